//! Section Parser - Named `section(name) ... endsection` Blocks

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::error::{line_of, EngineError, Result};
use crate::syntax::{at_directive, bare_directive, named_directive};

static SECTION_OPEN: Lazy<Regex> = Lazy::new(|| named_directive("section"));
static SECTION_CLOSE: Lazy<Regex> = Lazy::new(|| bare_directive("endsection"));
static PARENT: Lazy<Regex> = Lazy::new(|| at_directive("parent"));

/// Captured sections of one render, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionMap {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl SectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` without inserting when `name` is already present.
    pub fn insert(&mut self, name: impl Into<String>, content: impl Into<String>) -> bool {
        let name = name.into();
        if self.index.contains_key(&name) {
            return false;
        }
        self.index.insert(name.clone(), self.entries.len());
        self.entries.push((name, content.into()));
        true
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.index.get(name).map(|&i| self.entries[i].1.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, c)| (n.as_str(), c.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Folds an ancestor's sections beneath this (descendant) map.
    ///
    /// Descendant sections win. `@parent` inside a descendant section is
    /// replaced by the ancestor's content of the same name.
    pub fn inherit(&mut self, ancestor: SectionMap) {
        for (name, content) in ancestor.entries {
            match self.index.get(&name) {
                Some(&i) => {
                    let own = &mut self.entries[i].1;
                    if PARENT.is_match(own) {
                        *own = PARENT.replace_all(own, regex::NoExpand(&content)).into_owned();
                    }
                }
                None => {
                    self.insert(name, content);
                }
            }
        }
    }

    /// Applies `f` to every section body.
    pub fn try_map_contents<F>(&self, mut f: F) -> Result<SectionMap>
    where
        F: FnMut(&str, &str) -> Result<String>,
    {
        let mut mapped = SectionMap::new();
        for (name, content) in self.iter() {
            mapped.insert(name, f(name, content)?);
        }
        Ok(mapped)
    }
}

/// Pulls every section block out of `source`.
///
/// Returns the sections and the text left outside of them. Sections do not
/// nest; a `section` opened before the previous one closed is a compile error.
pub fn extract_sections(template: &str, source: &str) -> Result<(SectionMap, String)> {
    let mut sections = SectionMap::new();
    let mut remaining = String::with_capacity(source.len());
    let mut cursor = 0;

    while let Some(open) = SECTION_OPEN.captures_at(source, cursor) {
        let Some(whole) = open.get(0) else { break };
        let name = open[1].to_string();
        let body_start = whole.end();

        let close = SECTION_CLOSE.find_at(source, body_start).ok_or_else(|| {
            EngineError::compile(
                template,
                line_of(source, whole.start()),
                format!("section '{}' is never closed", name),
            )
        })?;
        if let Some(nested) = SECTION_OPEN.find_at(source, body_start) {
            if nested.start() < close.start() {
                return Err(EngineError::compile(
                    template,
                    line_of(source, nested.start()),
                    format!("nested section inside '{}'", name),
                ));
            }
        }

        remaining.push_str(&source[cursor..whole.start()]);
        let body = source[body_start..close.start()].trim();
        if !sections.insert(name.clone(), body) {
            return Err(EngineError::DuplicateSection {
                template: template.to_string(),
                section: name,
            });
        }
        cursor = close.end();
    }
    remaining.push_str(&source[cursor..]);

    if let Some(stray) = SECTION_CLOSE.find(&remaining) {
        return Err(EngineError::compile(
            template,
            line_of(&remaining, stray.start()),
            "endsection without a matching section",
        ));
    }

    Ok((sections, remaining))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_in_document_order() {
        let src = "a @section('title')Home@endsection b section(content) <p>x</p> endsection c";
        let (sections, rest) = extract_sections("home", src).unwrap();
        assert_eq!(sections.names().collect::<Vec<_>>(), vec!["title", "content"]);
        assert_eq!(sections.get("title"), Some("Home"));
        assert_eq!(sections.get("content"), Some("<p>x</p>"));
        assert_eq!(rest, "a  b  c");
    }

    #[test]
    fn test_duplicate_section_rejected() {
        let src = "section(a)1 endsection section(a)2@endsection";
        assert!(matches!(
            extract_sections("dup", src),
            Err(EngineError::DuplicateSection { section, .. }) if section == "a"
        ));
    }

    #[test]
    fn test_bare_closer_needs_word_boundary() {
        // `1endsection` is one word, so the section stays open.
        let err = extract_sections("t", "section(a)1endsection").unwrap_err();
        assert!(matches!(err, EngineError::Compile { .. }));
        let (sections, _) = extract_sections("t", "section(a)1@endsection").unwrap();
        assert_eq!(sections.get("a"), Some("1"));
    }

    #[test]
    fn test_unclosed_section_rejected() {
        let err = extract_sections("t", "x\nsection(a) never closed").unwrap_err();
        assert!(matches!(err, EngineError::Compile { line: 2, .. }));
    }

    #[test]
    fn test_stray_endsection_rejected() {
        assert!(extract_sections("t", "text endsection").is_err());
    }

    #[test]
    fn test_inherit_prefers_descendant_and_expands_parent() {
        let mut child = SectionMap::new();
        child.insert("nav", "@parent <a>extra</a>");
        child.insert("content", "child");

        let mut layout = SectionMap::new();
        layout.insert("nav", "<a>home</a>");
        layout.insert("content", "layout");
        layout.insert("footer", "(c)");

        child.inherit(layout);
        assert_eq!(child.get("nav"), Some("<a>home</a> <a>extra</a>"));
        assert_eq!(child.get("content"), Some("child"));
        assert_eq!(child.get("footer"), Some("(c)"));
    }
}
