//! Layout Parser - `extends(parent)` Declarations

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{line_of, EngineError, Result};
use crate::syntax::named_directive;

static EXTENDS: Lazy<Regex> = Lazy::new(|| named_directive("extends"));

/// Removes the extends directive and returns the parent's logical name.
/// More than one declaration in a template is a compile error.
pub fn extract_layout(template: &str, source: &str) -> Result<(Option<String>, String)> {
    let found: Vec<_> = EXTENDS.captures_iter(source).collect();
    match found.as_slice() {
        [] => Ok((None, source.to_string())),
        [only] => {
            let whole = only.get(0).map(|m| m.range()).unwrap_or(0..0);
            let parent = only[1].to_string();
            let mut remaining = String::with_capacity(source.len());
            remaining.push_str(&source[..whole.start]);
            remaining.push_str(&source[whole.end..]);
            Ok((Some(parent), remaining))
        }
        [first, second, ..] => {
            let offset = |c: &regex::Captures| c.get(0).map_or(0, |m| m.start());
            Err(EngineError::compile(
                template,
                line_of(source, offset(second)),
                format!(
                    "multiple extends directives (first at line {})",
                    line_of(source, offset(first))
                ),
            ))
        }
    }
}
