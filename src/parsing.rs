//! Template Parsing Service - Logical Name to Compiled Text
//!
//! Walks the layout chain with an explicit worklist, collects sections
//! (descendants override ancestors), runs the compiler passes, substitutes
//! yields and caches the result. A cache that cannot be written degrades to
//! recompiling on every call; it never fails the render.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache::{ArtifactHeader, TemplateCache};
use crate::compiler::{validate_syntax, Compiler, YieldPass};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::executor::parse_compiled;
use crate::layout::extract_layout;
use crate::resolver::PathResolver;
use crate::sections::{extract_sections, SectionMap};
use crate::ENGINE_VERSION;

/// Compiled text plus every source file it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compilation {
    pub text: String,
    pub dependencies: Vec<PathBuf>,
}

/// A template file as read from the views directory.
#[derive(Debug, Clone)]
pub struct TemplateSource {
    pub name: String,
    pub path: PathBuf,
    pub text: String,
    pub modified: DateTime<Utc>,
}

impl TemplateSource {
    pub fn load(name: &str, path: &Path) -> Result<Self> {
        let not_found = |e: std::io::Error| EngineError::PathNotFound {
            name: name.to_string(),
            reason: e.to_string(),
        };
        let text = fs::read_to_string(path).map_err(not_found)?;
        let modified = fs::metadata(path).and_then(|m| m.modified()).map_err(not_found)?;
        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            text,
            modified: DateTime::<Utc>::from(modified),
        })
    }
}

pub struct TemplateParsingService {
    resolver: PathResolver,
    cache: TemplateCache,
    compiler: Compiler,
    cache_enabled: bool,
    max_depth: usize,
}

impl TemplateParsingService {
    pub fn new(resolver: PathResolver, cache: TemplateCache, max_depth: usize) -> Self {
        Self {
            resolver,
            cache,
            compiler: Compiler::new(),
            cache_enabled: true,
            max_depth,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let resolver = PathResolver::new(&config.views_dir, &config.extension)?;
        let cache = TemplateCache::new(&config.cache_dir);
        let mut service = Self::new(resolver, cache, config.max_depth);
        service.cache_enabled = config.cache_enabled;
        Ok(service)
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn cache(&self) -> &TemplateCache {
        &self.cache
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn get_compiled(&self, name: &str) -> Result<String> {
        Ok(self.compile_tracked(name, &mut vec![])?.text)
    }

    /// Artifact location for a logical name.
    pub fn compiled_path(&self, name: &str) -> Result<PathBuf> {
        let path = self.resolver.resolve(name)?;
        Ok(self.cache.compiled_path_for(&path))
    }

    fn compile_tracked(&self, name: &str, include_stack: &mut Vec<String>) -> Result<Compilation> {
        if include_stack.len() >= self.max_depth {
            let mut chain = include_stack.clone();
            chain.push(name.to_string());
            return Err(EngineError::RecursionLimitExceeded { limit: self.max_depth, chain });
        }

        let path = self.resolver.resolve(name)?;
        let compiled_path = self.cache.compiled_path_for(&path);
        if self.cache_enabled {
            if let Some(hit) = self.cached(&path, &compiled_path) {
                tracing::debug!(template = name, "compiled template cache hit");
                return Ok(hit);
            }
        }

        include_stack.push(name.to_string());
        let compiled = self.compile_fresh(name, &path, include_stack);
        include_stack.pop();
        let compiled = compiled?;
        tracing::info!(
            template = name,
            dependencies = compiled.dependencies.len(),
            "compiled template"
        );

        if self.cache_enabled {
            let header = ArtifactHeader {
                engine_version: ENGINE_VERSION.to_string(),
                source: path.clone(),
                dependencies: compiled.dependencies.clone(),
            };
            if let Err(e) = self.cache.store(&compiled_path, &header, &compiled.text) {
                tracing::warn!(template = name, error = %e, "compiled template not cached");
            }
        }
        Ok(compiled)
    }

    fn cached(&self, path: &Path, compiled_path: &Path) -> Option<Compilation> {
        if self.cache.is_stale(path, compiled_path) {
            tracing::debug!(source = %path.display(), "compiled template stale");
            return None;
        }
        let artifact = self.cache.artifact(compiled_path).ok().flatten()?;
        let header = &artifact.header;
        let usable = header.engine_version == ENGINE_VERSION
            && header.source == path
            && !self.cache.is_stale_with_dependencies(compiled_path, &header.dependencies);
        usable.then(|| Compilation {
            text: artifact.text.clone(),
            dependencies: artifact.header.dependencies.clone(),
        })
    }

    fn compile_fresh(
        &self,
        name: &str,
        path: &Path,
        include_stack: &mut Vec<String>,
    ) -> Result<Compilation> {
        let mut dependencies = vec![];
        let mut sections = SectionMap::new();
        let mut chain: Vec<String> = vec![];
        let mut visited: HashSet<PathBuf> = HashSet::new();
        let mut pending = Some((name.to_string(), path.to_path_buf()));

        let mut body = String::new();
        while let Some((current, current_path)) = pending.take() {
            chain.push(current.clone());
            if !visited.insert(current_path.clone()) {
                return Err(EngineError::LayoutCycle { chain });
            }
            if chain.len() > self.max_depth {
                return Err(EngineError::RecursionLimitExceeded { limit: self.max_depth, chain });
            }

            let source = TemplateSource::load(&current, &current_path)?;
            tracing::trace!(
                template = %source.name,
                modified = %source.modified,
                "loaded template source"
            );
            dependencies.push(source.path);

            validate_syntax(&current, &source.text)?;
            let (parent, rest) = extract_layout(&current, &source.text)?;
            let (own_sections, remaining) = extract_sections(&current, &rest)?;
            sections.inherit(own_sections);

            match parent {
                Some(parent) => {
                    let parent_path = self.resolver.resolve(&parent)?;
                    pending = Some((parent, parent_path));
                }
                None => body = remaining,
            }
        }
        tracing::debug!(
            template = name,
            chain = ?chain,
            sections = sections.len(),
            "layout chain merged"
        );

        let mut include = |included: &str| -> Result<String> {
            let compilation = self.compile_tracked(included, include_stack)?;
            dependencies.extend(compilation.dependencies);
            Ok(compilation.text)
        };
        let compiled_sections = sections.try_map_contents(|section, content| {
            self.compiler.compile(&format!("{}#{}", name, section), content, &mut include)
        })?;
        let compiled_body = self.compiler.compile(name, &body, &mut include)?;

        let text = YieldPass::new(&compiled_sections, self.max_depth).apply(name, &compiled_body)?;
        parse_compiled(name, &text)?;

        dependencies.sort();
        dependencies.dedup();
        Ok(Compilation { text, dependencies })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    const DEFAULT_DEPTH: usize = crate::config::DEFAULT_MAX_DEPTH;

    struct Fixture {
        dir: TempDir,
        service: TemplateParsingService,
    }

    fn fixture(files: &[(&str, &str)]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let views = dir.path().join("views");
        fs::create_dir_all(&views).unwrap();
        for (name, content) in files {
            let path = views.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let config = EngineConfig::new(&views, dir.path().join("cache"));
        let service = TemplateParsingService::from_config(&config).unwrap();
        Fixture { dir, service }
    }

    fn backdate(path: &Path) {
        let past = SystemTime::now() - Duration::from_secs(120);
        File::options().write(true).open(path).unwrap().set_modified(past).unwrap();
    }

    #[test]
    fn test_three_level_chain() {
        let f = fixture(&[
            ("base.html", "<html>[yield:title]|yield(body)|yield(footer, 'default footer')</html>"),
            ("mid.html", "extends(base) section(body)<main>yield(content)</main>endsection section(title)Mid endsection"),
            ("leaf.html", "@extends('mid') @section('content')Leaf@endsection @section('title')Leaf title@endsection"),
        ]);
        let out = f.service.get_compiled("leaf").unwrap();
        assert_eq!(out, "<html>Leaf title|<main>Leaf</main>|default footer</html>");
    }

    #[test]
    fn test_parent_directive_keeps_layout_content() {
        let f = fixture(&[
            ("base.html", "<nav>yield(nav)</nav>section(nav)<a>home</a>endsection"),
            ("child.html", "extends(base) section(nav)@parent<a>more</a>endsection"),
        ]);
        assert_eq!(
            f.service.get_compiled("child").unwrap(),
            "<nav><a>home</a><a>more</a></nav>"
        );
    }

    #[test]
    fn test_template_source_load() {
        let f = fixture(&[("home.html", "hello")]);
        let path = f.service.resolver().resolve("home").unwrap();
        let source = TemplateSource::load("home", &path).unwrap();
        assert_eq!(source.text, "hello");
        assert_eq!(source.path, path);

        let missing = f.dir.path().join("views/missing.html");
        assert!(matches!(
            TemplateSource::load("missing", &missing),
            Err(EngineError::PathNotFound { .. })
        ));
    }

    #[test]
    fn test_layout_cycle_detected() {
        let f = fixture(&[("a.html", "extends(b)"), ("b.html", "extends(a)")]);
        match f.service.get_compiled("a") {
            Err(EngineError::LayoutCycle { chain }) => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_extension_is_cycle() {
        let f = fixture(&[("a.html", "extends(a)")]);
        assert!(matches!(f.service.get_compiled("a"), Err(EngineError::LayoutCycle { .. })));
    }

    #[test]
    fn test_include_inlined_and_tracked() {
        let f = fixture(&[
            ("page.html", "<ul>@include('item', {\"label\": \"x\"})</ul>"),
            ("item.html", "<li>{{ label }}</li>"),
        ]);
        let out = f.service.get_compiled("page").unwrap();
        assert_eq!(
            out,
            "<ul><?fg scope {\"label\":\"x\"} ?><li><?fg echo label ?></li><?fg endscope ?></ul>"
        );
    }

    #[test]
    fn test_self_include_hits_recursion_limit() {
        let f = fixture(&[("loop.html", "x include(loop)")]);
        match f.service.get_compiled("loop") {
            Err(EngineError::RecursionLimitExceeded { limit, chain }) => {
                assert_eq!(limit, DEFAULT_DEPTH);
                assert_eq!(chain.len(), DEFAULT_DEPTH + 1);
            }
            other => panic!("expected recursion error, got {:?}", other),
        }
    }

    #[test]
    fn test_second_compile_served_from_cache() {
        let f = fixture(&[("home.html", "<p>{{ name }}</p>")]);
        let first = f.service.get_compiled("home").unwrap();
        let source = f.service.resolver().resolve("home").unwrap();
        backdate(&source);
        let compiled_path = f.service.compiled_path("home").unwrap();
        assert!(!f.service.cache().is_stale(&source, &compiled_path));

        // Served from the artifact even though the source now differs.
        fs::write(&source, "<p>changed</p>").unwrap();
        backdate(&source);
        assert_eq!(f.service.get_compiled("home").unwrap(), first);
    }

    #[test]
    fn test_layout_edit_invalidates_child() {
        let f = fixture(&[
            ("base.html", "<div>[yield:content]</div>"),
            ("child.html", "extends(base) section(content) Hello endsection"),
        ]);
        assert_eq!(f.service.get_compiled("child").unwrap(), "<div>Hello</div>");

        let child = f.service.resolver().resolve("child").unwrap();
        backdate(&child);
        let base = f.service.resolver().resolve("base").unwrap();
        fs::write(&base, "<section>[yield:content]</section>").unwrap();
        let future = SystemTime::now() + Duration::from_secs(120);
        File::options().write(true).open(&base).unwrap().set_modified(future).unwrap();

        assert_eq!(f.service.get_compiled("child").unwrap(), "<section>Hello</section>");
    }

    #[test]
    fn test_include_edit_invalidates_parent() {
        let f = fixture(&[
            ("page.html", "<ul>@include('item')</ul>"),
            ("item.html", "<li>one</li>"),
        ]);
        assert_eq!(f.service.get_compiled("page").unwrap(), "<ul><li>one</li></ul>");

        let page = f.service.resolver().resolve("page").unwrap();
        backdate(&page);
        let item = f.service.resolver().resolve("item").unwrap();
        fs::write(&item, "<li>two</li>").unwrap();
        let future = SystemTime::now() + Duration::from_secs(120);
        File::options().write(true).open(&item).unwrap().set_modified(future).unwrap();

        assert_eq!(f.service.get_compiled("page").unwrap(), "<ul><li>two</li></ul>");
    }

    #[test]
    fn test_artifact_from_other_engine_version_recompiled() {
        let f = fixture(&[("home.html", "<p>fresh</p>")]);
        let source = f.service.resolver().resolve("home").unwrap();
        backdate(&source);
        let compiled_path = f.service.compiled_path("home").unwrap();

        let mut header = ArtifactHeader {
            engine_version: ENGINE_VERSION.to_string(),
            source: source.clone(),
            dependencies: vec![source.clone()],
        };
        f.service.cache().store(&compiled_path, &header, "<p>cached</p>").unwrap();
        assert_eq!(f.service.get_compiled("home").unwrap(), "<p>cached</p>");

        header.engine_version = "0.0.1".into();
        f.service.cache().store(&compiled_path, &header, "<p>cached</p>").unwrap();
        assert_eq!(f.service.get_compiled("home").unwrap(), "<p>fresh</p>");
        let artifact = f.service.cache().artifact(&compiled_path).unwrap().unwrap();
        assert_eq!(artifact.header.engine_version, ENGINE_VERSION);
    }

    #[test]
    fn test_unwritable_cache_degrades() {
        let dir = TempDir::new().unwrap();
        let views = dir.path().join("views");
        fs::create_dir_all(&views).unwrap();
        fs::write(views.join("home.html"), "hi {{ name }}").unwrap();
        let blocker = dir.path().join("cache");
        fs::write(&blocker, "a file, not a directory").unwrap();

        let config = EngineConfig::new(&views, &blocker);
        let service = TemplateParsingService::from_config(&config).unwrap();
        assert_eq!(service.get_compiled("home").unwrap(), "hi <?fg echo name ?>");
        assert_eq!(service.get_compiled("home").unwrap(), "hi <?fg echo name ?>");
    }

    #[test]
    fn test_compile_error_names_template_and_line() {
        let f = fixture(&[("bad.html", "ok\n@if(x)\nnever closed")]);
        match f.service.get_compiled("bad") {
            Err(EngineError::Compile { template, line, .. }) => {
                assert_eq!(template, "bad");
                assert_eq!(line, 2);
            }
            other => panic!("expected compile error, got {:?}", other),
        }
        assert!(f.dir.path().join("cache").read_dir().map_or(true, |mut d| d.next().is_none()));
    }

    #[test]
    fn test_block_split_across_sections_rejected() {
        let f = fixture(&[
            ("base.html", "yield(a)@endif"),
            ("child.html", "extends(base) section(a)@if(x)endsection"),
        ]);
        assert!(f.service.get_compiled("child").is_err());
    }
}
