//! Component Rendering Service - Single Entry Point for Rendering
//!
//! Dispatches renderables through a table keyed by variant tag. Nested
//! partials render recursively with the calling scope as their parent; the
//! chain of templates on the current call stack is bounded by `max_depth`.

use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::{Data, RenderContext};
use crate::error::{EngineError, Result};
use crate::executor::{execute, parse_compiled, PartialHost};
use crate::parsing::TemplateParsingService;
use crate::renderable::{AssetLink, NamedPartials, Page, Renderable, RenderableKind};

/// Position of a render call: enclosing scope plus the templates above it.
#[derive(Clone, Copy)]
pub struct Frame<'a> {
    pub parent: Option<&'a RenderContext<'a>>,
    pub chain: &'a [String],
}

impl Frame<'_> {
    pub fn root() -> Frame<'static> {
        Frame { parent: None, chain: &[] }
    }
}

/// Executes one renderable variant.
pub trait ComponentExecutor {
    fn kind(&self) -> RenderableKind;
    fn execute(
        &self,
        renderer: &ComponentRenderingService,
        renderable: &Renderable,
        frame: Frame<'_>,
    ) -> Result<String>;
}

pub struct PageExecutor;

impl ComponentExecutor for PageExecutor {
    fn kind(&self) -> RenderableKind {
        RenderableKind::Page
    }

    fn execute(
        &self,
        renderer: &ComponentRenderingService,
        renderable: &Renderable,
        frame: Frame<'_>,
    ) -> Result<String> {
        let Renderable::Page(page) = renderable else {
            return Err(mismatch(self.kind(), renderable));
        };

        let base = layer(frame.parent, page.data.clone());
        let inner = Frame { parent: Some(&base), chain: frame.chain };
        let region = |part: &Option<Box<Renderable>>| -> Result<String> {
            match part {
                Some(r) => renderer.dispatch(r, inner),
                None => Ok(String::new()),
            }
        };
        let header = region(&page.header)?;
        let main = renderer.dispatch(&page.main, inner)?;
        let footer = region(&page.footer)?;

        let mut vars = Data::new();
        vars.insert("header".into(), Value::String(header));
        vars.insert("main".into(), Value::String(main));
        vars.insert("footer".into(), Value::String(footer));
        let styles = asset_tags(page, |a| matches!(a, AssetLink::Style(_)));
        let scripts = asset_tags(page, |a| matches!(a, AssetLink::Script(_)));
        vars.insert("styles".into(), Value::String(styles));
        vars.insert("scripts".into(), Value::String(scripts));
        renderer.execute_template(&page.template, vars, &page.partials, inner)
    }
}

pub struct ViewExecutor;

impl ComponentExecutor for ViewExecutor {
    fn kind(&self) -> RenderableKind {
        RenderableKind::View
    }

    fn execute(
        &self,
        renderer: &ComponentRenderingService,
        renderable: &Renderable,
        frame: Frame<'_>,
    ) -> Result<String> {
        let Renderable::View(view) = renderable else {
            return Err(mismatch(self.kind(), renderable));
        };
        let mut vars = view.data.clone();
        if let Some(title) = &view.title {
            vars.insert("title".into(), Value::String(title.clone()));
        }
        renderer.execute_template(&view.template, vars, &view.partials, frame)
    }
}

pub struct PartialExecutor;

impl ComponentExecutor for PartialExecutor {
    fn kind(&self) -> RenderableKind {
        RenderableKind::Partial
    }

    fn execute(
        &self,
        renderer: &ComponentRenderingService,
        renderable: &Renderable,
        frame: Frame<'_>,
    ) -> Result<String> {
        let Renderable::Partial(partial) = renderable else {
            return Err(mismatch(self.kind(), renderable));
        };
        renderer.execute_template(&partial.template, partial.data.clone(), &partial.partials, frame)
    }
}

pub struct ComponentRenderingService {
    parser: TemplateParsingService,
    executors: HashMap<RenderableKind, Box<dyn ComponentExecutor + Send + Sync>>,
    max_depth: usize,
}

impl ComponentRenderingService {
    pub fn new(parser: TemplateParsingService) -> Self {
        let mut service = Self {
            max_depth: parser.max_depth(),
            parser,
            executors: HashMap::new(),
        };
        service.register(Box::new(PageExecutor));
        service.register(Box::new(ViewExecutor));
        service.register(Box::new(PartialExecutor));
        service
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self::new(TemplateParsingService::from_config(config)?))
    }

    /// Replaces the executor for its variant.
    pub fn register(&mut self, executor: Box<dyn ComponentExecutor + Send + Sync>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn parser(&self) -> &TemplateParsingService {
        &self.parser
    }

    pub fn render(&self, renderable: &Renderable) -> Result<String> {
        let render_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "render",
            %render_id,
            kind = %renderable.kind(),
            template = renderable.template()
        );
        let _entered = span.enter();

        let result = self.dispatch(renderable, Frame::root());
        match &result {
            Ok(html) => tracing::debug!(bytes = html.len(), "rendered"),
            Err(e) => tracing::debug!(error = %e, "render failed"),
        }
        result
    }

    /// Renders a template by name as a partial with its own data bag.
    pub fn render_included_partial(&self, name: &str, data: Data) -> Result<String> {
        self.execute_template(name, data, &NamedPartials::new(), Frame::root())
    }

    pub fn dispatch(&self, renderable: &Renderable, frame: Frame<'_>) -> Result<String> {
        let executor = self.executors.get(&renderable.kind()).ok_or_else(|| {
            let message = format!("no executor for {}", renderable.kind());
            EngineError::render(renderable.template(), message)
        })?;
        executor.execute(self, renderable, frame)
    }

    /// Compiles and runs `template` in a scope layered over `frame.parent`.
    pub fn execute_template(
        &self,
        template: &str,
        vars: Data,
        partials: &NamedPartials,
        frame: Frame<'_>,
    ) -> Result<String> {
        let mut chain = frame.chain.to_vec();
        chain.push(template.to_string());
        if chain.len() > self.max_depth {
            return Err(EngineError::RecursionLimitExceeded { limit: self.max_depth, chain });
        }

        let compiled = self.parser.get_compiled(template)?;
        let nodes = parse_compiled(template, &compiled)?;
        let scope = layer(frame.parent, vars);
        let host = NestedPartials { renderer: self, partials, chain: &chain };
        execute(template, &nodes, &scope, &host)
    }
}

/// Resolves `partial(...)` references for one executing template.
struct NestedPartials<'r> {
    renderer: &'r ComponentRenderingService,
    partials: &'r NamedPartials,
    chain: &'r [String],
}

impl PartialHost for NestedPartials<'_> {
    fn render_partial(&self, name: &str, data: Data, ctx: &RenderContext<'_>) -> Result<String> {
        let frame = Frame { parent: Some(ctx), chain: self.chain };
        match self.partials.get(name) {
            Some(renderable) if data.is_empty() => self.renderer.dispatch(renderable, frame),
            Some(renderable) => self.renderer.dispatch(&renderable.with_extra_data(data), frame),
            None => self.renderer.execute_template(name, data, &NamedPartials::new(), frame),
        }
    }
}

fn layer<'a>(parent: Option<&'a RenderContext<'a>>, vars: Data) -> RenderContext<'a> {
    match parent {
        Some(p) => p.layer(vars),
        None => RenderContext::new(vars),
    }
}

fn asset_tags(page: &Page, keep: impl Fn(&AssetLink) -> bool) -> String {
    page.assets
        .iter()
        .filter(|a| keep(a))
        .map(AssetLink::to_html)
        .collect::<Vec<_>>()
        .join("\n")
}

fn mismatch(expected: RenderableKind, renderable: &Renderable) -> EngineError {
    EngineError::render(
        renderable.template(),
        format!("{} executor received a {}", expected, renderable.kind()),
    )
}
