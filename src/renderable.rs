//! Renderables - Immutable Values Handed to the Renderer

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::context::{escape_html, Data};

pub type NamedPartials = BTreeMap<String, Renderable>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderableKind {
    Page,
    View,
    Partial,
}

impl fmt::Display for RenderableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Page => "page",
            Self::View => "view",
            Self::Partial => "partial",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Renderable {
    Page(Page),
    View(View),
    Partial(Partial),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub template: String,
    #[serde(default)]
    pub header: Option<Box<Renderable>>,
    pub main: Box<Renderable>,
    #[serde(default)]
    pub footer: Option<Box<Renderable>>,
    #[serde(default)]
    pub assets: Vec<AssetLink>,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub partials: NamedPartials,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct View {
    pub template: String,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub partials: NamedPartials,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partial {
    pub template: String,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub partials: NamedPartials,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "href", rename_all = "lowercase")]
pub enum AssetLink {
    Style(String),
    Script(String),
}

impl AssetLink {
    pub fn to_html(&self) -> String {
        match self {
            Self::Style(href) => format!(r#"<link rel="stylesheet" href="{}">"#, escape_html(href)),
            Self::Script(href) => format!(r#"<script src="{}"></script>"#, escape_html(href)),
        }
    }
}

impl Renderable {
    pub fn kind(&self) -> RenderableKind {
        match self {
            Self::Page(_) => RenderableKind::Page,
            Self::View(_) => RenderableKind::View,
            Self::Partial(_) => RenderableKind::Partial,
        }
    }

    pub fn template(&self) -> &str {
        match self {
            Self::Page(p) => &p.template,
            Self::View(v) => &v.template,
            Self::Partial(p) => &p.template,
        }
    }

    pub fn data(&self) -> &Data {
        match self {
            Self::Page(p) => &p.data,
            Self::View(v) => &v.data,
            Self::Partial(p) => &p.data,
        }
    }

    pub fn partials(&self) -> &NamedPartials {
        match self {
            Self::Page(p) => &p.partials,
            Self::View(v) => &v.partials,
            Self::Partial(p) => &p.partials,
        }
    }

    /// Copy of this renderable with `extra` merged over its data.
    pub fn with_extra_data(&self, extra: Data) -> Renderable {
        let mut copy = self.clone();
        let data = match &mut copy {
            Self::Page(p) => &mut p.data,
            Self::View(v) => &mut v.data,
            Self::Partial(p) => &mut p.data,
        };
        data.extend(extra);
        copy
    }
}

impl View {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            data: Data::new(),
            partials: NamedPartials::new(),
            title: None,
        }
    }

    pub fn with_data(mut self, data: Data) -> Self {
        self.data = data;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_partial(mut self, name: impl Into<String>, partial: Renderable) -> Self {
        self.partials.insert(name.into(), partial);
        self
    }
}

impl Partial {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            data: Data::new(),
            partials: NamedPartials::new(),
        }
    }

    pub fn with_data(mut self, data: Data) -> Self {
        self.data = data;
        self
    }

    pub fn with_partial(mut self, name: impl Into<String>, partial: Renderable) -> Self {
        self.partials.insert(name.into(), partial);
        self
    }
}

impl Page {
    pub fn new(template: impl Into<String>, main: Renderable) -> Self {
        Self {
            template: template.into(),
            header: None,
            main: Box::new(main),
            footer: None,
            assets: vec![],
            data: Data::new(),
            partials: NamedPartials::new(),
        }
    }

    pub fn with_header(mut self, header: Renderable) -> Self {
        self.header = Some(Box::new(header));
        self
    }

    pub fn with_footer(mut self, footer: Renderable) -> Self {
        self.footer = Some(Box::new(footer));
        self
    }

    pub fn with_asset(mut self, asset: AssetLink) -> Self {
        self.assets.push(asset);
        self
    }

    pub fn with_data(mut self, data: Data) -> Self {
        self.data = data;
        self
    }
}

impl From<Page> for Renderable {
    fn from(page: Page) -> Self {
        Self::Page(page)
    }
}

impl From<View> for Renderable {
    fn from(view: View) -> Self {
        Self::View(view)
    }
}

impl From<Partial> for Renderable {
    fn from(partial: Partial) -> Self {
        Self::Partial(partial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renderable_from_json() {
        let json = r#"{
            "kind": "page",
            "template": "layouts/page",
            "main": {"kind": "view", "template": "home", "title": "Home"},
            "assets": [{"type": "style", "href": "/app.css"}]
        }"#;
        let renderable: Renderable = serde_json::from_str(json).unwrap();
        assert_eq!(renderable.kind(), RenderableKind::Page);
        assert_eq!(renderable.template(), "layouts/page");
        let Renderable::Page(page) = renderable else { unreachable!() };
        assert_eq!(page.main.kind(), RenderableKind::View);
        assert_eq!(page.assets, vec![AssetLink::Style("/app.css".into())]);
    }

    #[test]
    fn test_asset_href_escaped() {
        let link = AssetLink::Script("/a.js?x=1&y=\"2\"".into());
        assert_eq!(link.to_html(), r#"<script src="/a.js?x=1&amp;y=&quot;2&quot;"></script>"#);
    }

    #[test]
    fn test_extra_data_overrides_and_keeps_variant() {
        let partial: Renderable = Partial::new("card")
            .with_data(serde_json::json!({"a": 1, "b": 2}).as_object().cloned().unwrap())
            .into();
        let extra = serde_json::json!({"b": 3}).as_object().cloned().unwrap();
        let merged = partial.with_extra_data(extra);
        assert_eq!(merged.kind(), RenderableKind::Partial);
        assert_eq!(merged.data().get("a"), Some(&serde_json::json!(1)));
        assert_eq!(merged.data().get("b"), Some(&serde_json::json!(3)));
        assert_eq!(partial.data().get("b"), Some(&serde_json::json!(2)));
    }
}
