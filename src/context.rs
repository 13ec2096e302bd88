//! Render Context - Layered, Read-Only Variable Scopes
//!
//! A nested scope borrows its enclosing scope. Lookups walk outward; a
//! layer can shadow a name but never modifies the layers beneath it.

use serde_json::{Map, Value};

pub type Data = Map<String, Value>;

#[derive(Debug, Clone, Default)]
pub struct RenderContext<'a> {
    vars: Data,
    parent: Option<&'a RenderContext<'a>>,
}

impl<'a> RenderContext<'a> {
    pub fn new(vars: Data) -> Self {
        Self { vars, parent: None }
    }

    /// New scope on top of this one.
    pub fn layer(&self, vars: Data) -> RenderContext<'_> {
        RenderContext { vars, parent: Some(self) }
    }

    pub fn parent(&self) -> Option<&RenderContext<'a>> {
        self.parent
    }

    /// Variables defined by this layer only.
    pub fn own(&self) -> &Data {
        &self.vars
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        let mut scope = Some(self);
        while let Some(ctx) = scope {
            if let Some(v) = ctx.vars.get(name) {
                return Some(v);
            }
            scope = ctx.parent;
        }
        None
    }

    pub fn lookup_path<S: AsRef<str>>(&self, segments: &[S]) -> Option<&Value> {
        let (first, rest) = segments.split_first()?;
        let mut value = self.get(first.as_ref())?;
        for segment in rest {
            let segment = segment.as_ref();
            value = match value {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(value)
    }

    /// Number of layers including this one.
    pub fn depth(&self) -> usize {
        1 + self.parent.map_or(0, |p| p.depth())
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Text form of a value as it appears in output.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
