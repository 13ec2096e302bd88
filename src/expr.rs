//! Template Expressions
//!
//! The bounded expression set allowed inside `{{ }}`, `{!! !!}`, `if` and
//! `foreach`: variable paths, literals, `??` fallback, `!` and `==`/`!=`.

use serde_json::Value;
use std::fmt;

use crate::context::{is_truthy, RenderContext};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Dotted lookup. `optional` paths render missing values as null.
    Path { segments: Vec<String>, optional: bool },
    Literal(Value),
    Fallback(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare { left: Box<Expr>, negated: bool, right: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprError(pub String);

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn parse(source: &str) -> Result<Expr, ExprError> {
    let mut parser = Parser { src: source, pos: 0 };
    let expr = parser.comparison()?;
    parser.skip_ws();
    if parser.pos != source.len() {
        return Err(ExprError(format!(
            "unexpected '{}' in expression '{}'",
            &source[parser.pos..],
            source.trim()
        )));
    }
    Ok(expr)
}

struct Parser<'s> {
    src: &'s str,
    pos: usize,
}

impl<'s> Parser<'s> {
    fn rest(&self) -> &'s str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.unary()?;
        let negated = if self.eat("==") {
            false
        } else if self.eat("!=") {
            true
        } else {
            return Ok(left);
        };
        let right = self.unary()?;
        Ok(Expr::Compare { left: Box::new(left), negated, right: Box::new(right) })
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        self.skip_ws();
        if self.rest().starts_with('!') && !self.rest().starts_with("!=") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.fallback()
    }

    fn fallback(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        while self.eat("??") {
            let alt = self.primary()?;
            expr = Expr::Fallback(Box::new(expr), Box::new(alt));
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        self.skip_ws();
        let rest = self.rest();
        let Some(first) = rest.chars().next() else {
            return Err(ExprError("expected an expression".into()));
        };

        if first == '\'' || first == '"' {
            return self.string(first);
        }
        let negative_number =
            first == '-' && rest[1..].starts_with(|c: char| c.is_ascii_digit());
        if first.is_ascii_digit() || negative_number {
            let len = rest
                .char_indices()
                .skip(1)
                .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
                .map_or(rest.len(), |(i, _)| i);
            let text = &rest[..len];
            self.pos += len;
            let value: Value = serde_json::from_str(text)
                .map_err(|_| ExprError(format!("invalid number '{}'", text)))?;
            return Ok(Expr::Literal(value));
        }
        if first.is_alphabetic() || first == '_' {
            return self.path();
        }
        Err(ExprError(format!("unexpected '{}'", first)))
    }

    fn string(&mut self, quote: char) -> Result<Expr, ExprError> {
        let mut out = String::new();
        let mut escaped = false;
        for (i, c) in self.rest().char_indices().skip(1) {
            if escaped {
                out.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                self.pos += i + c.len_utf8();
                return Ok(Expr::Literal(Value::String(out)));
            } else {
                out.push(c);
            }
        }
        Err(ExprError("unterminated string literal".into()))
    }

    fn path(&mut self) -> Result<Expr, ExprError> {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.'))
            .unwrap_or(rest.len());
        let text = &rest[..len];
        self.pos += len;

        match text {
            "true" => return Ok(Expr::Literal(Value::Bool(true))),
            "false" => return Ok(Expr::Literal(Value::Bool(false))),
            "null" => return Ok(Expr::Literal(Value::Null)),
            _ => {}
        }
        let segments: Vec<String> = text.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(ExprError(format!("malformed variable path '{}'", text)));
        }
        // `name?` marks an optional lookup; `??` is the fallback operator.
        let optional = self.rest().starts_with('?') && !self.rest().starts_with("??");
        if optional {
            self.pos += 1;
        }
        Ok(Expr::Path { segments, optional })
    }
}

impl Expr {
    /// Evaluates against the context. Missing required variables are errors.
    pub fn eval(&self, ctx: &RenderContext<'_>) -> Result<Value, ExprError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path { segments, optional } => match ctx.lookup_path(segments) {
                Some(v) => Ok(v.clone()),
                None if *optional => Ok(Value::Null),
                None => Err(ExprError(format!("undefined variable '{}'", segments.join(".")))),
            },
            Expr::Fallback(primary, alt) => match primary.eval_lenient(ctx) {
                Value::Null => Ok(alt.eval_lenient(ctx)),
                v => Ok(v),
            },
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.eval(ctx)?))),
            Expr::Compare { left, negated, right } => {
                let equal = values_equal(&left.eval(ctx)?, &right.eval(ctx)?);
                Ok(Value::Bool(equal != *negated))
            }
        }
    }

    fn eval_lenient(&self, ctx: &RenderContext<'_>) -> Value {
        self.eval(ctx).unwrap_or(Value::Null)
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}
