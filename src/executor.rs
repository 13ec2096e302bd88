//! Executor - Runs Compiled Templates Against a Render Context

use serde_json::{json, Value};

use crate::context::{display_value, escape_html, is_truthy, Data, RenderContext};
use crate::error::{line_of, EngineError, Result};
use crate::expr::{self, Expr};
use crate::syntax::{INSTRUCTION_CLOSE, INSTRUCTION_OPEN};

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    Echo { source: String, expr: Expr, raw: bool },
    If { branches: Vec<(Option<Expr>, Vec<Node>)> },
    Each { item: String, source: String, collection: Expr, body: Vec<Node> },
    Scope { data: Data, body: Vec<Node> },
    Partial { name: String, data: Data },
}

/// Renders `partial(...)` references met during execution.
pub trait PartialHost {
    fn render_partial(&self, name: &str, data: Data, ctx: &RenderContext<'_>) -> Result<String>;
}

struct Instruction<'t> {
    op: &'t str,
    args: &'t str,
    offset: usize,
}

enum Token<'t> {
    Text(&'t str),
    Instruction(Instruction<'t>),
}

fn tokenize<'t>(template: &str, compiled: &'t str) -> Result<Vec<Token<'t>>> {
    let mut tokens = vec![];
    let mut cursor = 0;
    while let Some(rel) = compiled[cursor..].find(INSTRUCTION_OPEN) {
        let start = cursor + rel;
        if start > cursor {
            tokens.push(Token::Text(&compiled[cursor..start]));
        }
        let body_start = start + INSTRUCTION_OPEN.len();
        let rel_end = compiled[body_start..].find(INSTRUCTION_CLOSE).ok_or_else(|| {
            EngineError::compile(template, line_of(compiled, start), "unterminated instruction")
        })?;
        let body = compiled[body_start..body_start + rel_end].trim();
        let (op, args) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
        tokens.push(Token::Instruction(Instruction { op, args: args.trim(), offset: start }));
        cursor = body_start + rel_end + INSTRUCTION_CLOSE.len();
    }
    if cursor < compiled.len() {
        tokens.push(Token::Text(&compiled[cursor..]));
    }
    Ok(tokens)
}

/// Parses compiled text into a node tree; unbalanced blocks are compile errors.
pub fn parse_compiled(template: &str, compiled: &str) -> Result<Vec<Node>> {
    let tokens = tokenize(template, compiled)?;
    let mut parser = TreeBuilder { template, compiled, tokens: tokens.into_iter().peekable() };
    let (nodes, terminator) = parser.block()?;
    if let Some(stray) = terminator {
        return Err(parser.error(&stray, format!("unexpected '{}'", stray.op)));
    }
    Ok(nodes)
}

struct TreeBuilder<'a, 't> {
    template: &'a str,
    compiled: &'t str,
    tokens: std::iter::Peekable<std::vec::IntoIter<Token<'t>>>,
}

impl<'a, 't> TreeBuilder<'a, 't> {
    fn error(&self, at: &Instruction<'_>, message: String) -> EngineError {
        EngineError::compile(self.template, line_of(self.compiled, at.offset), message)
    }

    /// Reads nodes until a block terminator or end of input.
    fn block(&mut self) -> Result<(Vec<Node>, Option<Instruction<'t>>)> {
        let mut nodes = vec![];
        while let Some(token) = self.tokens.next() {
            let ins = match token {
                Token::Text(text) => {
                    nodes.push(Node::Text(text.to_string()));
                    continue;
                }
                Token::Instruction(ins) => ins,
            };
            match ins.op {
                "echo" | "raw" => {
                    let expr = self.expr(&ins, ins.args)?;
                    nodes.push(Node::Echo {
                        source: ins.args.to_string(),
                        expr,
                        raw: ins.op == "raw",
                    });
                }
                "if" => nodes.push(self.conditional(ins)?),
                "each" => {
                    let (item, collection) = ins
                        .args
                        .split_once(" in ")
                        .ok_or_else(|| self.error(&ins, format!("malformed loop '{}'", ins.args)))?;
                    let collection_expr = self.expr(&ins, collection)?;
                    let body = self.expect_end(&ins, "endeach")?;
                    nodes.push(Node::Each {
                        item: item.trim().to_string(),
                        source: collection.trim().to_string(),
                        collection: collection_expr,
                        body,
                    });
                }
                "scope" => {
                    let data = self.object(&ins)?;
                    let body = self.expect_end(&ins, "endscope")?;
                    nodes.push(Node::Scope { data, body });
                }
                "partial" => {
                    let mut payload = self.object(&ins)?;
                    let name = match payload.remove("name") {
                        Some(Value::String(name)) => name,
                        _ => return Err(self.error(&ins, "partial without a name".into())),
                    };
                    let data = match payload.remove("data") {
                        Some(Value::Object(data)) => data,
                        _ => Data::new(),
                    };
                    nodes.push(Node::Partial { name, data });
                }
                "elseif" | "else" | "endif" | "endeach" | "endscope" => {
                    return Ok((nodes, Some(ins)));
                }
                other => return Err(self.error(&ins, format!("unknown instruction '{}'", other))),
            }
        }
        Ok((nodes, None))
    }

    fn conditional(&mut self, opening: Instruction<'t>) -> Result<Node> {
        let mut branches = vec![];
        let mut condition = Some(self.expr(&opening, opening.args)?);
        let mut seen_else = false;
        loop {
            let (body, terminator) = self.block()?;
            branches.push((condition.take(), body));
            let Some(term) = terminator else {
                return Err(self.error(&opening, "if is never closed".into()));
            };
            match term.op {
                "endif" => return Ok(Node::If { branches }),
                "elseif" if !seen_else => condition = Some(self.expr(&term, term.args)?),
                "else" if !seen_else => seen_else = true,
                other => {
                    return Err(self.error(&term, format!("unexpected '{}' in if block", other)));
                }
            }
        }
    }

    fn expect_end(&mut self, opening: &Instruction<'_>, end: &str) -> Result<Vec<Node>> {
        let (body, terminator) = self.block()?;
        match terminator {
            Some(t) if t.op == end => Ok(body),
            Some(t) => Err(self.error(&t, format!("expected '{}', found '{}'", end, t.op))),
            None => Err(self.error(opening, format!("'{}' is never closed", opening.op))),
        }
    }

    fn expr(&self, at: &Instruction<'_>, source: &str) -> Result<Expr> {
        expr::parse(source).map_err(|e| self.error(at, e.0))
    }

    fn object(&self, at: &Instruction<'_>) -> Result<Data> {
        match serde_json::from_str::<Value>(at.args) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(self.error(at, format!("malformed '{}' payload", at.op))),
        }
    }
}

/// Evaluates a node tree.
pub fn execute(
    template: &str,
    nodes: &[Node],
    ctx: &RenderContext<'_>,
    host: &dyn PartialHost,
) -> Result<String> {
    let mut out = String::new();
    execute_into(template, nodes, ctx, host, &mut out)?;
    Ok(out)
}

fn execute_into(
    template: &str,
    nodes: &[Node],
    ctx: &RenderContext<'_>,
    host: &dyn PartialHost,
    out: &mut String,
) -> Result<()> {
    let eval = |expr: &Expr, source: &str, ctx: &RenderContext<'_>| {
        expr.eval(ctx)
            .map_err(|e| EngineError::render(template, format!("{} in '{}'", e, source)))
    };

    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Echo { source, expr, raw } => {
                let text = display_value(&eval(expr, source, ctx)?);
                if *raw {
                    out.push_str(&text);
                } else {
                    out.push_str(&escape_html(&text));
                }
            }
            Node::If { branches } => {
                for (condition, body) in branches {
                    let taken = match condition {
                        Some(c) => is_truthy(&eval(c, "if", ctx)?),
                        None => true,
                    };
                    if taken {
                        execute_into(template, body, ctx, host, out)?;
                        break;
                    }
                }
            }
            Node::Each { item, source, collection, body } => {
                let entries: Vec<(Value, Value)> = match eval(collection, source, ctx)? {
                    Value::Array(items) => items
                        .into_iter()
                        .enumerate()
                        .map(|(i, v)| (json!(i), v))
                        .collect(),
                    Value::Object(map) => {
                        map.into_iter().map(|(k, v)| (Value::String(k), v)).collect()
                    }
                    Value::Null => vec![],
                    other => {
                        return Err(EngineError::render(
                            template,
                            format!("'{}' is not iterable ({})", source, kind_of(&other)),
                        ))
                    }
                };
                let count = entries.len();
                for (index, (key, value)) in entries.into_iter().enumerate() {
                    let mut vars = Data::new();
                    vars.insert(item.clone(), value);
                    vars.insert(
                        "loop".into(),
                        json!({
                            "index": index,
                            "iteration": index + 1,
                            "first": index == 0,
                            "last": index + 1 == count,
                            "count": count,
                            "key": key,
                        }),
                    );
                    let scope = ctx.layer(vars);
                    execute_into(template, body, &scope, host, out)?;
                }
            }
            Node::Scope { data, body } => {
                let scope = ctx.layer(data.clone());
                execute_into(template, body, &scope, host, out)?;
            }
            Node::Partial { name, data } => {
                out.push_str(&host.render_partial(name, data.clone(), ctx)?);
            }
        }
    }
    Ok(())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use std::cell::RefCell;

    struct RecordingHost {
        calls: RefCell<Vec<String>>,
    }

    impl PartialHost for RecordingHost {
        fn render_partial(
            &self,
            name: &str,
            data: Data,
            ctx: &RenderContext<'_>,
        ) -> Result<String> {
            self.calls.borrow_mut().push(name.to_string());
            let who = data
                .get("who")
                .or_else(|| ctx.get("who"))
                .map(display_value)
                .unwrap_or_default();
            Ok(format!("<{}:{}>", name, who))
        }
    }

    fn render(source: &str, data: Value) -> Result<String> {
        let compiled = Compiler::new().compile("t", source, |_| Ok(String::new()))?;
        let nodes = parse_compiled("t", &compiled)?;
        let host = RecordingHost { calls: RefCell::new(vec![]) };
        let ctx = RenderContext::new(data.as_object().cloned().unwrap_or_default());
        execute("t", &nodes, &ctx, &host)
    }

    #[test]
    fn test_escaped_and_raw_output() {
        let out = render("{{ html }}|{!! html !!}", json!({"html": "<b>&</b>"})).unwrap();
        assert_eq!(out, "&lt;b&gt;&amp;&lt;/b&gt;|<b>&</b>");
    }

    #[test]
    fn test_conditional_branches() {
        let src = "@if(role == 'admin')A@elseif(role == 'user')U@else ?@endif";
        assert_eq!(render(src, json!({"role": "admin"})).unwrap(), "A");
        assert_eq!(render(src, json!({"role": "user"})).unwrap(), "U");
        assert_eq!(render(src, json!({"role": "guest"})).unwrap(), " ?");
    }

    #[test]
    fn test_loop_variables() {
        let src = "@foreach(items as item){{ loop.iteration }}={{ item }}@if(!loop.last),@endif@endforeach";
        let out = render(src, json!({"items": ["a", "b", "c"]})).unwrap();
        assert_eq!(out, "1=a,2=b,3=c");
    }

    #[test]
    fn test_loop_does_not_leak_item() {
        let err = render("@foreach(xs as x)@endforeach{{ x }}", json!({"xs": [1]})).unwrap_err();
        assert!(matches!(err, EngineError::Render { .. }));
    }

    #[test]
    fn test_missing_variable_is_render_error() {
        let err = render("<p>{{ user.name }}</p>", json!({})).unwrap_err();
        assert!(err.to_string().contains("user.name"));
        assert_eq!(render("{{ user.name? }}", json!({})).unwrap(), "");
        assert_eq!(render("{{ user.name ?? 'anon' }}", json!({})).unwrap(), "anon");
    }

    #[test]
    fn test_non_iterable_rejected() {
        assert!(render("@foreach(n as x)@endforeach", json!({"n": 3})).is_err());
    }

    #[test]
    fn test_partial_sees_enclosing_scope() {
        let compiled = "<?fg scope {\"who\":\"ada\"} ?><?fg partial {\"name\":\"card\",\"data\":{}} ?><?fg endscope ?>";
        let nodes = parse_compiled("t", compiled).unwrap();
        let host = RecordingHost { calls: RefCell::new(vec![]) };
        let out = execute("t", &nodes, &RenderContext::default(), &host).unwrap();
        assert_eq!(out, "<card:ada>");
        assert_eq!(host.calls.borrow().as_slice(), ["card".to_string()]);
    }

    #[test]
    fn test_unbalanced_compiled_text_rejected() {
        assert!(parse_compiled("t", "<?fg if a ?>x").is_err());
        assert!(parse_compiled("t", "<?fg endeach ?>").is_err());
        assert!(parse_compiled("t", "<?fg if a ?><?fg else ?><?fg else ?><?fg endif ?>").is_err());
        assert!(parse_compiled("t", "<?fg echo a").is_err());
    }
}
