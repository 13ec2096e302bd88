//! Compiler Pipeline - Ordered Directive Passes
//!
//! Lowers template directives to `<?fg op args ?>` instructions.
//!
//! Order:
//! 1. syntax validation (source level, the only pass that fails)
//! 2. comments
//! 3. includes (inlines compiled output of other templates)
//! 4. partial references
//! 5. escaped output `{{ }}`
//! 6. raw output `{!! !!}`
//! 7. conditionals
//! 8. loops
//!
//! followed by the yield pass once the layout chain is merged.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::context::Data;
use crate::error::{line_of, EngineError, Result};
use crate::expr;
use crate::sections::SectionMap;
use crate::syntax::{
    at_directive, balanced_args, bare_directive, call_opening, instruction, map_text,
    try_map_text, unquote, INSTRUCTION_CLOSE, INSTRUCTION_OPEN,
};

static COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{\{--.*?--\}\}").expect("comment pattern"));
static ESCAPED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{\{\s*(.+?)\s*\}\}").expect("echo pattern"));
static RAW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{!!\s*(.+?)\s*!!\}").expect("raw pattern"));
static SHORT_YIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[yield:([^\]\s]+)\]").expect("yield pattern"));

static INCLUDE: Lazy<Regex> = Lazy::new(|| call_opening("include"));
static PARTIAL: Lazy<Regex> = Lazy::new(|| call_opening("partial"));
static YIELD: Lazy<Regex> = Lazy::new(|| call_opening("yield"));
static IF: Lazy<Regex> = Lazy::new(|| call_opening("if"));
static ELSEIF: Lazy<Regex> = Lazy::new(|| call_opening("elseif"));
static ELSE: Lazy<Regex> = Lazy::new(|| at_directive("else"));
static ENDIF: Lazy<Regex> = Lazy::new(|| bare_directive("endif"));
static FOREACH: Lazy<Regex> = Lazy::new(|| call_opening("foreach"));
static ENDFOREACH: Lazy<Regex> = Lazy::new(|| bare_directive("endforeach"));

/// A stateless text transformation. Must be total on validated input.
pub trait CompilerPass {
    fn name(&self) -> &'static str;
    fn transform(&self, text: &str) -> String;
}

pub struct CommentPass;

impl CompilerPass for CommentPass {
    fn name(&self) -> &'static str {
        "comments"
    }

    fn transform(&self, text: &str) -> String {
        COMMENT.replace_all(text, "").into_owned()
    }
}

pub struct PartialPass;

impl CompilerPass for PartialPass {
    fn name(&self) -> &'static str {
        "partials"
    }

    fn transform(&self, text: &str) -> String {
        replace_calls(text, &PARTIAL, |args| {
            let call = parse_named_call(args).ok()?;
            let payload = serde_json::json!({ "name": call.name, "data": call.data });
            Some(instruction("partial", &instruction_json(&payload)))
        })
    }
}

pub struct EscapedEchoPass;

impl CompilerPass for EscapedEchoPass {
    fn name(&self) -> &'static str {
        "escaped_output"
    }

    fn transform(&self, text: &str) -> String {
        ESCAPED
            .replace_all(text, |caps: &Captures| instruction("echo", caps[1].trim()))
            .into_owned()
    }
}

pub struct RawEchoPass;

impl CompilerPass for RawEchoPass {
    fn name(&self) -> &'static str {
        "raw_output"
    }

    fn transform(&self, text: &str) -> String {
        RAW.replace_all(text, |caps: &Captures| instruction("raw", caps[1].trim()))
            .into_owned()
    }
}

pub struct ConditionalPass;

impl CompilerPass for ConditionalPass {
    fn name(&self) -> &'static str {
        "conditionals"
    }

    fn transform(&self, text: &str) -> String {
        let text = replace_calls(text, &ELSEIF, |args| Some(instruction("elseif", args.trim())));
        let text = replace_calls(&text, &IF, |args| Some(instruction("if", args.trim())));
        let text = ELSE.replace_all(&text, regex::NoExpand(&instruction("else", "")));
        ENDIF
            .replace_all(&text, regex::NoExpand(&instruction("endif", "")))
            .into_owned()
    }
}

pub struct LoopPass;

impl CompilerPass for LoopPass {
    fn name(&self) -> &'static str {
        "loops"
    }

    fn transform(&self, text: &str) -> String {
        let text = replace_calls(text, &FOREACH, |args| {
            let (collection, item) = split_foreach(args)?;
            Some(instruction("each", &format!("{} in {}", item, collection)))
        });
        ENDFOREACH
            .replace_all(&text, regex::NoExpand(&instruction("endeach", "")))
            .into_owned()
    }
}

/// Runs the passes in their fixed order.
pub struct Compiler {
    passes: Vec<Box<dyn CompilerPass + Send + Sync>>,
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            passes: vec![
                Box::new(PartialPass),
                Box::new(EscapedEchoPass),
                Box::new(RawEchoPass),
                Box::new(ConditionalPass),
                Box::new(LoopPass),
            ],
        }
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        let mut names = vec![CommentPass.name(), "includes"];
        names.extend(self.passes.iter().map(|p| p.name()));
        names
    }

    /// Compiles validated source text. `include` returns the compiled text
    /// of an included template.
    pub fn compile<F>(&self, template: &str, source: &str, include: F) -> Result<String>
    where
        F: FnMut(&str) -> Result<String>,
    {
        let text = CommentPass.transform(source);
        let mut text = expand_includes(template, &text, include)?;
        for pass in &self.passes {
            text = map_text(&text, |segment| pass.transform(segment));
            tracing::trace!(template, pass = pass.name(), "compiler pass applied");
        }
        Ok(text)
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Replaces every `include(name[, {data}])` with the included template's
/// compiled text, wrapped in a data scope when a data bag is given.
/// `partial(...)` calls are stepped over whole, so their data is never
/// mistaken for an include.
pub fn expand_includes<F>(template: &str, text: &str, mut include: F) -> Result<String>
where
    F: FnMut(&str) -> Result<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    while let Some((keyword, open)) = next_named_call(text, cursor) {
        let (args, end) = balanced_args(text, open.end()).ok_or_else(|| {
            let msg = format!("unclosed {} directive", keyword);
            EngineError::compile(template, line_of(text, open.start()), msg)
        })?;
        if keyword != "include" {
            out.push_str(&text[cursor..end]);
            cursor = end;
            continue;
        }
        let call = parse_named_call(args)
            .map_err(|msg| EngineError::compile(template, line_of(text, open.start()), msg))?;

        out.push_str(&text[cursor..open.start()]);
        let compiled = include(&call.name)?;
        if call.data.is_empty() {
            out.push_str(&compiled);
        } else {
            out.push_str(&instruction("scope", &instruction_json(&Value::Object(call.data))));
            out.push_str(&compiled);
            out.push_str(&instruction("endscope", ""));
        }
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}

/// Stateful pass substituting `yield(name[, default])` and `[yield:name]`.
pub struct YieldPass<'s> {
    sections: &'s SectionMap,
    max_depth: usize,
}

impl<'s> YieldPass<'s> {
    pub fn new(sections: &'s SectionMap, max_depth: usize) -> Self {
        Self { sections, max_depth }
    }

    /// Substitutes yields in the literal text of compiled `text`. Instruction
    /// payloads are left alone.
    pub fn apply(&self, template: &str, text: &str) -> Result<String> {
        self.apply_nested(template, text, &mut vec![])
    }

    fn apply_nested(&self, template: &str, text: &str, stack: &mut Vec<String>) -> Result<String> {
        try_map_text(text, |segment| self.expand(template, segment, stack))
    }

    fn expand(&self, template: &str, text: &str, stack: &mut Vec<String>) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        loop {
            let call = YIELD.find_at(text, cursor);
            let short = SHORT_YIELD.captures_at(text, cursor);
            let next = match (call, short) {
                (None, None) => break,
                (Some(c), Some(s)) if s.get(0).map_or(false, |m| m.start() < c.start()) => {
                    YieldSite::Short(s)
                }
                (Some(c), _) => YieldSite::Call(c),
                (None, Some(s)) => YieldSite::Short(s),
            };

            let (start, end, name, default) = match next {
                YieldSite::Call(m) => {
                    let (args, end) = balanced_args(text, m.end()).ok_or_else(|| {
                        let line = line_of(text, m.start());
                        EngineError::compile(template, line, "unclosed yield directive")
                    })?;
                    let (name, rest) = split_first_arg(args);
                    let default = rest.map(|r| unquote(r).to_string()).unwrap_or_default();
                    (m.start(), end, unquote(name).to_string(), default)
                }
                YieldSite::Short(caps) => {
                    let whole = caps.get(0).map_or(0..0, |m| m.range());
                    (whole.start, whole.end, caps[1].to_string(), String::new())
                }
            };

            out.push_str(&text[cursor..start]);
            match self.sections.get(&name) {
                Some(content) => {
                    if stack.contains(&name) || stack.len() >= self.max_depth {
                        stack.push(name);
                        return Err(EngineError::RecursionLimitExceeded {
                            limit: self.max_depth,
                            chain: stack.iter().map(|s| format!("{}#{}", template, s)).collect(),
                        });
                    }
                    stack.push(name);
                    let expanded = self.apply_nested(template, content, stack)?;
                    stack.pop();
                    out.push_str(&expanded);
                }
                // Undefined sections yield their default, or nothing.
                None => out.push_str(&default),
            }
            cursor = end;
        }
        out.push_str(&text[cursor..]);
        Ok(out)
    }
}

enum YieldSite<'t> {
    Call(regex::Match<'t>),
    Short(Captures<'t>),
}

/// Source-level syntax check, run on every template as it is loaded.
pub fn validate_syntax(template: &str, source: &str) -> Result<()> {
    let fail = |offset: usize, msg: String| {
        Err(EngineError::compile(template, line_of(source, offset), msg))
    };

    if let Some(pos) = source.find(INSTRUCTION_OPEN) {
        return fail(pos, format!("reserved sequence '{}'", INSTRUCTION_OPEN));
    }
    let mut text = blank_comments(source);
    if let Some(pos) = text.find("{{--") {
        return fail(pos, "unclosed comment".into());
    }

    // Include and partial data is JSON; blank it once checked so the
    // directive checks below never look inside it.
    let mut cursor = 0;
    while let Some((_, m)) = next_named_call(&text, cursor) {
        let Some((args, end)) = balanced_args(&text, m.end()) else {
            return fail(m.start(), "unclosed directive arguments".into());
        };
        parse_named_call(args).map(|_| ()).or_else(|msg| fail(m.start(), msg))?;
        let (range, blanked) = (m.end()..end - 1, blank(args));
        text.replace_range(range, &blanked);
        cursor = end;
    }

    for (open, close, kind) in [("{!!", "!!}", "raw output"), ("{{", "}}", "escaped output")] {
        let mut cursor = 0;
        while let Some(rel) = text[cursor..].find(open) {
            let start = cursor + rel;
            let inner_start = start + open.len();
            let Some(rel_end) = text[inner_start..].find(close) else {
                return fail(start, format!("unclosed {} '{}'", kind, open));
            };
            let inner = &text[inner_start..inner_start + rel_end];
            check_expression(inner).or_else(|msg| fail(start, msg))?;
            cursor = inner_start + rel_end + close.len();
        }
    }

    let mut blocks: Vec<(usize, BlockEvent)> = vec![];
    let openers = [
        (&*IF, BlockEvent::If),
        (&*ELSEIF, BlockEvent::ElseIf),
        (&*FOREACH, BlockEvent::Each),
    ];
    for (re, kind) in openers {
        for m in re.find_iter(&text) {
            let Some((args, _)) = balanced_args(&text, m.end()) else {
                return fail(m.start(), "unclosed directive arguments".into());
            };
            let checked = match kind {
                BlockEvent::Each => match split_foreach(args) {
                    Some((collection, _)) => check_expression(collection),
                    None => Err(format!("expected 'collection as item' in foreach({})", args)),
                },
                _ => check_expression(args),
            };
            checked.or_else(|msg| fail(m.start(), msg))?;
            blocks.push((m.start(), kind));
        }
    }
    let closers = [
        (&*ELSE, BlockEvent::Else),
        (&*ENDIF, BlockEvent::EndIf),
        (&*ENDFOREACH, BlockEvent::EndEach),
    ];
    for (re, kind) in closers {
        blocks.extend(re.find_iter(&text).map(|m| (m.start(), kind)));
    }
    for m in YIELD.find_iter(&text) {
        if balanced_args(&text, m.end()).is_none() {
            return fail(m.start(), "unclosed directive arguments".into());
        }
    }

    blocks.sort_by_key(|(pos, _)| *pos);
    let mut open: Vec<(usize, BlockEvent)> = vec![];
    for (pos, event) in blocks {
        match event {
            BlockEvent::If | BlockEvent::Each => open.push((pos, event)),
            BlockEvent::ElseIf | BlockEvent::Else => {
                if !matches!(open.last(), Some((_, BlockEvent::If))) {
                    return fail(pos, "else/elseif outside of an if block".into());
                }
            }
            BlockEvent::EndIf | BlockEvent::EndEach => {
                let expected = if event == BlockEvent::EndIf {
                    BlockEvent::If
                } else {
                    BlockEvent::Each
                };
                match open.pop() {
                    Some((_, kind)) if kind == expected => {}
                    _ => return fail(pos, format!("unexpected {}", event.directive())),
                }
            }
        }
    }
    if let Some((pos, event)) = open.pop() {
        return fail(pos, format!("{} is never closed", event.directive()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockEvent {
    If,
    ElseIf,
    Else,
    EndIf,
    Each,
    EndEach,
}

impl BlockEvent {
    fn directive(self) -> &'static str {
        match self {
            BlockEvent::If => "if",
            BlockEvent::ElseIf => "elseif",
            BlockEvent::Else => "else",
            BlockEvent::EndIf => "endif",
            BlockEvent::Each => "foreach",
            BlockEvent::EndEach => "endforeach",
        }
    }
}

fn check_expression(source: &str) -> std::result::Result<(), String> {
    if source.contains(INSTRUCTION_CLOSE) {
        return Err(format!("reserved sequence '{}' in expression", INSTRUCTION_CLOSE));
    }
    expr::parse(source).map(|_| ()).map_err(|e| e.0)
}

/// Replaces comments with whitespace of the same byte length, so offsets
/// into the result are offsets into `source`.
fn blank_comments(source: &str) -> String {
    COMMENT
        .replace_all(source, |caps: &Captures| blank(&caps[0]))
        .into_owned()
}

fn blank(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\n' => "\n".to_string(),
            c => " ".repeat(c.len_utf8()),
        })
        .collect()
}

/// Earliest `include(` or `partial(` at or after `cursor`.
fn next_named_call(text: &str, cursor: usize) -> Option<(&'static str, regex::Match<'_>)> {
    let include = INCLUDE.find_at(text, cursor).map(|m| ("include", m));
    let partial = PARTIAL.find_at(text, cursor).map(|m| ("partial", m));
    [include, partial].into_iter().flatten().min_by_key(|(_, m)| m.start())
}

/// `name[, {json}]` argument list of include and partial.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedCall {
    pub name: String,
    pub data: Data,
}

pub fn parse_named_call(args: &str) -> std::result::Result<NamedCall, String> {
    let (name, rest) = split_first_arg(args);
    let name = unquote(name);
    if name.is_empty() {
        return Err("missing template name".into());
    }
    let data = match rest.map(str::trim).filter(|r| !r.is_empty()) {
        None => Data::new(),
        Some(json) => match serde_json::from_str::<Value>(json) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(format!("data for '{}' must be an object", name)),
            Err(e) => return Err(format!("invalid data for '{}': {}", name, e)),
        },
    };
    Ok(NamedCall { name: name.to_string(), data })
}

/// Splits at the first comma outside of quotes and brackets.
pub fn split_first_arg(args: &str) -> (&str, Option<&str>) {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in args.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '{' | '[' | '(') => depth += 1,
            (None, '}' | ']' | ')') => depth -= 1,
            (None, ',') if depth == 0 => return (args[..i].trim(), Some(&args[i + 1..])),
            _ => {}
        }
    }
    (args.trim(), None)
}

/// `collection as item` -> (collection, item).
fn split_foreach(args: &str) -> Option<(&str, &str)> {
    let (collection, item) = args.rsplit_once(" as ")?;
    let item = item.trim();
    let valid = !item.is_empty() && item.chars().all(|c| c.is_alphanumeric() || c == '_');
    valid.then(|| (collection.trim(), item))
}

/// JSON for instruction arguments; `?>` inside strings is escaped so it
/// cannot terminate the instruction.
pub fn instruction_json(value: &Value) -> String {
    value.to_string().replace(INSTRUCTION_CLOSE, "?\\u003e")
}

fn replace_calls<F>(text: &str, opening: &Regex, mut replace: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    while let Some(open) = opening.find_at(text, cursor) {
        let Some((args, end)) = balanced_args(text, open.end()) else {
            break;
        };
        out.push_str(&text[cursor..open.start()]);
        match replace(args) {
            Some(replacement) => out.push_str(&replacement),
            None => out.push_str(&text[open.start()..end]),
        }
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> String {
        validate_syntax("test", source).unwrap();
        Compiler::new()
            .compile("test", source, |name| Ok(format!("[{}]", name)))
            .unwrap()
    }

    #[test]
    fn test_echo_lowering() {
        assert_eq!(compile("<b>{{ user.name }}</b>"), "<b><?fg echo user.name ?></b>");
        assert_eq!(compile("{!! body !!}"), "<?fg raw body ?>");
    }

    #[test]
    fn test_comments_removed() {
        assert_eq!(compile("a{{-- {{ not.code }} --}}b"), "ab");
    }

    #[test]
    fn test_conditionals_and_loops() {
        let out = compile(
            "@if(a)x@elseif(b == 'y')y@else z@endif foreach(rows as row){{ row }}endforeach",
        );
        assert_eq!(
            out,
            "<?fg if a ?>x<?fg elseif b == 'y' ?>y<?fg else ?> z<?fg endif ?> \
             <?fg each row in rows ?><?fg echo row ?><?fg endeach ?>"
        );
    }

    #[test]
    fn test_include_inlined_with_scope() {
        let out = compile(r#"<ul>@include('item', {"label": "a?>b"})</ul>"#);
        assert_eq!(
            out,
            "<ul><?fg scope {\"label\":\"a?\\u003eb\"} ?>[item]<?fg endscope ?></ul>"
        );
        assert_eq!(compile("include(nav)"), "[nav]");
    }

    #[test]
    fn test_partial_reference() {
        assert_eq!(
            compile("@partial('sidebar')"),
            r#"<?fg partial {"name":"sidebar","data":{}} ?>"#
        );
    }

    #[test]
    fn test_call_data_left_untouched() {
        let out = compile(r#"@include('row', {"q": "{{ x }} @if(y) endif"})"#);
        assert_eq!(out, r#"<?fg scope {"q":"{{ x }} @if(y) endif"} ?>[row]<?fg endscope ?>"#);

        let out = compile(r#"@partial('row', {"q": "see yield(x) include(z) here"})"#);
        assert_eq!(
            out,
            r#"<?fg partial {"name":"row","data":{"q":"see yield(x) include(z) here"}} ?>"#
        );
        let sections = SectionMap::new();
        assert_eq!(YieldPass::new(&sections, 32).apply("t", &out).unwrap(), out);
    }

    #[test]
    fn test_pass_order_documented() {
        assert_eq!(
            Compiler::new().pass_names(),
            vec![
                "comments",
                "includes",
                "partials",
                "escaped_output",
                "raw_output",
                "conditionals",
                "loops",
            ]
        );
    }

    #[test]
    fn test_validation_errors_name_line() {
        let cases = [
            ("ok\n{{ name", 2),
            ("{!! x", 1),
            ("a\n\n@if(x) never", 3),
            ("@endif", 1),
            ("foreach(rows)x endforeach", 1),
            ("{{ a b }}", 1),
            ("x <?fg raw y ?>", 1),
            (r#"include('a', [1])"#, 1),
            (r#"include('a', {bad})"#, 1),
            ("{{ '?>' }}", 1),
            ("@else", 1),
        ];
        for (source, expected_line) in cases {
            match validate_syntax("t", source) {
                Err(EngineError::Compile { line, .. }) => {
                    assert_eq!(line, expected_line, "{}", source)
                }
                other => panic!("{} should fail, got {:?}", source, other),
            }
        }
    }

    #[test]
    fn test_comment_lines_preserved_for_errors() {
        let err = validate_syntax("t", "{{--\n\n--}}\n{{ }}").unwrap_err();
        assert!(matches!(err, EngineError::Compile { line: 4, .. }));

        let err = validate_syntax("t", "{{-- a\nb\nc --}}\nok\n@if(x) never").unwrap_err();
        assert!(matches!(err, EngineError::Compile { line: 5, .. }));

        let err = validate_syntax("t", "{{-- é ü --}} x\n{{ a b }}").unwrap_err();
        assert!(matches!(err, EngineError::Compile { line: 2, .. }));
    }

    #[test]
    fn test_yield_substitution() {
        let mut sections = SectionMap::new();
        sections.insert("content", "Hello");
        sections.insert("nested", "<h1>yield(content)</h1>");
        let pass = YieldPass::new(&sections, 32);
        assert_eq!(pass.apply("t", "<div>[yield:content]</div>").unwrap(), "<div>Hello</div>");
        assert_eq!(pass.apply("t", "@yield('nested')").unwrap(), "<h1>Hello</h1>");
        assert_eq!(pass.apply("t", "[@yield('missing')]").unwrap(), "[]");
        assert_eq!(pass.apply("t", "@yield('title', 'Home')").unwrap(), "Home");
    }

    #[test]
    fn test_self_yielding_section_fails() {
        let mut sections = SectionMap::new();
        sections.insert("loop", "again yield(loop)");
        let err = YieldPass::new(&sections, 32).apply("t", "yield(loop)").unwrap_err();
        assert!(matches!(err, EngineError::RecursionLimitExceeded { .. }));
    }

    #[test]
    fn test_split_first_arg() {
        assert_eq!(split_first_arg("'a', {\"x\": 1}"), ("'a'", Some(" {\"x\": 1}")));
        assert_eq!(split_first_arg("'a,b'"), ("'a,b'", None));
    }
}
