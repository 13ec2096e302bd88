//! Directive Syntax Shared by the Parsers and Compiler Passes

use regex::Regex;

/// Opening marker of a compiled instruction. Reserved in template sources.
pub const INSTRUCTION_OPEN: &str = "<?fg";
pub const INSTRUCTION_CLOSE: &str = "?>";

/// `@?keyword(name)` with an optionally quoted name. Capture 1 is the name.
pub fn named_directive(keyword: &str) -> Regex {
    build(&format!(
        r#"@?\b{}\(\s*['"]?([^'"(),\s]+)['"]?\s*\)"#,
        regex::escape(keyword)
    ))
}

/// `@?keyword` without arguments.
pub fn bare_directive(keyword: &str) -> Regex {
    build(&format!(r"@?\b{}\b", regex::escape(keyword)))
}

/// `@keyword` without arguments where the `@` is mandatory.
pub fn at_directive(keyword: &str) -> Regex {
    build(&format!(r"@{}\b", regex::escape(keyword)))
}

/// `@?keyword(` opening; the argument list is read with [`balanced_args`].
pub fn call_opening(keyword: &str) -> Regex {
    build(&format!(r"@?\b{}\(", regex::escape(keyword)))
}

/// Reads a parenthesised argument list starting right after the `(` at
/// `start`. Returns the inner text and the offset just past the closing `)`.
/// Quoted strings may contain parentheses.
pub fn balanced_args(text: &str, start: usize) -> Option<(&str, usize)> {
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '{' | '[' => depth += 1,
            ')' | '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    if c != ')' {
                        return None;
                    }
                    let end = start + i;
                    return Some((&text[start..end], end + 1));
                }
            }
            _ => {}
        }
    }
    None
}

/// Strips one pair of matching quotes.
pub fn unquote(arg: &str) -> &str {
    let arg = arg.trim();
    for q in ['\'', '"'] {
        if arg.len() >= 2 && arg.starts_with(q) && arg.ends_with(q) {
            return &arg[1..arg.len() - 1];
        }
    }
    arg
}

/// Formats a compiled instruction.
pub fn instruction(op: &str, args: &str) -> String {
    if args.is_empty() {
        format!("{} {} {}", INSTRUCTION_OPEN, op, INSTRUCTION_CLOSE)
    } else {
        format!("{} {} {} {}", INSTRUCTION_OPEN, op, args, INSTRUCTION_CLOSE)
    }
}

/// Piece of compiled text: literal text or one whole instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'t> {
    Text(&'t str),
    Instruction(&'t str),
}

/// Splits compiled text at instruction boundaries. An unterminated
/// instruction runs to the end of the text.
pub fn segments(text: &str) -> Vec<Segment<'_>> {
    let mut out = vec![];
    let mut cursor = 0;
    while let Some(rel) = text[cursor..].find(INSTRUCTION_OPEN) {
        let start = cursor + rel;
        if start > cursor {
            out.push(Segment::Text(&text[cursor..start]));
        }
        let body = start + INSTRUCTION_OPEN.len();
        let end = text[body..]
            .find(INSTRUCTION_CLOSE)
            .map_or(text.len(), |rel| body + rel + INSTRUCTION_CLOSE.len());
        out.push(Segment::Instruction(&text[start..end]));
        cursor = end;
    }
    if cursor < text.len() {
        out.push(Segment::Text(&text[cursor..]));
    }
    out
}

/// Rewrites the literal text between instructions; instructions, and the
/// payloads inside them, are copied unchanged.
pub fn try_map_text<F, E>(text: &str, mut f: F) -> std::result::Result<String, E>
where
    F: FnMut(&str) -> std::result::Result<String, E>,
{
    let mut out = String::with_capacity(text.len());
    for segment in segments(text) {
        match segment {
            Segment::Text(t) => out.push_str(&f(t)?),
            Segment::Instruction(i) => out.push_str(i),
        }
    }
    Ok(out)
}

pub fn map_text<F>(text: &str, mut f: F) -> String
where
    F: FnMut(&str) -> String,
{
    segments(text)
        .into_iter()
        .map(|segment| match segment {
            Segment::Text(t) => f(t),
            Segment::Instruction(i) => i.to_string(),
        })
        .collect()
}

fn build(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid directive pattern {}: {}", pattern, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_directive_variants() {
        let re = named_directive("extends");
        for src in ["@extends('base')", "extends(base)", "@extends( \"base\" )"] {
            let caps = re.captures(src).unwrap();
            assert_eq!(&caps[1], "base");
        }
        assert!(re.captures("pretends(base)").is_none());
    }

    #[test]
    fn test_balanced_args_nested() {
        let text = r#"include('card', {"title": "a (b)"}) tail"#;
        let (args, end) = balanced_args(text, "include(".len()).unwrap();
        assert_eq!(args, r#"'card', {"title": "a (b)"}"#);
        assert_eq!(&text[end..], " tail");
    }

    #[test]
    fn test_balanced_args_unclosed() {
        assert!(balanced_args("foo(bar", 4).is_none());
    }

    #[test]
    fn test_segments_keep_instructions_whole() {
        let text = "a<?fg scope {\"q\":\"if(x)\"} ?>b<?fg endscope ?>";
        assert_eq!(
            segments(text),
            vec![
                Segment::Text("a"),
                Segment::Instruction("<?fg scope {\"q\":\"if(x)\"} ?>"),
                Segment::Text("b"),
                Segment::Instruction("<?fg endscope ?>"),
            ]
        );
        assert_eq!(
            map_text(text, |t| t.to_uppercase()),
            "A<?fg scope {\"q\":\"if(x)\"} ?>B<?fg endscope ?>"
        );
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote(" 'card' "), "card");
        assert_eq!(unquote("card"), "card");
    }
}
