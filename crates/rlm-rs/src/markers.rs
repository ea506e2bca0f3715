//! Termination markers and snippet extraction.
//!
//! A model ends a run by emitting one of three markers anywhere in its
//! output, checked in this order:
//!
//! 1. `FINAL_WITH_CONFIDENCE({answer: "...", confidence: 0.9, reasoning: "..."})`
//! 2. `FINAL("...")`, with `"…"`, `'…'`, `"""…"""`, `'''…'''`, or backtick
//!    quoting, or a bare number. A lone identifier is read as `FINAL_VAR`;
//!    any other unquoted argument is not a marker.
//! 3. `FINAL_VAR(name)`, naming a top-level binding of the latest snippet
//!
//! Everything else is a candidate snippet: fenced code blocks if present,
//! otherwise the marker-stripped text when it looks like code.

use crate::sandbox::{self, Bindings, Value, value::final_var_text};
use regex::Regex;
use std::ops::Range;
use std::sync::OnceLock;

/// A termination marker found in model output.
#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    WithConfidence {
        answer: String,
        /// Clamped into `[0, 1]`.
        confidence: f64,
        reasoning: Option<String>,
    },
    Final(String),
    /// Unresolved; see [`resolve_final_var`].
    FinalVar(String),
}

/// A model output split into its marker and snippet parts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedOutput {
    pub marker: Option<Marker>,
    pub snippet: Option<String>,
}

struct Patterns {
    confidence: Regex,
    final_answer: Regex,
    final_var: Regex,
    any_marker: Regex,
    fence: Regex,
    number: Regex,
    scrape_answer: Regex,
    scrape_confidence: Regex,
    scrape_reasoning: Regex,
    code_signals: Vec<Regex>,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            let field = |name: &str| {
                Regex::new(&format!(
                    r#"(?s)["']?\b{name}["']?\s*[:=]\s*("(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'|`(?:[^`\\]|\\.)*`|[^,}}\n]+)"#
                ))
            };
            Some(Patterns {
                confidence: Regex::new(r"\bFINAL_WITH_CONFIDENCE\s*\(").ok()?,
                final_answer: Regex::new(r"\bFINAL\s*\(").ok()?,
                final_var: Regex::new(r#"\bFINAL_VAR\s*\(\s*["'`]?([A-Za-z_][A-Za-z0-9_]*)["'`]?\s*\)"#).ok()?,
                any_marker: Regex::new(r"\b(?:FINAL_WITH_CONFIDENCE|FINAL_VAR|FINAL)\s*\(").ok()?,
                fence: Regex::new(r"(?s)```[A-Za-z0-9_+.-]*[ \t]*\r?\n(.*?)```").ok()?,
                number: Regex::new(r"^[-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?").ok()?,
                scrape_answer: field("answer").ok()?,
                scrape_confidence: Regex::new(r#"["']?\bconfidence["']?\s*[:=]\s*["']?(-?\d*\.?\d+(?:[eE][-+]?\d+)?)"#).ok()?,
                scrape_reasoning: field("reasoning").ok()?,
                code_signals: [
                    // declaration
                    r"\b(?:let|const|var|function)\s+[A-Za-z_$]",
                    // call
                    r"[A-Za-z_$][\w$]*\s*\(",
                    // member access
                    r"[A-Za-z_$][\w$]*\.[A-Za-z_$]",
                    // assignment
                    r"[\w\])]\s*[-+*/]?=[^=>]",
                    // bracket or brace literal
                    r"[\[{]",
                    // comparison
                    r"===|!==|==|!=|<=|>=|\s<\s|\s>\s",
                    // arithmetic
                    r"\d\s*[-+*/%]\s*\d|\w\s+[-+*/%]\s+\w|\+\+|--\s*;",
                    // comment
                    r"(?m)^\s*(?://|#)|/\*",
                ]
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
            })
        })
        .as_ref()
}

// ── Scanning helpers ───────────────────────────────────────────────

/// Byte index just past the quoted literal starting at `start`, which must
/// hold a quote character. Triple quotes end at the next triple quote.
fn skip_string(text: &str, start: usize) -> Option<usize> {
    let rest = text.get(start..)?;
    for triple in ["\"\"\"", "'''"] {
        if rest.starts_with(triple) {
            let body = rest.get(3..)?;
            return body.find(triple).map(|i| start + 3 + i + 3);
        }
    }
    let quote = rest.chars().next()?;
    let mut escaped = false;
    for (i, c) in rest.char_indices().skip(1) {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return Some(start + i + c.len_utf8());
        }
    }
    None
}

/// Byte index of the delimiter closing the one at `open`, skipping string
/// literals.
fn find_close(text: &str, open: usize) -> Option<usize> {
    let (open_char, close_char) = match text.get(open..)?.chars().next()? {
        '(' => ('(', ')'),
        '{' => ('{', '}'),
        '[' => ('[', ']'),
        _ => return None,
    };
    let mut depth = 0usize;
    let mut i = open;
    while let Some(c) = text.get(i..).and_then(|r| r.chars().next()) {
        match c {
            '"' | '\'' | '`' => {
                i = skip_string(text, i)?;
                continue;
            }
            c if c == open_char => depth += 1,
            c if c == close_char => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += c.len_utf8();
    }
    None
}

/// Undo `\n \t \r \" \' \\` (and `` \` ``); unknown escapes are kept.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(q @ ('"' | '\'' | '\\' | '`')) => out.push(q),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Strip the surrounding quotes of a scraped field value.
fn unquote(raw: &str) -> String {
    let t = raw.trim();
    for q in ['"', '\'', '`'] {
        if let Some(inner) = t.strip_prefix(q).and_then(|r| r.strip_suffix(q)) {
            return unescape(inner);
        }
    }
    t.to_string()
}

fn clamp_confidence(c: f64) -> f64 {
    if c.is_nan() { 0.0 } else { c.clamp(0.0, 1.0) }
}

// ── Markers ────────────────────────────────────────────────────────

/// Parse the payload of `FINAL_WITH_CONFIDENCE(`, starting right after the
/// opening parenthesis.
fn confidence_payload(p: &Patterns, after: &str) -> Option<Marker> {
    let offset = after.len() - after.trim_start().len();
    let object = after
        .trim_start()
        .starts_with('{')
        .then(|| find_close(after, offset))
        .flatten()
        .and_then(|close| after.get(offset..=close));

    if let Some(object) = object
        && let Ok(Value::Object(map)) = sandbox::eval_literal(object)
    {
        let answer = match map.get("answer") {
            Some(Value::Str(s)) => Some(s.clone()),
            Some(Value::Number(_) | Value::Bool(_)) => map.get("answer").map(Value::to_display),
            _ => None,
        };
        let confidence = match map.get("confidence") {
            Some(Value::Number(n)) => Some(*n),
            Some(Value::Str(s)) => s.trim().parse().ok(),
            _ => None,
        };
        if let (Some(answer), Some(confidence)) = (answer, confidence) {
            let reasoning = match map.get("reasoning") {
                Some(Value::Null) | None => None,
                Some(v) => Some(v.to_display()),
            };
            return Some(Marker::WithConfidence {
                answer,
                confidence: clamp_confidence(confidence),
                reasoning,
            });
        }
    }

    // Field scrape over the object, or the rest of the text when the
    // object never closes.
    let region = object.unwrap_or(after);
    let answer = p.scrape_answer.captures(region)?.get(1)?.as_str();
    let confidence: f64 = p
        .scrape_confidence
        .captures(region)?
        .get(1)?
        .as_str()
        .parse()
        .ok()?;
    let reasoning = p
        .scrape_reasoning
        .captures(region)
        .and_then(|c| c.get(1))
        .map(|m| unquote(m.as_str()));
    Some(Marker::WithConfidence {
        answer: unquote(answer),
        confidence: clamp_confidence(confidence),
        reasoning,
    })
}

/// Parse the argument of `FINAL(`, starting right after the parenthesis.
/// A bare identifier is read as a variable reference; other unquoted
/// expressions are not a marker.
fn final_payload(p: &Patterns, after: &str) -> Option<Marker> {
    let body = after.trim_start();
    let first = body.chars().next()?;
    if matches!(first, '"' | '\'' | '`') {
        let end = skip_string(body, 0)?;
        let literal = body.get(..end)?;
        for triple in ["\"\"\"", "'''"] {
            if let Some(inner) = literal.strip_prefix(triple).and_then(|r| r.strip_suffix(triple)) {
                return Some(Marker::Final(inner.to_string()));
            }
        }
        return literal.get(1..literal.len() - 1).map(|s| Marker::Final(unescape(s)));
    }
    if let Some(m) = p.number.find(body) {
        let rest = body.get(m.end()..).unwrap_or("").trim_start();
        if rest.is_empty() || rest.starts_with(')') {
            return Some(Marker::Final(m.as_str().to_string()));
        }
    }
    // Anything else unquoted is code, not an answer.
    let text = body.split(')').next().unwrap_or("").trim();
    is_identifier(text).then(|| Marker::FinalVar(text.to_string()))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Find the highest-precedence marker in `text`.
pub fn find_marker(text: &str) -> Option<Marker> {
    let p = patterns()?;
    for m in p.confidence.find_iter(text) {
        if let Some(marker) = text.get(m.end()..).and_then(|after| confidence_payload(p, after)) {
            return Some(marker);
        }
    }
    for m in p.final_answer.find_iter(text) {
        if let Some(marker) = text.get(m.end()..).and_then(|after| final_payload(p, after)) {
            return Some(marker);
        }
    }
    p.final_var
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|name| Marker::FinalVar(name.as_str().to_string()))
}

/// Resolve a `FINAL_VAR` name against snippet bindings. Strings pass
/// through verbatim; other values use their canonical text.
pub fn resolve_final_var(name: &str, bindings: &Bindings) -> Option<String> {
    bindings.get(name).map(final_var_text)
}

// ── Snippets ───────────────────────────────────────────────────────

/// Byte ranges of every marker call in `text`, through its closing
/// parenthesis (or end of line when it never closes).
fn marker_spans(p: &Patterns, text: &str) -> Vec<Range<usize>> {
    let mut spans: Vec<Range<usize>> = Vec::new();
    for m in p.any_marker.find_iter(text) {
        if spans.last().is_some_and(|last| last.end > m.start()) {
            continue;
        }
        let open = m.end() - 1;
        let end = match find_close(text, open) {
            Some(close) => close + 1,
            None => text
                .get(open..)
                .and_then(|r| r.find('\n'))
                .map_or(text.len(), |i| open + i),
        };
        spans.push(m.start()..end);
    }
    spans
}

fn strip_markers(p: &Patterns, text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for span in marker_spans(p, text) {
        out.push_str(text.get(last..span.start).unwrap_or(""));
        last = span.end;
    }
    out.push_str(text.get(last..).unwrap_or(""));
    out
}

/// Lightweight check: at least two of eight code signals are present.
pub fn looks_like_code(text: &str) -> bool {
    let Some(p) = patterns() else {
        return false;
    };
    p.code_signals.iter().filter(|re| re.is_match(text)).count() >= 2
}

/// The snippet to execute, if any: fenced blocks joined in order, or the
/// marker-stripped text when it looks like code.
pub fn extract_snippet(text: &str) -> Option<String> {
    let p = patterns()?;
    let blocks: Vec<&str> = p
        .fence
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    let candidate = if blocks.is_empty() {
        let stripped = strip_markers(p, text);
        let stripped = stripped.trim();
        if !looks_like_code(stripped) {
            return None;
        }
        stripped.to_string()
    } else {
        strip_markers(p, &blocks.join("\n"))
    };
    let candidate = candidate.trim();
    (!candidate.is_empty()).then(|| candidate.to_string())
}

/// Split a model output into marker and snippet.
pub fn parse_output(text: &str) -> ParsedOutput {
    ParsedOutput {
        marker: find_marker(text),
        snippet: extract_snippet(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn final_of(text: &str) -> Option<String> {
        match find_marker(text) {
            Some(Marker::Final(s)) => Some(s),
            _ => None,
        }
    }

    #[test]
    fn quoting_forms() {
        assert_eq!(final_of(r#"FINAL("42")"#).as_deref(), Some("42"));
        assert_eq!(final_of("FINAL('single')").as_deref(), Some("single"));
        assert_eq!(final_of("FINAL(`tick`)").as_deref(), Some("tick"));
        assert_eq!(final_of("FINAL(3.14)").as_deref(), Some("3.14"));
        assert_eq!(
            final_of("FINAL(\"\"\"line one\nsays \\n \"hi\" there\"\"\")").as_deref(),
            Some("line one\nsays \\n \"hi\" there")
        );
        assert_eq!(final_of("FINAL('''a\nb''')").as_deref(), Some("a\nb"));
    }

    #[test]
    fn escaped_answers_round_trip() {
        let answers = [
            "plain",
            "she said \"yes\"",
            "two\nlines\twith tab",
            "back\\slash and 'single'",
            "",
        ];
        for answer in answers {
            let escaped = answer
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n")
                .replace('\t', "\\t");
            let wrapped = format!("Done.\nFINAL(\"{escaped}\")");
            assert_eq!(final_of(&wrapped).as_deref(), Some(answer), "{wrapped}");
        }
    }

    #[test]
    fn bare_arguments() {
        assert_eq!(find_marker("FINAL(total)"), Some(Marker::FinalVar("total".into())));
        assert_eq!(find_marker("FINAL( total )"), Some(Marker::FinalVar("total".into())));
        assert_eq!(find_marker("FINAL(The answer is 5)"), None);
        assert_eq!(find_marker("FINAL(len(xs))"), None);
    }

    #[test]
    fn member_expression_is_code_not_an_answer() {
        let parsed = parse_output("```js\nconst r = { a: 7 }\nFINAL(r.a)\n```");
        assert_eq!(parsed.marker, None);
        assert_eq!(parsed.snippet.as_deref(), Some("const r = { a: 7 }"));
    }

    #[test]
    fn markers_need_a_word_boundary() {
        assert_eq!(find_marker("MY_FINAL(\"x\")"), None);
        assert_eq!(find_marker("call FINAL_VAR(result) now"), Some(Marker::FinalVar("result".into())));
    }

    #[test]
    fn precedence_prefers_confidence_then_final() {
        let text = "FINAL_VAR(x)\nFINAL(\"plain\")\nFINAL_WITH_CONFIDENCE({answer: \"rich\", confidence: 0.7})";
        assert_eq!(
            find_marker(text),
            Some(Marker::WithConfidence {
                answer: "rich".into(),
                confidence: 0.7,
                reasoning: None
            })
        );
        assert_eq!(final_of("FINAL_VAR(x) FINAL(\"plain\")").as_deref(), Some("plain"));
    }

    #[test]
    fn confidence_is_clamped() {
        let marker = find_marker(r#"FINAL_WITH_CONFIDENCE({"answer": "a", "confidence": 1.7, "reasoning": "r"})"#);
        assert_eq!(
            marker,
            Some(Marker::WithConfidence {
                answer: "a".into(),
                confidence: 1.0,
                reasoning: Some("r".into())
            })
        );
        let marker = find_marker("FINAL_WITH_CONFIDENCE({answer: 'b', confidence: -3})");
        assert!(matches!(marker, Some(Marker::WithConfidence { confidence, .. }) if confidence == 0.0));
    }

    #[test]
    fn confidence_falls_back_to_field_scrape() {
        let text = "FINAL_WITH_CONFIDENCE({answer: \"Paris\", confidence: 0.9, reasoning: it is the capital})";
        match find_marker(text) {
            Some(Marker::WithConfidence {
                answer,
                confidence,
                reasoning,
            }) => {
                assert_eq!(answer, "Paris");
                assert_eq!(confidence, 0.9);
                assert_eq!(reasoning.as_deref(), Some("it is the capital"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn confidence_without_required_fields_is_not_a_marker() {
        assert_eq!(find_marker("FINAL_WITH_CONFIDENCE({answer: \"x\"})"), None);
    }

    #[test]
    fn braces_inside_strings_do_not_end_the_object() {
        let text = r#"FINAL_WITH_CONFIDENCE({answer: "use {x} and )", confidence: 0.5})"#;
        assert!(matches!(find_marker(text), Some(Marker::WithConfidence { answer, .. }) if answer == "use {x} and )"));
    }

    #[test]
    fn final_var_resolution() {
        let mut bindings = Bindings::new();
        bindings.insert("text".into(), Value::str("verbatim \"quoted\""));
        bindings.insert("list".into(), Value::Array(vec![Value::Number(1.0), Value::str("b")]));
        assert_eq!(resolve_final_var("text", &bindings).as_deref(), Some("verbatim \"quoted\""));
        assert_eq!(resolve_final_var("list", &bindings).as_deref(), Some(r#"[1,"b"]"#));
        assert_eq!(resolve_final_var("missing", &bindings), None);
    }

    #[test]
    fn fenced_blocks_are_joined_and_markers_stripped() {
        let text = "Let me look.\n```js\nconst a = context.slice(0, 10)\n```\nthen\n```\nprint(a)\nFINAL_VAR(a)\n```";
        assert_eq!(
            extract_snippet(text).as_deref(),
            Some("const a = context.slice(0, 10)\n\nprint(a)")
        );
    }

    #[test]
    fn unfenced_code_is_detected_by_heuristic() {
        assert_eq!(
            extract_snippet("const n = context.length\nprint(n)").as_deref(),
            Some("const n = context.length\nprint(n)")
        );
        assert_eq!(extract_snippet("I think the answer is near the end."), None);
        assert_eq!(extract_snippet("FINAL(\"done\")"), None);
    }

    #[test]
    fn looks_like_code_needs_two_signals() {
        assert!(looks_like_code("let x = 1"));
        assert!(looks_like_code("// scan\nfoo(bar)"));
        assert!(!looks_like_code("Hello there"));
        assert!(!looks_like_code("call me maybe"));
    }

    #[test]
    fn parse_output_reports_both_parts() {
        let parsed = parse_output("```\nconst r = 'x'\n```\nFINAL_VAR(r)");
        assert_eq!(parsed.marker, Some(Marker::FinalVar("r".into())));
        assert_eq!(parsed.snippet.as_deref(), Some("const r = 'x'"));
    }
}
