//! Tokenizer for the snippet language.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Number(f64),
    Str(String),
    /// `/pattern/flags`, recognised only where an operand is expected.
    Regex {
        pattern: String,
        flags: String,
    },
    /// Backtick literal: alternating raw text and `${...}` source.
    Template(Vec<TemplatePiece>),
    Ident(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePiece {
    Text(String),
    Expr(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Number(n) => write!(f, "{n}"),
            Tok::Str(s) => write!(f, "{s:?}"),
            Tok::Regex { pattern, flags } => write!(f, "/{pattern}/{flags}"),
            Tok::Template(_) => write!(f, "template literal"),
            Tok::Ident(name) => write!(f, "{name}"),
            Tok::Punct(p) => write!(f, "{p}"),
            Tok::Eof => write!(f, "end of input"),
        }
    }
}

/// Longest operators first so `===` wins over `==` and `=`.
const PUNCTS: &[&str] = &[
    "===", "!==", "**=", "...", "==", "!=", "<=", ">=", "=>", "**", "++", "--", "+=", "-=", "*=",
    "/=", "%=", "&&", "||", "??", "?.", ";", ",", ".", "(", ")", "[", "]", "{", "}", ":", "?", "+",
    "-", "*", "/", "%", "<", ">", "=", "!",
];

pub fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line = 1u32;

    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            line += 1;
            i += 1;
            continue;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // Comments: `//`, `#`, and `/* ... */`.
        if c == '#' || (c == '/' && chars.get(i + 1) == Some(&'/')) {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            loop {
                match chars.get(i) {
                    None => return Err(format!("line {line}: unterminated block comment")),
                    Some('*') if chars.get(i + 1) == Some(&'/') => {
                        i += 2;
                        break;
                    }
                    Some('\n') => {
                        line += 1;
                        i += 1;
                    }
                    Some(_) => i += 1,
                }
            }
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()))
        {
            let (n, next) = lex_number(&chars, i).map_err(|e| format!("line {line}: {e}"))?;
            tokens.push(Token {
                tok: Tok::Number(n),
                line,
            });
            i = next;
            continue;
        }

        if c == '"' || c == '\'' {
            let start_line = line;
            let (s, next) = lex_string(&chars, i, c, &mut line)?;
            tokens.push(Token {
                tok: Tok::Str(s),
                line: start_line,
            });
            i = next;
            continue;
        }

        if c == '`' {
            let start_line = line;
            let (pieces, next) = lex_template(&chars, i, &mut line)?;
            tokens.push(Token {
                tok: Tok::Template(pieces),
                line: start_line,
            });
            i = next;
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(Token {
                tok: Tok::Ident(chars[start..i].iter().collect()),
                line,
            });
            continue;
        }

        if c == '/' && expects_operand(tokens.last()) {
            let (pattern, flags, next) = lex_regex(&chars, i, line)?;
            tokens.push(Token {
                tok: Tok::Regex { pattern, flags },
                line,
            });
            i = next;
            continue;
        }

        let punct = PUNCTS.iter().find(|p| {
            p.chars()
                .enumerate()
                .all(|(k, pc)| chars.get(i + k) == Some(&pc))
        });
        match punct {
            Some(p) => {
                tokens.push(Token {
                    tok: Tok::Punct(p),
                    line,
                });
                i += p.chars().count();
            }
            None => return Err(format!("line {line}: unexpected character '{c}'")),
        }
    }

    tokens.push(Token {
        tok: Tok::Eof,
        line,
    });
    Ok(tokens)
}

/// Whether a `/` after `prev` starts a regex literal rather than a division.
fn expects_operand(prev: Option<&Token>) -> bool {
    match prev.map(|t| &t.tok) {
        None => true,
        Some(Tok::Punct(p)) => !matches!(*p, ")" | "]" | "}" | "++" | "--"),
        Some(Tok::Ident(word)) => matches!(
            word.as_str(),
            "return" | "typeof" | "case" | "of" | "in" | "await"
        ),
        Some(_) => false,
    }
}

fn lex_regex(chars: &[char], start: usize, line: u32) -> Result<(String, String, usize), String> {
    let mut i = start + 1;
    let mut pattern = String::new();
    let mut in_class = false;
    loop {
        match chars.get(i) {
            None | Some('\n') => return Err(format!("line {line}: unterminated regex literal")),
            Some('\\') => {
                pattern.push('\\');
                if let Some(&next) = chars.get(i + 1) {
                    pattern.push(next);
                }
                i += 2;
            }
            Some('[') => {
                in_class = true;
                pattern.push('[');
                i += 1;
            }
            Some(']') => {
                in_class = false;
                pattern.push(']');
                i += 1;
            }
            Some('/') if !in_class => {
                i += 1;
                break;
            }
            Some(&c) => {
                pattern.push(c);
                i += 1;
            }
        }
    }
    let flags_start = i;
    while i < chars.len() && chars[i].is_ascii_alphabetic() {
        i += 1;
    }
    Ok((pattern, chars[flags_start..i].iter().collect(), i))
}

fn lex_number(chars: &[char], start: usize) -> Result<(f64, usize), String> {
    let mut i = start;
    if chars[i] == '0' && matches!(chars.get(i + 1), Some('x') | Some('X')) {
        i += 2;
        let digits_start = i;
        while i < chars.len() && (chars[i].is_ascii_hexdigit() || chars[i] == '_') {
            i += 1;
        }
        let digits: String = chars[digits_start..i].iter().filter(|c| **c != '_').collect();
        let n = u64::from_str_radix(&digits, 16).map_err(|e| format!("bad hex literal: {e}"))?;
        return Ok((n as f64, i));
    }

    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
        i += 1;
    }
    if chars.get(i) == Some(&'.') && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()) {
        i += 1;
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
            i += 1;
        }
    }
    if matches!(chars.get(i), Some('e') | Some('E')) {
        let mut j = i + 1;
        if matches!(chars.get(j), Some('+') | Some('-')) {
            j += 1;
        }
        if chars.get(j).is_some_and(|d| d.is_ascii_digit()) {
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
    text.parse::<f64>()
        .map(|n| (n, i))
        .map_err(|e| format!("bad number literal '{text}': {e}"))
}

/// Decode one escape sequence starting after the backslash at `chars[i]`.
/// Returns the decoded text and the index after the sequence.
fn lex_escape(chars: &[char], i: usize) -> (String, usize) {
    let Some(&c) = chars.get(i) else {
        return ("\\".into(), i);
    };
    let hex = |from: usize, len: usize| -> Option<char> {
        let digits: String = chars.get(from..from + len)?.iter().collect();
        u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32)
    };
    match c {
        'n' => ("\n".into(), i + 1),
        't' => ("\t".into(), i + 1),
        'r' => ("\r".into(), i + 1),
        '0' => ("\0".into(), i + 1),
        'b' => ("\u{8}".into(), i + 1),
        'f' => ("\u{c}".into(), i + 1),
        'v' => ("\u{b}".into(), i + 1),
        'x' => match hex(i + 1, 2) {
            Some(ch) => (ch.to_string(), i + 3),
            None => ("x".into(), i + 1),
        },
        'u' => match hex(i + 1, 4) {
            Some(ch) => (ch.to_string(), i + 5),
            None => ("u".into(), i + 1),
        },
        // Line continuation.
        '\n' => (String::new(), i + 1),
        other => (other.to_string(), i + 1),
    }
}

fn lex_string(
    chars: &[char],
    start: usize,
    quote: char,
    line: &mut u32,
) -> Result<(String, usize), String> {
    let mut i = start + 1;
    let mut out = String::new();
    loop {
        match chars.get(i) {
            None => return Err(format!("line {line}: unterminated string literal")),
            Some(&c) if c == quote => return Ok((out, i + 1)),
            Some('\\') => {
                let (decoded, next) = lex_escape(chars, i + 1);
                out.push_str(&decoded);
                i = next;
            }
            Some('\n') => {
                *line += 1;
                out.push('\n');
                i += 1;
            }
            Some(&c) => {
                out.push(c);
                i += 1;
            }
        }
    }
}

fn lex_template(
    chars: &[char],
    start: usize,
    line: &mut u32,
) -> Result<(Vec<TemplatePiece>, usize), String> {
    let mut i = start + 1;
    let mut pieces = Vec::new();
    let mut text = String::new();
    loop {
        match chars.get(i) {
            None => return Err(format!("line {line}: unterminated template literal")),
            Some('`') => {
                if !text.is_empty() {
                    pieces.push(TemplatePiece::Text(text));
                }
                return Ok((pieces, i + 1));
            }
            Some('\\') => {
                let (decoded, next) = lex_escape(chars, i + 1);
                text.push_str(&decoded);
                i = next;
            }
            Some('$') if chars.get(i + 1) == Some(&'{') => {
                if !text.is_empty() {
                    pieces.push(TemplatePiece::Text(std::mem::take(&mut text)));
                }
                i += 2;
                let expr_start = i;
                let mut depth = 1;
                while depth > 0 {
                    match chars.get(i) {
                        None => return Err(format!("line {line}: unterminated ${{ in template")),
                        Some('{') => depth += 1,
                        Some('}') => depth -= 1,
                        Some('\n') => *line += 1,
                        _ => {}
                    }
                    i += 1;
                }
                let expr: String = chars[expr_start..i - 1].iter().collect();
                pieces.push(TemplatePiece::Expr(expr));
            }
            Some(&c) => {
                if c == '\n' {
                    *line += 1;
                }
                text.push(c);
                i += 1;
            }
        }
    }
}
