//! Static denylist scan run before any snippet executes.
//!
//! The scan looks at identifier tokens (variable, function, and member
//! names), including those inside template `${...}` interpolations, so a
//! query *about* `import` statements can still pass the word around inside
//! string literals. Common English words in the denylist ([`CONTEXTUAL`])
//! are only denied where they would reach something: as a callee or the root
//! of a member access. When the snippet does not even tokenize, the raw text
//! is scanned instead.
//!
//! This is a fast-path rejection layer. The interpreter is the actual
//! boundary: nothing outside the whitelist in [`super::interp`] resolves.

use super::lexer::{TemplatePiece, Tok, Token, tokenize};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Denied capability tokens, grouped by what they would reach.
pub const DENYLIST: &[(&str, &[&str])] = &[
    (
        "process/environment access",
        &["process", "Deno", "Bun", "__dirname", "__filename", "getenv", "environ"],
    ),
    (
        "dynamic module loading",
        &["require", "import", "importScripts", "__import__", "module", "exports"],
    ),
    (
        "arbitrary code evaluation",
        &["eval", "Function", "exec", "execSync", "spawn", "child_process", "vm", "WebAssembly"],
    ),
    (
        "prototype/constructor tampering",
        &[
            "__proto__",
            "prototype",
            "constructor",
            "defineProperty",
            "setPrototypeOf",
            "getPrototypeOf",
            "Reflect",
            "Proxy",
            "__defineGetter__",
            "__defineSetter__",
        ],
    ),
    (
        "filesystem",
        &["fs", "readFile", "readFileSync", "writeFile", "writeFileSync", "unlink", "open"],
    ),
    (
        "raw network",
        &["fetch", "XMLHttpRequest", "WebSocket", "EventSource", "net", "http", "https", "dgram", "socket"],
    ),
    (
        "timers",
        &["setTimeout", "setInterval", "setImmediate", "queueMicrotask", "clearTimeout", "clearInterval"],
    ),
    (
        "ambient globals",
        &["globalThis", "global", "window", "self", "document", "navigator", "this", "arguments"],
    ),
];

/// Denylisted words that are also ordinary variable names. They are denied
/// only as an undeclared callee or member root: `const open = ...` followed
/// by `open.length` passes, while `open(...)`, `self.x` and `module.exports`
/// do not.
pub const CONTEXTUAL: &[&str] = &[
    "open", "net", "http", "https", "socket", "module", "exports", "self", "global", "window",
    "document", "vm", "exec", "spawn", "arguments",
];

/// A denylist hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub token: String,
    pub category: &'static str,
    pub line: u32,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "`{}` ({}) on line {}", self.token, self.category, self.line)
    }
}

fn category_of(word: &str) -> Option<&'static str> {
    DENYLIST
        .iter()
        .find(|(_, tokens)| tokens.contains(&word))
        .map(|(category, _)| *category)
}

fn raw_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            let alternation = DENYLIST
                .iter()
                .flat_map(|(_, tokens)| tokens.iter())
                .map(|t| regex::escape(t))
                .collect::<Vec<_>>()
                .join("|");
            Regex::new(&format!(r"\b(?:{alternation})\b")).ok()
        })
        .as_ref()
}

/// Scan `snippet` and return the first denied token, if any.
pub fn check(snippet: &str) -> Result<(), Violation> {
    scan_source(snippet, 1, &HashSet::new())
}

fn scan_source(src: &str, first_line: u32, outer: &HashSet<String>) -> Result<(), Violation> {
    match tokenize(src) {
        Ok(tokens) => {
            let mut declared = outer.clone();
            declared.extend(declared_names(&tokens));
            scan_tokens(&tokens, first_line, &declared)
        }
        Err(_) => raw_scan(src, first_line),
    }
}

fn scan_tokens(tokens: &[Token], first_line: u32, declared: &HashSet<String>) -> Result<(), Violation> {
    for (i, token) in tokens.iter().enumerate() {
        let line = first_line + token.line - 1;
        match &token.tok {
            Tok::Ident(word) => {
                let contextual = CONTEXTUAL.contains(&word.as_str());
                if let Some(category) = category_of(word)
                    && (!contextual || (!declared.contains(word) && reaches_through(tokens, i)))
                {
                    return Err(Violation {
                        token: word.clone(),
                        category,
                        line,
                    });
                }
            }
            Tok::Template(pieces) => {
                for piece in pieces {
                    if let TemplatePiece::Expr(expr) = piece {
                        scan_source(expr, line, declared)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Contextual words the snippet binds itself with `let`, `const`, `var` or
/// `function`.
fn declared_names(tokens: &[Token]) -> impl Iterator<Item = String> + '_ {
    tokens.windows(2).filter_map(|pair| match (&pair[0].tok, &pair[1].tok) {
        (Tok::Ident(kw), Tok::Ident(name))
            if matches!(kw.as_str(), "let" | "const" | "var" | "function")
                && CONTEXTUAL.contains(&name.as_str()) =>
        {
            Some(name.clone())
        }
        _ => None,
    })
}

/// Whether the identifier at `i` is called or has a member read off it,
/// and is not itself a member name.
fn reaches_through(tokens: &[Token], i: usize) -> bool {
    let before = i.checked_sub(1).and_then(|j| tokens.get(j)).map(|t| &t.tok);
    let after = tokens.get(i + 1).map(|t| &t.tok);
    !matches!(before, Some(Tok::Punct("." | "?.")))
        && matches!(after, Some(Tok::Punct("(" | "." | "?." | "[")))
}

fn raw_scan(src: &str, first_line: u32) -> Result<(), Violation> {
    match raw_pattern().and_then(|re| re.find(src)) {
        Some(m) => {
            let token = m.as_str().to_string();
            let line = src
                .get(..m.start())
                .map_or(0, |before| before.matches('\n').count() as u32);
            Err(Violation {
                category: category_of(&token).unwrap_or("denied"),
                token,
                line: first_line + line,
            })
        }
        None => Ok(()),
    }
}
