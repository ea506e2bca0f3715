//! The text under investigation.
//!
//! A [`Context`] is either an in-memory string or a lazy [`ContextProvider`]
//! that can serve slices of something too large (or too remote) to hold in
//! memory. Both are immutable and cheap to clone: child runs share the same
//! backing object through an `Arc`.
//!
//! Offsets are measured in characters, never bytes, so slicing never lands
//! inside a multi-byte code point.

use regex::Regex;
use serde::Serialize;
use std::sync::Arc;

/// One hit returned by a context search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    /// Character offset of the match start.
    pub start: usize,
    /// Character offset one past the match end.
    pub end: usize,
    /// 1-based line number of the match start.
    pub line: usize,
    /// The matched text.
    pub text: String,
}

/// A lazily-sliced text source.
///
/// Implement this for file-backed or remote contexts. `search` is optional;
/// returning `None` tells the snippet that the provider cannot search and it
/// has to slice instead.
pub trait ContextProvider: Send + Sync {
    /// Total length in characters.
    fn size(&self) -> usize;

    /// Characters in `[start, end)`, clamped to the provider bounds.
    fn slice(&self, start: usize, end: usize) -> String;

    /// Regex search over the whole source.
    fn search(&self, pattern: &str) -> Option<Vec<SearchMatch>> {
        let _ = pattern;
        None
    }

    /// Short label used in prompts and logs.
    fn kind(&self) -> &str {
        "provider"
    }
}

/// Immutable context handed to a run.
#[derive(Clone)]
pub enum Context {
    Text(Arc<str>),
    Provider(Arc<dyn ContextProvider>),
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Context::Text(text) => f
                .debug_struct("Context::Text")
                .field("chars", &text.chars().count())
                .finish(),
            Context::Provider(p) => f
                .debug_struct("Context::Provider")
                .field("kind", &p.kind())
                .field("size", &p.size())
                .finish(),
        }
    }
}

impl From<String> for Context {
    fn from(value: String) -> Self {
        Context::text(value)
    }
}

impl From<&str> for Context {
    fn from(value: &str) -> Self {
        Context::text(value)
    }
}

impl Context {
    pub fn text(text: impl Into<Arc<str>>) -> Self {
        Context::Text(text.into())
    }

    pub fn provider(provider: impl ContextProvider + 'static) -> Self {
        Context::Provider(Arc::new(provider))
    }

    /// Label used in the system prompt.
    pub fn kind(&self) -> &str {
        match self {
            Context::Text(_) => "text",
            Context::Provider(p) => p.kind(),
        }
    }

    /// Total length in characters.
    pub fn size(&self) -> usize {
        match self {
            Context::Text(text) => text.chars().count(),
            Context::Provider(p) => p.size(),
        }
    }

    /// Characters in `[start, end)`. Out-of-range bounds are clamped and an
    /// inverted range yields an empty string.
    pub fn slice(&self, start: usize, end: usize) -> String {
        match self {
            Context::Text(text) => char_slice(text, start, end),
            Context::Provider(p) => {
                let size = p.size();
                let end = end.min(size);
                if start >= end {
                    String::new()
                } else {
                    p.slice(start, end)
                }
            }
        }
    }

    /// Regex search. Falls back to a literal substring search when the
    /// pattern is not a valid regex. `None` when the provider cannot search.
    pub fn search(&self, pattern: &str) -> Option<Vec<SearchMatch>> {
        match self {
            Context::Text(text) => Some(search_text(text, pattern)),
            Context::Provider(p) => p.search(pattern),
        }
    }

    /// The whole context as one string. Text contexts are returned as-is;
    /// providers are read through a single full-range slice.
    pub fn materialize(&self) -> Arc<str> {
        match self {
            Context::Text(text) => Arc::clone(text),
            Context::Provider(p) => Arc::from(p.slice(0, p.size())),
        }
    }

    /// First `n` characters, for prompt previews.
    pub fn preview(&self, n: usize) -> String {
        self.slice(0, n)
    }
}

/// Character-indexed slice of `text`, clamped to its bounds.
pub fn char_slice(text: &str, start: usize, end: usize) -> String {
    if start >= end {
        return String::new();
    }
    text.chars().skip(start).take(end - start).collect()
}

/// Regex (or literal, if the pattern does not compile) search over `text`.
pub fn search_text(text: &str, pattern: &str) -> Vec<SearchMatch> {
    let ranges: Vec<(usize, usize)> = match Regex::new(pattern) {
        Ok(re) => re
            .find_iter(text)
            .filter(|m| !m.as_str().is_empty())
            .map(|m| (m.start(), m.end()))
            .collect(),
        Err(_) if pattern.is_empty() => Vec::new(),
        Err(_) => text
            .match_indices(pattern)
            .map(|(i, m)| (i, i + m.len()))
            .collect(),
    };

    // Convert byte offsets to char offsets and line numbers in one pass.
    let mut matches = Vec::with_capacity(ranges.len());
    let mut chars_before = 0usize;
    let mut lines_before = 1usize;
    let mut cursor = 0usize;
    for (start, end) in ranges {
        let Some(skipped) = text.get(cursor..start) else {
            continue;
        };
        chars_before += skipped.chars().count();
        lines_before += skipped.matches('\n').count();
        cursor = start;
        let Some(matched) = text.get(start..end) else {
            continue;
        };
        let len = matched.chars().count();
        matches.push(SearchMatch {
            start: chars_before,
            end: chars_before + len,
            line: lines_before,
            text: matched.to_string(),
        });
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Repeated {
        unit: String,
        times: usize,
    }

    impl ContextProvider for Repeated {
        fn size(&self) -> usize {
            self.unit.chars().count() * self.times
        }

        fn slice(&self, start: usize, end: usize) -> String {
            let unit: Vec<char> = self.unit.chars().collect();
            (start..end).map(|i| unit[i % unit.len()]).collect()
        }

        fn kind(&self) -> &str {
            "repeated"
        }
    }

    #[test]
    fn text_slice_is_char_based_and_clamped() {
        let ctx = Context::text("héllo wörld");
        assert_eq!(ctx.size(), 11);
        assert_eq!(ctx.slice(0, 5), "héllo");
        assert_eq!(ctx.slice(6, 100), "wörld");
        assert_eq!(ctx.slice(8, 3), "");
    }

    #[test]
    fn text_search_reports_char_offsets_and_lines() {
        let ctx = Context::text("alpha\nbéta 42\ngamma 7");
        let hits = ctx.search(r"\d+").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "42");
        assert_eq!(hits[0].line, 2);
        assert_eq!(hits[0].start, 11);
        assert_eq!(hits[1].text, "7");
        assert_eq!(hits[1].line, 3);
    }

    #[test]
    fn invalid_regex_falls_back_to_literal() {
        let ctx = Context::text("a (b c (b");
        let hits = ctx.search("(b").unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn provider_slices_lazily_without_search() {
        let ctx = Context::provider(Repeated {
            unit: "ab".into(),
            times: 1000,
        });
        assert_eq!(ctx.kind(), "repeated");
        assert_eq!(ctx.size(), 2000);
        assert_eq!(ctx.slice(1, 5), "baba");
        assert_eq!(ctx.slice(1998, 5000), "ab");
        assert!(ctx.search("ab").is_none());
    }

    #[test]
    fn clones_share_backing_text() {
        let ctx = Context::text("shared");
        let child = ctx.clone();
        match (&ctx, &child) {
            (Context::Text(a), Context::Text(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected text contexts"),
        }
    }
}
