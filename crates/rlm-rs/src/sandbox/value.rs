//! Runtime values of the snippet language.

use super::ast::FunctionDef;
use crate::context::Context;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Top-level variables left behind by a snippet, keyed by name.
pub type Bindings = BTreeMap<String, Value>;

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<Value>),
    /// Keys are kept sorted, which makes serialization canonical.
    Object(BTreeMap<String, Value>),
    Function(Arc<FunctionDef>),
    /// A whitelisted native function, e.g. `print` or `Math.floor`.
    Builtin(&'static str),
    /// A whitelisted namespace object, e.g. `Math` or `JSON`.
    Namespace(&'static str),
    Regex(Arc<RegexValue>),
    /// Handle to the run's context; materialized only on demand.
    Context,
    /// A recursive call that has been issued but not yet resolved.
    Pending(Arc<PendingCall>),
}

#[derive(Debug)]
pub struct RegexValue {
    pub source: String,
    pub flags: String,
    pub regex: Regex,
}

impl RegexValue {
    pub fn compile(source: &str, flags: &str) -> Result<Self, String> {
        let mut prefix = String::new();
        for flag in flags.chars() {
            match flag {
                'i' => prefix.push('i'),
                'm' => prefix.push('m'),
                's' => prefix.push('s'),
                'g' | 'u' | 'y' | 'd' => {}
                other => return Err(format!("unsupported regex flag '{other}'")),
            }
        }
        let pattern = if prefix.is_empty() {
            source.to_string()
        } else {
            format!("(?{prefix}){source}")
        };
        let regex = Regex::new(&pattern).map_err(|e| format!("invalid regex /{source}/: {e}"))?;
        Ok(Self {
            source: source.to_string(),
            flags: flags.to_string(),
            regex,
        })
    }

    pub fn global(&self) -> bool {
        self.flags.contains('g')
    }
}

/// One deferred `llm_query` call. Resolved at most once; every copy of the
/// value shares the same cell.
#[derive(Debug)]
pub struct PendingCall {
    pub query: String,
    /// `None` means "the parent's context".
    pub context: Option<Context>,
    pub result: tokio::sync::OnceCell<String>,
}

impl PendingCall {
    pub fn new(query: String, context: Option<Context>) -> Self {
        Self {
            query,
            context,
            result: tokio::sync::OnceCell::new(),
        }
    }
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) | Value::Context => "string",
            Value::Array(_) => "array",
            Value::Object(_) | Value::Namespace(_) | Value::Regex(_) => "object",
            Value::Function(_) | Value::Builtin(_) => "function",
            Value::Pending(_) => "promise",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Null => Some(0.0),
            Value::Str(s) => {
                let t = s.trim();
                if t.is_empty() {
                    Some(0.0)
                } else {
                    t.parse::<f64>().ok()
                }
            }
            _ => None,
        }
    }

    /// Numeric coercion, `NaN` when impossible.
    pub fn to_number(&self) -> f64 {
        self.as_f64().unwrap_or(f64::NAN)
    }

    /// Text shown by `print` and produced by string concatenation. Strings
    /// are verbatim; structured values use their canonical JSON form.
    pub fn to_display(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Null => "null".into(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Function(def) => format!("[function {}]", def.name.as_deref().unwrap_or("anonymous")),
            Value::Builtin(name) => format!("[builtin {name}]"),
            Value::Namespace(name) => format!("[object {name}]"),
            Value::Regex(re) => format!("/{}/{}", re.source, re.flags),
            Value::Context => "[context]".into(),
            Value::Pending(call) => match call.result.get() {
                Some(answer) => answer.clone(),
                None => "[pending llm_query]".into(),
            },
            Value::Array(_) | Value::Object(_) => canonical_json(self),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::Str(s) => J::String(s.clone()),
            Value::Array(items) => J::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => J::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            other => J::String(other.to_display()),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as J;
        match json {
            J::Null => Value::Null,
            J::Bool(b) => Value::Bool(*b),
            J::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            J::String(s) => Value::Str(s.clone()),
            J::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            J::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// `===`: same type and same value; arrays and objects compare
    /// structurally.
    pub fn strict_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.strict_eq(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.strict_eq(vb))
            }
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Namespace(a), Value::Namespace(b)) => a == b,
            (Value::Context, Value::Context) => true,
            _ => false,
        }
    }

    /// `==`: like `===`, but numbers, numeric strings, and booleans compare
    /// by numeric value.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(_), Value::Str(_) | Value::Bool(_))
            | (Value::Str(_) | Value::Bool(_), Value::Number(_))
            | (Value::Bool(_), Value::Str(_))
            | (Value::Str(_), Value::Bool(_)) => self.to_number() == other.to_number(),
            _ => self.strict_eq(other),
        }
    }

    /// Ordering used by `<`, `>`, and the default `sort`: numeric when both
    /// sides are numbers, lexicographic when both are strings, numeric
    /// coercion otherwise. `None` when incomparable (NaN involved).
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => self.to_number().partial_cmp(&other.to_number()),
        }
    }
}

/// JS-style number formatting: integral values print without a fraction.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".into()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".into() } else { "-Infinity".into() }
    } else if n == 0.0 {
        "0".into()
    } else if n == n.trunc() && n.abs() < 1e21 {
        format!("{n:.0}")
    } else {
        n.to_string()
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n == n.trunc() && n.abs() < 9_007_199_254_740_992.0 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(serde_json::Value::Null, serde_json::Value::Number)
    }
}

/// Canonical text of a value: compact JSON with sorted object keys.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&value.to_json()).unwrap_or_else(|_| "null".into())
}

/// Text a `FINAL_VAR` marker resolves to: strings verbatim, everything else
/// in canonical form.
pub fn final_var_text(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Number(n) => format_number(*n),
        other => canonical_json(other),
    }
}
