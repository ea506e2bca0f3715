//! Whitelisted globals and the methods of built-in value types.

use super::interp::{EvalError, EvalResult, Interpreter, MAX_COLLECTION, check_member_name, runtime};
use super::value::{PendingCall, RegexValue, Value, format_number};
use crate::context::{Context, SearchMatch, char_slice};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

const NAMESPACES: &[&str] = &[
    "console", "JSON", "Math", "Date", "Regex", "Object", "Array", "Promise",
];

/// Every callable builtin. Qualified names are reached through their
/// namespace, bare names resolve as globals.
const BUILTINS: &[&str] = &[
    "print",
    "len",
    "range",
    "str",
    "String",
    "Number",
    "Boolean",
    "parseInt",
    "parseFloat",
    "isNaN",
    "Error",
    "llm_query",
    "llm_batch",
    "console.log",
    "console.info",
    "console.warn",
    "console.error",
    "JSON.stringify",
    "JSON.parse",
    "Math.floor",
    "Math.ceil",
    "Math.round",
    "Math.trunc",
    "Math.sign",
    "Math.abs",
    "Math.min",
    "Math.max",
    "Math.sqrt",
    "Math.pow",
    "Math.log",
    "Math.exp",
    "Date.now",
    "Date.iso",
    "Date.parse",
    "Regex.test",
    "Regex.findAll",
    "Regex.replace",
    "Object.keys",
    "Object.values",
    "Object.entries",
    "Object.fromEntries",
    "Object.assign",
    "Array.isArray",
    "Array.from",
    "Number.isInteger",
    "Number.isFinite",
    "Promise.all",
    "Promise.resolve",
];

static NULL: Value = Value::Null;

fn qualified(namespace: &str, name: &str) -> Option<&'static str> {
    BUILTINS
        .iter()
        .find(|b| b.split_once('.') == Some((namespace, name)))
        .copied()
}

fn arg(args: &[Value], i: usize) -> &Value {
    args.get(i).unwrap_or(&NULL)
}

/// Numeric argument, `None` when absent or null.
fn opt_num(args: &[Value], i: usize) -> Option<f64> {
    match args.get(i) {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.to_number()),
    }
}

fn num(args: &[Value], i: usize) -> f64 {
    arg(args, i).to_number()
}

/// Normalize a JS-style relative index (negative counts from the end).
fn rel_index(index: f64, len: usize) -> usize {
    if index.is_nan() {
        0
    } else if index < 0.0 {
        len.saturating_sub((-index) as usize)
    } else {
        (index as usize).min(len)
    }
}

/// Start and end of a `slice(a, b)` call over `len` elements.
fn slice_bounds(args: &[Value], len: usize) -> (usize, usize) {
    let start = opt_num(args, 0).map_or(0, |n| rel_index(n, len));
    let end = opt_num(args, 1).map_or(len, |n| rel_index(n, len));
    (start, end.max(start))
}

fn substring_bounds(args: &[Value], len: usize) -> (usize, usize) {
    let clamp = |n: f64| if n.is_nan() || n < 0.0 { 0 } else { (n as usize).min(len) };
    let a = opt_num(args, 0).map_or(0, clamp);
    let b = opt_num(args, 1).map_or(len, clamp);
    (a.min(b), a.max(b))
}

/// Regex from a pattern argument: regex values as-is, strings compiled.
fn regex_arg(value: &Value) -> EvalResult<Arc<RegexValue>> {
    match value {
        Value::Regex(re) => Ok(Arc::clone(re)),
        other => RegexValue::compile(&other.to_display(), "")
            .map(Arc::new)
            .map_err(EvalError::Runtime),
    }
}

fn char_index(s: &str, byte: usize) -> usize {
    s.get(..byte).map_or(0, |prefix| prefix.chars().count())
}

fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}

fn match_array(caps: &regex::Captures<'_>) -> Value {
    Value::Array(
        caps.iter()
            .map(|m| m.map_or(Value::Null, |m| Value::str(m.as_str())))
            .collect(),
    )
}

fn check_size(len: usize) -> EvalResult<()> {
    if len > MAX_COLLECTION {
        runtime(format!("result too large ({len} elements)"))
    } else {
        Ok(())
    }
}

fn parse_int(text: &str, radix: Option<f64>) -> f64 {
    let t = text.trim();
    let (negative, t) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t.strip_prefix('+').unwrap_or(t)),
    };
    let explicit = radix.filter(|r| *r != 0.0 && !r.is_nan());
    let mut radix = explicit.map_or(10, |r| r as u32);
    let mut digits = t;
    if (explicit.is_none() || radix == 16) && (t.starts_with("0x") || t.starts_with("0X")) {
        radix = 16;
        digits = t.get(2..).unwrap_or("");
    }
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    let mut value: Option<f64> = None;
    for c in digits.chars() {
        let Some(d) = c.to_digit(radix) else { break };
        value = Some(value.unwrap_or(0.0) * radix as f64 + d as f64);
    }
    match value {
        Some(v) if negative => -v,
        Some(v) => v,
        None => f64::NAN,
    }
}

fn parse_float(text: &str) -> f64 {
    let t = text.trim_start();
    if t.starts_with("Infinity") || t.starts_with("+Infinity") {
        return f64::INFINITY;
    }
    if t.starts_with("-Infinity") {
        return f64::NEG_INFINITY;
    }
    let prefix: String = t
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
        .collect();
    let mut end = prefix.len();
    while end > 0 {
        if let Some(n) = prefix.get(..end).and_then(|p| p.parse::<f64>().ok()) {
            return n;
        }
        end -= 1;
    }
    f64::NAN
}

impl Interpreter<'_> {
    /// Resolve a whitelisted global name.
    pub(super) fn global(&self, name: &str) -> Option<Value> {
        match name {
            "context" => Some(Value::Context),
            "query" => Some(Value::str(self.env.query)),
            "undefined" => Some(Value::Null),
            "NaN" => Some(Value::Number(f64::NAN)),
            "Infinity" => Some(Value::Number(f64::INFINITY)),
            _ => NAMESPACES
                .iter()
                .find(|ns| **ns == name)
                .copied()
                .map(Value::Namespace)
                .or_else(|| {
                    BUILTINS
                        .iter()
                        .find(|b| **b == name)
                        .copied()
                        .map(Value::Builtin)
                }),
        }
    }

    pub(super) fn get_member(&self, value: &Value, name: &str) -> EvalResult<Value> {
        check_member_name(name)?;
        Ok(match value {
            Value::Str(s) if name == "length" => Value::Number(s.chars().count() as f64),
            Value::Array(items) if name == "length" => Value::Number(items.len() as f64),
            Value::Context if name == "length" => Value::Number(self.env.context.size() as f64),
            Value::Object(map) => map.get(name).cloned().unwrap_or(Value::Null),
            Value::Namespace("Math") if name == "PI" => Value::Number(std::f64::consts::PI),
            Value::Namespace("Math") if name == "E" => Value::Number(std::f64::consts::E),
            Value::Namespace(ns) => qualified(ns, name).map_or(Value::Null, Value::Builtin),
            Value::Builtin("Number") if name == "MAX_SAFE_INTEGER" => Value::Number(9_007_199_254_740_991.0),
            Value::Builtin("Number") => qualified("Number", name).map_or(Value::Null, Value::Builtin),
            Value::Regex(re) => match name {
                "source" => Value::str(re.source.clone()),
                "flags" => Value::str(re.flags.clone()),
                "global" => Value::Bool(re.global()),
                _ => Value::Null,
            },
            Value::Null => {
                return runtime(format!("cannot read properties of null (reading '{name}')"));
            }
            _ => Value::Null,
        })
    }

    pub(super) fn get_index(&self, value: &Value, index: &Value) -> EvalResult<Value> {
        match (value, index) {
            (Value::Array(items), Value::Number(n)) => Ok(if *n >= 0.0 && n.fract() == 0.0 {
                items.get(*n as usize).cloned().unwrap_or(Value::Null)
            } else {
                Value::Null
            }),
            (Value::Str(s), Value::Number(n)) => Ok(if *n >= 0.0 && n.fract() == 0.0 {
                s.chars()
                    .nth(*n as usize)
                    .map_or(Value::Null, |c| Value::Str(c.to_string()))
            } else {
                Value::Null
            }),
            (Value::Context, Value::Number(n)) => {
                let size = self.env.context.size();
                Ok(if *n >= 0.0 && (*n as usize) < size {
                    let i = *n as usize;
                    Value::Str(self.env.context.slice(i, i + 1))
                } else {
                    Value::Null
                })
            }
            (Value::Null, _) => runtime(format!(
                "cannot read properties of null (reading '{}')",
                index.to_display()
            )),
            (value, key) => self.get_member(value, &key.to_display()),
        }
    }

    async fn settle_args(&mut self, args: Vec<Value>) -> EvalResult<Vec<Value>> {
        let mut out = Vec::with_capacity(args.len());
        for value in args {
            out.push(self.settle(value).await?);
        }
        Ok(out)
    }

    // ── Global functions ───────────────────────────────────────────

    pub(super) async fn call_builtin(&mut self, name: &str, args: Vec<Value>) -> EvalResult<Value> {
        let args = self.settle_args(args).await?;
        let value = match name {
            "print" | "console.log" | "console.info" | "console.warn" | "console.error" => {
                let mut parts = Vec::with_capacity(args.len());
                for value in args {
                    parts.push(self.display(value).await?);
                }
                self.output.push(parts.join(" "));
                Value::Null
            }
            "len" => Value::Number(match arg(&args, 0) {
                Value::Str(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Context => self.env.context.size(),
                other => return runtime(format!("len() of {}", other.type_name())),
            } as f64),
            "range" => {
                let (start, end, step) = match args.len() {
                    0 => return runtime("range() needs at least one argument"),
                    1 => (0.0, num(&args, 0), 1.0),
                    2 => (num(&args, 0), num(&args, 1), 1.0),
                    _ => (num(&args, 0), num(&args, 1), num(&args, 2)),
                };
                if step == 0.0 || step.is_nan() {
                    return runtime("range() step must not be zero");
                }
                let count = ((end - start) / step).ceil().max(0.0);
                check_size(count as usize)?;
                Value::Array(
                    (0..count as usize)
                        .map(|i| Value::Number(start + step * i as f64))
                        .collect(),
                )
            }
            "str" | "String" => {
                let value = args.into_iter().next().unwrap_or(Value::str(""));
                Value::Str(self.display(value).await?)
            }
            "Number" => Value::Number(self.concrete(arg(&args, 0).clone()).to_number()),
            "Boolean" => Value::Bool(arg(&args, 0).truthy()),
            "parseInt" => Value::Number(parse_int(&arg(&args, 0).to_display(), opt_num(&args, 1))),
            "parseFloat" => Value::Number(parse_float(&arg(&args, 0).to_display())),
            "isNaN" => Value::Bool(num(&args, 0).is_nan()),
            "Error" => self.error_value(&arg(&args, 0).to_display()),
            "llm_query" => {
                let query = match arg(&args, 0) {
                    Value::Null => return runtime("llm_query() needs a query string"),
                    q => q.to_display(),
                };
                let context = self.context_arg(arg(&args, 1));
                if self.deferring > 0 {
                    self.defer(PendingCall::new(query, context))
                } else {
                    let started = std::time::Instant::now();
                    let answer = self.env.recursive.call(query, context).await;
                    self.suspended(started);
                    Value::Str(answer.map_err(EvalError::Abort)?)
                }
            }
            "llm_batch" => {
                let Value::Array(items) = arg(&args, 0) else {
                    return runtime("llm_batch() expects an array of queries");
                };
                let mut calls = Vec::with_capacity(items.len());
                for item in items {
                    let (query, context) = match item {
                        Value::Object(map) => (
                            map.get("query").map(Value::to_display).unwrap_or_default(),
                            self.context_arg(map.get("context").unwrap_or(&NULL)),
                        ),
                        other => (other.to_display(), None),
                    };
                    calls.push(self.defer(PendingCall::new(query, context)));
                }
                self.resolve_deep(Value::Array(calls)).await?
            }

            "JSON.stringify" => {
                let value = self.concrete(arg(&args, 0).clone()).to_json();
                let pretty = match arg(&args, 2) {
                    Value::Number(n) => *n > 0.0,
                    Value::Str(s) => !s.is_empty(),
                    _ => false,
                };
                let text = if pretty {
                    serde_json::to_string_pretty(&value)
                } else {
                    serde_json::to_string(&value)
                };
                Value::Str(text.map_err(|e| EvalError::Runtime(format!("JSON.stringify: {e}")))?)
            }
            "JSON.parse" => {
                let text = arg(&args, 0).to_display();
                let json: serde_json::Value = serde_json::from_str(&text)
                    .map_err(|e| EvalError::Runtime(format!("JSON.parse: {e}")))?;
                Value::from_json(&json)
            }

            "Math.floor" => Value::Number(num(&args, 0).floor()),
            "Math.ceil" => Value::Number(num(&args, 0).ceil()),
            "Math.round" => Value::Number((num(&args, 0) + 0.5).floor()),
            "Math.trunc" => Value::Number(num(&args, 0).trunc()),
            "Math.sign" => {
                let n = num(&args, 0);
                Value::Number(if n == 0.0 || n.is_nan() { n } else { n.signum() })
            }
            "Math.abs" => Value::Number(num(&args, 0).abs()),
            "Math.sqrt" => Value::Number(num(&args, 0).sqrt()),
            "Math.pow" => Value::Number(num(&args, 0).powf(num(&args, 1))),
            "Math.log" => Value::Number(num(&args, 0).ln()),
            "Math.exp" => Value::Number(num(&args, 0).exp()),
            "Math.min" | "Math.max" => {
                let want_max = name == "Math.max";
                let mut acc = if want_max { f64::NEG_INFINITY } else { f64::INFINITY };
                for value in &args {
                    let n = value.to_number();
                    if n.is_nan() {
                        acc = f64::NAN;
                        break;
                    }
                    acc = if want_max { acc.max(n) } else { acc.min(n) };
                }
                Value::Number(acc)
            }

            "Date.now" => Value::Number(chrono::Utc::now().timestamp_millis() as f64),
            "Date.iso" => Value::Str(chrono::Utc::now().to_rfc3339()),
            "Date.parse" => Value::Number(
                chrono::DateTime::parse_from_rfc3339(arg(&args, 0).to_display().trim())
                    .map_or(f64::NAN, |d| d.timestamp_millis() as f64),
            ),

            "Regex.test" => {
                let re = regex_arg(arg(&args, 0))?;
                Value::Bool(re.regex.is_match(&arg(&args, 1).to_display()))
            }
            "Regex.findAll" => {
                let re = regex_arg(arg(&args, 0))?;
                let text = self.concrete(arg(&args, 1).clone()).to_display();
                let groups = re.regex.captures_len() - 1;
                let found: Vec<Value> = re
                    .regex
                    .captures_iter(&text)
                    .map(|caps| match groups {
                        0 => Value::str(caps.get(0).map_or("", |m| m.as_str())),
                        1 => caps.get(1).map_or(Value::Null, |m| Value::str(m.as_str())),
                        _ => Value::Array(
                            caps.iter()
                                .skip(1)
                                .map(|m| m.map_or(Value::Null, |m| Value::str(m.as_str())))
                                .collect(),
                        ),
                    })
                    .collect();
                check_size(found.len())?;
                Value::Array(found)
            }
            "Regex.replace" => {
                let re = regex_arg(arg(&args, 0))?;
                let text = arg(&args, 1).to_display();
                let replacement = arg(&args, 2).to_display();
                Value::Str(re.regex.replace_all(&text, replacement.as_str()).into_owned())
            }

            "Object.keys" | "Object.values" | "Object.entries" => {
                let Value::Object(map) = arg(&args, 0) else {
                    return match arg(&args, 0) {
                        Value::Array(items) if name == "Object.keys" => Ok(Value::Array(
                            (0..items.len()).map(|i| Value::str(i.to_string())).collect(),
                        )),
                        Value::Array(items) if name == "Object.values" => Ok(Value::Array(items.clone())),
                        other => runtime(format!("{name}() of {}", other.type_name())),
                    };
                };
                Value::Array(match name {
                    "Object.keys" => map.keys().map(|k| Value::str(k.clone())).collect(),
                    "Object.values" => map.values().cloned().collect(),
                    _ => map
                        .iter()
                        .map(|(k, v)| Value::Array(vec![Value::str(k.clone()), v.clone()]))
                        .collect(),
                })
            }
            "Object.fromEntries" => {
                let mut map = BTreeMap::new();
                for entry in self.items_of(arg(&args, 0).clone())? {
                    if let Value::Array(pair) = entry {
                        let key = pair.first().map(Value::to_display).unwrap_or_default();
                        check_member_name(&key)?;
                        map.insert(key, pair.get(1).cloned().unwrap_or(Value::Null));
                    }
                }
                Value::Object(map)
            }
            "Object.assign" => {
                let mut map = BTreeMap::new();
                for value in &args {
                    if let Value::Object(other) = value {
                        map.extend(other.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                }
                Value::Object(map)
            }
            "Array.isArray" => Value::Bool(matches!(arg(&args, 0), Value::Array(_))),
            "Array.from" => Value::Array(self.items_of(arg(&args, 0).clone())?),
            "Number.isInteger" => Value::Bool(matches!(arg(&args, 0), Value::Number(n) if n.is_finite() && n.fract() == 0.0)),
            "Number.isFinite" => Value::Bool(matches!(arg(&args, 0), Value::Number(n) if n.is_finite())),
            "Promise.all" => {
                let value = args.into_iter().next().unwrap_or(Value::Array(Vec::new()));
                self.resolve_deep(value).await?
            }
            "Promise.resolve" => args.into_iter().next().unwrap_or(Value::Null),
            other => return runtime(format!("{other} is not a function")),
        };
        Ok(value)
    }

    fn context_arg(&self, value: &Value) -> Option<Context> {
        match value {
            Value::Null => None,
            Value::Context => Some(self.env.context.clone()),
            Value::Str(s) => Some(Context::text(s.as_str())),
            other => Some(Context::text(other.to_display())),
        }
    }

    // ── Methods ────────────────────────────────────────────────────

    pub(super) async fn call_method(
        &mut self,
        receiver: Value,
        name: &str,
        args: Vec<Value>,
    ) -> EvalResult<Value> {
        check_member_name(name)?;
        match receiver {
            Value::Namespace(ns) => match qualified(ns, name) {
                Some(builtin) => self.call_builtin(builtin, args).await,
                None => runtime(format!("{ns}.{name} is not a function")),
            },
            Value::Builtin("Number") => match qualified("Number", name) {
                Some(builtin) => self.call_builtin(builtin, args).await,
                None => runtime(format!("Number.{name} is not a function")),
            },
            Value::Object(map) => match map.get(name) {
                Some(function @ (Value::Function(_) | Value::Builtin(_))) => {
                    self.call_value(function.clone(), args).await
                }
                Some(other) => runtime(format!("{name} is a {}, not a function", other.type_name())),
                None => match name {
                    "hasOwnProperty" => {
                        let args = self.settle_args(args).await?;
                        Ok(Value::Bool(map.contains_key(&arg(&args, 0).to_display())))
                    }
                    "toString" => Ok(Value::Str(Value::Object(map).to_display())),
                    _ => runtime(format!("object has no method '{name}'")),
                },
            },
            Value::Null => runtime(format!("cannot read properties of null (reading '{name}')")),
            other => {
                let args = self.settle_args(args).await?;
                match other {
                    Value::Str(s) => self.string_method(&s, name, args).await,
                    Value::Context => self.context_method(name, args).await,
                    Value::Array(items) => self.array_method(items, name, args).await,
                    Value::Number(n) => number_method(n, name, &args),
                    Value::Bool(b) if name == "toString" => Ok(Value::str(b.to_string())),
                    Value::Regex(re) if name == "test" => {
                        Ok(Value::Bool(re.regex.is_match(&arg(&args, 0).to_display())))
                    }
                    other => runtime(format!("{} has no method '{name}'", other.type_name())),
                }
            }
        }
    }

    async fn string_method(&mut self, s: &str, name: &str, args: Vec<Value>) -> EvalResult<Value> {
        let len = || s.chars().count();
        let text = |i: usize| arg(&args, i).to_display();
        Ok(match name {
            "slice" => {
                let (a, b) = slice_bounds(&args, len());
                Value::Str(char_slice(s, a, b))
            }
            "substring" => {
                let (a, b) = substring_bounds(&args, len());
                Value::Str(char_slice(s, a, b))
            }
            "substr" => {
                let n = len();
                let start = opt_num(&args, 0).map_or(0, |x| rel_index(x, n));
                let count = opt_num(&args, 1).map_or(n, |x| x.max(0.0) as usize);
                Value::Str(char_slice(s, start, start.saturating_add(count).min(n)))
            }
            "charAt" | "at" => {
                let n = len();
                let i = num(&args, 0);
                let i = if name == "at" && i < 0.0 { n as f64 + i } else { i };
                match s.chars().nth(if i >= 0.0 { i as usize } else { usize::MAX }) {
                    Some(c) => Value::Str(c.to_string()),
                    None if name == "at" => Value::Null,
                    None => Value::str(""),
                }
            }
            "charCodeAt" => s
                .chars()
                .nth(num(&args, 0).max(0.0) as usize)
                .map_or(Value::Number(f64::NAN), |c| Value::Number(c as u32 as f64)),
            "indexOf" => {
                let needle = text(0);
                let from = byte_offset(s, opt_num(&args, 1).map_or(0, |n| n.max(0.0) as usize));
                let found = s.get(from..).and_then(|rest| rest.find(&needle));
                Value::Number(found.map_or(-1.0, |b| char_index(s, from + b) as f64))
            }
            "lastIndexOf" => {
                let found = s.rfind(&text(0));
                Value::Number(found.map_or(-1.0, |b| char_index(s, b) as f64))
            }
            "search" => {
                let re = regex_arg(arg(&args, 0))?;
                Value::Number(re.regex.find(s).map_or(-1.0, |m| char_index(s, m.start()) as f64))
            }
            "includes" => Value::Bool(s.contains(&text(0))),
            "startsWith" => Value::Bool(s.starts_with(&text(0))),
            "endsWith" => Value::Bool(s.ends_with(&text(0))),
            "toLowerCase" | "toLocaleLowerCase" => Value::Str(s.to_lowercase()),
            "toUpperCase" | "toLocaleUpperCase" => Value::Str(s.to_uppercase()),
            "trim" => Value::str(s.trim()),
            "trimStart" => Value::str(s.trim_start()),
            "trimEnd" => Value::str(s.trim_end()),
            "toString" | "valueOf" | "normalize" => Value::str(s),
            "concat" => {
                let mut out = s.to_string();
                for value in &args {
                    out.push_str(&value.to_display());
                }
                check_size(out.len())?;
                Value::Str(out)
            }
            "repeat" => {
                let count = num(&args, 0);
                if count < 0.0 || count.is_nan() {
                    return runtime("repeat count must be non-negative");
                }
                check_size(s.len().saturating_mul(count as usize))?;
                Value::Str(s.repeat(count as usize))
            }
            "padStart" | "padEnd" => {
                let target = num(&args, 0).max(0.0) as usize;
                check_size(target)?;
                let fill = match arg(&args, 1) {
                    Value::Null => " ".to_string(),
                    v => v.to_display(),
                };
                let n = len();
                if target <= n || fill.is_empty() {
                    Value::str(s)
                } else {
                    let pad: String = fill.chars().cycle().take(target - n).collect();
                    Value::Str(if name == "padStart" {
                        format!("{pad}{s}")
                    } else {
                        format!("{s}{pad}")
                    })
                }
            }
            "localeCompare" => Value::Number(match s.cmp(text(0).as_str()) {
                Ordering::Less => -1.0,
                Ordering::Equal => 0.0,
                Ordering::Greater => 1.0,
            }),
            "split" => {
                let limit = opt_num(&args, 1).map_or(usize::MAX, |n| n.max(0.0) as usize);
                let parts: Vec<Value> = match arg(&args, 0) {
                    Value::Null => vec![Value::str(s)],
                    Value::Regex(re) => re.regex.split(s).map(Value::str).collect(),
                    sep => {
                        let sep = sep.to_display();
                        if sep.is_empty() {
                            s.chars().map(|c| Value::Str(c.to_string())).collect()
                        } else {
                            s.split(sep.as_str()).map(Value::str).collect()
                        }
                    }
                };
                check_size(parts.len())?;
                Value::Array(parts.into_iter().take(limit).collect())
            }
            "match" => {
                let re = regex_arg(arg(&args, 0))?;
                if re.global() {
                    let all: Vec<Value> = re.regex.find_iter(s).map(|m| Value::str(m.as_str())).collect();
                    if all.is_empty() { Value::Null } else { Value::Array(all) }
                } else {
                    re.regex.captures(s).map_or(Value::Null, |caps| match_array(&caps))
                }
            }
            "matchAll" => {
                let re = regex_arg(arg(&args, 0))?;
                Value::Array(re.regex.captures_iter(s).map(|caps| match_array(&caps)).collect())
            }
            "replace" | "replaceAll" => {
                let all = name == "replaceAll";
                let replacement = arg(&args, 1).clone();
                match arg(&args, 0) {
                    Value::Regex(re) => {
                        let re = Arc::clone(re);
                        let all = all || re.global();
                        self.replace_regex(s, &re.regex, all, replacement).await?
                    }
                    pattern => {
                        let pattern = regex::escape(&pattern.to_display());
                        let re = Regex::new(&pattern).map_err(|e| EvalError::Runtime(e.to_string()))?;
                        let replacement = match replacement {
                            Value::Function(_) | Value::Builtin(_) => replacement,
                            // Literal patterns take literal replacements.
                            other => Value::Str(other.to_display().replace('$', "$$")),
                        };
                        self.replace_regex(s, &re, all, replacement).await?
                    }
                }
            }
            _ => return runtime(format!("string has no method '{name}'")),
        })
    }

    async fn replace_regex(
        &mut self,
        s: &str,
        re: &Regex,
        all: bool,
        replacement: Value,
    ) -> EvalResult<Value> {
        if !matches!(replacement, Value::Function(_) | Value::Builtin(_)) {
            let rep = replacement.to_display();
            let out = if all {
                re.replace_all(s, rep.as_str())
            } else {
                re.replace(s, rep.as_str())
            };
            check_size(out.len())?;
            return Ok(Value::Str(out.into_owned()));
        }
        let mut spans = Vec::new();
        for caps in re.captures_iter(s) {
            let Some(whole) = caps.get(0) else { continue };
            let Value::Array(groups) = match_array(&caps) else { continue };
            spans.push((whole.start(), whole.end(), groups));
            if !all {
                break;
            }
        }
        let mut out = String::with_capacity(s.len());
        let mut last = 0;
        for (start, end, groups) in spans {
            out.push_str(s.get(last..start).unwrap_or(""));
            let produced = self.call_value(replacement.clone(), groups).await?;
            out.push_str(&self.display(produced).await?);
            last = end;
        }
        out.push_str(s.get(last..).unwrap_or(""));
        check_size(out.len())?;
        Ok(Value::Str(out))
    }

    async fn context_method(&mut self, name: &str, args: Vec<Value>) -> EvalResult<Value> {
        let context = self.env.context;
        Ok(match name {
            "length" | "size" => Value::Number(context.size() as f64),
            "slice" => {
                let (a, b) = slice_bounds(&args, context.size());
                Value::Str(context.slice(a, b))
            }
            "substring" => {
                let (a, b) = substring_bounds(&args, context.size());
                Value::Str(context.slice(a, b))
            }
            "search" => {
                let pattern = match arg(&args, 0) {
                    Value::Regex(re) => re.source.clone(),
                    other => other.to_display(),
                };
                match context.search(&pattern) {
                    Some(found) => {
                        check_size(found.len())?;
                        Value::Array(found.iter().map(search_match_value).collect())
                    }
                    None => Value::Null,
                }
            }
            "grep" => {
                let pattern = match arg(&args, 0) {
                    Value::Regex(re) => re.source.clone(),
                    other => other.to_display(),
                };
                let re = Regex::new(&pattern)
                    .or_else(|_| Regex::new(&regex::escape(&pattern)))
                    .map_err(|e| EvalError::Runtime(format!("grep: {e}")))?;
                let text = context.materialize();
                let mut hits = Vec::new();
                for (i, line) in text.lines().enumerate() {
                    if re.is_match(line) {
                        let mut map = BTreeMap::new();
                        map.insert("line".to_string(), Value::Number((i + 1) as f64));
                        map.insert("text".to_string(), Value::str(line));
                        hits.push(Value::Object(map));
                    }
                }
                check_size(hits.len())?;
                Value::Array(hits)
            }
            "lines" => {
                let text = context.materialize();
                let all: Vec<&str> = text.lines().collect();
                let (a, b) = slice_bounds(&args, all.len());
                check_size(b - a)?;
                Value::Array(all.get(a..b).unwrap_or(&[]).iter().map(|l| Value::str(*l)).collect())
            }
            "head" | "tail" => {
                let n = opt_num(&args, 0).map_or(10, |n| n.max(0.0) as usize);
                let text = context.materialize();
                let all: Vec<&str> = text.lines().collect();
                let picked = if name == "head" {
                    all.get(..n.min(all.len())).unwrap_or(&[])
                } else {
                    all.get(all.len().saturating_sub(n)..).unwrap_or(&[])
                };
                Value::Str(picked.join("\n"))
            }
            "chunks" => {
                let size = num(&args, 0);
                if size.is_nan() || size < 1.0 {
                    return runtime("chunks() size must be at least 1");
                }
                let size = size as usize;
                let total = context.size();
                check_size(total / size + 1)?;
                Value::Array(
                    (0..total)
                        .step_by(size)
                        .map(|start| Value::Str(context.slice(start, start + size)))
                        .collect(),
                )
            }
            "toString" | "valueOf" | "text" => Value::Str(context.materialize().to_string()),
            _ => {
                let text = context.materialize();
                return self.string_method(&text, name, args).await;
            }
        })
    }

    async fn array_method(&mut self, items: Vec<Value>, name: &str, args: Vec<Value>) -> EvalResult<Value> {
        Ok(match name {
            "join" => {
                let sep = match arg(&args, 0) {
                    Value::Null => ",".to_string(),
                    v => v.to_display(),
                };
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    parts.push(match item {
                        Value::Null => String::new(),
                        other => self.display(other).await?,
                    });
                }
                let joined = parts.join(&sep);
                check_size(joined.len())?;
                Value::Str(joined)
            }
            "toString" => Value::Str(
                items
                    .iter()
                    .map(Value::to_display)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            "slice" => {
                let (a, b) = slice_bounds(&args, items.len());
                Value::Array(items.get(a..b).unwrap_or(&[]).to_vec())
            }
            "concat" => {
                let mut out = items;
                for value in args {
                    match value {
                        Value::Array(more) => out.extend(more),
                        other => out.push(other),
                    }
                }
                check_size(out.len())?;
                Value::Array(out)
            }
            "includes" => Value::Bool(items.iter().any(|v| v.strict_eq(arg(&args, 0)))),
            "indexOf" => Value::Number(
                items
                    .iter()
                    .position(|v| v.strict_eq(arg(&args, 0)))
                    .map_or(-1.0, |i| i as f64),
            ),
            "lastIndexOf" => Value::Number(
                items
                    .iter()
                    .rposition(|v| v.strict_eq(arg(&args, 0)))
                    .map_or(-1.0, |i| i as f64),
            ),
            "at" => {
                let i = num(&args, 0);
                let i = if i < 0.0 { items.len() as f64 + i } else { i };
                if i >= 0.0 {
                    items.get(i as usize).cloned().unwrap_or(Value::Null)
                } else {
                    Value::Null
                }
            }
            "flat" => {
                let mut out = Vec::new();
                for item in items {
                    match item {
                        Value::Array(inner) => out.extend(inner),
                        other => out.push(other),
                    }
                }
                Value::Array(out)
            }
            "reverse" => Value::Array(items.into_iter().rev().collect()),
            "push" => Value::Number((items.len() + args.len()) as f64),
            "pop" | "shift" => {
                let picked = if name == "pop" { items.last() } else { items.first() };
                picked.cloned().unwrap_or(Value::Null)
            }
            "sort" => Value::Array(self.sort_values(items, args.into_iter().next()).await?),
            "map" | "flatMap" => {
                let f = arg(&args, 0).clone();
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let mapped = self.call_value(f.clone(), vec![item, Value::Number(i as f64)]).await?;
                    match mapped {
                        Value::Array(inner) if name == "flatMap" => out.extend(inner),
                        other => out.push(other),
                    }
                }
                Value::Array(out)
            }
            "forEach" => {
                let f = arg(&args, 0).clone();
                for (i, item) in items.into_iter().enumerate() {
                    let result = self.call_value(f.clone(), vec![item, Value::Number(i as f64)]).await?;
                    self.settle(result).await?;
                }
                Value::Null
            }
            "filter" | "find" | "findIndex" | "some" | "every" => {
                let f = arg(&args, 0).clone();
                let mut kept = Vec::new();
                for (i, item) in items.into_iter().enumerate() {
                    let verdict = self
                        .call_value(f.clone(), vec![item.clone(), Value::Number(i as f64)])
                        .await?;
                    let pass = self.settle(verdict).await?.truthy();
                    match name {
                        "find" if pass => return Ok(item),
                        "findIndex" if pass => return Ok(Value::Number(i as f64)),
                        "some" if pass => return Ok(Value::Bool(true)),
                        "every" if !pass => return Ok(Value::Bool(false)),
                        "filter" if pass => kept.push(item),
                        _ => {}
                    }
                }
                match name {
                    "filter" => Value::Array(kept),
                    "find" => Value::Null,
                    "findIndex" => Value::Number(-1.0),
                    "some" => Value::Bool(false),
                    _ => Value::Bool(true),
                }
            }
            "reduce" => {
                let f = arg(&args, 0).clone();
                let mut iter = items.into_iter().enumerate();
                let mut acc = match args.get(1) {
                    Some(init) => init.clone(),
                    None => match iter.next() {
                        Some((_, first)) => first,
                        None => return runtime("reduce of empty array with no initial value"),
                    },
                };
                for (i, item) in iter {
                    acc = self
                        .call_value(f.clone(), vec![acc, item, Value::Number(i as f64)])
                        .await?;
                }
                acc
            }
            _ => return runtime(format!("array has no method '{name}'")),
        })
    }

    /// Stable sort. Without a comparator values order numerically or
    /// lexicographically; with one, a merge sort calls it for each pair.
    pub(super) async fn sort_values(
        &mut self,
        mut items: Vec<Value>,
        comparator: Option<Value>,
    ) -> EvalResult<Vec<Value>> {
        let comparator = match comparator {
            None | Some(Value::Null) => {
                items.sort_by(|a, b| a.compare(b).unwrap_or(Ordering::Equal));
                return Ok(items);
            }
            Some(f) => f,
        };
        let n = items.len();
        let mut width = 1;
        while width < n {
            let mut merged = Vec::with_capacity(n);
            let mut start = 0;
            while start < n {
                let mid = (start + width).min(n);
                let end = (start + 2 * width).min(n);
                let (mut i, mut j) = (start, mid);
                while i < mid && j < end {
                    let order = self
                        .call_value(comparator.clone(), vec![items[i].clone(), items[j].clone()])
                        .await?;
                    if self.settle(order).await?.to_number() > 0.0 {
                        merged.push(items[j].clone());
                        j += 1;
                    } else {
                        merged.push(items[i].clone());
                        i += 1;
                    }
                }
                merged.extend_from_slice(&items[i..mid]);
                merged.extend_from_slice(&items[j..end]);
                start = end;
            }
            items = merged;
            width *= 2;
        }
        Ok(items)
    }
}

fn number_method(n: f64, name: &str, args: &[Value]) -> EvalResult<Value> {
    Ok(match name {
        "toFixed" => {
            let digits = opt_num(args, 0).map_or(0, |d| d.clamp(0.0, 100.0) as usize);
            Value::Str(format!("{n:.digits$}"))
        }
        "toString" | "valueOf" => Value::Str(format_number(n)),
        _ => return runtime(format!("number has no method '{name}'")),
    })
}

fn search_match_value(m: &SearchMatch) -> Value {
    let mut map = BTreeMap::new();
    map.insert("start".to_string(), Value::Number(m.start as f64));
    map.insert("end".to_string(), Value::Number(m.end as f64));
    map.insert("line".to_string(), Value::Number(m.line as f64));
    map.insert("text".to_string(), Value::str(m.text.clone()));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_int_follows_js() {
        assert_eq!(parse_int("42px", None), 42.0);
        assert_eq!(parse_int("  -7", None), -7.0);
        assert_eq!(parse_int("0x1f", None), 31.0);
        assert_eq!(parse_int("ff", Some(16.0)), 255.0);
        assert!(parse_int("abc", None).is_nan());
    }

    #[test]
    fn parse_float_takes_longest_numeric_prefix() {
        assert_eq!(parse_float("3.25 apples"), 3.25);
        assert_eq!(parse_float("1e3x"), 1000.0);
        assert!(parse_float("x1").is_nan());
    }

    #[test]
    fn relative_slices() {
        let args = [Value::Number(-3.0)];
        assert_eq!(slice_bounds(&args, 10), (7, 10));
        let args = [Value::Number(5.0), Value::Number(2.0)];
        assert_eq!(slice_bounds(&args, 10), (5, 5));
        assert_eq!(substring_bounds(&args, 10), (2, 5));
    }

    #[test]
    fn qualified_lookup() {
        assert_eq!(qualified("Math", "floor"), Some("Math.floor"));
        assert_eq!(qualified("Math", "random"), None);
        assert_eq!(qualified("Regex", "findAll"), Some("Regex.findAll"));
    }

    #[test]
    fn number_methods() {
        assert_eq!(number_method(3.14159, "toFixed", &[Value::Number(2.0)]).unwrap().to_display(), "3.14");
        assert!(number_method(1.0, "toPrecision", &[]).is_err());
    }
}
