//! Tree-walking evaluator for the snippet language.
//!
//! Evaluation is async so a snippet can suspend at a recursive call. Every
//! recursive evaluation step returns a [`BoxFuture`] to keep the future type
//! finite.
//!
//! Name resolution is two-level: user bindings (innermost scope first), then
//! the fixed whitelist in [`Interpreter::global`]. Nothing else resolves.
//! Function calls push a scope on top of the caller's, so callbacks passed
//! to `map`/`forEach` can read and update the caller's variables.

use super::SnippetEnv;
use super::ast::*;
use super::value::{Bindings, PendingCall, RegexValue, Value};
use crate::error::RunError;
use futures::future::{BoxFuture, join_all};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Maximum nesting of user-function calls.
const MAX_CALL_DEPTH: usize = 32;

/// Hard cap on buffered print output, independent of the display ceiling.
const OUTPUT_HARD_CAP: usize = 1_000_000;

/// Largest string or array a single builtin may produce.
pub(super) const MAX_COLLECTION: usize = 10_000_000;

#[derive(Debug)]
pub(crate) enum EvalError {
    Runtime(String),
    /// A value raised with `throw`.
    Thrown(Value),
    Timeout,
    /// A fatal failure from a recursive call.
    Abort(RunError),
}

impl EvalError {
    pub(crate) fn message(&self) -> String {
        match self {
            EvalError::Runtime(msg) => msg.clone(),
            EvalError::Thrown(value) => match value {
                Value::Object(map) => match map.get("message") {
                    Some(msg) => format!("Uncaught {}", msg.to_display()),
                    None => format!("Uncaught {}", value.to_display()),
                },
                other => format!("Uncaught {}", other.to_display()),
            },
            EvalError::Timeout => "timed out".into(),
            EvalError::Abort(err) => err.to_string(),
        }
    }
}

pub(crate) type EvalResult<T> = Result<T, EvalError>;

pub(super) fn runtime<T>(msg: impl Into<String>) -> EvalResult<T> {
    Err(EvalError::Runtime(msg.into()))
}

/// Control-flow outcome of a statement.
pub(crate) enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Captured `print` output.
#[derive(Debug, Default)]
pub(crate) struct OutputBuffer {
    lines: Vec<String>,
    chars: usize,
    overflowed: bool,
}

impl OutputBuffer {
    pub(crate) fn push(&mut self, line: String) {
        if self.chars >= OUTPUT_HARD_CAP {
            self.overflowed = true;
            return;
        }
        self.chars += line.chars().count() + 1;
        self.lines.push(line);
    }

    pub(crate) fn joined(&self) -> String {
        self.lines.join("\n")
    }

    pub(crate) fn overflowed(&self) -> bool {
        self.overflowed
    }
}

/// One segment of an assignment path below a root variable.
enum PathKey {
    Field(String),
    Index(usize),
}

pub(crate) struct Interpreter<'e> {
    pub(super) env: &'e SnippetEnv<'e>,
    pub(super) scopes: Vec<BTreeMap<String, Value>>,
    pub(super) output: OutputBuffer,
    deadline: Instant,
    call_depth: usize,
    /// Non-zero while evaluating the argument of `Promise.all`; `llm_query`
    /// then returns a deferred call instead of resolving immediately.
    pub(super) deferring: usize,
    /// Set once a deferred call exists, enabling deep resolution walks.
    pub(super) pending_seen: bool,
}

impl<'e> Interpreter<'e> {
    pub(crate) fn new(env: &'e SnippetEnv<'e>, bindings: Bindings, timeout: Duration) -> Self {
        Self {
            env,
            scopes: vec![bindings],
            output: OutputBuffer::default(),
            deadline: Instant::now() + timeout,
            call_depth: 0,
            deferring: 0,
            pending_seen: false,
        }
    }

    /// Run a program in the top-level scope.
    pub(crate) async fn run(&mut self, program: &[Stmt]) -> EvalResult<()> {
        self.hoist(program);
        for stmt in program {
            match self.exec(stmt).await? {
                Flow::Return(_) => break,
                Flow::Normal | Flow::Break | Flow::Continue => {}
            }
        }
        // Leave no unresolved deferred calls in the bindings FINAL_VAR sees.
        if self.pending_seen {
            let top = std::mem::take(&mut self.scopes[0]);
            let resolved = self.resolve_deep(Value::Object(top)).await?;
            if let Value::Object(map) = resolved {
                self.scopes[0] = map;
            }
        }
        Ok(())
    }

    /// Top-level bindings and the output buffer.
    pub(crate) fn into_parts(mut self) -> (Bindings, OutputBuffer) {
        let top = if self.scopes.is_empty() {
            Bindings::new()
        } else {
            self.scopes.swap_remove(0)
        };
        (top, self.output)
    }

    fn tick(&self) -> EvalResult<()> {
        if Instant::now() >= self.deadline {
            Err(EvalError::Timeout)
        } else {
            Ok(())
        }
    }

    // ── Scopes ─────────────────────────────────────────────────────

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn lookup_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.get_mut(name))
    }

    fn declare(&mut self, name: &str, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    fn hoist(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            if let Stmt::Function(def) = stmt
                && let Some(name) = &def.name
            {
                self.declare(name, Value::Function(Arc::clone(def)));
            }
        }
    }

    fn bind_pattern(&mut self, pattern: &Pattern, value: Value) -> EvalResult<()> {
        match pattern {
            Pattern::Name(name) => self.declare(name, value),
            Pattern::Array(names) => {
                let items = match value {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => return runtime(format!("cannot destructure {} as an array", other.type_name())),
                };
                for (i, name) in names.iter().enumerate() {
                    self.declare(name, items.get(i).cloned().unwrap_or(Value::Null));
                }
            }
            Pattern::Object(names) => {
                let map = match value {
                    Value::Object(map) => map,
                    other => return runtime(format!("cannot destructure {} as an object", other.type_name())),
                };
                for name in names {
                    self.declare(name, map.get(name).cloned().unwrap_or(Value::Null));
                }
            }
        }
        Ok(())
    }

    // ── Statements ─────────────────────────────────────────────────

    /// Run `stmts` in a fresh block scope.
    fn exec_block<'s>(&'s mut self, stmts: &'s [Stmt]) -> BoxFuture<'s, EvalResult<Flow>> {
        Box::pin(async move {
            self.scopes.push(BTreeMap::new());
            self.hoist(stmts);
            let mut flow = Ok(Flow::Normal);
            for stmt in stmts {
                match self.exec(stmt).await {
                    Ok(Flow::Normal) => {}
                    other => {
                        flow = other;
                        break;
                    }
                }
            }
            self.scopes.pop();
            flow
        })
    }

    fn exec<'s>(&'s mut self, stmt: &'s Stmt) -> BoxFuture<'s, EvalResult<Flow>> {
        Box::pin(async move {
            self.tick()?;
            match stmt {
                Stmt::Declare(decls) => {
                    for (pattern, init) in decls {
                        let value = match init {
                            Some(expr) => self.eval(expr).await?,
                            None => Value::Null,
                        };
                        let value = match pattern {
                            Pattern::Name(_) => value,
                            _ => self.settle(value).await?,
                        };
                        self.bind_pattern(pattern, value)?;
                    }
                    Ok(Flow::Normal)
                }
                Stmt::Expr(expr) => {
                    let value = self.eval(expr).await?;
                    // A bare deferred call still has to run.
                    if let Value::Pending(_) = value {
                        self.settle(value).await?;
                    }
                    Ok(Flow::Normal)
                }
                Stmt::If {
                    cond,
                    then,
                    otherwise,
                } => {
                    if self.truthy(cond).await? {
                        self.exec_block(then).await
                    } else if let Some(otherwise) = otherwise {
                        self.exec_block(otherwise).await
                    } else {
                        Ok(Flow::Normal)
                    }
                }
                Stmt::While { cond, body } => {
                    while self.truthy(cond).await? {
                        self.tick()?;
                        match self.exec_block(body).await? {
                            Flow::Break => break,
                            Flow::Return(v) => return Ok(Flow::Return(v)),
                            Flow::Normal | Flow::Continue => {}
                        }
                    }
                    Ok(Flow::Normal)
                }
                Stmt::For {
                    init,
                    cond,
                    step,
                    body,
                } => {
                    self.scopes.push(BTreeMap::new());
                    let flow = self.exec_for(init.as_deref(), cond.as_ref(), step.as_ref(), body).await;
                    self.scopes.pop();
                    flow
                }
                Stmt::ForOf {
                    pattern,
                    iterable,
                    body,
                    keys,
                } => {
                    let source = self.eval(iterable).await?;
                    let source = self.settle(source).await?;
                    let items = if *keys {
                        self.keys_of(source)?
                    } else {
                        self.items_of(source)?
                    };
                    for item in items {
                        self.tick()?;
                        self.scopes.push(BTreeMap::new());
                        let flow = match self.bind_pattern(pattern, item) {
                            Ok(()) => self.exec_block(body).await,
                            Err(e) => Err(e),
                        };
                        self.scopes.pop();
                        match flow? {
                            Flow::Break => break,
                            Flow::Return(v) => return Ok(Flow::Return(v)),
                            Flow::Normal | Flow::Continue => {}
                        }
                    }
                    Ok(Flow::Normal)
                }
                Stmt::Try {
                    body,
                    catch_name,
                    handler,
                    finally,
                } => {
                    let depth = self.scopes.len();
                    let mut result = self.exec_block(body).await;
                    if let Err(EvalError::Runtime(_) | EvalError::Thrown(_)) = &result {
                        self.scopes.truncate(depth);
                        let caught = match result {
                            Err(EvalError::Thrown(value)) => value,
                            Err(EvalError::Runtime(msg)) => error_object(&msg),
                            _ => Value::Null,
                        };
                        self.scopes.push(BTreeMap::new());
                        if let Some(name) = catch_name {
                            self.declare(name, caught);
                        }
                        result = self.exec_block(handler).await;
                        self.scopes.pop();
                    }
                    if !finally.is_empty() {
                        match self.exec_block(finally).await? {
                            Flow::Normal => {}
                            other => return Ok(other),
                        }
                    }
                    result
                }
                Stmt::Throw(expr) => {
                    let value = self.eval(expr).await?;
                    let value = self.settle(value).await?;
                    Err(EvalError::Thrown(value))
                }
                Stmt::Block(stmts) => self.exec_block(stmts).await,
                Stmt::Function(def) => {
                    if let Some(name) = &def.name {
                        self.declare(name, Value::Function(Arc::clone(def)));
                    }
                    Ok(Flow::Normal)
                }
                Stmt::Return(expr) => {
                    let value = match expr {
                        Some(expr) => self.eval(expr).await?,
                        None => Value::Null,
                    };
                    Ok(Flow::Return(value))
                }
                Stmt::Break => Ok(Flow::Break),
                Stmt::Continue => Ok(Flow::Continue),
            }
        })
    }

    async fn exec_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Expr>,
        body: &[Stmt],
    ) -> EvalResult<Flow> {
        if let Some(init) = init {
            self.exec(init).await?;
        }
        loop {
            self.tick()?;
            if let Some(cond) = cond
                && !self.truthy(cond).await?
            {
                break;
            }
            match self.exec_block(body).await? {
                Flow::Break => break,
                Flow::Return(v) => return Ok(Flow::Return(v)),
                Flow::Normal | Flow::Continue => {}
            }
            if let Some(step) = step {
                self.eval(step).await?;
            }
        }
        Ok(Flow::Normal)
    }

    async fn truthy(&mut self, expr: &Expr) -> EvalResult<bool> {
        let value = self.eval(expr).await?;
        Ok(self.settle(value).await?.truthy())
    }

    pub(super) fn items_of(&self, value: Value) -> EvalResult<Vec<Value>> {
        match value {
            Value::Array(items) => Ok(items),
            Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            Value::Object(map) => Ok(map
                .into_iter()
                .map(|(k, v)| Value::Array(vec![Value::Str(k), v]))
                .collect()),
            Value::Context => Ok(self
                .env
                .context
                .materialize()
                .lines()
                .map(Value::str)
                .collect()),
            Value::Null => Ok(Vec::new()),
            other => runtime(format!("{} is not iterable", other.type_name())),
        }
    }

    fn keys_of(&self, value: Value) -> EvalResult<Vec<Value>> {
        match value {
            Value::Object(map) => Ok(map.into_keys().map(Value::Str).collect()),
            Value::Array(items) => Ok((0..items.len()).map(|i| Value::Number(i as f64)).collect()),
            Value::Null => Ok(Vec::new()),
            other => runtime(format!("cannot enumerate keys of {}", other.type_name())),
        }
    }

    // ── Expressions ────────────────────────────────────────────────

    pub(super) fn eval<'s>(&'s mut self, expr: &'s Expr) -> BoxFuture<'s, EvalResult<Value>> {
        Box::pin(async move {
            match expr {
                Expr::Number(n) => Ok(Value::Number(*n)),
                Expr::Str(s) => Ok(Value::Str(s.clone())),
                Expr::Bool(b) => Ok(Value::Bool(*b)),
                Expr::Null => Ok(Value::Null),
                Expr::Regex { pattern, flags } => RegexValue::compile(pattern, flags)
                    .map(|re| Value::Regex(Arc::new(re)))
                    .map_err(EvalError::Runtime),
                Expr::Template(parts) => {
                    let mut out = String::new();
                    for part in parts {
                        match part {
                            TemplatePart::Text(text) => out.push_str(text),
                            TemplatePart::Expr(expr) => {
                                let value = self.eval(expr).await?;
                                out.push_str(&self.display(value).await?);
                            }
                        }
                    }
                    Ok(Value::Str(out))
                }
                Expr::Ident(name) => match self.lookup(name) {
                    Some(value) => Ok(value.clone()),
                    None => self
                        .global(name)
                        .ok_or_else(|| EvalError::Runtime(format!("{name} is not defined"))),
                },
                Expr::Array(items) => Ok(Value::Array(self.eval_list(items).await?)),
                Expr::Object(props) => {
                    let mut map = BTreeMap::new();
                    for prop in props {
                        match prop {
                            ObjectProp::Pair(key, expr) => {
                                let value = self.eval(expr).await?;
                                map.insert(key.clone(), value);
                            }
                            ObjectProp::Spread(expr) => {
                                let value = self.eval(expr).await?;
                                match self.settle(value).await? {
                                    Value::Object(other) => map.extend(other),
                                    Value::Null => {}
                                    other => {
                                        return runtime(format!(
                                            "cannot spread {} into an object",
                                            other.type_name()
                                        ));
                                    }
                                }
                            }
                        }
                    }
                    Ok(Value::Object(map))
                }
                Expr::Spread(_) => runtime("spread is only allowed in calls and array literals"),
                Expr::Member {
                    object,
                    name,
                    optional,
                } => {
                    let value = self.eval(object).await?;
                    let value = self.settle(value).await?;
                    if *optional && matches!(value, Value::Null) {
                        return Ok(Value::Null);
                    }
                    self.get_member(&value, name)
                }
                Expr::Index { object, index } => {
                    let value = self.eval(object).await?;
                    let value = self.settle(value).await?;
                    let index = self.eval(index).await?;
                    let index = self.settle(index).await?;
                    self.get_index(&value, &index)
                }
                Expr::Call { callee, args } => self.eval_call(callee, args).await,
                Expr::Unary(op, inner) => {
                    if let (UnaryOp::TypeOf, Expr::Ident(name)) = (op, inner.as_ref())
                        && self.lookup(name).is_none()
                        && self.global(name).is_none()
                    {
                        return Ok(Value::str("undefined"));
                    }
                    let value = self.eval(inner).await?;
                    let value = self.settle(value).await?;
                    Ok(match op {
                        UnaryOp::Not => Value::Bool(!value.truthy()),
                        UnaryOp::Neg => Value::Number(-value.to_number()),
                        UnaryOp::Plus => Value::Number(value.to_number()),
                        UnaryOp::TypeOf => Value::str(value.type_name()),
                    })
                }
                Expr::Binary(op, left, right) => {
                    let lhs = self.eval(left).await?;
                    let lhs = self.settle(lhs).await?;
                    match op {
                        BinaryOp::And if !lhs.truthy() => return Ok(lhs),
                        BinaryOp::Or if lhs.truthy() => return Ok(lhs),
                        BinaryOp::Nullish if !matches!(lhs, Value::Null) => return Ok(lhs),
                        BinaryOp::And | BinaryOp::Or | BinaryOp::Nullish => {
                            return self.eval(right).await;
                        }
                        _ => {}
                    }
                    let rhs = self.eval(right).await?;
                    let rhs = self.settle(rhs).await?;
                    binary_op(*op, &self.concrete(lhs), &self.concrete(rhs))
                }
                Expr::Conditional {
                    cond,
                    then,
                    otherwise,
                } => {
                    if self.truthy(cond).await? {
                        self.eval(then).await
                    } else {
                        self.eval(otherwise).await
                    }
                }
                Expr::Assign { target, op, value } => {
                    let mut new_value = self.eval(value).await?;
                    if let Some(op) = op {
                        let current = self.eval(target).await?;
                        let current = self.settle(current).await?;
                        let rhs = self.settle(new_value).await?;
                        new_value = binary_op(*op, &current, &rhs)?;
                    }
                    self.assign(target, new_value.clone()).await?;
                    Ok(new_value)
                }
                Expr::Update {
                    target,
                    delta,
                    prefix,
                } => {
                    let current = self.eval(target).await?;
                    let old = self.settle(current).await?.to_number();
                    let new = old + delta;
                    self.assign(target, Value::Number(new)).await?;
                    Ok(Value::Number(if *prefix { new } else { old }))
                }
                Expr::Function(def) => Ok(Value::Function(Arc::clone(def))),
                Expr::Await(inner) => {
                    let value = self.eval(inner).await?;
                    self.resolve_deep(value).await
                }
            }
        })
    }

    /// Evaluate a list of expressions, expanding spreads.
    pub(super) async fn eval_list(&mut self, exprs: &[Expr]) -> EvalResult<Vec<Value>> {
        let mut out = Vec::with_capacity(exprs.len());
        for expr in exprs {
            match expr {
                Expr::Spread(inner) => {
                    let value = self.eval(inner).await?;
                    let value = self.settle(value).await?;
                    out.extend(self.items_of(value)?);
                }
                other => out.push(self.eval(other).await?),
            }
        }
        Ok(out)
    }

    async fn eval_call(&mut self, callee: &Expr, args: &[Expr]) -> EvalResult<Value> {
        self.tick()?;
        let Expr::Member {
            object,
            name,
            optional,
        } = callee
        else {
            let function = self.eval(callee).await?;
            let function = self.settle(function).await?;
            let args = self.eval_list(args).await?;
            return self.call_value(function, args).await;
        };

        let receiver = self.eval(object).await?;
        let receiver = self.settle(receiver).await?;
        if *optional && matches!(receiver, Value::Null) {
            return Ok(Value::Null);
        }

        if let Value::Namespace("Promise") = receiver
            && name == "all"
        {
            self.deferring += 1;
            let batch = self.eval_list(args).await;
            self.deferring -= 1;
            let first = batch?.into_iter().next().unwrap_or(Value::Array(Vec::new()));
            return self.resolve_deep(first).await;
        }

        let args = self.eval_list(args).await?;
        if is_mutating_method(name)
            && matches!(receiver, Value::Array(_))
            && is_place(object)
        {
            return self.call_mutating(object, name, args).await;
        }
        self.call_method(receiver, name, args).await
    }

    /// Call any callable value.
    pub(super) fn call_value<'s>(
        &'s mut self,
        function: Value,
        args: Vec<Value>,
    ) -> BoxFuture<'s, EvalResult<Value>> {
        Box::pin(async move {
            match function {
                Value::Function(def) => self.call_function(&def, args).await,
                Value::Builtin(name) => self.call_builtin(name, args).await,
                other => runtime(format!("{} is not a function", other.to_display())),
            }
        })
    }

    async fn call_function(&mut self, def: &FunctionDef, args: Vec<Value>) -> EvalResult<Value> {
        if self.call_depth >= MAX_CALL_DEPTH {
            return runtime("maximum call depth exceeded");
        }
        self.tick()?;
        let mut frame = BTreeMap::new();
        let mut args = args.into_iter();
        for param in &def.params {
            frame.insert(param.clone(), args.next().unwrap_or(Value::Null));
        }

        self.call_depth += 1;
        self.scopes.push(frame);
        let depth = self.scopes.len();
        let result = match &def.body {
            FunctionBody::Expr(expr) => self.eval(expr).await,
            FunctionBody::Block(stmts) => match self.exec_block(stmts).await {
                Ok(Flow::Return(value)) => Ok(value),
                Ok(_) => Ok(Value::Null),
                Err(e) => Err(e),
            },
        };
        self.scopes.truncate(depth - 1);
        self.call_depth -= 1;
        result
    }

    // ── Assignment ─────────────────────────────────────────────────

    /// Resolve `target` to a root variable plus a path of keys.
    async fn resolve_path(&mut self, target: &Expr) -> EvalResult<(String, Vec<PathKey>)> {
        let mut keys = Vec::new();
        let mut cursor = target;
        loop {
            match cursor {
                Expr::Ident(name) => {
                    keys.reverse();
                    return Ok((name.clone(), keys));
                }
                Expr::Member { object, name, .. } => {
                    check_member_name(name)?;
                    keys.push(PathKey::Field(name.clone()));
                    cursor = object;
                }
                Expr::Index { object, index } => {
                    let index = self.eval(index).await?;
                    let index = self.settle(index).await?;
                    keys.push(match index {
                        Value::Number(n) if n >= 0.0 && n.fract() == 0.0 => PathKey::Index(n as usize),
                        other => {
                            let key = other.to_display();
                            check_member_name(&key)?;
                            PathKey::Field(key)
                        }
                    });
                    cursor = object;
                }
                _ => return runtime("invalid assignment target"),
            }
        }
    }

    fn place_mut(&mut self, root: &str, keys: &[PathKey]) -> EvalResult<&mut Value> {
        if self.lookup(root).is_none() {
            if self.global(root).is_some() {
                return runtime(format!("cannot modify built-in `{root}`"));
            }
            // Undeclared assignment creates a top-level binding.
            if let Some(top) = self.scopes.first_mut() {
                top.insert(root.to_string(), Value::Null);
            }
        }
        let Some(mut slot) = self.lookup_mut(root) else {
            return runtime(format!("{root} is not defined"));
        };
        for key in keys {
            slot = match (slot, key) {
                (Value::Object(map), PathKey::Field(name)) => {
                    map.entry(name.clone()).or_insert(Value::Null)
                }
                (Value::Object(map), PathKey::Index(i)) => {
                    map.entry(i.to_string()).or_insert(Value::Null)
                }
                (Value::Array(items), PathKey::Index(i)) => {
                    if *i >= MAX_COLLECTION {
                        return runtime("array index too large");
                    }
                    if *i >= items.len() {
                        items.resize(*i + 1, Value::Null);
                    }
                    &mut items[*i]
                }
                (other, _) => {
                    return runtime(format!("cannot set a property on {}", other.type_name()));
                }
            };
        }
        Ok(slot)
    }

    async fn assign(&mut self, target: &Expr, value: Value) -> EvalResult<()> {
        let (root, keys) = self.resolve_path(target).await?;
        *self.place_mut(&root, &keys)? = value;
        Ok(())
    }

    async fn call_mutating(
        &mut self,
        object: &Expr,
        method: &str,
        args: Vec<Value>,
    ) -> EvalResult<Value> {
        let (root, keys) = self.resolve_path(object).await?;
        if method == "sort" {
            // The comparator is async, so sort a copy and write it back.
            let Value::Array(items) = self.place_mut(&root, &keys)?.clone() else {
                return runtime("sort receiver is not an array");
            };
            let sorted = self.sort_values(items, args.into_iter().next()).await?;
            *self.place_mut(&root, &keys)? = Value::Array(sorted.clone());
            return Ok(Value::Array(sorted));
        }
        let Value::Array(items) = self.place_mut(&root, &keys)? else {
            return runtime(format!("{method} receiver is not an array"));
        };
        Ok(match method {
            "push" => {
                if items.len() + args.len() > MAX_COLLECTION {
                    return runtime("array too large");
                }
                items.extend(args);
                Value::Number(items.len() as f64)
            }
            "pop" => items.pop().unwrap_or(Value::Null),
            "shift" => {
                if items.is_empty() {
                    Value::Null
                } else {
                    items.remove(0)
                }
            }
            "unshift" => {
                let tail = std::mem::take(items);
                items.extend(args);
                items.extend(tail);
                Value::Number(items.len() as f64)
            }
            "reverse" => {
                items.reverse();
                Value::Array(items.clone())
            }
            _ => return runtime(format!("unknown array method {method}")),
        })
    }

    // ── Deferred recursive calls ───────────────────────────────────

    /// Resolve a value for consumption: a deferred call becomes its answer,
    /// and containers are walked only once deferred calls exist.
    pub(super) fn settle<'s>(&'s mut self, value: Value) -> BoxFuture<'s, EvalResult<Value>> {
        Box::pin(async move {
            match value {
                Value::Pending(call) => Ok(Value::Str(self.resolve_one(&call).await?)),
                other if self.pending_seen => self.resolve_deep(other).await,
                other => Ok(other),
            }
        })
    }

    async fn resolve_one(&mut self, call: &Arc<PendingCall>) -> EvalResult<String> {
        let recursive = self.env.recursive;
        let started = Instant::now();
        let answer = call
            .result
            .get_or_try_init(|| recursive.call(call.query.clone(), call.context.clone()))
            .await
            .cloned()
            .map_err(EvalError::Abort);
        self.suspended(started);
        answer
    }

    /// Time spent waiting on child runs does not count against the
    /// snippet's compute deadline.
    pub(super) fn suspended(&mut self, since: Instant) {
        self.deadline += since.elapsed();
    }

    /// Resolve every deferred call inside `value` concurrently and replace
    /// each with its answer.
    pub(super) async fn resolve_deep(&mut self, value: Value) -> EvalResult<Value> {
        let mut pending = Vec::new();
        collect_pending(&value, &mut pending);
        if pending.is_empty() {
            return Ok(value);
        }
        let recursive = self.env.recursive;
        let started = Instant::now();
        let results = join_all(pending.iter().map(|call| {
            call.result
                .get_or_try_init(|| recursive.call(call.query.clone(), call.context.clone()))
        }))
        .await;
        self.suspended(started);
        for result in results {
            result.map_err(EvalError::Abort)?;
        }
        Ok(substitute_pending(value))
    }

    pub(super) fn defer(&mut self, call: PendingCall) -> Value {
        self.pending_seen = true;
        Value::Pending(Arc::new(call))
    }

    /// `print`-style text of a value, resolving deferred calls first.
    pub(super) async fn display(&mut self, value: Value) -> EvalResult<String> {
        let value = match value {
            Value::Context => return Ok(self.env.context.materialize().to_string()),
            other => self.settle(other).await?,
        };
        let value = if self.pending_seen || matches!(value, Value::Array(_) | Value::Object(_)) {
            self.resolve_deep(value).await?
        } else {
            value
        };
        Ok(value.to_display())
    }

    pub(super) fn error_value(&self, message: &str) -> Value {
        error_object(message)
    }

    /// Replace the context handle with its text; operators need real strings.
    pub(super) fn concrete(&self, value: Value) -> Value {
        match value {
            Value::Context => Value::Str(self.env.context.materialize().to_string()),
            other => other,
        }
    }
}

fn error_object(message: &str) -> Value {
    let mut map = BTreeMap::new();
    map.insert("name".to_string(), Value::str("Error"));
    map.insert("message".to_string(), Value::str(message));
    Value::Object(map)
}

fn collect_pending(value: &Value, out: &mut Vec<Arc<PendingCall>>) {
    match value {
        Value::Pending(call) => {
            if call.result.get().is_none() && !out.iter().any(|c| Arc::ptr_eq(c, call)) {
                out.push(Arc::clone(call));
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_pending(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_pending(v, out)),
        _ => {}
    }
}

fn substitute_pending(value: Value) -> Value {
    match value {
        Value::Pending(call) => Value::Str(call.result.get().cloned().unwrap_or_default()),
        Value::Array(items) => Value::Array(items.into_iter().map(substitute_pending).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, substitute_pending(v)))
                .collect(),
        ),
        other => other,
    }
}

fn is_mutating_method(name: &str) -> bool {
    matches!(name, "push" | "pop" | "shift" | "unshift" | "reverse" | "sort")
}

fn is_place(expr: &Expr) -> bool {
    match expr {
        Expr::Ident(_) => true,
        Expr::Member { object, .. } | Expr::Index { object, .. } => is_place(object),
        _ => false,
    }
}

/// Property names that lead to prototype or constructor internals.
pub(super) fn check_member_name(name: &str) -> EvalResult<()> {
    if matches!(name, "constructor" | "__proto__" | "prototype") {
        runtime(format!("access to `{name}` is not allowed"))
    } else {
        Ok(())
    }
}

pub(super) fn binary_op(op: BinaryOp, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    use std::cmp::Ordering::*;
    Ok(match op {
        BinaryOp::Add => match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
            (Value::Number(_) | Value::Bool(_) | Value::Null, Value::Number(_) | Value::Bool(_) | Value::Null) => {
                Value::Number(lhs.to_number() + rhs.to_number())
            }
            _ => {
                let mut s = lhs.to_display();
                s.push_str(&rhs.to_display());
                if s.len() > MAX_COLLECTION {
                    return runtime("string too large");
                }
                Value::Str(s)
            }
        },
        BinaryOp::Sub => Value::Number(lhs.to_number() - rhs.to_number()),
        BinaryOp::Mul => Value::Number(lhs.to_number() * rhs.to_number()),
        BinaryOp::Div => Value::Number(lhs.to_number() / rhs.to_number()),
        BinaryOp::Rem => Value::Number(lhs.to_number() % rhs.to_number()),
        BinaryOp::Pow => Value::Number(lhs.to_number().powf(rhs.to_number())),
        BinaryOp::Eq => Value::Bool(lhs.loose_eq(rhs)),
        BinaryOp::NotEq => Value::Bool(!lhs.loose_eq(rhs)),
        BinaryOp::StrictEq => Value::Bool(lhs.strict_eq(rhs)),
        BinaryOp::StrictNotEq => Value::Bool(!lhs.strict_eq(rhs)),
        BinaryOp::Lt => Value::Bool(lhs.compare(rhs) == Some(Less)),
        BinaryOp::LtEq => Value::Bool(matches!(lhs.compare(rhs), Some(Less | Equal))),
        BinaryOp::Gt => Value::Bool(lhs.compare(rhs) == Some(Greater)),
        BinaryOp::GtEq => Value::Bool(matches!(lhs.compare(rhs), Some(Greater | Equal))),
        BinaryOp::And | BinaryOp::Or | BinaryOp::Nullish => {
            return runtime("logical operators are evaluated lazily");
        }
    })
}
