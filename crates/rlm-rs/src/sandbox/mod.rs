//! Restricted execution of model-written snippets.
//!
//! Snippets are written in a small JavaScript-flavoured language and run by
//! an interpreter embedded in this crate. They never reach a host evaluator,
//! so the set of things a snippet can touch is exactly the set of names the
//! interpreter resolves:
//!
//! | Name | What it is |
//! |------|------------|
//! | `context` | The run's text. `.length`, `.slice(a, b)`, `.search(re)`, `.grep(re)`, `.lines(a?, b?)`, `.head(n)`, `.tail(n)`, `.chunks(size)`; other string methods work on the materialized text |
//! | `query` | The question this run is answering |
//! | `print(...)`, `console.log(...)` | Append a line to the captured output |
//! | `len`, `range`, `str`, `String`, `Number`, `Boolean`, `parseInt`, `parseFloat`, `isNaN`, `Error` | Conversions and helpers |
//! | `JSON`, `Math`, `Date`, `Regex`, `Object`, `Array` | Namespaces of pure helpers |
//! | `llm_query(q, ctx?)` | Delegate a sub-question to a child run; returns its answer |
//! | `llm_batch(items)` | Delegate several sub-questions concurrently; returns answers in order |
//! | `Promise.all(xs)` | Resolve every `llm_query` issued while evaluating `xs`, concurrently |
//!
//! Execution goes through three gates:
//!
//! 1. [`policy::check`] scans identifiers against a denylist and rejects the
//!    snippet before it runs.
//! 2. The parser rejects anything outside the grammar.
//! 3. The interpreter enforces a compute deadline (checked at every
//!    statement, loop iteration, and call), a call-depth cap, and a size cap
//!    on built strings and arrays. A wall-clock timeout bounds the whole
//!    execution including suspended recursive calls.

mod ast;
mod builtins;
mod interp;
mod lexer;
pub(crate) mod parser;
pub mod policy;
pub mod value;

use crate::context::Context;
use crate::error::{RunError, SnippetFault};
use futures::future::BoxFuture;
use interp::{EvalError, Interpreter};
use std::time::Duration;
use tracing::{debug, warn};

pub use value::{Bindings, Value};

/// Evaluate a standalone expression with no globals in scope. Used to read
/// object literals such as the payload of a confidence marker.
pub fn eval_literal(src: &str) -> Result<Value, String> {
    let expr = parser::parse_expression(src)?;
    literal_value(&expr)
}

fn literal_value(expr: &ast::Expr) -> Result<Value, String> {
    use ast::{Expr, ObjectProp, TemplatePart, UnaryOp};
    Ok(match expr {
        Expr::Number(n) => Value::Number(*n),
        Expr::Str(s) => Value::Str(s.clone()),
        Expr::Bool(b) => Value::Bool(*b),
        Expr::Null => Value::Null,
        Expr::Ident(name) if name == "undefined" => Value::Null,
        Expr::Template(parts) => {
            let mut out = String::new();
            for part in parts {
                match part {
                    TemplatePart::Text(text) => out.push_str(text),
                    TemplatePart::Expr(_) => return Err("interpolation is not allowed here".into()),
                }
            }
            Value::Str(out)
        }
        Expr::Unary(UnaryOp::Neg, inner) => match literal_value(inner)? {
            Value::Number(n) => Value::Number(-n),
            _ => return Err("unary minus on a non-number".into()),
        },
        Expr::Array(items) => Value::Array(items.iter().map(literal_value).collect::<Result<_, _>>()?),
        Expr::Object(props) => {
            let mut map = Bindings::new();
            for prop in props {
                match prop {
                    ObjectProp::Pair(key, value) => {
                        map.insert(key.clone(), literal_value(value)?);
                    }
                    ObjectProp::Spread(_) => return Err("spread is not allowed here".into()),
                }
            }
            Value::Object(map)
        }
        _ => return Err("only literal values are allowed here".into()),
    })
}

/// The recursive-call capability handed to a snippet.
pub trait RecursiveCall: Send + Sync {
    /// Answer `query` over `context` (the caller's context when `None`).
    ///
    /// Refusals and ordinary child failures come back as `Ok` text for the
    /// snippet to read; only fatal failures are `Err`.
    fn call<'a>(&'a self, query: String, context: Option<Context>) -> BoxFuture<'a, Result<String, RunError>>;
}

/// What a snippet can see besides its own bindings.
pub struct SnippetEnv<'a> {
    pub context: &'a Context,
    pub query: &'a str,
    pub recursive: &'a dyn RecursiveCall,
}

/// Captured output of a successful execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnippetOutput {
    /// Printed text, possibly truncated.
    pub output: String,
    pub truncated: bool,
    /// Character count before truncation.
    pub total_chars: usize,
}

/// Snippet executor with its limits.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub max_output_chars: usize,
    /// Compute deadline. Time suspended in recursive calls is not counted.
    pub timeout: Duration,
    /// Wall-clock bound on the whole execution.
    pub wall_timeout: Duration,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self {
            max_output_chars: 2000,
            timeout: Duration::from_secs(30),
            wall_timeout: Duration::from_secs(600),
        }
    }
}

impl Sandbox {
    pub fn new(max_output_chars: usize, timeout: Duration, wall_timeout: Duration) -> Self {
        Self {
            max_output_chars,
            timeout,
            wall_timeout,
        }
    }

    /// Execute `snippet`. Top-level bindings are read from and written back
    /// to `bindings`, including after a runtime fault.
    pub async fn execute(
        &self,
        snippet: &str,
        env: &SnippetEnv<'_>,
        bindings: &mut Bindings,
    ) -> Result<SnippetOutput, SnippetFault> {
        if let Err(violation) = policy::check(snippet) {
            warn!("Snippet rejected: {violation}");
            return Err(SnippetFault::Rejected {
                token: violation.token,
            });
        }
        let program = parser::parse_program(snippet).map_err(|message| SnippetFault::Parse { message })?;

        let mut interpreter = Interpreter::new(env, std::mem::take(bindings), self.timeout);
        let result = tokio::time::timeout(self.wall_timeout, interpreter.run(&program)).await;
        let (top, buffer) = interpreter.into_parts();
        *bindings = top;

        let (output, truncated, total_chars) = self.render(&buffer.joined(), buffer.overflowed());
        debug!(chars = total_chars, truncated, "Snippet finished");
        match result {
            Ok(Ok(())) => Ok(SnippetOutput {
                output,
                truncated,
                total_chars,
            }),
            Err(_) => Err(SnippetFault::Timeout {
                after: self.wall_timeout,
                output,
            }),
            Ok(Err(EvalError::Timeout)) => Err(SnippetFault::Timeout {
                after: self.timeout,
                output,
            }),
            Ok(Err(EvalError::Abort(err))) => Err(SnippetFault::Aborted(Box::new(err))),
            Ok(Err(err)) => Err(SnippetFault::Execution {
                message: err.message(),
                output,
            }),
        }
    }

    /// Truncate `raw` to the output ceiling, appending a marker when cut.
    fn render(&self, raw: &str, overflowed: bool) -> (String, bool, usize) {
        let total = raw.chars().count();
        if total <= self.max_output_chars && !overflowed {
            return (raw.to_string(), false, total);
        }
        let kept: String = raw.chars().take(self.max_output_chars).collect();
        let marker = if overflowed {
            format!("\n... [truncated, more than {total} chars total]")
        } else {
            format!("\n... [truncated, {total} chars total]")
        };
        (kept + &marker, true, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every sub-question with `"answer to <query>"` and records the
    /// context size each call saw.
    #[derive(Default)]
    struct EchoRecursion {
        calls: AtomicUsize,
        sizes: Mutex<Vec<usize>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl RecursiveCall for EchoRecursion {
        fn call<'a>(&'a self, query: String, context: Option<Context>) -> BoxFuture<'a, Result<String, RunError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                self.sizes
                    .lock()
                    .unwrap()
                    .push(context.map_or(0, |c| c.size()));
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(format!("answer to {query}"))
            })
        }
    }

    struct FailingRecursion;

    impl RecursiveCall for FailingRecursion {
        fn call<'a>(&'a self, _query: String, _context: Option<Context>) -> BoxFuture<'a, Result<String, RunError>> {
            Box::pin(async {
                Err(RunError::TransportFault {
                    model: "m".into(),
                    message: "HTTP 503".into(),
                })
            })
        }
    }

    async fn run_with(
        snippet: &str,
        text: &str,
        recursive: &dyn RecursiveCall,
        bindings: &mut Bindings,
    ) -> Result<SnippetOutput, SnippetFault> {
        let context = Context::text(text);
        let env = SnippetEnv {
            context: &context,
            query: "what?",
            recursive,
        };
        Sandbox::default().execute(snippet, &env, bindings).await
    }

    async fn run(snippet: &str, text: &str) -> Result<SnippetOutput, SnippetFault> {
        run_with(snippet, text, &EchoRecursion::default(), &mut Bindings::new()).await
    }

    async fn output(snippet: &str, text: &str) -> String {
        run(snippet, text).await.unwrap().output
    }

    #[tokio::test]
    async fn prints_context_slices() {
        let out = output("print(context.slice(0, 5))\nprint(context.length)", "hello world").await;
        assert_eq!(out, "hello\n11");
    }

    #[tokio::test]
    async fn arithmetic_strings_and_templates() {
        let out = output(
            "const n = 6 * 7\nlet s = `n is ${n}`\nconsole.log(s, n % 5, 2 ** 3)",
            "",
        )
        .await;
        assert_eq!(out, "n is 42 2 8");
    }

    #[tokio::test]
    async fn loops_functions_and_closures_over_caller_scope() {
        let snippet = r#"
            function square(x) { return x * x }
            let total = 0
            for (let i = 0; i < 4; i++) { total += square(i) }
            const doubled = [1, 2, 3].map(x => x * 2).filter(x => x > 2)
            let seen = []
            doubled.forEach(x => { seen.push(x) })
            print(total, JSON.stringify(doubled), seen.length)
        "#;
        assert_eq!(output(snippet, "").await, "14 [4,6] 2");
    }

    #[tokio::test]
    async fn mutating_methods_write_back() {
        let snippet = r#"
            const acc = { items: [3, 1, 2] }
            acc.items.push(0)
            acc.items.sort((a, b) => a - b)
            const last = acc.items.pop()
            print(JSON.stringify(acc), last)
        "#;
        assert_eq!(output(snippet, "").await, r#"{"items":[0,1,2]} 3"#);
    }

    #[tokio::test]
    async fn context_helpers() {
        let text = "alpha\nbeta error\ngamma\ndelta error";
        let snippet = r#"
            const hits = context.search("error")
            print(hits.length, hits[0].line)
            print(context.grep(/error$/).map(h => h.line).join(","))
            print(context.head(1), context.tail(1))
            print(context.chunks(10).length)
            print(context.lines().length, context.split("\n")[2])
        "#;
        assert_eq!(output(snippet, text).await, "2 2\n2,4\nalpha delta error\n4\n4 gamma");
    }

    #[tokio::test]
    async fn regex_helpers() {
        let snippet = r#"
            const ids = Regex.findAll("id=(\\d+)", "id=4 id=17")
            print(ids.join("+"))
            print("a-b-c".replace(/-/g, "_"), "x1y2".match(/\d/g).length)
            print("Hello".replace("l", "L"), "aaa".replaceAll("a", "$"))
        "#;
        assert_eq!(output(snippet, "").await, "4+17\na_b_c 2\nHeLlo $$$");
    }

    #[tokio::test]
    async fn denied_tokens_are_rejected_before_running() {
        let fault = run("print('hi')\nrequire('fs')", "").await.unwrap_err();
        assert_eq!(
            fault,
            SnippetFault::Rejected {
                token: "require".into()
            }
        );
    }

    #[tokio::test]
    async fn unknown_names_do_not_resolve() {
        let fault = run("print(secrets)", "").await.unwrap_err();
        match fault {
            SnippetFault::Execution { message, .. } => assert!(message.contains("secrets is not defined")),
            other => panic!("unexpected fault {other:?}"),
        }
    }

    #[tokio::test]
    async fn runtime_errors_keep_partial_output() {
        let fault = run("print('before')\nnull.x", "").await.unwrap_err();
        assert_eq!(fault.partial_output(), "before");
        assert!(fault.is_recoverable());
    }

    #[tokio::test]
    async fn try_catch_recovers_from_runtime_errors() {
        let snippet = r#"
            try { JSON.parse("{oops") } catch (e) { print("caught", e.name) }
            try { throw new Error("boom") } catch (e) { print(e.message) } finally { print("done") }
        "#;
        assert_eq!(output(snippet, "").await, "caught Error\nboom\ndone");
    }

    #[tokio::test]
    async fn infinite_loops_time_out() {
        let context = Context::text("");
        let recursion = EchoRecursion::default();
        let env = SnippetEnv {
            context: &context,
            query: "",
            recursive: &recursion,
        };
        let sandbox = Sandbox::new(100, Duration::from_millis(50), Duration::from_secs(5));
        let fault = sandbox
            .execute("print('start')\nwhile (true) {}", &env, &mut Bindings::new())
            .await
            .unwrap_err();
        assert!(matches!(fault, SnippetFault::Timeout { .. }));
        assert_eq!(fault.partial_output(), "start");
    }

    #[tokio::test]
    async fn runaway_recursion_is_an_error() {
        let fault = run("function f(n) { return f(n + 1) }\nf(0)", "").await.unwrap_err();
        assert!(fault.to_string().contains("maximum call depth"));
    }

    #[tokio::test]
    async fn output_is_truncated_with_a_marker() {
        let context = Context::text("");
        let recursion = EchoRecursion::default();
        let env = SnippetEnv {
            context: &context,
            query: "",
            recursive: &recursion,
        };
        let sandbox = Sandbox::new(10, Duration::from_secs(5), Duration::from_secs(5));
        let out = sandbox
            .execute("print('x'.repeat(25))", &env, &mut Bindings::new())
            .await
            .unwrap();
        assert!(out.truncated);
        assert_eq!(out.total_chars, 25);
        assert_eq!(out.output, "xxxxxxxxxx\n... [truncated, 25 chars total]");
    }

    #[tokio::test]
    async fn bindings_persist_across_executions() {
        let recursion = EchoRecursion::default();
        let mut bindings = Bindings::new();
        run_with("const notes = ['a']\nfunction add(x) { notes.push(x) }", "", &recursion, &mut bindings)
            .await
            .unwrap();
        let out = run_with("add('b')\nprint(notes.join(''))", "", &recursion, &mut bindings)
            .await
            .unwrap();
        assert_eq!(out.output, "ab");
        assert!(matches!(bindings.get("notes"), Some(Value::Array(items)) if items.len() == 2));
    }

    #[tokio::test]
    async fn recursive_calls_receive_fragments() {
        let recursion = EchoRecursion::default();
        let out = run_with(
            "const a = llm_query('first', context.slice(0, 3))\nconst b = llm_query('second')\nprint(a)\nprint(b)",
            "abcdefgh",
            &recursion,
            &mut Bindings::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.output, "answer to first\nanswer to second");
        assert_eq!(*recursion.sizes.lock().unwrap(), vec![3, 0]);
    }

    #[tokio::test]
    async fn promise_all_runs_calls_concurrently_in_order() {
        let recursion = EchoRecursion::default();
        let snippet = r#"
            const parts = context.chunks(4)
            const answers = await Promise.all(parts.map((p, i) => llm_query(`part ${i}`, p)))
            print(answers.join(" | "))
        "#;
        let mut bindings = Bindings::new();
        let out = run_with(snippet, "aaaabbbbcccc", &recursion, &mut bindings).await.unwrap();
        assert_eq!(out.output, "answer to part 0 | answer to part 1 | answer to part 2");
        assert_eq!(recursion.calls.load(Ordering::SeqCst), 3);
        assert_eq!(recursion.peak.load(Ordering::SeqCst), 3);
        assert!(matches!(bindings.get("answers"), Some(Value::Array(items)) if matches!(&items[0], Value::Str(_))));
    }

    #[tokio::test]
    async fn llm_batch_accepts_strings_and_objects() {
        let recursion = EchoRecursion::default();
        let snippet = r#"
            const out = llm_batch(["q1", { query: "q2", context: "xy" }])
            print(out[0], "/", out[1])
        "#;
        let out = run_with(snippet, "ctx", &recursion, &mut Bindings::new()).await.unwrap();
        assert_eq!(out.output, "answer to q1 / answer to q2");
        assert_eq!(recursion.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sequential_calls_do_not_overlap() {
        let recursion = EchoRecursion::default();
        let snippet = "const xs = []\nfor (const q of ['a', 'b']) { xs.push(llm_query(q)) }\nprint(xs.length)";
        run_with(snippet, "", &recursion, &mut Bindings::new()).await.unwrap();
        assert_eq!(recursion.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_child_faults_abort_the_snippet() {
        let fault = run_with("print(llm_query('x'))", "", &FailingRecursion, &mut Bindings::new())
            .await
            .unwrap_err();
        assert!(!fault.is_recoverable());
        assert!(matches!(fault, SnippetFault::Aborted(err) if err.kind() == "TransportFault"));
    }

    #[tokio::test]
    async fn prototype_access_is_refused_at_runtime() {
        let fault = run("const o = {}\nconst k = 'proto' + 'type'\nprint(o[k])", "").await.unwrap_err();
        assert!(fault.to_string().contains("not allowed"));
    }

    #[test]
    fn literal_evaluation_has_no_globals() {
        let value = eval_literal("{answer: 'x', confidence: 0.5, tags: ['a',],}").unwrap();
        assert_eq!(value.to_display(), r#"{"answer":"x","confidence":0.5,"tags":["a"]}"#);
        assert!(eval_literal("{answer: context}").is_err());
    }
}
