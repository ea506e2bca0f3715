//! End-to-end runs of the engine against scripted model clients.

use rlm_rs::api::tracing::ModelPricing;
use rlm_rs::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Tokens reported for every scripted call.
const IN_TOKENS: u32 = 1000;
const OUT_TOKENS: u32 = 100;

/// Cost of one scripted call at the default $3 / $15 rate.
fn call_cost() -> f64 {
    ModelPricing::default().estimate_cost(IN_TOKENS, OUT_TOKENS)
}

/// The question a transcript is about, taken from its first user message.
fn question(messages: &[Message]) -> String {
    messages
        .iter()
        .find(|m| m.role == MessageRole::User)
        .map(|m| m.content.trim_start_matches("Question: ").to_string())
        .unwrap_or_default()
}

/// A client that replies per question: the n-th call for question `q`
/// gets `scripts[q][n]`, or `FINAL("<q> done")` once the script runs out.
/// Every transcript sent is recorded.
struct Scripted {
    scripts: HashMap<String, Vec<String>>,
    calls: Mutex<HashMap<String, usize>>,
    sent: Mutex<Vec<Vec<Message>>>,
}

impl Scripted {
    fn new(scripts: Vec<(&str, Vec<&str>)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts
                .into_iter()
                .map(|(q, replies)| (q.to_string(), replies.into_iter().map(String::from).collect()))
                .collect(),
            calls: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn reply(&self, messages: &[Message]) -> String {
        let q = question(messages);
        self.sent.lock().unwrap().push(messages.to_vec());
        let mut calls = self.calls.lock().unwrap();
        let n = calls.entry(q.clone()).or_default();
        let reply = self
            .scripts
            .get(&q)
            .and_then(|script| script.get(*n).cloned())
            .unwrap_or_else(|| format!("FINAL(\"{q} done\")"));
        *n += 1;
        reply
    }

    fn calls_for(&self, q: &str) -> usize {
        self.calls.lock().unwrap().get(q).copied().unwrap_or(0)
    }

    fn client(self: &Arc<Self>) -> impl ModelClient + use<> {
        let script = Arc::clone(self);
        FnModelClient::new(move |messages: &[Message], _: &CompletionOptions| {
            Ok(Completion::new(script.reply(messages), IN_TOKENS, OUT_TOKENS))
        })
    }
}

fn capture() -> (
    Arc<Mutex<Vec<RunEvent>>>,
    FnEventHandler<impl Fn(&RunEvent) + Send + Sync>,
) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let handler = FnEventHandler::new(move |event: &RunEvent| sink.lock().unwrap().push(event.clone()));
    (events, handler)
}

// ── Scenario A ─────────────────────────────────────────────────────

#[tokio::test]
async fn print_a_slice_then_answer() {
    let script = Scripted::new(vec![(
        "what is the answer?",
        vec!["```js\nprint(context.slice(0, 12))\n```", "FINAL(\"42\")"],
    )]);
    let client = script.client();
    let (events, handler) = capture();

    let mut rlm = Orchestrator::new(&client, RlmConfig::new("m")).with_event_handler(&handler);
    let result = rlm
        .run("what is the answer?", Context::text("the answer is 42, obviously"))
        .await
        .unwrap();

    assert_eq!(result.answer, "42");
    assert_eq!(result.confidence, None);
    assert_eq!(rlm.stats().iterations, 2);
    assert_eq!(rlm.stats().llm_calls, 2);
    assert_eq!(rlm.stats().repl_errors, 0);

    let sent = script.sent.lock().unwrap();
    assert_eq!(sent[1].last().unwrap().content, "Output:\nthe answer i");

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::SnippetOutputProduced { success: true, .. }
    )));
    assert!(matches!(
        events.last(),
        Some(RunEvent::RunCompleted { answer: Some(a), iterations: 2, .. }) if a == "42"
    ));
}

// ── Scenario B ─────────────────────────────────────────────────────

#[tokio::test]
async fn delegation_at_max_depth_is_refused_without_a_model_call() {
    let script = Scripted::new(vec![(
        "root",
        vec![
            "```js\nconst sub = llm_query(\"sub\", context.slice(0, 3))\nprint(sub)\n```",
            "FINAL(\"done\")",
        ],
    )]);
    let client = script.client();
    let (events, handler) = capture();

    let config = RlmConfig::new("m").with_max_depth(1);
    let mut rlm = Orchestrator::new(&client, config).with_event_handler(&handler);
    let result = rlm.run("root", Context::text("abcdef")).await.unwrap();

    assert_eq!(result.answer, "done");
    assert_eq!(script.calls_for("sub"), 0);
    assert_eq!(rlm.stats().llm_calls, 2);
    assert_eq!(rlm.stats().max_depth_reached, 0);

    let sent = script.sent.lock().unwrap();
    let feedback = &sent[1].last().unwrap().content;
    assert!(feedback.contains("[recursion depth limit reached: depth 1 of max 1"));

    let events = events.lock().unwrap();
    assert!(events.iter().all(|e| e.depth() == 0));
}

// ── Scenario C ─────────────────────────────────────────────────────

#[tokio::test]
async fn denylisted_snippet_is_rejected_and_run_continues() {
    let script = Scripted::new(vec![(
        "q",
        vec!["```js\nprint(process.env.HOME)\n```", "FINAL(\"fine\")"],
    )]);
    let client = script.client();
    let (events, handler) = capture();

    let mut rlm = Orchestrator::new(&client, RlmConfig::new("m")).with_event_handler(&handler);
    let result = rlm.run("q", Context::text("t")).await.unwrap();

    assert_eq!(result.answer, "fine");
    assert_eq!(rlm.stats().repl_errors, 1);

    let sent = script.sent.lock().unwrap();
    let feedback = &sent[1].last().unwrap().content;
    assert!(feedback.starts_with("Error:"));
    assert!(feedback.contains("process"));

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::RecoverableError { kind, .. } if kind == "SnippetRejected"
    )));
}

#[tokio::test]
async fn capability_hidden_in_template_is_rejected_before_running() {
    let script = Scripted::new(vec![(
        "q",
        vec!["```js\nprint(`home is ${process.env.HOME}`)\n```", "FINAL(\"fine\")"],
    )]);
    let client = script.client();
    let (events, handler) = capture();

    let mut rlm = Orchestrator::new(&client, RlmConfig::new("m")).with_event_handler(&handler);
    let result = rlm.run("q", Context::text("t")).await.unwrap();

    assert_eq!(result.answer, "fine");
    assert_eq!(rlm.stats().repl_errors, 1);
    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::RecoverableError { kind, message, .. }
            if kind == "SnippetRejected" && message.contains("process")
    )));
}

#[tokio::test]
async fn snippet_timeout_is_recoverable() {
    let script = Scripted::new(vec![(
        "q",
        vec!["```js\nprint(\"started\")\nwhile (true) {}\n```", "FINAL(\"recovered\")"],
    )]);
    let client = script.client();
    let (events, handler) = capture();

    let config = RlmConfig::new("m").with_snippet_timeout(std::time::Duration::from_millis(50));
    let mut rlm = Orchestrator::new(&client, config).with_event_handler(&handler);
    let result = rlm.run("q", Context::text("t")).await.unwrap();

    assert_eq!(result.answer, "recovered");
    assert_eq!(rlm.stats().iterations, 2);
    assert_eq!(rlm.stats().repl_errors, 1);

    let sent = script.sent.lock().unwrap();
    let feedback = &sent[1].last().unwrap().content;
    assert!(feedback.starts_with("Error: snippet timed out"), "{feedback}");
    assert!(feedback.ends_with("Output before the error:\nstarted"), "{feedback}");

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::SnippetOutputProduced { success: false, output, .. } if output == "started"
    )));
}

// ── Unquoted FINAL arguments ───────────────────────────────────────

#[tokio::test]
async fn final_with_an_expression_runs_the_snippet_instead() {
    let script = Scripted::new(vec![(
        "q",
        vec!["```js\nconst r = { a: 7 }\nprint(r.a)\nFINAL(r.a)\n```", "FINAL(\"7\")"],
    )]);
    let client = script.client();

    let mut rlm = Orchestrator::new(&client, RlmConfig::new("m"));
    let result = rlm.run("q", Context::text("t")).await.unwrap();

    assert_eq!(result.answer, "7");
    assert_eq!(rlm.stats().iterations, 2);
    let sent = script.sent.lock().unwrap();
    assert_eq!(sent[1].last().unwrap().content, "Output:\n7");
}

// ── Scenario D ─────────────────────────────────────────────────────

#[tokio::test]
async fn parallel_batch_children_fold_into_parent() {
    let script = Scripted::new(vec![(
        "root",
        vec![
            "```js\nconst parts = await Promise.all([\n  llm_query(\"left\", context.slice(0, 3)),\n  llm_query(\"right\", context.slice(3, 6)),\n])\nprint(parts.join(\" | \"))\n```",
            "FINAL(\"combined\")",
        ],
    )]);
    let client = script.client();
    let (events, handler) = capture();

    let mut rlm = Orchestrator::new(&client, RlmConfig::new("m")).with_event_handler(&handler);
    let result = rlm.run("root", Context::text("abcdef")).await.unwrap();
    assert_eq!(result.answer, "combined");

    let stats = rlm.stats();
    assert_eq!(script.calls_for("left"), 1);
    assert_eq!(script.calls_for("right"), 1);
    assert!(stats.llm_calls >= 1 + 2);
    assert_eq!(stats.llm_calls, 4);
    assert_eq!(stats.max_depth_reached, 1);
    assert!((stats.estimated_cost - 4.0 * call_cost()).abs() < 1e-12);
    assert!((rlm.budget().spent() - stats.estimated_cost).abs() < 1e-12);

    let sent = script.sent.lock().unwrap();
    let root_feedback = sent
        .iter()
        .filter(|m| question(m) == "root")
        .nth(1)
        .and_then(|m| m.last())
        .map(|m| m.content.clone())
        .unwrap();
    assert_eq!(root_feedback, "Output:\nleft done | right done");

    let events = events.lock().unwrap();
    let started: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::RecursiveCallStarted {
                depth,
                child_depth,
                context_chars,
                ..
            } => {
                assert_eq!(*child_depth, depth + 1);
                assert_eq!(*context_chars, 3);
                Some(*child_depth)
            }
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![1, 1]);
}

#[tokio::test]
async fn llm_batch_accepts_strings_and_objects() {
    let script = Scripted::new(vec![(
        "root",
        vec![
            "```js\nconst out = llm_batch([\"a\", { query: \"b\", context: context.slice(0, 2) }])\nprint(out)\n```",
        ],
    )]);
    let client = script.client();
    let mut rlm = Orchestrator::new(&client, RlmConfig::new("m"));
    let result = rlm.run("root", Context::text("xyz")).await.unwrap();
    assert_eq!(result.answer, "root done");
    assert_eq!(rlm.stats().llm_calls, 4);

    let sent = script.sent.lock().unwrap();
    let b_prompt = &sent.iter().find(|m| question(m) == "b").unwrap()[0].content;
    assert!(b_prompt.contains("Total size: 2 characters"));
}

// ── Testable properties ────────────────────────────────────────────

#[tokio::test]
async fn depth_grows_by_one_and_stops_at_max() {
    let delegate = "```js\nprint(llm_query(\"deeper\"))\n```";
    let script = Scripted::new(vec![("root", vec![delegate]), ("deeper", vec![delegate, delegate])]);
    let client = script.client();
    let (events, handler) = capture();

    let config = RlmConfig::new("m").with_max_depth(3);
    let mut rlm = Orchestrator::new(&client, config).with_event_handler(&handler);
    rlm.run("root", Context::text("text")).await.unwrap();

    let events = events.lock().unwrap();
    let max_iteration_depth = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::IterationStarted { depth, .. } => Some(*depth),
            _ => None,
        })
        .max();
    assert_eq!(max_iteration_depth, Some(2));
    assert_eq!(rlm.stats().max_depth_reached, 2);

    for event in events.iter() {
        if let RunEvent::RecursiveCallStarted {
            depth, child_depth, ..
        } = event
        {
            assert_eq!(*child_depth, depth + 1);
            assert!(*child_depth < 3);
        }
    }
}

#[tokio::test]
async fn llm_calls_are_own_calls_plus_children() {
    let script = Scripted::new(vec![
        (
            "root",
            vec!["```js\nprint(llm_query(\"one\"))\nprint(llm_query(\"two\"))\n```"],
        ),
        ("one", vec!["```js\nprint(1)\n```", "```js\nprint(2)\n```"]),
    ]);
    let client = script.client();
    let mut rlm = Orchestrator::new(&client, RlmConfig::new("m"));
    rlm.run("root", Context::text("t")).await.unwrap();

    let own = script.calls_for("root");
    let children = script.calls_for("one") + script.calls_for("two");
    assert_eq!(own, 2);
    assert_eq!(children, 3 + 1);
    assert_eq!(rlm.stats().llm_calls as usize, own + children);
    assert_eq!(rlm.stats().total_tokens, (own + children) as u64 * 1100);
}

#[tokio::test]
async fn budget_stops_second_call_when_first_costs_more_than_ceiling() {
    let script = Scripted::new(vec![("q", vec!["```js\nprint(1)\n```"])]);
    let client = script.client();
    let (events, handler) = capture();

    let config = RlmConfig::new("m")
        .with_cost_budget(0.5)
        .with_pricing(ModelPricing::new(1000.0, 1000.0));
    let mut rlm = Orchestrator::new(&client, config).with_event_handler(&handler);
    let err = rlm.run("q", Context::text("t")).await.unwrap_err();

    assert!(matches!(err, RunError::BudgetExceeded { ceiling, .. } if ceiling == 0.5));
    assert_eq!(script.calls_for("q"), 1);
    assert_eq!(rlm.stats().llm_calls, 1);

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(e, RunEvent::BudgetWarning { .. })));
}

#[tokio::test]
async fn estimated_cost_never_decreases() {
    let script = Scripted::new(vec![(
        "q",
        vec![
            "```js\nprint(llm_query(\"sub\"))\n```",
            "```js\nprint(2)\n```",
            "FINAL(\"end\")",
        ],
    )]);
    let client = script.client();
    let (events, handler) = capture();
    let mut rlm = Orchestrator::new(&client, RlmConfig::new("m")).with_event_handler(&handler);
    rlm.run("q", Context::text("t")).await.unwrap();

    let mut running = 0.0;
    for event in events.lock().unwrap().iter() {
        if let RunEvent::TokenUsage { cost, .. } = event {
            assert!(*cost >= 0.0);
            running += cost;
        }
    }
    assert!((running - rlm.stats().estimated_cost).abs() < 1e-12);
}

#[tokio::test]
async fn child_ceiling_is_what_the_parent_has_left() {
    // Root spends one call, then delegates; the child's first call pushes
    // the tree over the ceiling, so its second check fails.
    let script = Scripted::new(vec![
        ("root", vec!["```js\nprint(llm_query(\"sub\"))\n```"]),
        ("sub", vec!["```js\nprint(1)\n```"]),
    ]);
    let client = script.client();
    let (events, handler) = capture();
    let config = RlmConfig::new("m").with_cost_budget(call_cost() * 1.5);
    let mut rlm = Orchestrator::new(&client, config).with_event_handler(&handler);
    let err = rlm.run("root", Context::text("t")).await.unwrap_err();

    assert!(matches!(err, RunError::BudgetExceeded { .. }));
    assert_eq!(script.calls_for("root"), 1);
    assert_eq!(script.calls_for("sub"), 1);

    let events = events.lock().unwrap();
    let root_output = events
        .iter()
        .find_map(|e| match e {
            RunEvent::SnippetOutputProduced { depth: 0, output, .. } => Some(output.clone()),
            _ => None,
        })
        .unwrap();
    assert!(root_output.starts_with("[recursive call failed: cost budget exceeded"));
}

#[tokio::test]
async fn escaped_final_round_trips() {
    let original = "line one\nhe said \"hi\"\tand left \\ done";
    let script = Scripted::new(vec![(
        "q",
        vec![r#"FINAL("line one\nhe said \"hi\"\tand left \\ done")"#],
    )]);
    let client = script.client();
    let mut rlm = Orchestrator::new(&client, RlmConfig::new("m"));
    let result = rlm.run("q", Context::text("t")).await.unwrap();
    assert_eq!(result.answer, original);
}

#[tokio::test]
async fn child_transport_fault_fails_the_parent() {
    let client = FnModelClient::new(|messages: &[Message], _: &CompletionOptions| {
        if question(messages) == "root" {
            Ok(Completion::new("```js\nprint(llm_query(\"sub\"))\n```", 10, 10))
        } else {
            Err("OpenRouter API HTTP 401: unauthorized".to_string())
        }
    });
    let (events, handler) = capture();
    let mut rlm = Orchestrator::new(&client, RlmConfig::new("m")).with_event_handler(&handler);
    let err = rlm.run("root", Context::text("t")).await.unwrap_err();
    assert_eq!(err.kind(), "TransportFault");

    let events = events.lock().unwrap();
    let completed: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::RunCompleted { depth, error: Some(_), .. } => Some(*depth),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec![1, 0]);
}

#[tokio::test]
async fn channel_handler_streams_events_to_another_task() {
    let script = Scripted::new(vec![]);
    let client = script.client();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = ChannelHandler::new(tx);

    let mut rlm = Orchestrator::new(&client, RlmConfig::new("m")).with_event_handler(&handler);
    rlm.run("q", Context::text("t")).await.unwrap();
    drop(rlm);
    drop(handler);

    let mut kinds = Vec::new();
    while let Some(event) = rx.recv().await {
        kinds.push(serde_json::to_value(&event).unwrap()["event"].as_str().unwrap().to_string());
    }
    assert_eq!(kinds.first().map(String::as_str), Some("iteration_started"));
    assert_eq!(kinds.last().map(String::as_str), Some("run_completed"));
}
