//! Ask a recursive run to count error lines in a generated log.
//!
//! Builds a synthetic access log far larger than a prompt should hold, then
//! lets the model slice, search, and delegate over it. Prints the answer and
//! the run's stats.
//!
//! # Usage
//!
//! ```bash
//! OPENROUTER_KEY=sk-... cargo run --example count_errors
//! ```

use rlm_rs::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

fn synthetic_log(lines: usize) -> String {
    (0..lines)
        .map(|i| {
            let status = if i % 97 == 0 { 500 } else { 200 };
            format!("2026-01-01T00:00:{:02}Z GET /item/{i} {status}\n", i % 60)
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), String> {
    // 1. Create the OpenRouter client.
    let api_key = std::env::var("OPENROUTER_KEY")
        .map_err(|_| "Set OPENROUTER_KEY env var to your OpenRouter API key")?;
    let client = OpenRouterClient::new(api_key)?;

    // 2. Cheaper model below the root, and a spend cap for the whole tree.
    let config = RlmConfig::new("anthropic/claude-sonnet-4")
        .with_recursive_model("anthropic/claude-3.5-haiku")
        .with_max_depth(2)
        .with_cost_budget(0.25);

    // 3. Log lifecycle events and count delegations as they happen.
    let delegations = Arc::new(AtomicU32::new(0));
    let counter = delegations.clone();
    let handler = CompositeEventHandler::new()
        .with(LoggingHandler)
        .with(FnEventHandler::new(move |event: &RunEvent| {
            if matches!(event, RunEvent::RecursiveCallStarted { .. }) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }));

    // 4. Run.
    let context = Context::text(synthetic_log(20_000));
    let mut rlm = Orchestrator::new(&client, config).with_event_handler(&handler);
    let result = rlm
        .run("How many requests returned status 500?", context)
        .await
        .map_err(|e| e.to_string())?;

    // 5. Print results.
    println!("\n{}", result.answer);
    println!(
        "\n--- {} | {} delegation(s) ---",
        rlm.stats().summary(),
        delegations.load(Ordering::Relaxed)
    );

    Ok(())
}
