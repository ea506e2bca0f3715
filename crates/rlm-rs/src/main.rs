//! Answer a question about a large text with a recursive model run.
//!
//! Reads the API key from the `OPENROUTER_KEY` environment variable. Logs go
//! to stderr; set `RUST_LOG` to change the level (default `rlm_rs=info`).
//!
//! # Examples
//!
//! ```sh
//! # Context from a file
//! rlm --query "How many requests returned 500?" --context-file access.log
//!
//! # Context from stdin, cheaper model for sub-questions, spend cap
//! cat book.txt | rlm --query "Who is the narrator?" \
//!   --recursive-model anthropic/claude-3.5-haiku --budget 0.50
//!
//! # Machine-readable result with stats
//! rlm --query "List the error codes" --context-file app.log --json
//! ```

use clap::Parser;
use rlm_rs::prelude::*;
use std::io::{self, IsTerminal, Read};
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Answer a question about a large text with a recursive model run.
///
/// Reads the API key from the OPENROUTER_KEY environment variable.
#[derive(Parser)]
#[command(name = "rlm")]
struct Cli {
    // ── Input ──────────────────────────────────────────────────
    /// The question to answer
    #[arg(long)]
    query: String,

    /// Read the context from a file
    #[arg(long, conflicts_with = "context")]
    context_file: Option<String>,

    /// Pass the context inline
    #[arg(long)]
    context: Option<String>,

    // ── Models ─────────────────────────────────────────────────
    /// Model for the root run
    #[arg(long, env = "RLM_MODEL", default_value = rlm_rs::DEFAULT_MODEL)]
    model: String,

    /// Model for delegated sub-questions (defaults to --model)
    #[arg(long)]
    recursive_model: Option<String>,

    /// Fallback models tried in order when a model keeps failing
    #[arg(long = "fallback")]
    fallback_models: Vec<String>,

    /// Sampling temperature
    #[arg(long, default_value_t = 0.0)]
    temperature: f32,

    // ── Ceilings ───────────────────────────────────────────────
    /// Maximum delegation depth
    #[arg(long, default_value_t = 5)]
    max_depth: u32,

    /// Maximum model calls per run
    #[arg(long, default_value_t = 30)]
    max_iterations: u32,

    /// Snippet output shown to the model, in characters
    #[arg(long, default_value_t = 2000)]
    max_output_chars: usize,

    /// Spend ceiling in USD for the whole run tree
    #[arg(long)]
    budget: Option<f64>,

    /// Per model-call timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Retries per model on transient errors (429, 5xx, network)
    #[arg(long, default_value_t = 0)]
    retries: u32,

    // ── Output ─────────────────────────────────────────────────
    /// Print the result and stats as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn config(&self) -> RlmConfig {
        let mut config = RlmConfig::new(&self.model)
            .with_max_depth(self.max_depth)
            .with_max_iterations(self.max_iterations)
            .with_max_output_chars(self.max_output_chars)
            .with_temperature(self.temperature)
            .with_call_timeout(Duration::from_secs(self.timeout_secs))
            .with_fallback_models(self.fallback_models.clone())
            .with_retries(self.retries);
        if let Some(model) = &self.recursive_model {
            config = config.with_recursive_model(model);
        }
        if let Some(budget) = self.budget {
            config = config.with_cost_budget(budget);
        }
        config
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn read_context(cli: &Cli) -> Result<String, String> {
    if let Some(path) = &cli.context_file {
        return std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read context file '{path}': {e}"));
    }
    if let Some(text) = &cli.context {
        return Ok(text.clone());
    }
    if io::stdin().is_terminal() {
        return Err("provide --context-file, --context, or pipe the context on stdin".into());
    }
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| format!("failed to read stdin: {e}"))?;
    Ok(buf)
}

async fn run(cli: &Cli) -> Result<String, String> {
    let api_key = std::env::var("OPENROUTER_KEY")
        .map_err(|_| "OPENROUTER_KEY environment variable is not set".to_string())?;
    let text = read_context(cli)?;
    let client = OpenRouterClient::new(api_key)?;

    let mut rlm = Orchestrator::new(&client, cli.config()).with_event_handler(&LoggingHandler);
    let result = rlm.run(&cli.query, Context::text(text)).await;
    eprintln!("  {}", rlm.stats().summary());
    let result = result.map_err(|e| e.to_string())?;

    if cli.json {
        let out = serde_json::json!({ "result": result, "stats": rlm.stats() });
        serde_json::to_string_pretty(&out).map_err(|e| format!("failed to serialize result: {e}"))
    } else {
        Ok(result.answer)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rlm_rs=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    match run(&cli).await {
        Ok(output) => println!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
