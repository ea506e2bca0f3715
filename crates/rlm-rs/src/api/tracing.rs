//! Trace ids and per-model pricing.
//!
//! Every run gets a trace id; a delegated run's id extends its parent's, so
//! log lines from a whole recursion tree can be grouped and ordered.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Generate a unique trace ID for a root run.
pub fn generate_trace_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("tr-{ts:x}-{count:04x}")
}

/// Trace ID for the `index`-th child delegated by the run `parent`.
pub fn child_trace_id(parent: &str, index: u32) -> String {
    format!("{parent}.{index}")
}

/// Per-model pricing for cost estimation (USD per 1M tokens).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Estimated cost in USD for one call.
    pub fn estimate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (output_tokens as f64 / 1_000_000.0) * self.output_per_million
    }
}

impl Default for ModelPricing {
    /// Rate applied to unknown model identifiers: $3 in / $15 out per 1M.
    fn default() -> Self {
        Self::new(3.0, 15.0)
    }
}

/// Approximate pricing for a model by name.
///
/// Matches on the segment after the last `/` (`"claude-sonnet-4"` in
/// `"anthropic/claude-sonnet-4"`) so org prefixes don't cause false hits.
/// Unknown models get [`ModelPricing::default`].
pub fn pricing_for_model(model: &str) -> ModelPricing {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();

    if name.contains("opus") {
        ModelPricing::new(15.0, 75.0)
    } else if name.contains("sonnet") {
        ModelPricing::new(3.0, 15.0)
    } else if name.contains("haiku") {
        ModelPricing::new(0.25, 1.25)
    } else if name.contains("gpt-4o-mini") || name.contains("4o-mini") {
        ModelPricing::new(0.15, 0.60)
    } else if name.contains("gpt-4o") || name.contains("gpt-4") {
        ModelPricing::new(2.50, 10.0)
    } else if name.starts_with("o1") || name.starts_with("o3") {
        ModelPricing::new(15.0, 60.0)
    } else if name.contains("gemini") && name.contains("flash") {
        ModelPricing::new(0.075, 0.30)
    } else if name.contains("gemini") {
        ModelPricing::new(1.25, 5.0)
    } else if name.contains("deepseek") {
        ModelPricing::new(0.27, 1.10)
    } else {
        ModelPricing::default()
    }
}
