//! Configuration for the [`Orchestrator`](super::orchestrator::Orchestrator).
//!
//! Every recognized option has a default, so the minimal configuration is
//! just a model name:
//!
//! ```ignore
//! let config = RlmConfig::new("anthropic/claude-sonnet-4");
//! ```
//!
//! Builder methods cover the rest:
//!
//! ```ignore
//! let config = RlmConfig::new("anthropic/claude-sonnet-4")
//!     .with_recursive_model("anthropic/claude-3.5-haiku")
//!     .with_max_depth(3)
//!     .with_max_iterations(20)
//!     .with_cost_budget(1.00)
//!     .with_fallback_models(vec!["openai/gpt-4o".into()])
//!     .with_retries(2);
//! ```
//!
//! Child runs inherit the parent's configuration unchanged; only their
//! model (the recursive model) and budget ceiling differ.

use crate::api::retry::RetryConfig;
use crate::api::router::ModelRoute;
use crate::api::tracing::{ModelPricing, pricing_for_model};
use crate::sandbox::Sandbox;
use std::time::Duration;

/// Configuration for a run and every run it delegates to.
#[derive(Debug, Clone)]
pub struct RlmConfig {
    /// Model for the root run.
    pub model: String,
    /// Model for child runs. `None` means the root model.
    pub recursive_model: Option<String>,
    /// Runs at or past this depth are refused. Default: 5.
    pub max_depth: u32,
    /// Model calls per run before giving up. Default: 30.
    pub max_iterations: u32,
    /// Ceiling on snippet output fed back to the model. Default: 2000 chars.
    pub max_output_chars: usize,
    /// Sampling temperature. Default: 0.
    pub temperature: f32,
    /// Spend ceiling in USD for the root run and everything it delegates to.
    pub cost_budget: Option<f64>,
    /// Per model-call timeout. Default: 60s.
    pub call_timeout: Duration,
    /// Models tried in order when the primary keeps failing.
    pub fallback_models: Vec<String>,
    /// Maximum tokens per model response. Default: 4096.
    pub max_tokens: u32,
    /// Snippet compute deadline, excluding time spent in recursive calls.
    /// Default: 30s.
    pub snippet_timeout: Duration,
    /// Wall-clock bound on a snippet including recursive calls. Default: 600s.
    pub snippet_wall_timeout: Duration,
    /// Retries on transient transport errors, per model.
    pub retry: RetryConfig,
    /// Overrides the per-model pricing table for every model.
    pub pricing: Option<ModelPricing>,
    /// Carry top-level snippet bindings over to the next snippet of the same
    /// run. Default: true.
    pub persist_bindings: bool,
}

impl RlmConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    // ── Builder methods ───────────────────────────────────────────

    /// Set the model used for child runs.
    pub fn with_recursive_model(mut self, model: impl Into<String>) -> Self {
        self.recursive_model = Some(model.into());
        self
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_output_chars(mut self, max_output_chars: usize) -> Self {
        self.max_output_chars = max_output_chars;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the spend ceiling in USD.
    pub fn with_cost_budget(mut self, budget: f64) -> Self {
        self.cost_budget = Some(budget);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_fallback_models(mut self, models: Vec<String>) -> Self {
        self.fallback_models = models;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_snippet_timeout(mut self, timeout: Duration) -> Self {
        self.snippet_timeout = timeout;
        self
    }

    pub fn with_snippet_wall_timeout(mut self, timeout: Duration) -> Self {
        self.snippet_wall_timeout = timeout;
        self
    }

    /// Enable automatic retries for transient transport failures (429, 5xx,
    /// network errors). Uses exponential backoff with jitter.
    ///
    /// Pass `0` to disable retries (the default).
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry = RetryConfig::with_retries(max_retries);
        self
    }

    /// Price every model at `pricing` instead of the built-in table.
    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn with_persist_bindings(mut self, persist: bool) -> Self {
        self.persist_bindings = persist;
        self
    }

    // ── Derived settings ──────────────────────────────────────────

    /// Model routing for primary, recursive and fallback models.
    pub fn route(&self) -> ModelRoute {
        ModelRoute {
            primary: self.model.clone(),
            recursive: self.recursive_model.clone(),
            fallbacks: self.fallback_models.clone(),
        }
    }

    /// Pricing applied to calls against `model`.
    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        self.pricing.unwrap_or_else(|| pricing_for_model(model))
    }

    /// Sandbox limits for snippet execution.
    pub fn sandbox(&self) -> Sandbox {
        Sandbox::new(self.max_output_chars, self.snippet_timeout, self.snippet_wall_timeout)
    }
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            model: crate::DEFAULT_MODEL.to_string(),
            recursive_model: None,
            max_depth: 5,
            max_iterations: 30,
            max_output_chars: 2000,
            temperature: 0.0,
            cost_budget: None,
            call_timeout: Duration::from_secs(60),
            fallback_models: Vec::new(),
            max_tokens: 4096,
            snippet_timeout: Duration::from_secs(30),
            snippet_wall_timeout: Duration::from_secs(600),
            retry: RetryConfig::default(),
            pricing: None,
            persist_bindings: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RlmConfig::default();
        assert_eq!(config.max_depth, 5);
        assert_eq!(config.max_iterations, 30);
        assert_eq!(config.max_output_chars, 2000);
        assert_eq!(config.temperature, 0.0);
        assert_eq!(config.cost_budget, None);
        assert_eq!(config.call_timeout, Duration::from_secs(60));
        assert!(config.fallback_models.is_empty());
        assert_eq!(config.retry.max_retries, 0);
        assert!(config.persist_bindings);
    }

    #[test]
    fn recursive_model_defaults_to_primary() {
        let config = RlmConfig::new("big");
        assert_eq!(config.route().model_for_depth(0), "big");
        assert_eq!(config.route().model_for_depth(2), "big");

        let config = config.with_recursive_model("small");
        assert_eq!(config.route().model_for_depth(0), "big");
        assert_eq!(config.route().model_for_depth(1), "small");
    }

    #[test]
    fn builders_set_fields() {
        let config = RlmConfig::new("m")
            .with_max_depth(2)
            .with_max_iterations(7)
            .with_cost_budget(0.25)
            .with_fallback_models(vec!["f".into()])
            .with_retries(3)
            .with_snippet_timeout(Duration::from_secs(5));
        assert_eq!(config.max_depth, 2);
        assert_eq!(config.max_iterations, 7);
        assert_eq!(config.cost_budget, Some(0.25));
        assert_eq!(config.route().chain_for_depth(0), vec!["m", "f"]);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.sandbox().timeout, Duration::from_secs(5));
    }

    #[test]
    fn pricing_override_applies_to_every_model() {
        let config = RlmConfig::new("m").with_pricing(ModelPricing::new(1.0, 2.0));
        assert_eq!(config.pricing_for("anything"), ModelPricing::new(1.0, 2.0));
        assert_eq!(RlmConfig::new("m").pricing_for("unknown/model"), ModelPricing::default());
    }
}
