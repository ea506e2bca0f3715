//! Recursive language-model completion engine.
//!
//! `rlm-rs` lets a model answer a query about an arbitrarily large body of
//! text without inlining that text in the prompt. The text is held as an
//! addressable [`Context`](context::Context); the model writes short snippets
//! that slice, search, and print it inside an embedded
//! [`Sandbox`](sandbox::Sandbox), and may delegate sub-questions over
//! fragments of it to child runs one depth deeper. The loop ends when the
//! model emits a termination marker (`FINAL(...)`, `FINAL_VAR(...)`, or
//! `FINAL_WITH_CONFIDENCE({...})`).
//!
//! # Getting started
//!
//! ```ignore
//! use rlm_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let api_key = std::env::var("OPENROUTER_KEY")?;
//!     let client = OpenRouterClient::new(api_key)?;
//!
//!     let config = RlmConfig::new("anthropic/claude-sonnet-4")
//!         .with_recursive_model("anthropic/claude-3.5-haiku")
//!         .with_cost_budget(0.50);
//!
//!     let text = std::fs::read_to_string("big_log.txt")?;
//!     let mut rlm = Orchestrator::new(&client, config).with_event_handler(&LoggingHandler);
//!     let result = rlm.run("How many requests failed?", Context::text(text)).await?;
//!
//!     println!("{}", result.answer);
//!     println!("{}", rlm.stats().summary());
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Run the loop:** [`Orchestrator`](agent::orchestrator::Orchestrator) and
//!   [`RlmConfig`](agent::config::RlmConfig).
//! - **Plug in a model provider:** implement [`ModelClient`], or wrap a closure
//!   in [`FnModelClient`]. [`OpenRouterClient`] is the bundled HTTP adapter.
//! - **Observe a run:** implement [`EventHandler`](agent::events::EventHandler),
//!   or use [`LoggingHandler`](agent::events::LoggingHandler),
//!   [`FnEventHandler`](agent::events::FnEventHandler),
//!   [`ChannelHandler`](agent::events::ChannelHandler), and
//!   [`CompositeEventHandler`](agent::events::CompositeEventHandler).
//! - **Bound spend and nesting:** [`BudgetTracker`](agent::budget::BudgetTracker)
//!   and [`RecursionNode`](agent::recursion::RecursionNode). Pricing tables
//!   live in [`api::tracing`].
//! - **Understand what a snippet may do:** [`sandbox`] documents the language
//!   and the capability whitelist; [`sandbox::policy`] holds the denylist.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`agent`] | Orchestrator loop, config, events, budget, stats, recursion gate |
//! | [`sandbox`] | Denylist scan and the embedded snippet interpreter |
//! | [`markers`] | Termination-marker grammar and snippet extraction |
//! | [`context`] | Text and lazy-provider contexts |
//! | [`api`] | Retry with backoff, model routing, pricing and cost tracking |
//! | [`error`] | Fatal and recoverable error taxonomy |

pub mod agent;
pub mod api;
pub mod context;
pub mod error;
pub mod markers;
pub mod prelude;
pub mod sandbox;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// ── Constants ──────────────────────────────────────────────────────

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default primary model when none is configured.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

// ── Model client ───────────────────────────────────────────────────

/// Per-call parameters handed to a [`ModelClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub model: String,
    pub temperature: f32,
    /// Upper bound the adapter should respect. The dispatcher enforces it
    /// independently with `tokio::time::timeout`.
    pub timeout: Duration,
    pub max_tokens: u32,
}

/// Generated text plus the token counts reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Completion {
    pub fn new(content: impl Into<String>, input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            content: content.into(),
            input_tokens,
            output_tokens,
        }
    }
}

/// Boxed future returned by [`ModelClient::complete`]. The error string is a
/// transport fault description, classified by [`api::retry`].
pub type CompletionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Completion, String>> + Send + 'a>>;

/// A provider that turns an ordered message sequence into generated text.
///
/// The engine owns retries, fallbacks, and timeouts; an implementation makes
/// exactly one attempt per call.
pub trait ModelClient: Send + Sync {
    fn complete<'a>(
        &'a self,
        messages: &'a [Message],
        options: &'a CompletionOptions,
    ) -> CompletionFuture<'a>;
}

/// A [`ModelClient`] backed by a synchronous closure.
///
/// Useful for tests and for adapters that already have a blocking-free
/// answer at hand (scripted replies, caches).
///
/// ```
/// use rlm_rs::{Completion, FnModelClient};
///
/// let client = FnModelClient::new(|_messages, _options| {
///     Ok(Completion::new("FINAL(\"42\")", 10, 5))
/// });
/// # let _ = client;
/// ```
pub struct FnModelClient<F>(F)
where
    F: Fn(&[Message], &CompletionOptions) -> Result<Completion, String> + Send + Sync;

impl<F> FnModelClient<F>
where
    F: Fn(&[Message], &CompletionOptions) -> Result<Completion, String> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ModelClient for FnModelClient<F>
where
    F: Fn(&[Message], &CompletionOptions) -> Result<Completion, String> + Send + Sync,
{
    fn complete<'a>(
        &'a self,
        messages: &'a [Message],
        options: &'a CompletionOptions,
    ) -> CompletionFuture<'a> {
        let result = (self.0)(messages, options);
        Box::pin(async move { result })
    }
}

// ── Request types ──────────────────────────────────────────────────

/// Chat completion request body for the OpenRouter API. Unused optional
/// fields are omitted from serialization.
#[derive(Serialize, Debug, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

// ── Response types ─────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

/// Clean return type from `OpenRouterClient::chat()`.
#[derive(Debug)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
}

/// Token usage statistics.
#[derive(Deserialize, Debug, Clone)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for the OpenRouter chat completions API.
pub struct OpenRouterClient {
    pub(crate) client: reqwest::Client,
    pub(crate) api_key: String,
    pub(crate) referer: String,
    pub(crate) title: String,
}

impl OpenRouterClient {
    /// Create a new client with the given API key and default headers.
    pub fn new(api_key: impl Into<String>) -> Result<Self, String> {
        Self::with_headers(api_key, "https://github.com/rlm-rs", "rlm-rs")
    }

    /// Create a new client with custom Referer and X-Title headers.
    pub fn with_headers(
        api_key: impl Into<String>,
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent("rlm-rs/0.1")
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            referer: referer.into(),
            title: title.into(),
        })
    }

    /// Send a chat completion request.
    pub async fn chat(
        &self,
        body: &ChatRequest,
        timeout: Duration,
    ) -> Result<ChatCompletion, String> {
        debug!(
            "LLM request: model={}, messages={}, max_tokens={}, temp={}",
            body.model,
            body.messages.len(),
            body.max_tokens,
            body.temperature,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();

        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;

        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(format!("OpenRouter API HTTP {status}: {text}"));
        }

        let parsed: RawChatResponse =
            serde_json::from_str(&text).map_err(|e| format!("failed to parse response: {e}"))?;

        if let Some(err) = parsed.error {
            return Err(format!("OpenRouter API error: {}", err.message));
        }

        if let Some(ref usage) = parsed.usage {
            debug!(
                "Token usage: prompt={}, completion={}, total={}",
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
                usage.total_tokens.unwrap_or(0),
            );
        }

        let choice = parsed.choices.and_then(|c| c.into_iter().next());
        Ok(match choice {
            Some(c) => ChatCompletion {
                content: c.message.content,
                usage: parsed.usage,
                finish_reason: c.finish_reason,
            },
            None => ChatCompletion {
                content: None,
                usage: parsed.usage,
                finish_reason: None,
            },
        })
    }
}

impl ModelClient for OpenRouterClient {
    fn complete<'a>(
        &'a self,
        messages: &'a [Message],
        options: &'a CompletionOptions,
    ) -> CompletionFuture<'a> {
        Box::pin(async move {
            let body = ChatRequest {
                model: options.model.clone(),
                messages: messages.to_vec(),
                max_tokens: options.max_tokens,
                temperature: options.temperature,
                ..Default::default()
            };
            let completion = self.chat(&body, options.timeout).await?;
            let usage = completion.usage.unwrap_or(UsageInfo {
                prompt_tokens: None,
                completion_tokens: None,
                total_tokens: None,
            });
            Ok(Completion {
                content: completion.content.unwrap_or_default(),
                input_tokens: usage.prompt_tokens.unwrap_or(0),
                output_tokens: usage.completion_tokens.unwrap_or(0),
            })
        })
    }
}
