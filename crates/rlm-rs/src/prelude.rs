//! Convenience re-exports for common `rlm-rs` types.
//!
//! ```ignore
//! use rlm_rs::prelude::*;
//! ```
//!
//! Pulls in what most programs need: a model client, [`Context`], the
//! [`Orchestrator`] with its config, and the event handlers. Sandbox
//! internals and the marker grammar are left out; import those from their
//! modules when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    Completion, CompletionOptions, FnModelClient, Message, MessageRole, ModelClient,
    OpenRouterClient,
};

// ── Engine ──────────────────────────────────────────────────────────
pub use crate::agent::{
    BudgetTracker, ChannelHandler, CompositeEventHandler, EventHandler, ExecutionStats,
    FnEventHandler, LoggingHandler, NoopHandler, Orchestrator, RlmConfig, RunEvent,
    TerminalResult,
};

// ── Context and errors ──────────────────────────────────────────────
pub use crate::context::{Context, ContextProvider, SearchMatch};
pub use crate::error::{RunError, SnippetFault};
