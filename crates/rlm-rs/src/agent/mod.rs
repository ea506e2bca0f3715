//! The completion engine: the [`Orchestrator`] loop and its supporting
//! modules.
//!
//! - [`orchestrator::Orchestrator`]: the iterate/execute/parse loop. Start
//!   here.
//! - [`config::RlmConfig`]: models, ceilings, timeouts and retry settings.
//! - [`events`]: the [`EventHandler`] trait and [`RunEvent`] enum for
//!   observing a run tree.
//! - [`budget::BudgetTracker`]: spend meters linked across the run tree.
//! - [`stats::ExecutionStats`]: per-run counters, folded up from children.
//! - [`dispatch`]: timeout, retry and fallback around one model call.
//! - [`recursion`]: the depth gate and the [`Delegator`] that runs child
//!   orchestrators for `llm_query`.
//! - [`prompt`]: system prompt and feedback message builders.

pub mod budget;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod orchestrator;
pub mod prompt;
pub mod recursion;
pub mod stats;

pub use budget::BudgetTracker;
pub use config::RlmConfig;
pub use events::{
    ChannelHandler, CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler,
    NoopHandler, RunEvent,
};
pub use orchestrator::{Orchestrator, TerminalResult};
pub use recursion::{Delegator, RecursionNode};
pub use stats::ExecutionStats;
