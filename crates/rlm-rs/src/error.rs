//! Error taxonomy for runs and snippet executions.
//!
//! [`RunError`] ends a run. [`SnippetFault`] is absorbed into the
//! conversation as feedback and the run carries on, with one exception:
//! [`SnippetFault::Aborted`] wraps a fatal child failure that must bring the
//! parent down with it.

use std::time::Duration;
use thiserror::Error;

/// Fatal failure of a run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    #[error("recursion depth exceeded: depth {depth} is at or past max depth {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },

    #[error("no final answer after {iterations} iteration(s)")]
    IterationsExhausted {
        iterations: u32,
        /// Last model output, for diagnosis.
        last_message: Option<String>,
    },

    #[error("cost budget exceeded: spent ${spent:.6} of ${ceiling:.6}")]
    BudgetExceeded { spent: f64, ceiling: f64 },

    #[error("transport fault on model {model}: {message}")]
    TransportFault { model: String, message: String },
}

impl RunError {
    /// Short stable name, used in events and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::DepthExceeded { .. } => "DepthExceeded",
            RunError::IterationsExhausted { .. } => "IterationsExhausted",
            RunError::BudgetExceeded { .. } => "BudgetExceeded",
            RunError::TransportFault { .. } => "TransportFault",
        }
    }
}

/// Failure of a single snippet execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SnippetFault {
    /// The static denylist scan matched before anything ran.
    #[error("snippet rejected: use of `{token}` is not allowed")]
    Rejected { token: String },

    #[error("syntax error: {message}")]
    Parse { message: String },

    #[error("runtime error: {message}")]
    Execution {
        message: String,
        /// Output printed before the error.
        output: String,
    },

    #[error("snippet timed out after {after:?}")]
    Timeout { after: Duration, output: String },

    /// A fatal child failure surfaced through a recursive call.
    #[error("aborted: {0}")]
    Aborted(Box<RunError>),
}

impl SnippetFault {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SnippetFault::Aborted(_))
    }

    /// Output captured before the fault, if any.
    pub fn partial_output(&self) -> &str {
        match self {
            SnippetFault::Execution { output, .. } | SnippetFault::Timeout { output, .. } => {
                output
            }
            _ => "",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SnippetFault::Rejected { .. } => "SnippetRejected",
            SnippetFault::Parse { .. }
            | SnippetFault::Execution { .. }
            | SnippetFault::Timeout { .. } => "SnippetExecutionFault",
            SnippetFault::Aborted(_) => "Aborted",
        }
    }
}
