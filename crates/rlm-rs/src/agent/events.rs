//! Lifecycle events for a run and the handlers that observe them.
//!
//! The orchestrator reports progress through [`RunEvent`] variants, from the
//! start of each iteration through snippet execution and delegation to
//! completion. Callers implement [`EventHandler`] to observe these events
//! for logging, progress display, metrics or test assertions. A handler is
//! passed into each run explicitly and shared by every child run; there is
//! no global registry.
//!
//! Handlers are passive: they cannot influence control flow, and they must
//! not block.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`ChannelHandler`] | Forward events to another task |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted during a run. Every variant carries the depth of the run
/// that emitted it (root = 0).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// A new iteration is about to dispatch a model call.
    IterationStarted {
        depth: u32,
        iteration: u32,
        max_iterations: u32,
    },
    /// A snippet was extracted from the model output.
    SnippetGenerated { depth: u32, snippet: String },
    /// A snippet finished executing, successfully or not.
    SnippetOutputProduced {
        depth: u32,
        output: String,
        success: bool,
    },
    /// A snippet delegated a sub-question to a child run.
    RecursiveCallStarted {
        depth: u32,
        child_depth: u32,
        query: String,
        context_chars: usize,
    },
    /// A fault was folded back into the conversation.
    RecoverableError {
        depth: u32,
        kind: String,
        message: String,
    },
    /// Spend crossed 80% of the ceiling.
    BudgetWarning { depth: u32, spent: f64, ceiling: f64 },
    /// The run ended. Exactly one of `answer` and `error` is set.
    RunCompleted {
        depth: u32,
        answer: Option<String>,
        error: Option<String>,
        iterations: u32,
    },
    /// Tokens and estimated cost of one model call.
    TokenUsage {
        depth: u32,
        model: String,
        input_tokens: u32,
        output_tokens: u32,
        cost: f64,
    },
    /// A model kept failing and the next model in the chain takes over.
    ModelFallback {
        depth: u32,
        from: String,
        to: String,
        error: String,
    },
}

impl RunEvent {
    /// Depth of the run that emitted this event.
    pub fn depth(&self) -> u32 {
        match self {
            RunEvent::IterationStarted { depth, .. }
            | RunEvent::SnippetGenerated { depth, .. }
            | RunEvent::SnippetOutputProduced { depth, .. }
            | RunEvent::RecursiveCallStarted { depth, .. }
            | RunEvent::RecoverableError { depth, .. }
            | RunEvent::BudgetWarning { depth, .. }
            | RunEvent::RunCompleted { depth, .. }
            | RunEvent::TokenUsage { depth, .. }
            | RunEvent::ModelFallback { depth, .. } => *depth,
        }
    }

    /// Total tokens of a `TokenUsage` event as `u64`, `None` for all others.
    pub fn total_tokens(&self) -> Option<u64> {
        if let RunEvent::TokenUsage {
            input_tokens,
            output_tokens,
            ..
        } = self
        {
            Some(*input_tokens as u64 + *output_tokens as u64)
        } else {
            None
        }
    }
}

// ── Handlers ───────────────────────────────────────────────────────

/// Observer of run events.
///
/// The default implementation ignores everything, so implementors only
/// match the variants they care about.
///
/// # Example
///
/// ```ignore
/// struct Progress;
///
/// impl EventHandler for Progress {
///     fn on_event(&self, event: &RunEvent) {
///         if let RunEvent::IterationStarted { depth, iteration, .. } = event {
///             eprintln!("{}iteration {iteration}", "  ".repeat(*depth as usize));
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &RunEvent) {
        let _ = event;
    }
}

/// A handler that ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = seen.clone();
/// let handler = FnEventHandler::new(move |event: &RunEvent| {
///     sink.lock().unwrap().push(event.clone());
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&RunEvent) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&RunEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&RunEvent) + Send + Sync,
{
    fn on_event(&self, event: &RunEvent) {
        (self.0)(event)
    }
}

/// Forwards a clone of every event into an unbounded channel.
///
/// Sending never blocks. Once the receiver is dropped, events are discarded.
pub struct ChannelHandler {
    tx: UnboundedSender<RunEvent>,
}

impl ChannelHandler {
    pub fn new(tx: UnboundedSender<RunEvent>) -> Self {
        Self { tx }
    }
}

impl EventHandler for ChannelHandler {
    fn on_event(&self, event: &RunEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// An event handler that fans every event out to multiple inner handlers,
/// in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with_opt(progress_tx.map(ChannelHandler::new));
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler to the chain.
    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler. When `condition` is `false`, this is a
    /// no-op, which keeps the builder chain intact.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    /// Add a handler from an `Option`. `None` is a no-op.
    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &RunEvent) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// An event handler that logs events via `tracing`.
pub struct LoggingHandler;

fn preview(text: &str) -> String {
    let head: String = text.chars().take(200).collect();
    if text.chars().count() > 200 {
        format!("{head}...")
    } else {
        head
    }
}

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &RunEvent) {
        match event {
            RunEvent::IterationStarted {
                depth,
                iteration,
                max_iterations,
            } => {
                info!("[depth {depth}] iteration {iteration}/{max_iterations}");
            }
            RunEvent::SnippetGenerated { depth, snippet } => {
                debug!("[depth {depth}] snippet:\n{}", preview(snippet));
            }
            RunEvent::SnippetOutputProduced {
                depth,
                output,
                success,
            } => {
                debug!(
                    "[depth {depth}] snippet {} ({} chars): {}",
                    if *success { "ok" } else { "failed" },
                    output.chars().count(),
                    preview(output)
                );
            }
            RunEvent::RecursiveCallStarted {
                child_depth,
                query,
                context_chars,
                ..
            } => {
                info!(
                    "[depth {child_depth}] delegated: {} ({context_chars} context chars)",
                    preview(query)
                );
            }
            RunEvent::RecoverableError {
                depth,
                kind,
                message,
            } => {
                warn!("[depth {depth}] {kind}: {message}");
            }
            RunEvent::BudgetWarning {
                depth,
                spent,
                ceiling,
            } => {
                warn!("[depth {depth}] budget at ${spent:.4} of ${ceiling:.4}");
            }
            RunEvent::RunCompleted {
                depth,
                answer,
                error,
                iterations,
            } => match (answer, error) {
                (Some(answer), _) => info!(
                    "[depth {depth}] finished after {iterations} iteration(s): {}",
                    preview(answer)
                ),
                (None, Some(error)) => {
                    warn!("[depth {depth}] failed after {iterations} iteration(s): {error}")
                }
                (None, None) => info!("[depth {depth}] finished after {iterations} iteration(s)"),
            },
            RunEvent::TokenUsage {
                depth,
                model,
                input_tokens,
                output_tokens,
                cost,
            } => {
                debug!(
                    "[depth {depth}] {model}: in={input_tokens}, out={output_tokens}, cost=${cost:.6}"
                );
            }
            RunEvent::ModelFallback {
                depth,
                from,
                to,
                error,
            } => {
                warn!("[depth {depth}] model {from} failed ({error}); falling back to {to}");
            }
        }
    }
}
