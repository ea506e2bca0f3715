//! The per-run control loop.
//!
//! Each iteration:
//!
//! 1. Pre-flight budget check. A ceiling already reached fails the run
//!    before anything is dispatched.
//! 2. Dispatch the transcript to the model for this depth (with timeout,
//!    retry and fallback).
//! 3. Record tokens and cost, warn once past 80% of the ceiling.
//! 4. Parse the reply. A resolvable termination marker ends the run.
//! 5. Otherwise execute the extracted snippet. Faults become feedback and
//!    bump `repl_errors`; a fatal child fault fails the run.
//! 6. Append the reply and the feedback to the transcript.
//!
//! The loop gives up with [`RunError::IterationsExhausted`] after
//! `max_iterations` model calls.

use crate::{Message, ModelClient};
use crate::agent::budget::BudgetTracker;
use crate::agent::config::RlmConfig;
use crate::agent::dispatch::dispatch;
use crate::agent::events::{EventHandler, NoopHandler, RunEvent};
use crate::agent::prompt;
use crate::agent::recursion::{Delegator, RecursionNode};
use crate::agent::stats::ExecutionStats;
use crate::api::tracing::generate_trace_id;
use crate::context::Context;
use crate::error::{RunError, SnippetFault};
use crate::markers::{Marker, parse_output, resolve_final_var};
use crate::sandbox::{Bindings, Sandbox, SnippetEnv, SnippetOutput};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicU32;
use std::time::Instant;
use tracing::{debug, info};

/// The answer a run terminated with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalResult {
    pub answer: String,
    /// In `[0, 1]`. Only set by `FINAL_WITH_CONFIDENCE`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl TerminalResult {
    pub fn answer(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            confidence: None,
            reasoning: None,
        }
    }

    /// The result a `FINAL` or `FINAL_WITH_CONFIDENCE` marker carries.
    /// `FINAL_VAR` needs bindings and yields `None` here.
    pub fn from_marker(marker: &Marker) -> Option<Self> {
        match marker {
            Marker::WithConfidence {
                answer,
                confidence,
                reasoning,
            } => Some(TerminalResult {
                answer: answer.clone(),
                confidence: Some(*confidence),
                reasoning: reasoning.clone(),
            }),
            Marker::Final(answer) => Some(TerminalResult::answer(answer.clone())),
            Marker::FinalVar(_) => None,
        }
    }
}

/// Runs the iterate/execute loop for one query at one depth.
///
/// ```ignore
/// let mut rlm = Orchestrator::new(&client, RlmConfig::new("anthropic/claude-sonnet-4"))
///     .with_event_handler(&LoggingHandler);
/// let result = rlm.run("Which user logged in first?", Context::text(log)).await?;
/// println!("{} ({})", result.answer, rlm.stats().summary());
/// ```
pub struct Orchestrator<'a> {
    client: &'a dyn ModelClient,
    config: RlmConfig,
    events: &'a dyn EventHandler,
    node: RecursionNode,
    budget: BudgetTracker,
    trace_id: String,
    stats: ExecutionStats,
    transcript: Vec<Message>,
    spawned: AtomicU32,
}

impl<'a> Orchestrator<'a> {
    /// A root run (depth 0) with the configured budget ceiling.
    pub fn new(client: &'a dyn ModelClient, config: RlmConfig) -> Self {
        let node = RecursionNode::root(config.max_depth);
        let budget = BudgetTracker::new(config.cost_budget);
        Self::child(client, config, &NoopHandler, node, budget, generate_trace_id())
    }

    /// A run at an arbitrary position in the tree. Used by the delegator.
    pub(crate) fn child(
        client: &'a dyn ModelClient,
        config: RlmConfig,
        events: &'a dyn EventHandler,
        node: RecursionNode,
        budget: BudgetTracker,
        trace_id: String,
    ) -> Self {
        Self {
            client,
            config,
            events,
            node,
            budget,
            trace_id,
            stats: ExecutionStats::at_depth(node.depth),
            transcript: Vec::new(),
            spawned: AtomicU32::new(0),
        }
    }

    /// Observe this run and every run it delegates to.
    pub fn with_event_handler(mut self, events: &'a dyn EventHandler) -> Self {
        self.events = events;
        self
    }

    /// Share an existing budget meter, e.g. to cap several root runs with
    /// one ceiling.
    pub fn with_budget(mut self, budget: BudgetTracker) -> Self {
        self.budget = budget;
        self
    }

    /// Stats of the last run, including every child it spawned.
    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    /// Messages of the last run, in the order they were sent.
    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn depth(&self) -> u32 {
        self.node.depth
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }

    /// Answer `query` about `context`.
    ///
    /// Ends with the terminal answer, or with the fatal error that stopped
    /// the run. Either way a `RunCompleted` event is emitted and
    /// [`stats`](Self::stats) reflects the whole run.
    pub async fn run(&mut self, query: &str, context: Context) -> Result<TerminalResult, RunError> {
        let started = Instant::now();
        self.stats = ExecutionStats::at_depth(self.node.depth);
        self.transcript.clear();
        info!(
            "[{}] run at depth {} over {} chars",
            self.trace_id,
            self.node.depth,
            context.size()
        );

        let result = self.iterate(query, &context).await;

        self.stats.wall_clock_ms = started.elapsed().as_millis() as u64;
        let (answer, error) = match &result {
            Ok(terminal) => (Some(terminal.answer.clone()), None),
            Err(err) => (None, Some(err.to_string())),
        };
        self.events.on_event(&RunEvent::RunCompleted {
            depth: self.node.depth,
            answer,
            error,
            iterations: self.stats.iterations,
        });
        result
    }

    async fn iterate(&mut self, query: &str, context: &Context) -> Result<TerminalResult, RunError> {
        self.node.check()?;

        let depth = self.node.depth;
        let sandbox = self.config.sandbox();
        self.transcript = prompt::initial_messages(query, context, &self.config, &self.node);
        let mut bindings = Bindings::new();
        let mut last_message = None;

        for iteration in 1..=self.config.max_iterations {
            self.stats.iterations = iteration;
            self.events.on_event(&RunEvent::IterationStarted {
                depth,
                iteration,
                max_iterations: self.config.max_iterations,
            });

            self.budget.check()?;
            let dispatched = dispatch(
                self.client,
                &self.transcript,
                &self.config,
                depth,
                self.events,
            )
            .await?;

            let completion = dispatched.completion;
            let cost = self
                .config
                .pricing_for(&dispatched.model)
                .estimate_cost(completion.input_tokens, completion.output_tokens);
            self.stats
                .record_call(completion.input_tokens, completion.output_tokens, cost);
            self.budget.charge(cost);
            self.events.on_event(&RunEvent::TokenUsage {
                depth,
                model: dispatched.model,
                input_tokens: completion.input_tokens,
                output_tokens: completion.output_tokens,
                cost,
            });
            if let Some((spent, ceiling)) = self.budget.take_warning() {
                self.events.on_event(&RunEvent::BudgetWarning {
                    depth,
                    spent,
                    ceiling,
                });
            }

            let content = completion.content;
            let parsed = parse_output(&content);
            if let Some(result) = self.terminal(parsed.marker.as_ref(), &bindings) {
                return Ok(result);
            }

            let feedback = match parsed.snippet {
                Some(snippet) => {
                    self.events.on_event(&RunEvent::SnippetGenerated {
                        depth,
                        snippet: snippet.clone(),
                    });
                    if !self.config.persist_bindings {
                        bindings.clear();
                    }
                    match self
                        .execute(&sandbox, &snippet, query, context, &mut bindings)
                        .await
                    {
                        Ok(output) => {
                            self.events.on_event(&RunEvent::SnippetOutputProduced {
                                depth,
                                output: output.output.clone(),
                                success: true,
                            });
                            // A FINAL_VAR naming a variable this very snippet set.
                            if let Some(Marker::FinalVar(name)) = &parsed.marker
                                && let Some(answer) = resolve_final_var(name, &bindings)
                            {
                                return Ok(TerminalResult::answer(answer));
                            }
                            prompt::output_feedback(&output)
                        }
                        Err(SnippetFault::Aborted(err)) => return Err(*err),
                        Err(fault) => {
                            self.stats.repl_errors += 1;
                            self.events.on_event(&RunEvent::SnippetOutputProduced {
                                depth,
                                output: fault.partial_output().to_string(),
                                success: false,
                            });
                            self.events.on_event(&RunEvent::RecoverableError {
                                depth,
                                kind: fault.kind().to_string(),
                                message: fault.to_string(),
                            });
                            prompt::fault_feedback(&fault)
                        }
                    }
                }
                None => match &parsed.marker {
                    Some(Marker::FinalVar(name)) => prompt::unresolved_var_feedback(name),
                    _ => {
                        debug!("[depth {depth}] iteration {iteration} carried no snippet");
                        prompt::nudge()
                    }
                },
            };

            self.transcript.push(Message::assistant(content.clone()));
            self.transcript.push(Message::user(feedback));
            last_message = Some(content);
        }

        Err(RunError::IterationsExhausted {
            iterations: self.config.max_iterations,
            last_message,
        })
    }

    /// The terminal result `marker` resolves to against the current
    /// bindings, if any.
    fn terminal(&self, marker: Option<&Marker>, bindings: &Bindings) -> Option<TerminalResult> {
        match marker? {
            Marker::FinalVar(name) => resolve_final_var(name, bindings).map(TerminalResult::answer),
            other => TerminalResult::from_marker(other),
        }
    }

    /// Run one snippet with a fresh delegator and fold its children's stats
    /// in, whatever the outcome.
    async fn execute(
        &mut self,
        sandbox: &Sandbox,
        snippet: &str,
        query: &str,
        context: &Context,
        bindings: &mut Bindings,
    ) -> Result<SnippetOutput, SnippetFault> {
        let delegator = Delegator::new(
            self.client,
            &self.config,
            self.events,
            self.node,
            &self.budget,
            &self.trace_id,
            context,
            &self.spawned,
        );
        let env = SnippetEnv {
            context,
            query,
            recursive: &delegator,
        };
        let result = sandbox.execute(snippet, &env, bindings).await;
        let children = delegator.into_stats();
        self.stats.merge_child(&children);
        result
    }
}
