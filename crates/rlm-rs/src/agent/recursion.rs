//! The recursion gate: depth bookkeeping and delegation to child runs.
//!
//! A snippet's `llm_query` lands in [`Delegator::call`], which either refuses
//! (depth limit) or builds a fresh child [`Orchestrator`] one level deeper,
//! runs it to completion and hands its answer back. Children own their own
//! transcript, bindings and stats; only the budget meter links them to the
//! parent while they run. Each child's stats are collected here and folded
//! into the parent once the snippet finishes.

use crate::ModelClient;
use crate::agent::budget::BudgetTracker;
use crate::agent::config::RlmConfig;
use crate::agent::events::{EventHandler, RunEvent};
use crate::agent::orchestrator::Orchestrator;
use crate::agent::stats::ExecutionStats;
use crate::api::tracing::child_trace_id;
use crate::context::Context;
use crate::error::RunError;
use crate::sandbox::RecursiveCall;
use futures::future::BoxFuture;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Position of a run in the recursion tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecursionNode {
    /// Root = 0.
    pub depth: u32,
    pub max_depth: u32,
}

impl RecursionNode {
    pub fn root(max_depth: u32) -> Self {
        Self {
            depth: 0,
            max_depth,
        }
    }

    pub fn child(&self) -> Self {
        Self {
            depth: self.depth + 1,
            max_depth: self.max_depth,
        }
    }

    /// A run at or past `max_depth` must not start.
    pub fn check(&self) -> Result<(), RunError> {
        if self.depth >= self.max_depth {
            return Err(RunError::DepthExceeded {
                depth: self.depth,
                max_depth: self.max_depth,
            });
        }
        Ok(())
    }

    /// Whether a child one level deeper may dispatch model calls.
    pub fn can_delegate(&self) -> bool {
        self.depth + 1 < self.max_depth
    }

    /// Text returned to the snippet when delegation is refused.
    pub fn refusal(&self) -> String {
        format!(
            "[recursion depth limit reached: depth {} of max {}; answer this sub-question directly]",
            self.depth + 1,
            self.max_depth
        )
    }
}

/// [`RecursiveCall`] implementation handed to one snippet execution.
pub struct Delegator<'a> {
    client: &'a dyn ModelClient,
    config: &'a RlmConfig,
    events: &'a dyn EventHandler,
    node: RecursionNode,
    budget: &'a BudgetTracker,
    trace_id: &'a str,
    context: &'a Context,
    spawned: &'a AtomicU32,
    children: Mutex<ExecutionStats>,
}

impl<'a> Delegator<'a> {
    /// `spawned` numbers children across every snippet of the parent run so
    /// their trace ids stay unique.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: &'a dyn ModelClient,
        config: &'a RlmConfig,
        events: &'a dyn EventHandler,
        node: RecursionNode,
        budget: &'a BudgetTracker,
        trace_id: &'a str,
        context: &'a Context,
        spawned: &'a AtomicU32,
    ) -> Self {
        Self {
            client,
            config,
            events,
            node,
            budget,
            trace_id,
            context,
            spawned,
            children: Mutex::new(ExecutionStats::default()),
        }
    }

    /// Combined stats of every child this delegator ran, completed or failed.
    pub fn into_stats(self) -> ExecutionStats {
        self.children.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    async fn delegate(&self, query: String, context: Option<Context>) -> Result<String, RunError> {
        if !self.node.can_delegate() {
            debug!(
                "[depth {}] refusing delegation at max depth {}",
                self.node.depth, self.node.max_depth
            );
            return Ok(self.node.refusal());
        }

        let context = context.unwrap_or_else(|| self.context.clone());
        let index = self.spawned.fetch_add(1, Ordering::SeqCst);
        let child_node = self.node.child();
        self.events.on_event(&RunEvent::RecursiveCallStarted {
            depth: self.node.depth,
            child_depth: child_node.depth,
            query: query.clone(),
            context_chars: context.size(),
        });

        let mut child = Orchestrator::child(
            self.client,
            self.config.clone(),
            self.events,
            child_node,
            self.budget.child(),
            child_trace_id(self.trace_id, index),
        );
        let result = child.run(&query, context).await;
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .merge_child(child.stats());

        match result {
            Ok(terminal) => Ok(terminal.answer),
            Err(err @ RunError::TransportFault { .. }) => Err(err),
            Err(err) => Ok(format!("[recursive call failed: {err}]")),
        }
    }
}

impl RecursiveCall for Delegator<'_> {
    fn call<'b>(&'b self, query: String, context: Option<Context>) -> BoxFuture<'b, Result<String, RunError>> {
        Box::pin(self.delegate(query, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::NoopHandler;
    use crate::{Completion, FnModelClient};

    #[test]
    fn depth_checks() {
        let root = RecursionNode::root(2);
        assert!(root.check().is_ok());
        assert!(root.can_delegate());

        let child = root.child();
        assert_eq!(child.depth, 1);
        assert!(child.check().is_ok());
        assert!(!child.can_delegate());

        let too_deep = child.child();
        assert_eq!(
            too_deep.check(),
            Err(RunError::DepthExceeded {
                depth: 2,
                max_depth: 2
            })
        );
    }

    #[test]
    fn refusal_names_depth_and_max() {
        let text = RecursionNode::root(1).refusal();
        assert_eq!(
            text,
            "[recursion depth limit reached: depth 1 of max 1; answer this sub-question directly]"
        );
    }

    #[tokio::test]
    async fn refuses_without_calling_the_model() {
        let client = FnModelClient::new(|_, _| panic!("no model call expected"));
        let config = RlmConfig::new("m").with_max_depth(1);
        let budget = BudgetTracker::unlimited();
        let context = Context::text("abc");
        let spawned = AtomicU32::new(0);
        let delegator = Delegator::new(
            &client,
            &config,
            &NoopHandler,
            RecursionNode::root(1),
            &budget,
            "tr-test",
            &context,
            &spawned,
        );
        let answer = delegator.call("sub".into(), None).await.unwrap();
        assert!(answer.starts_with("[recursion depth limit reached"));
        assert_eq!(delegator.into_stats(), ExecutionStats::default());
    }

    #[tokio::test]
    async fn child_answer_and_stats_come_back() {
        let client = FnModelClient::new(|_, options| {
            assert_eq!(options.model, "small");
            Ok(Completion::new("FINAL(\"child says hi\")", 100, 10))
        });
        let config = RlmConfig::new("big").with_recursive_model("small");
        let budget = BudgetTracker::new(Some(1.0));
        let context = Context::text("abc");
        let spawned = AtomicU32::new(0);
        let delegator = Delegator::new(
            &client,
            &config,
            &NoopHandler,
            RecursionNode::root(5),
            &budget,
            "tr-test",
            &context,
            &spawned,
        );
        let answer = delegator.call("sub".into(), None).await.unwrap();
        assert_eq!(answer, "child says hi");
        assert!(budget.spent() > 0.0);

        let stats = delegator.into_stats();
        assert_eq!(stats.llm_calls, 1);
        assert_eq!(stats.max_depth_reached, 1);
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn child_failure_becomes_text_but_transport_fault_propagates() {
        let exhausting = FnModelClient::new(|_, _| Ok(Completion::new("thinking...", 1, 1)));
        let config = RlmConfig::new("m").with_max_iterations(1);
        let budget = BudgetTracker::unlimited();
        let context = Context::text("abc");
        let spawned = AtomicU32::new(0);
        let node = RecursionNode::root(3);
        let delegator = Delegator::new(
            &exhausting, &config, &NoopHandler, node, &budget, "tr", &context, &spawned,
        );
        let text = delegator.call("sub".into(), None).await.unwrap();
        assert!(text.starts_with("[recursive call failed:"));
        assert_eq!(delegator.into_stats().llm_calls, 1);

        let broken = FnModelClient::new(|_, _| Err("HTTP 401 unauthorized".to_string()));
        let delegator = Delegator::new(
            &broken, &config, &NoopHandler, node, &budget, "tr", &context, &spawned,
        );
        let err = delegator.call("sub".into(), None).await.unwrap_err();
        assert_eq!(err.kind(), "TransportFault");
    }
}
