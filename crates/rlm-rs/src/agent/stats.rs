//! Counters for a run and everything it delegated to.

use serde::{Deserialize, Serialize};

/// Execution statistics of a run.
///
/// A child's stats are folded into its parent with [`merge_child`]:
/// calls, tokens, cost and errors add up, depth takes the maximum.
/// `iterations` and `wall_clock_ms` stay local to the run that owns them.
///
/// [`merge_child`]: ExecutionStats::merge_child
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub llm_calls: u32,
    pub iterations: u32,
    pub max_depth_reached: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
    pub repl_errors: u32,
    pub wall_clock_ms: u64,
}

impl ExecutionStats {
    /// Stats for a run starting at `depth`.
    pub fn at_depth(depth: u32) -> Self {
        Self {
            max_depth_reached: depth,
            ..Default::default()
        }
    }

    /// Record one dispatched model call.
    pub fn record_call(&mut self, input_tokens: u32, output_tokens: u32, cost: f64) {
        self.llm_calls += 1;
        self.input_tokens += input_tokens as u64;
        self.output_tokens += output_tokens as u64;
        self.total_tokens += input_tokens as u64 + output_tokens as u64;
        if cost.is_finite() && cost > 0.0 {
            self.estimated_cost += cost;
        }
    }

    /// Fold a completed or failed child run into this one.
    pub fn merge_child(&mut self, child: &ExecutionStats) {
        self.llm_calls += child.llm_calls;
        self.input_tokens += child.input_tokens;
        self.output_tokens += child.output_tokens;
        self.total_tokens += child.total_tokens;
        self.estimated_cost += child.estimated_cost;
        self.repl_errors += child.repl_errors;
        self.max_depth_reached = self.max_depth_reached.max(child.max_depth_reached);
    }

    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        format!(
            "{} iteration(s), {} llm call(s), max depth {}, tokens: {} in + {} out = {} total, \
             est. cost: ${:.4}, {} snippet error(s), {:.1}s",
            self.iterations,
            self.llm_calls,
            self.max_depth_reached,
            self.input_tokens,
            self.output_tokens,
            self.total_tokens,
            self.estimated_cost,
            self.repl_errors,
            self.wall_clock_ms as f64 / 1000.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_call_accumulates() {
        let mut stats = ExecutionStats::default();
        stats.record_call(1000, 500, 0.01);
        stats.record_call(2000, 1000, 0.02);
        assert_eq!(stats.llm_calls, 2);
        assert_eq!(stats.input_tokens, 3000);
        assert_eq!(stats.output_tokens, 1500);
        assert_eq!(stats.total_tokens, 4500);
        assert!((stats.estimated_cost - 0.03).abs() < 1e-12);
    }

    #[test]
    fn merge_adds_counters_and_maxes_depth() {
        let mut parent = ExecutionStats::at_depth(0);
        parent.record_call(10, 10, 0.5);
        parent.iterations = 2;

        let mut child = ExecutionStats::at_depth(1);
        child.record_call(5, 5, 0.25);
        child.record_call(5, 5, 0.25);
        child.repl_errors = 1;
        child.iterations = 2;
        child.max_depth_reached = 3;

        parent.merge_child(&child);
        assert_eq!(parent.llm_calls, 3);
        assert_eq!(parent.total_tokens, 40);
        assert_eq!(parent.estimated_cost, 1.0);
        assert_eq!(parent.repl_errors, 1);
        assert_eq!(parent.max_depth_reached, 3);
        assert_eq!(parent.iterations, 2);
    }

    #[test]
    fn summary_mentions_calls_and_cost() {
        let mut stats = ExecutionStats::default();
        stats.record_call(100, 50, 0.0012);
        let summary = stats.summary();
        assert!(summary.contains("1 llm call(s)"));
        assert!(summary.contains("$0.0012"));
    }

    #[test]
    fn serializes_field_names() {
        let json = serde_json::to_value(ExecutionStats::at_depth(2)).unwrap();
        assert_eq!(json["max_depth_reached"], 2);
        assert_eq!(json["llm_calls"], 0);
    }
}
