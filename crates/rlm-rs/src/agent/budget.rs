//! Spend ceilings for a run tree.
//!
//! Each run owns a meter. Charging a run charges every ancestor meter as
//! well, so a parent sees its children's spend live even while they run
//! concurrently. Meters hold `f64` dollars as raw bits in an `AtomicU64`
//! updated with a compare-and-swap loop; concurrent siblings never lose an
//! update.
//!
//! Enforcement is pre-flight only: [`BudgetTracker::check`] runs before a
//! model call is dispatched, and a call already in flight is charged in
//! full even when it pushes spend past the ceiling.

use crate::error::RunError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Fraction of the ceiling at which a budget warning fires.
pub const WARNING_FRACTION: f64 = 0.8;

struct Meter {
    spent_bits: AtomicU64,
    ceiling: Option<f64>,
    warned: AtomicBool,
    parent: Option<Arc<Meter>>,
}

impl Meter {
    fn spent(&self) -> f64 {
        f64::from_bits(self.spent_bits.load(Ordering::SeqCst))
    }

    fn add(&self, cost: f64) {
        loop {
            let current = self.spent_bits.load(Ordering::SeqCst);
            let next = (f64::from_bits(current) + cost).to_bits();
            if self
                .spent_bits
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    fn ancestors(self: &Arc<Self>) -> impl Iterator<Item = &Meter> {
        std::iter::successors(Some(self.as_ref()), |m| m.parent.as_deref())
    }
}

/// Per-run spend meter linked to the meters of every enclosing run.
///
/// Cloning shares the meter; [`child`](Self::child) creates a new one.
#[derive(Clone)]
pub struct BudgetTracker {
    meter: Arc<Meter>,
}

impl BudgetTracker {
    /// A root tracker. `None` means no ceiling.
    pub fn new(ceiling: Option<f64>) -> Self {
        Self {
            meter: Arc::new(Meter {
                spent_bits: AtomicU64::new(0f64.to_bits()),
                ceiling,
                warned: AtomicBool::new(false),
                parent: None,
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Tracker for a delegated run. Its ceiling is what this run has left
    /// right now, and `None` when this run has no ceiling.
    pub fn child(&self) -> Self {
        Self {
            meter: Arc::new(Meter {
                spent_bits: AtomicU64::new(0f64.to_bits()),
                ceiling: self.remaining(),
                warned: AtomicBool::new(false),
                parent: Some(Arc::clone(&self.meter)),
            }),
        }
    }

    /// Record `cost` against this run and all of its ancestors.
    pub fn charge(&self, cost: f64) {
        if cost <= 0.0 || !cost.is_finite() {
            return;
        }
        for meter in self.meter.ancestors() {
            meter.add(cost);
        }
    }

    /// Spend recorded against this run, including its descendants.
    pub fn spent(&self) -> f64 {
        self.meter.spent()
    }

    pub fn ceiling(&self) -> Option<f64> {
        self.meter.ceiling
    }

    /// Ceiling minus spend, floored at zero. `None` without a ceiling.
    pub fn remaining(&self) -> Option<f64> {
        self.meter
            .ceiling
            .map(|ceiling| (ceiling - self.meter.spent()).max(0.0))
    }

    /// Pre-flight check: fails when this run or any ancestor has reached its
    /// ceiling.
    pub fn check(&self) -> Result<(), RunError> {
        for meter in self.meter.ancestors() {
            if let Some(ceiling) = meter.ceiling {
                let spent = meter.spent();
                if spent >= ceiling {
                    return Err(RunError::BudgetExceeded { spent, ceiling });
                }
            }
        }
        Ok(())
    }

    /// `(spent, ceiling)` the first time spend reaches [`WARNING_FRACTION`]
    /// of this run's ceiling; `None` before that and on every later call.
    pub fn take_warning(&self) -> Option<(f64, f64)> {
        let ceiling = self.meter.ceiling?;
        let spent = self.meter.spent();
        if spent < ceiling * WARNING_FRACTION {
            return None;
        }
        if self.meter.warned.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some((spent, ceiling))
    }
}

impl std::fmt::Debug for BudgetTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetTracker")
            .field("spent", &self.spent())
            .field("ceiling", &self.ceiling())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_fails() {
        let budget = BudgetTracker::unlimited();
        budget.charge(1e9);
        assert!(budget.check().is_ok());
        assert_eq!(budget.remaining(), None);
        assert_eq!(budget.take_warning(), None);
    }

    #[test]
    fn check_fails_once_ceiling_reached() {
        let budget = BudgetTracker::new(Some(1.0));
        budget.charge(0.5);
        assert!(budget.check().is_ok());
        budget.charge(0.7);
        let err = budget.check().unwrap_err();
        assert!(matches!(err, RunError::BudgetExceeded { ceiling, .. } if ceiling == 1.0));
        assert_eq!(budget.remaining(), Some(0.0));
    }

    #[test]
    fn warning_fires_once_at_eighty_percent() {
        let budget = BudgetTracker::new(Some(1.0));
        budget.charge(0.5);
        assert_eq!(budget.take_warning(), None);
        budget.charge(0.3);
        let (spent, ceiling) = budget.take_warning().unwrap();
        assert!((spent - 0.8).abs() < 1e-9);
        assert_eq!(ceiling, 1.0);
        budget.charge(0.1);
        assert_eq!(budget.take_warning(), None);
    }

    #[test]
    fn child_ceiling_is_parent_remaining() {
        let parent = BudgetTracker::new(Some(1.0));
        parent.charge(0.25);
        let child = parent.child();
        assert_eq!(child.ceiling(), Some(0.75));
        assert_eq!(BudgetTracker::unlimited().child().ceiling(), None);
    }

    #[test]
    fn child_spend_propagates_to_ancestors() {
        let root = BudgetTracker::new(Some(10.0));
        let child = root.child();
        let grandchild = child.child();
        grandchild.charge(2.0);
        assert_eq!(grandchild.spent(), 2.0);
        assert_eq!(child.spent(), 2.0);
        assert_eq!(root.spent(), 2.0);
    }

    #[test]
    fn exhausted_ancestor_blocks_descendants() {
        let root = BudgetTracker::new(Some(1.0));
        let child = root.child();
        root.charge(1.0);
        assert!(child.check().is_err());
    }

    #[test]
    fn negative_and_nan_costs_are_ignored() {
        let budget = BudgetTracker::new(Some(1.0));
        budget.charge(0.5);
        budget.charge(-1.0);
        budget.charge(f64::NAN);
        assert_eq!(budget.spent(), 0.5);
    }

    #[tokio::test]
    async fn concurrent_siblings_do_not_lose_updates() {
        let root = BudgetTracker::new(None);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let child = root.child();
                tokio::spawn(async move {
                    for _ in 0..1000 {
                        child.charge(0.001);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert!((root.spent() - 8.0).abs() < 1e-6);
    }
}
