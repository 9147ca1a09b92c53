//! Step budget enforcement
//!
//! Every tool call consumes one step. The budget is clamped to
//! `[1, MAX_STEP_CEILING]` when a run starts and can never be exceeded.
//! A repetition guard counts identical (tool, arguments) pairs so a
//! collaborator stuck in a loop is stopped before the budget runs out.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::config::MAX_STEP_CEILING;

/// Result of a budget check before dispatching calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetCheckResult {
    Ok,
    /// A consumption threshold was crossed for the first time
    Warning { percent: u8 },
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BudgetWarning {
    Steps50,
    Steps80,
}

#[derive(Debug)]
pub struct StepBudget {
    limit: u32,
    consumed: u32,
    warnings_issued: HashSet<BudgetWarning>,
    max_identical_calls: u32,
    call_counts: HashMap<String, u32>,
}

impl StepBudget {
    pub fn new(requested: u32, max_identical_calls: u32) -> Self {
        Self {
            limit: clamp_steps(requested),
            consumed: 0,
            warnings_issued: HashSet::new(),
            max_identical_calls: max_identical_calls.max(1),
            call_counts: HashMap::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn consumed(&self) -> u32 {
        self.consumed
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.consumed)
    }

    pub fn is_exhausted(&self) -> bool {
        self.consumed >= self.limit
    }

    /// Check budget status; threshold warnings are reported once each.
    pub fn check(&mut self) -> BudgetCheckResult {
        if self.is_exhausted() {
            return BudgetCheckResult::Exhausted;
        }
        let percent = (self.consumed as u64 * 100 / self.limit as u64) as u8;
        if percent >= 80 && self.warnings_issued.insert(BudgetWarning::Steps80) {
            self.warnings_issued.insert(BudgetWarning::Steps50);
            return BudgetCheckResult::Warning { percent };
        }
        if percent >= 50 && self.warnings_issued.insert(BudgetWarning::Steps50) {
            return BudgetCheckResult::Warning { percent };
        }
        BudgetCheckResult::Ok
    }

    /// How many of `requested` calls fit in the remaining budget.
    pub fn admit(&self, requested: usize) -> usize {
        requested.min(self.remaining() as usize)
    }

    /// Record one dispatched tool call.
    pub fn record_call(&mut self, tool: &str, arguments: &Value) {
        self.consumed = (self.consumed + 1).min(self.limit);
        *self.call_counts.entry(call_key(tool, arguments)).or_insert(0) += 1;
    }

    /// Position of the first call in `batch` that would push its (tool,
    /// arguments) pair past the repetition limit. Earlier calls of the same
    /// batch count towards the limit.
    pub fn first_excess_repeat<'a, I>(&self, batch: I) -> Option<usize>
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        let mut in_batch: HashMap<String, u32> = HashMap::new();
        for (position, (tool, arguments)) in batch.into_iter().enumerate() {
            let key = call_key(tool, arguments);
            let seen = self.call_counts.get(&key).copied().unwrap_or(0);
            let pending = in_batch.entry(key).or_insert(0);
            if seen + *pending >= self.max_identical_calls {
                return Some(position);
            }
            *pending += 1;
        }
        None
    }
}

pub fn clamp_steps(requested: u32) -> u32 {
    requested.clamp(1, MAX_STEP_CEILING)
}

// serde_json maps are ordered, so equal arguments serialize identically
fn call_key(tool: &str, arguments: &Value) -> String {
    format!("{}\u{0}{}", tool, arguments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clamps_to_ceiling_and_floor() {
        assert_eq!(StepBudget::new(0, 3).limit(), 1);
        assert_eq!(StepBudget::new(500, 3).limit(), 100);
        assert_eq!(StepBudget::new(20, 3).limit(), 20);
    }

    #[test]
    fn admits_only_what_remains() {
        let mut budget = StepBudget::new(3, 3);
        assert_eq!(budget.admit(5), 3);
        budget.record_call("a", &json!({}));
        budget.record_call("b", &json!({}));
        assert_eq!(budget.admit(5), 1);
        budget.record_call("c", &json!({}));
        assert!(budget.is_exhausted());
        assert_eq!(budget.admit(1), 0);
        assert_eq!(budget.check(), BudgetCheckResult::Exhausted);
    }

    #[test]
    fn warnings_fire_once_per_threshold() {
        let mut budget = StepBudget::new(10, 10);
        for i in 0..5 {
            budget.record_call("t", &json!({ "i": i }));
        }
        assert_eq!(budget.check(), BudgetCheckResult::Warning { percent: 50 });
        assert_eq!(budget.check(), BudgetCheckResult::Ok);
        for i in 5..8 {
            budget.record_call("t", &json!({ "i": i }));
        }
        assert_eq!(budget.check(), BudgetCheckResult::Warning { percent: 80 });
        assert_eq!(budget.check(), BudgetCheckResult::Ok);
    }

    #[test]
    fn repetition_guard_counts_identical_arguments_only() {
        let mut budget = StepBudget::new(50, 2);
        let args = json!({ "namespace": "prod", "resource": "pods" });
        let other = json!({ "namespace": "dev", "resource": "pods" });
        budget.record_call("kubectl_get", &args);
        assert_eq!(budget.first_excess_repeat([("kubectl_get", &args)]), None);
        budget.record_call("kubectl_get", &args);
        assert_eq!(budget.first_excess_repeat([("kubectl_get", &args)]), Some(0));
        assert_eq!(
            budget.first_excess_repeat([("kubectl_get", &other), ("kubectl_describe", &args)]),
            None
        );
    }

    #[test]
    fn repetition_guard_counts_within_one_batch() {
        let budget = StepBudget::new(50, 3);
        let args = json!({ "n": 1 });
        let batch = vec![("probe", &args); 6];
        assert_eq!(budget.first_excess_repeat(batch), Some(3));

        let mut budget = StepBudget::new(50, 3);
        budget.record_call("probe", &args);
        let mixed = [("probe", &args), ("other", &args), ("probe", &args), ("probe", &args)];
        assert_eq!(budget.first_excess_repeat(mixed), Some(3));
    }
}
