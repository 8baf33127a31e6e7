//! Resource consumption limits.
//!
//! Consumption is whatever unit the worker runtime reports (tokens, bytes,
//! seconds). A successful task whose cumulative consumption crosses the
//! per-task soft limit is split: it is marked `succeeded_partial` and a
//! continuation task picks up the remaining scope after a checkpoint.

use crate::core::{BudgetConfig, EngineError};

use super::task::Task;

/// Verdict on a successful task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetVerdict {
    /// Accept the task as done
    Within,
    /// Split the task into a partial success plus a continuation
    Split { consumed: u64, limit: u64 },
    /// Over the limit, but the lineage may not be split any further
    ExhaustedSplits { consumed: u64, limit: u64 },
}

/// Tracks consumption against soft limits.
#[derive(Debug, Clone, Default)]
pub struct BudgetMonitor {
    config: BudgetConfig,
    max_splits: u32,
}

impl BudgetMonitor {
    /// Create a monitor.
    pub fn new(config: BudgetConfig, max_splits: u32) -> Self {
        Self { config, max_splits }
    }

    /// Judge a task that just succeeded, after its consumption was recorded.
    pub fn check(&self, task: &Task) -> BudgetVerdict {
        let Some(limit) = self.config.task_soft_limit else {
            return BudgetVerdict::Within;
        };
        if task.consumption <= limit {
            return BudgetVerdict::Within;
        }

        let err = EngineError::ResourceBudgetExceeded {
            task: task.id.clone(),
            consumed: task.consumption,
            limit,
        };
        if task.split_count >= self.max_splits {
            tracing::warn!(error = %err, splits = task.split_count, "Split limit reached, accepting task");
            BudgetVerdict::ExhaustedSplits { consumed: task.consumption, limit }
        } else {
            tracing::info!(error = %err, "Splitting task");
            BudgetVerdict::Split { consumed: task.consumption, limit }
        }
    }

    /// Whether the workflow total has crossed its soft limit.
    pub fn workflow_exceeded(&self, total: u64) -> Option<u64> {
        self.config.workflow_soft_limit.filter(|limit| total > *limit)
    }

    /// Input for the continuation of a split task.
    pub fn continuation_input(task: &Task, output: &str) -> String {
        let mut input = task.input.clone();
        input.push_str("\n\nContinue from where the previous run stopped. Work completed so far:\n");
        input.push_str(output.trim());
        input
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with(consumption: u64, splits: u32) -> Task {
        let mut task = Task::new("TASK-001", "w", "REQ-001", "build it");
        task.consumption = consumption;
        task.split_count = splits;
        task
    }

    #[test]
    fn test_no_limit_is_always_within() {
        let monitor = BudgetMonitor::default();
        assert_eq!(monitor.check(&task_with(u64::MAX, 0)), BudgetVerdict::Within);
    }

    #[test]
    fn test_split_over_limit() {
        let monitor = BudgetMonitor::new(BudgetConfig { task_soft_limit: Some(100), ..Default::default() }, 2);

        assert_eq!(monitor.check(&task_with(100, 0)), BudgetVerdict::Within);
        assert_eq!(monitor.check(&task_with(150, 0)), BudgetVerdict::Split { consumed: 150, limit: 100 });
        assert_eq!(
            monitor.check(&task_with(150, 2)),
            BudgetVerdict::ExhaustedSplits { consumed: 150, limit: 100 }
        );
    }

    #[test]
    fn test_workflow_limit() {
        let monitor =
            BudgetMonitor::new(BudgetConfig { workflow_soft_limit: Some(10), ..Default::default() }, 1);
        assert_eq!(monitor.workflow_exceeded(5), None);
        assert_eq!(monitor.workflow_exceeded(11), Some(10));
    }

    #[test]
    fn test_continuation_input_carries_output() {
        let task = task_with(0, 0);
        let input = BudgetMonitor::continuation_input(&task, "  step one done \n");
        assert!(input.starts_with("build it"));
        assert!(input.ends_with("step one done"));
    }
}
