//! Completion scoring.
//!
//! Each task lineage of a requirement (the original task plus any
//! substitutes or continuations) is one slot. A slot earns the execution
//! weight when its final task succeeds, and the validation weight when that
//! output also passes validation. A requirement's percentage is the mean
//! over its slots; the workflow's percentage is the priority-weighted mean
//! over requirements.

use serde::{Deserialize, Serialize};

use super::requirement::{Priority, Requirement, RequirementStatus};
use super::state::{OverallStatus, WorkflowState};
use super::task::{BlockReason, Task, TaskStatus};

/// Weights used by the completion tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionPolicy {
    /// Share earned by successful execution
    pub execution_weight: f64,

    /// Share earned by passed validation
    pub validation_weight: f64,

    /// Fraction of the execution share credited to a split task
    pub partial_credit: f64,

    /// Workflow weight of critical requirements
    pub critical_weight: f64,

    /// Workflow weight of important requirements
    pub important_weight: f64,

    /// Workflow weight of optional requirements
    pub optional_weight: f64,
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        Self {
            execution_weight: 0.7,
            validation_weight: 0.3,
            partial_credit: 0.5,
            critical_weight: 3.0,
            important_weight: 2.0,
            optional_weight: 1.0,
        }
    }
}

impl CompletionPolicy {
    /// Check that the weights make sense.
    pub fn validate(&self) -> Result<(), String> {
        let weights = [
            ("completion.execution_weight", self.execution_weight),
            ("completion.validation_weight", self.validation_weight),
            ("completion.critical_weight", self.critical_weight),
            ("completion.important_weight", self.important_weight),
            ("completion.optional_weight", self.optional_weight),
        ];
        for (name, value) in weights {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("{name} must be a non-negative number, got {value}"));
            }
        }
        if self.execution_weight + self.validation_weight <= 0.0 {
            return Err("completion weights must not both be zero".to_string());
        }
        if !(0.0..=1.0).contains(&self.partial_credit) {
            return Err(format!("completion.partial_credit must be in [0, 1], got {}", self.partial_credit));
        }
        Ok(())
    }

    /// Weight of a requirement in the workflow average.
    pub fn priority_weight(&self, priority: Priority) -> f64 {
        match priority {
            Priority::Critical => self.critical_weight,
            Priority::Important => self.important_weight,
            Priority::Optional => self.optional_weight,
        }
    }

    fn normalized(&self) -> (f64, f64) {
        let total = self.execution_weight + self.validation_weight;
        if total <= 0.0 {
            (1.0, 0.0)
        } else {
            (self.execution_weight / total, self.validation_weight / total)
        }
    }
}

/// Where a slot stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Still has work to do
    Active,
    /// Final task succeeded
    Done { validated: bool },
    /// Ladder exhausted or fatal error
    Exhausted,
    /// Blocked by something upstream
    UpstreamBlocked,
    /// Skipped after a cascade decision
    Skipped,
    /// Interrupted by an abort
    Aborted,
}

#[derive(Debug, Clone, Copy)]
struct SlotScore {
    execution: f64,
    validation: f64,
    state: SlotState,
    started: bool,
}

/// Workflow-level completion figures, 0-100.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCompletion {
    /// Priority-weighted completion
    pub overall: f64,

    /// Priority-weighted execution completion
    pub execution: f64,

    /// Priority-weighted validation completion
    pub validation: f64,
}

/// Keeps requirement percentages and statuses current.
#[derive(Debug, Clone, Default)]
pub struct CompletionTracker {
    policy: CompletionPolicy,
}

impl CompletionTracker {
    /// Create a tracker with the given policy.
    pub fn new(policy: CompletionPolicy) -> Self {
        Self { policy }
    }

    /// The active policy.
    pub fn policy(&self) -> &CompletionPolicy {
        &self.policy
    }

    fn score_slot(&self, state: &WorkflowState, root: &Task) -> SlotScore {
        let mut current = root;
        let mut started = root.attempt_count > 0;
        let mut partial = root.status == TaskStatus::SucceededPartial;
        let mut steps = 0;
        while let Some(next) = current.successor.as_deref().and_then(|id| state.task(id)) {
            current = next;
            started |= current.attempt_count > 0;
            partial |= current.status == TaskStatus::SucceededPartial;
            steps += 1;
            if steps > state.tasks.len() {
                break;
            }
        }

        let state_of = match current.status {
            TaskStatus::Succeeded => SlotState::Done { validated: current.validation_passed == Some(true) },
            TaskStatus::Blocked => match &current.blocked_reason {
                Some(BlockReason::UpstreamRequirement { .. }) => SlotState::UpstreamBlocked,
                // A sibling slot of the same requirement failing is this requirement's own failure
                Some(BlockReason::Upstream { task_id }) => {
                    let external = state
                        .task(task_id)
                        .map_or(true, |upstream| upstream.requirement_id != current.requirement_id);
                    if external {
                        SlotState::UpstreamBlocked
                    } else {
                        SlotState::Exhausted
                    }
                }
                _ => SlotState::Exhausted,
            },
            TaskStatus::Failed | TaskStatus::SucceededPartial => SlotState::Exhausted,
            TaskStatus::Skipped => SlotState::Skipped,
            TaskStatus::Aborted => SlotState::Aborted,
            TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Running | TaskStatus::RetryScheduled => {
                SlotState::Active
            }
        };

        let (execution, validation) = match state_of {
            SlotState::Done { validated } => (1.0, if validated { 1.0 } else { 0.0 }),
            _ if partial => (self.policy.partial_credit, 0.0),
            _ => (0.0, 0.0),
        };

        SlotScore { execution, validation, state: state_of, started }
    }

    /// Recompute one requirement. Returns its new status if it changed.
    pub fn recompute(&self, state: &mut WorkflowState, requirement_id: &str) -> Option<RequirementStatus> {
        let slots: Vec<SlotScore> = state
            .tasks
            .iter()
            .filter(|t| t.requirement_id == requirement_id && t.lineage == t.id)
            .map(|root| self.score_slot(state, root))
            .collect();
        if slots.is_empty() {
            return None;
        }

        let (exec_w, val_w) = self.policy.normalized();
        let n = slots.len() as f64;
        let execution = slots.iter().map(|s| s.execution).sum::<f64>() / n;
        let validation = slots.iter().map(|s| s.validation).sum::<f64>() / n;
        let combined = slots.iter().map(|s| s.execution * exec_w + s.validation * val_w).sum::<f64>() / n;

        let requirement = state.requirement_mut(requirement_id)?;
        requirement.record_progress(combined * 100.0, execution * 100.0, validation * 100.0);

        if requirement.status.is_terminal() {
            return None;
        }

        let all_settled = slots.iter().all(|s| s.state != SlotState::Active);
        let next = if all_settled {
            if slots.iter().all(|s| s.state == SlotState::Done { validated: true })
                && requirement.is_fully_complete()
            {
                Some(RequirementStatus::Completed)
            } else if slots.iter().any(|s| s.state == SlotState::Aborted) {
                None
            } else if slots
                .iter()
                .any(|s| matches!(s.state, SlotState::UpstreamBlocked | SlotState::Skipped))
            {
                Some(RequirementStatus::Blocked)
            } else {
                Some(RequirementStatus::Failed)
            }
        } else if slots.iter().any(|s| s.started) {
            Some(RequirementStatus::InProgress)
        } else {
            None
        };

        match next {
            Some(status) if requirement.transition(status) => {
                if status.is_terminal() {
                    tracing::info!(
                        requirement = %requirement.id,
                        status = %status,
                        completion = requirement.completion_percentage,
                        "Requirement settled"
                    );
                }
                Some(status)
            }
            _ => None,
        }
    }

    /// Recompute every requirement.
    pub fn recompute_all(&self, state: &mut WorkflowState) {
        let ids: Vec<String> = state.requirements.iter().map(|r| r.id.clone()).collect();
        for id in ids {
            self.recompute(state, &id);
        }
    }

    /// Priority-weighted workflow completion.
    pub fn workflow_completion(&self, state: &WorkflowState) -> WorkflowCompletion {
        let total_weight: f64 =
            state.requirements.iter().map(|r| self.policy.priority_weight(r.priority)).sum();
        if total_weight <= 0.0 {
            return WorkflowCompletion::default();
        }
        let weighted = |f: fn(&Requirement) -> f64| -> f64 {
            let sum: f64 = state
                .requirements
                .iter()
                .map(|r| self.policy.priority_weight(r.priority) * f(r))
                .sum();
            ((sum / total_weight) * 100.0).round() / 100.0
        };
        WorkflowCompletion {
            overall: weighted(|r| r.completion_percentage),
            execution: weighted(|r| r.execution_percentage),
            validation: weighted(|r| r.validation_percentage),
        }
    }

    /// Classify a finished workflow.
    pub fn classify(&self, state: &WorkflowState, aborted: bool) -> OverallStatus {
        if aborted {
            return OverallStatus::Aborted;
        }
        let critical_unmet = state
            .requirements
            .iter()
            .any(|r| r.priority == Priority::Critical && r.status != RequirementStatus::Completed);
        if critical_unmet {
            return OverallStatus::Failed;
        }
        let all_completed = state.requirements.iter().all(|r| r.status == RequirementStatus::Completed);
        if all_completed && self.workflow_completion(state).overall >= 100.0 {
            OverallStatus::Succeeded
        } else {
            OverallStatus::Partial
        }
    }
}
