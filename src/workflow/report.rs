//! Final workflow report.
//!
//! Execution completion and validation completion are always reported
//! separately, next to the combined figure, so output that ran but failed
//! validation never reads as done.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::completion::CompletionTracker;
use super::escalation::ErrorRecord;
use super::requirement::{Priority, RequirementKind, RequirementStatus};
use super::state::{OverallStatus, WorkflowState};
use super::task::TaskStatus;
use crate::core::EngineResult;

/// File name of the JSON report in the output directory.
pub const REPORT_FILE: &str = "report.json";

/// Per-requirement line of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementSummary {
    pub id: String,
    pub kind: RequirementKind,
    pub description: String,
    pub priority: Priority,
    pub status: RequirementStatus,
    pub completion: f64,
    pub execution: f64,
    pub validation: f64,
    pub workers: Vec<String>,
}

/// Per-task line of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub worker_id: String,
    pub requirement_id: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub consumption: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Outcome of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowReport {
    /// Workflow instance id
    pub workflow_id: String,

    /// Project name
    pub project: Option<String>,

    /// Terminal status
    pub overall_status: OverallStatus,

    /// Priority-weighted combined completion, 0-100
    pub completion: f64,

    /// Priority-weighted execution completion, 0-100
    pub execution_completion: f64,

    /// Priority-weighted validation completion, 0-100
    pub validation_completion: f64,

    /// Requirements in document order
    pub requirements: Vec<RequirementSummary>,

    /// Tasks in creation order
    pub tasks: Vec<TaskSummary>,

    /// Escalation ledger at the end of the run
    pub error_records: Vec<ErrorRecord>,

    /// Total consumption over all tasks
    pub total_consumption: u64,

    /// Wall-clock duration of this run
    pub duration_ms: u64,

    /// Last checkpoint written, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<PathBuf>,

    /// When the report was produced
    pub generated_at: DateTime<Utc>,
}

impl WorkflowReport {
    /// Build a report from a finished state.
    pub fn from_state(
        state: &WorkflowState,
        tracker: &CompletionTracker,
        duration: Duration,
        checkpoint: Option<PathBuf>,
    ) -> Self {
        let completion = tracker.workflow_completion(state);
        let requirements = state
            .requirements
            .iter()
            .map(|r| RequirementSummary {
                id: r.id.clone(),
                kind: r.kind,
                description: r.description.clone(),
                priority: r.priority,
                status: r.status,
                completion: r.completion_percentage,
                execution: r.execution_percentage,
                validation: r.validation_percentage,
                workers: r.assigned_worker_ids.clone(),
            })
            .collect();
        let tasks = state
            .tasks
            .iter()
            .map(|t| TaskSummary {
                id: t.id.clone(),
                worker_id: t.worker_id.clone(),
                requirement_id: t.requirement_id.clone(),
                status: t.status,
                attempts: t.attempt_count,
                consumption: t.consumption,
                validation_passed: t.validation_passed,
                blocked_reason: t.blocked_reason.as_ref().map(ToString::to_string),
                successor: t.successor.clone(),
                last_error: t.last_error.clone(),
            })
            .collect();

        Self {
            workflow_id: state.workflow_id.clone(),
            project: state.project.clone(),
            overall_status: state.overall_status,
            completion: completion.overall,
            execution_completion: completion.execution,
            validation_completion: completion.validation,
            requirements,
            tasks,
            error_records: state.error_records.records().to_vec(),
            total_consumption: state.total_consumption,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            checkpoint,
            generated_at: Utc::now(),
        }
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        self.overall_status.exit_code()
    }

    /// Human-readable summary.
    pub fn to_summary_string(&self) -> String {
        let mut out = String::new();
        let project = self.project.as_deref().map(|p| format!(" ({p})")).unwrap_or_default();
        let _ = writeln!(
            out,
            "Workflow {}{}: {}",
            self.workflow_id,
            project,
            self.overall_status.as_str().to_uppercase()
        );
        let _ = writeln!(
            out,
            "Completion: {:.2}% (execution {:.2}%, validation {:.2}%)",
            self.completion, self.execution_completion, self.validation_completion
        );

        out.push_str("Requirements:\n");
        for req in &self.requirements {
            let _ = writeln!(
                out,
                "  {:<9} {:<9} {:<11} {:>6.2}%  {}",
                req.id,
                req.priority.as_str(),
                req.status.as_str(),
                req.completion,
                req.description
            );
        }

        let mut counts: Vec<(TaskStatus, usize)> = Vec::new();
        for task in &self.tasks {
            match counts.iter_mut().find(|(s, _)| *s == task.status) {
                Some((_, n)) => *n += 1,
                None => counts.push((task.status, 1)),
            }
        }
        let counts: Vec<String> = counts.iter().map(|(s, n)| format!("{n} {s}")).collect();
        let _ = writeln!(out, "Tasks: {}", counts.join(", "));
        for task in self.tasks.iter().filter(|t| t.blocked_reason.is_some()) {
            let _ = writeln!(
                out,
                "  {} ({}) blocked: {}",
                task.id,
                task.worker_id,
                task.blocked_reason.as_deref().unwrap_or_default()
            );
        }

        if !self.error_records.is_empty() {
            out.push_str("Errors:\n");
            for record in &self.error_records {
                let strategy = record.last_strategy_applied.map_or("none", |s| s.as_str());
                let _ = writeln!(
                    out,
                    "  {} x{} [{}] {}",
                    record.worker_id, record.occurrence_count, strategy, record.signature
                );
            }
        }

        let _ = writeln!(out, "Consumption: {}", self.total_consumption);
        out
    }

    /// Write `report.json` into `dir`, creating it if needed.
    pub fn write_json(&self, dir: &Path) -> EngineResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(REPORT_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        tracing::info!(path = %path.display(), "Report written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{BlockReason, Requirement, Task};

    fn finished_state() -> WorkflowState {
        let reqs = vec![
            Requirement::new("REQ-001", RequirementKind::Feature, "Checkout API", Priority::Critical),
            Requirement::new("REQ-002", RequirementKind::Feature, "Dark mode", Priority::Optional),
        ];
        let mut state = WorkflowState::new(Some("shop".into()), Vec::new(), reqs);
        state.workflow_id = "wf-test".into();

        let mut done = Task::new("TASK-001", "backend", "REQ-001", "");
        done.attempt_count = 1;
        done.status = TaskStatus::Succeeded;
        done.validation_passed = Some(true);
        done.consumption = 30;
        let mut stuck = Task::new("TASK-002", "frontend", "REQ-002", "");
        stuck.attempt_count = 5;
        stuck.block(BlockReason::ManualIntervention { failures: 5 });
        state.tasks = vec![done, stuck];
        state.total_consumption = 30;

        state.error_records.record_failure("frontend", "css <n> not found", "css 12 not found").occurrence_count = 5;
        let tracker = CompletionTracker::default();
        tracker.recompute_all(&mut state);
        state.overall_status = tracker.classify(&state, false);
        state
    }

    #[test]
    fn test_report_separates_execution_and_validation() {
        let state = finished_state();
        let report = WorkflowReport::from_state(&state, &CompletionTracker::default(), Duration::ZERO, None);

        assert_eq!(report.overall_status, OverallStatus::Partial);
        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.requirements[0].status, RequirementStatus::Completed);
        assert_eq!(report.requirements[1].status, RequirementStatus::Failed);
        assert!((report.completion - 75.0).abs() < f64::EPSILON);
        assert!((report.execution_completion - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_summary_text() {
        let state = finished_state();
        let report = WorkflowReport::from_state(&state, &CompletionTracker::default(), Duration::ZERO, None);
        insta::assert_snapshot!(report.to_summary_string(), @r"
        Workflow wf-test (shop): PARTIAL
        Completion: 75.00% (execution 75.00%, validation 75.00%)
        Requirements:
          REQ-001   critical  completed   100.00%  Checkout API
          REQ-002   optional  failed        0.00%  Dark mode
        Tasks: 1 succeeded, 1 blocked
          TASK-002 (frontend) blocked: manual intervention required after 5 failures
        Errors:
          frontend x5 [none] css <n> not found
        Consumption: 30
        ");
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let report =
            WorkflowReport::from_state(&finished_state(), &CompletionTracker::default(), Duration::ZERO, None);
        let path = report.write_json(&dir.path().join("out")).unwrap();

        let loaded: WorkflowReport = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(loaded.workflow_id, "wf-test");
        assert_eq!(loaded.tasks.len(), 2);
    }
}
