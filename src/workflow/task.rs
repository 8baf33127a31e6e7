//! Tasks: one worker applied to one requirement.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for a slot
    Ready,
    /// Executing on its worker
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished part of its scope; a continuation task carries the rest
    SucceededPartial,
    /// Failed and was superseded by a task on another worker
    Failed,
    /// Waiting for its backoff delay before the next attempt
    RetryScheduled,
    /// Needs manual intervention, or an upstream task did not succeed
    Blocked,
    /// Stopped by a workflow abort
    Aborted,
    /// Dropped after a cascade decision
    Skipped,
}

impl TaskStatus {
    /// Whether the task will not change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded
                | Self::SucceededPartial
                | Self::Failed
                | Self::Blocked
                | Self::Aborted
                | Self::Skipped
        )
    }

    /// Whether the task has not started its current attempt.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Pending | Self::Ready | Self::RetryScheduled)
    }

    /// Get the canonical label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::SucceededPartial => "succeeded_partial",
            Self::Failed => "failed",
            Self::RetryScheduled => "retry_scheduled",
            Self::Blocked => "blocked",
            Self::Aborted => "aborted",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task ended up blocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    /// The escalation ladder ran out
    ManualIntervention { failures: u32 },
    /// The worker reported an unrecoverable error
    Fatal { message: String },
    /// A dependency did not succeed
    Upstream { task_id: String },
    /// A requirement this one depends on did not complete
    UpstreamRequirement { requirement_id: String },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ManualIntervention { failures } => {
                write!(f, "manual intervention required after {failures} failures")
            }
            Self::Fatal { message } => write!(f, "unrecoverable error: {message}"),
            Self::Upstream { task_id } => write!(f, "upstream task {task_id} did not succeed"),
            Self::UpstreamRequirement { requirement_id } => {
                write!(f, "upstream requirement {requirement_id} did not complete")
            }
        }
    }
}

impl BlockReason {
    /// Whether the block was inherited from upstream.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::UpstreamRequirement { .. })
    }
}

/// A unit of work bound to a single worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique id (`TASK-001`)
    pub id: String,

    /// Worker that executes the task
    pub worker_id: String,

    /// Requirement the task contributes to
    pub requirement_id: String,

    /// Id of the first task of this lineage (itself for original tasks)
    pub lineage: String,

    /// Current status
    pub status: TaskStatus,

    /// Attempts started so far
    pub attempt_count: u32,

    /// Base input handed to the worker
    pub input: String,

    /// Diagnostic context appended on retries
    #[serde(default)]
    pub context: Vec<String>,

    /// Tasks that must succeed first
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// Normalized signature of the most recent error
    #[serde(default)]
    pub last_error_signature: Option<String>,

    /// Raw text of the most recent error
    #[serde(default)]
    pub last_error: Option<String>,

    /// Run remediation before the next attempt
    #[serde(default)]
    pub remediation_pending: bool,

    /// Task that took over this task's work
    #[serde(default)]
    pub successor: Option<String>,

    /// Task this one took over from
    #[serde(default)]
    pub predecessor: Option<String>,

    /// Workers already tried in this lineage
    #[serde(default)]
    pub tried_workers: Vec<String>,

    /// Budget splits so far in this lineage
    #[serde(default)]
    pub split_count: u32,

    /// Earliest time of the next attempt
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,

    /// Output of the successful attempt
    #[serde(default)]
    pub output: Option<String>,

    /// Validation result of the successful attempt
    #[serde(default)]
    pub validation_passed: Option<bool>,

    /// Validator notes
    #[serde(default)]
    pub validation_notes: Option<String>,

    /// Cumulative resource consumption over all attempts
    #[serde(default)]
    pub consumption: u64,

    /// Why the task is blocked
    #[serde(default)]
    pub blocked_reason: Option<BlockReason>,

    /// When the task was created
    pub created_at: DateTime<Utc>,

    /// When the latest attempt started
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// When the latest attempt finished
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending original task.
    pub fn new(
        id: impl Into<String>,
        worker_id: impl Into<String>,
        requirement_id: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let worker_id = worker_id.into();
        Self {
            lineage: id.clone(),
            tried_workers: vec![worker_id.clone()],
            id,
            worker_id,
            requirement_id: requirement_id.into(),
            status: TaskStatus::Pending,
            attempt_count: 0,
            input: input.into(),
            context: Vec::new(),
            dependencies: BTreeSet::new(),
            last_error_signature: None,
            last_error: None,
            remediation_pending: false,
            successor: None,
            predecessor: None,
            split_count: 0,
            retry_at: None,
            output: None,
            validation_passed: None,
            validation_notes: None,
            consumption: 0,
            blocked_reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Create a task that takes over this one's lineage.
    ///
    /// The new task keeps the dependencies, accumulated context and tried
    /// workers, and starts with a fresh attempt count.
    pub fn successor_task(
        &self,
        id: impl Into<String>,
        worker_id: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        let worker_id = worker_id.into();
        let mut tried = self.tried_workers.clone();
        if !tried.contains(&worker_id) {
            tried.push(worker_id.clone());
        }
        let mut next = Self::new(id, worker_id, self.requirement_id.clone(), input);
        next.lineage = self.lineage.clone();
        next.dependencies = self.dependencies.clone();
        next.context = self.context.clone();
        next.tried_workers = tried;
        next.predecessor = Some(self.id.clone());
        next.split_count = self.split_count;
        next
    }

    /// Full input for the next attempt: base input, then context sections.
    pub fn render_input(&self) -> String {
        if self.context.is_empty() {
            return self.input.clone();
        }
        let mut rendered = self.input.clone();
        for section in &self.context {
            rendered.push_str("\n\n");
            rendered.push_str(section);
        }
        rendered
    }

    /// Whether another task took over this one.
    pub fn is_superseded(&self) -> bool {
        self.successor.is_some()
    }

    /// Move to a new status, logging the transition.
    pub fn set_status(&mut self, to: TaskStatus) {
        if self.status != to {
            tracing::debug!(task = %self.id, from = %self.status, to = %to, "Task status");
            self.status = to;
        }
    }

    /// Mark the task blocked.
    pub fn block(&mut self, reason: BlockReason) {
        self.set_status(TaskStatus::Blocked);
        self.retry_at = None;
        self.blocked_reason = Some(reason);
    }
}

/// Format the `n`th (1-based) task id.
pub fn task_id(n: usize) -> String {
    format!("TASK-{n:03}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::SucceededPartial.is_terminal());
        assert!(TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::RetryScheduled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::RetryScheduled.is_waiting());
    }

    #[test]
    fn test_new_task_is_own_lineage() {
        let task = Task::new("TASK-001", "backend", "REQ-001", "do it");
        assert_eq!(task.lineage, "TASK-001");
        assert_eq!(task.tried_workers, vec!["backend"]);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_successor_inherits_lineage() {
        let mut task = Task::new("TASK-001", "backend", "REQ-001", "do it");
        task.dependencies.insert("TASK-000".into());
        task.context.push("previous failure".into());
        task.attempt_count = 4;

        let next = task.successor_task("TASK-007", "frontend", "do it");
        assert_eq!(next.lineage, "TASK-001");
        assert_eq!(next.predecessor.as_deref(), Some("TASK-001"));
        assert_eq!(next.attempt_count, 0);
        assert_eq!(next.tried_workers, vec!["backend", "frontend"]);
        assert!(next.dependencies.contains("TASK-000"));
        assert_eq!(next.context.len(), 1);
    }

    #[test]
    fn test_render_input_appends_context() {
        let mut task = Task::new("TASK-001", "w", "REQ-001", "base");
        assert_eq!(task.render_input(), "base");

        task.context.push("ctx one".into());
        task.context.push("ctx two".into());
        assert_eq!(task.render_input(), "base\n\nctx one\n\nctx two");
    }

    #[test]
    fn test_block_reason_display() {
        let reason = BlockReason::ManualIntervention { failures: 5 };
        assert_eq!(reason.to_string(), "manual intervention required after 5 failures");
        assert!(BlockReason::Upstream { task_id: "TASK-001".into() }.is_upstream());
    }

    #[test]
    fn test_task_id_format() {
        assert_eq!(task_id(1), "TASK-001");
        assert_eq!(task_id(1234), "TASK-1234");
    }
}
