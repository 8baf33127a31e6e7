//! The workflow state owned by an engine instance.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::escalation::ErrorLedger;
use super::requirement::{Requirement, RequirementStatus};
use super::task::{task_id, BlockReason, Task, TaskStatus};

/// Status of the whole workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    #[default]
    Pending,
    Running,
    /// Admission paused after a failure cascade
    Paused,
    Succeeded,
    Partial,
    Failed,
    Aborted,
}

impl OverallStatus {
    /// Whether the workflow has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Partial | Self::Failed | Self::Aborted)
    }

    /// Process exit code for a finished workflow.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Partial => 2,
            Self::Failed => 3,
            Self::Aborted => 4,
            Self::Pending | Self::Running | Self::Paused => 1,
        }
    }

    /// Get the canonical label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a dependency lets its dependents run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyOutcome {
    /// Finished successfully
    Satisfied,
    /// Still in flight
    Waiting,
    /// Will never succeed
    Failed,
}

/// Everything the engine knows about a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Workflow instance id
    pub workflow_id: String,

    /// Project name from the requirement document
    #[serde(default)]
    pub project: Option<String>,

    /// Global constraints passed to every task
    #[serde(default)]
    pub constraints: Vec<String>,

    /// Requirements in document order
    pub requirements: Vec<Requirement>,

    /// Tasks in creation order
    pub tasks: Vec<Task>,

    /// Escalation ledger
    #[serde(default)]
    pub error_records: ErrorLedger,

    /// Sequence number of the latest progress event
    pub sequence_number: u64,

    /// Workflow status
    pub overall_status: OverallStatus,

    /// Tasks that reached a terminal status so far
    #[serde(default)]
    pub completed_task_count: u64,

    /// Total consumption over all tasks
    #[serde(default)]
    pub total_consumption: u64,

    /// Failed+blocked count at the last cascade decision
    #[serde(default)]
    pub cascade_acknowledged: usize,

    /// When the plan was built
    pub created_at: DateTime<Utc>,

    /// When the state last changed
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Create an empty plan for the given requirements.
    pub fn new(project: Option<String>, constraints: Vec<String>, requirements: Vec<Requirement>) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: uuid::Uuid::new_v4().to_string(),
            project,
            constraints,
            requirements,
            tasks: Vec::new(),
            error_records: ErrorLedger::new(),
            sequence_number: 0,
            overall_status: OverallStatus::Pending,
            completed_task_count: 0,
            total_consumption: 0,
            cascade_acknowledged: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Look up a requirement.
    pub fn requirement(&self, id: &str) -> Option<&Requirement> {
        self.requirements.iter().find(|r| r.id == id)
    }

    /// Look up a requirement mutably.
    pub fn requirement_mut(&mut self, id: &str) -> Option<&mut Requirement> {
        self.requirements.iter_mut().find(|r| r.id == id)
    }

    /// Look up a task.
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Look up a task mutably.
    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Id for the next task to be created.
    pub fn next_task_id(&self) -> String {
        task_id(self.tasks.len() + 1)
    }

    /// Mark the state as changed.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Follow successor links to the task currently carrying `id`'s work.
    pub fn chain_end(&self, id: &str) -> Option<&Task> {
        let mut current = self.task(id)?;
        for _ in 0..self.tasks.len() {
            match current.successor.as_deref().and_then(|s| self.task(s)) {
                Some(next) => current = next,
                None => break,
            }
        }
        Some(current)
    }

    /// Whether dependency `id` lets its dependents run.
    pub fn dependency_outcome(&self, id: &str) -> DependencyOutcome {
        let Some(end) = self.chain_end(id) else {
            return DependencyOutcome::Failed;
        };
        match end.status {
            TaskStatus::Succeeded => DependencyOutcome::Satisfied,
            TaskStatus::Failed
            | TaskStatus::Blocked
            | TaskStatus::Aborted
            | TaskStatus::Skipped
            | TaskStatus::SucceededPartial => DependencyOutcome::Failed,
            TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Running | TaskStatus::RetryScheduled => {
                DependencyOutcome::Waiting
            }
        }
    }

    /// Promote pending tasks to ready and block those whose upstream failed.
    ///
    /// Repeats until nothing changes, so blocks propagate down the graph.
    /// Returns the ids of newly blocked tasks.
    pub fn refresh_readiness(&mut self) -> Vec<String> {
        let mut newly_blocked = Vec::new();
        loop {
            let mut changes: Vec<(usize, Option<BlockReason>)> = Vec::new();
            for (idx, task) in self.tasks.iter().enumerate() {
                if task.status != TaskStatus::Pending {
                    continue;
                }
                if let Some(reason) = self.upstream_requirement_failure(task) {
                    changes.push((idx, Some(reason)));
                    continue;
                }
                let mut all_satisfied = true;
                let mut failed_dep = None;
                for dep in &task.dependencies {
                    match self.dependency_outcome(dep) {
                        DependencyOutcome::Satisfied => {}
                        DependencyOutcome::Waiting => all_satisfied = false,
                        DependencyOutcome::Failed => {
                            failed_dep = Some(dep.clone());
                            break;
                        }
                    }
                }
                if let Some(dep) = failed_dep {
                    changes.push((idx, Some(BlockReason::Upstream { task_id: dep })));
                } else if all_satisfied {
                    changes.push((idx, None));
                }
            }

            if changes.is_empty() {
                break;
            }
            let mut blocked_any = false;
            for (idx, reason) in changes {
                let task = &mut self.tasks[idx];
                match reason {
                    Some(reason) => {
                        tracing::info!(task = %task.id, reason = %reason, "Task blocked");
                        task.block(reason);
                        newly_blocked.push(task.id.clone());
                        blocked_any = true;
                    }
                    None => task.set_status(TaskStatus::Ready),
                }
            }
            if !blocked_any {
                break;
            }
        }
        newly_blocked
    }

    fn upstream_requirement_failure(&self, task: &Task) -> Option<BlockReason> {
        let requirement = self.requirement(&task.requirement_id)?;
        requirement
            .dependency_ids
            .iter()
            .find(|dep| {
                self.requirement(dep).is_some_and(|r| {
                    matches!(r.status, RequirementStatus::Failed | RequirementStatus::Blocked)
                })
            })
            .map(|dep| BlockReason::UpstreamRequirement { requirement_id: dep.clone() })
    }

    /// Number of running tasks.
    pub fn running_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Running).count()
    }

    /// Number of tasks currently failed or blocked. Superseded tasks do not count.
    pub fn failed_or_blocked_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| !t.is_superseded() && matches!(t.status, TaskStatus::Failed | TaskStatus::Blocked))
            .count()
    }

    /// Whether every task is terminal.
    pub fn all_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// Earliest pending retry time.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::RetryScheduled)
            .filter_map(|t| t.retry_at)
            .min()
    }

    /// Count tasks per status, in a fixed order.
    pub fn status_counts(&self) -> Vec<(TaskStatus, usize)> {
        const ORDER: [TaskStatus; 10] = [
            TaskStatus::Pending,
            TaskStatus::Ready,
            TaskStatus::Running,
            TaskStatus::RetryScheduled,
            TaskStatus::Succeeded,
            TaskStatus::SucceededPartial,
            TaskStatus::Failed,
            TaskStatus::Blocked,
            TaskStatus::Aborted,
            TaskStatus::Skipped,
        ];
        ORDER
            .iter()
            .map(|status| (*status, self.tasks.iter().filter(|t| t.status == *status).count()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    /// Problems that make the state unusable (dangling references, duplicates).
    pub fn integrity_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        let mut req_ids = std::collections::HashSet::new();
        for req in &self.requirements {
            if !req_ids.insert(req.id.as_str()) {
                problems.push(format!("duplicate requirement id {}", req.id));
            }
            if !(0.0..=100.0).contains(&req.completion_percentage) {
                problems.push(format!(
                    "requirement {} has completion {} outside 0-100",
                    req.id, req.completion_percentage
                ));
            }
        }
        for req in &self.requirements {
            for dep in &req.dependency_ids {
                if !req_ids.contains(dep.as_str()) {
                    problems.push(format!("requirement {} depends on unknown requirement {dep}", req.id));
                }
            }
        }

        let mut task_ids = std::collections::HashSet::new();
        for task in &self.tasks {
            if !task_ids.insert(task.id.as_str()) {
                problems.push(format!("duplicate task id {}", task.id));
            }
        }
        for task in &self.tasks {
            if !req_ids.contains(task.requirement_id.as_str()) {
                problems.push(format!(
                    "task {} references unknown requirement {}",
                    task.id, task.requirement_id
                ));
            }
            let links = task
                .dependencies
                .iter()
                .chain(task.successor.iter())
                .chain(task.predecessor.iter())
                .chain(std::iter::once(&task.lineage));
            for link in links {
                if !task_ids.contains(link.as_str()) {
                    problems.push(format!("task {} references unknown task {link}", task.id));
                }
            }
        }
        problems
    }

    /// Reset in-flight bookkeeping after loading a checkpoint.
    pub fn prepare_resume(&mut self) {
        for task in &mut self.tasks {
            if matches!(task.status, TaskStatus::Running | TaskStatus::Ready) {
                task.set_status(TaskStatus::Pending);
            }
        }
        self.overall_status = OverallStatus::Pending;
        self.touch();
    }
}
