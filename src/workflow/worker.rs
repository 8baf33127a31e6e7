//! Worker descriptors and the collaborator interfaces the engine calls.
//!
//! The engine never talks to a worker directly. Every call goes through a
//! [`WorkerRuntime`], and the raw [`WorkerResponse`] is turned into an
//! explicit [`TaskOutcome`] before the scheduler looks at it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// A worker that can be bound to tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    /// Unique worker id
    pub id: String,

    /// Capability tags matched against requirement categories
    #[serde(default)]
    pub tags: Vec<String>,

    /// Program override for this worker in live mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl WorkerDescriptor {
    /// Create a descriptor with the given tags.
    pub fn new<I, S>(id: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { id: id.into(), tags: tags.into_iter().map(Into::into).collect(), command: None }
    }

    /// Set a per-worker program.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Check whether the worker carries a tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// The roster used when the configuration declares no workers.
    pub fn builtin_roster() -> Vec<Self> {
        vec![
            Self::new("architect", ["architecture", "design", "planning"]),
            Self::new("backend", ["backend", "api", "general"]),
            Self::new("frontend", ["frontend", "ui"]),
            Self::new("database", ["database", "storage"]),
            Self::new("tester", ["testing", "quality"]),
            Self::new("devops", ["devops", "infrastructure", "deployment"]),
            Self::new("security", ["security", "auth"]),
            Self::new("docs", ["documentation"]),
        ]
    }
}

/// Cooperative stop signal handed to every worker call.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Wrap a watch receiver.
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        Self { rx }
    }

    /// Whether a stop was requested.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until a stop is requested. Pends forever if it never is.
    pub async fn stopped(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// One call to a worker.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    /// Task being executed
    pub task_id: String,

    /// Requirement the task belongs to
    pub requirement_id: String,

    /// Worker to invoke
    pub worker_id: String,

    /// Rendered task input, including any accumulated diagnostics
    pub input: String,

    /// Timeout the engine enforces around the call
    pub timeout: Duration,

    /// 1-based attempt number
    pub attempt: u32,

    /// Fires when the workflow is aborting
    pub stop: StopSignal,
}

/// What a worker reported back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResponse {
    /// Whether the worker considers the task done
    pub success: bool,

    /// Produced output
    pub output: String,

    /// Error text or other diagnostics
    pub diagnostics: String,

    /// Resource units consumed by this call
    pub consumption: u64,

    /// Set when retrying is pointless (missing program, bad input)
    pub fatal: bool,
}

impl WorkerResponse {
    /// A successful response.
    pub fn success(output: impl Into<String>) -> Self {
        Self { success: true, output: output.into(), ..Default::default() }
    }

    /// A retryable failure.
    pub fn failure(diagnostics: impl Into<String>) -> Self {
        Self { success: false, diagnostics: diagnostics.into(), ..Default::default() }
    }

    /// A failure that should not be retried.
    pub fn fatal(diagnostics: impl Into<String>) -> Self {
        Self { fatal: true, ..Self::failure(diagnostics) }
    }

    /// Attach a consumption figure.
    #[must_use]
    pub fn with_consumption(mut self, units: u64) -> Self {
        self.consumption = units;
        self
    }

    /// Turn the raw response into the value the scheduler acts on.
    pub fn into_outcome(self) -> TaskOutcome {
        if self.success {
            TaskOutcome::Success {
                output: self.output,
                diagnostics: self.diagnostics,
                consumption: self.consumption,
            }
        } else {
            let message = if self.diagnostics.trim().is_empty() {
                "worker reported failure without diagnostics".to_string()
            } else {
                self.diagnostics
            };
            if self.fatal {
                TaskOutcome::FatalError { message, consumption: self.consumption }
            } else {
                TaskOutcome::RetryableError { message, consumption: self.consumption }
            }
        }
    }
}

/// Result of a single task attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The worker finished the task.
    Success { output: String, diagnostics: String, consumption: u64 },
    /// The attempt failed and goes through the escalation ladder.
    RetryableError { message: String, consumption: u64 },
    /// The attempt failed in a way retries cannot fix.
    FatalError { message: String, consumption: u64 },
}

impl TaskOutcome {
    /// Check if the attempt succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Units consumed by the attempt.
    pub fn consumption(&self) -> u64 {
        match self {
            Self::Success { consumption, .. }
            | Self::RetryableError { consumption, .. }
            | Self::FatalError { consumption, .. } => *consumption,
        }
    }
}

/// Verdict of an output validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    /// Whether the output is acceptable
    pub passed: bool,

    /// Validator notes
    pub notes: String,
}

impl ValidationVerdict {
    /// A passing verdict.
    pub fn pass() -> Self {
        Self { passed: true, notes: String::new() }
    }

    /// A failing verdict.
    pub fn fail(notes: impl Into<String>) -> Self {
        Self { passed: false, notes: notes.into() }
    }
}

/// Executes a task on a worker.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Run one attempt. Failures are reported in the response, never panicked.
    async fn execute(&self, request: WorkerRequest) -> WorkerResponse;

    /// Get the runtime name.
    fn name(&self) -> &str;
}

/// Produces diagnostic context before a retry.
#[async_trait]
pub trait RemediationRuntime: Send + Sync {
    /// Analyse the failing task and describe a fix.
    async fn remediate(&self, request: WorkerRequest) -> WorkerResponse;
}

/// Checks a successful task's output.
#[async_trait]
pub trait OutputValidator: Send + Sync {
    /// Judge the output of a finished task.
    async fn validate(&self, request: &WorkerRequest, output: &str) -> ValidationVerdict;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_roster_ids_unique() {
        let roster = WorkerDescriptor::builtin_roster();
        let mut ids: Vec<_> = roster.iter().map(|w| w.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), roster.len());
    }

    #[test]
    fn test_has_tag_ignores_case() {
        let worker = WorkerDescriptor::new("w", ["Backend"]);
        assert!(worker.has_tag("backend"));
        assert!(!worker.has_tag("frontend"));
    }

    #[test]
    fn test_response_into_outcome() {
        let ok = WorkerResponse::success("done").with_consumption(12).into_outcome();
        assert!(ok.is_success());
        assert_eq!(ok.consumption(), 12);

        let retry = WorkerResponse::failure("boom").into_outcome();
        assert!(matches!(retry, TaskOutcome::RetryableError { ref message, .. } if message == "boom"));

        let fatal = WorkerResponse::fatal("no such program").into_outcome();
        assert!(matches!(fatal, TaskOutcome::FatalError { .. }));
    }

    #[test]
    fn test_failure_without_diagnostics_gets_message() {
        let outcome = WorkerResponse::failure("  ").into_outcome();
        match outcome {
            TaskOutcome::RetryableError { message, .. } => assert!(message.contains("without")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_signal() {
        let (tx, rx) = watch::channel(false);
        let mut signal = StopSignal::new(rx);
        assert!(!signal.is_stopped());

        tx.send_replace(true);
        signal.stopped().await;
        assert!(signal.is_stopped());
        assert!(!StopSignal::never().is_stopped());
    }
}
