//! Engine error types.
//!
//! Fatal conditions (malformed input, cyclic plans, corrupt checkpoints)
//! surface as [`EngineError`]. Expected task failures never do: workers
//! report them as [`crate::workflow::TaskOutcome`] values and the scheduler
//! routes them through the escalation ladder.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while planning, running or resuming a workflow.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The requirement document is malformed.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The task graph contains a cycle; nothing was executed.
    #[error("Cycle detected between tasks: {}", .tasks.join(" -> "))]
    CycleDetected { tasks: Vec<String> },

    /// A worker call exceeded its timeout.
    #[error("Task '{task}' timed out after {}s", .after.as_secs())]
    TaskTimeout { task: String, after: Duration },

    /// A worker reported a failure.
    #[error("Task '{task}' failed: {message}")]
    TaskExecution { task: String, message: String },

    /// A checkpoint could not be reconstructed.
    #[error("Checkpoint {} is corrupt: {}", .path.display(), .problems.join("; "))]
    CheckpointCorruption { path: PathBuf, problems: Vec<String> },

    /// A checkpoint was written by a newer major schema version.
    #[error("Checkpoint schema version {found} is not supported (supported: {supported})")]
    UnsupportedCheckpointVersion { found: String, supported: String },

    /// A task crossed its soft consumption limit.
    #[error("Task '{task}' consumed {consumed} units, over the soft limit of {limit}")]
    ResourceBudgetExceeded { task: String, consumed: u64, limit: u64 },

    /// The engine was asked to run without a plan.
    #[error("No workflow has been planned or resumed")]
    NotPlanned,

    /// `run` was called while the workflow was already running.
    #[error("Workflow is already running")]
    AlreadyRunning,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl EngineError {
    /// Whether this error stops the workflow before any task runs.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::TaskTimeout { .. } | Self::TaskExecution { .. } | Self::ResourceBudgetExceeded { .. }
        )
    }
}

/// A single problem found while validating a requirement document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Location of the offending field (e.g. `features[2].priority`)
    pub field: String,

    /// What is wrong with it
    pub message: String,
}

impl Violation {
    /// Create a new violation.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every violation found in a requirement document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
pub struct ValidationError {
    /// All violations, in document order
    pub violations: Vec<Violation>,
}

impl ValidationError {
    /// Create an empty error to collect violations into.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a violation.
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.violations.push(Violation::new(field, message));
    }

    /// Whether any violation was recorded.
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// Number of violations.
    pub fn len(&self) -> usize {
        self.violations.len()
    }

    /// Convert into a `Result`, failing if anything was recorded.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid requirement document ({} problem", self.violations.len())?;
        if self.violations.len() != 1 {
            write!(f, "s")?;
        }
        write!(f, ")")?;
        for violation in &self.violations {
            write!(f, "\n  - {violation}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_lists_every_violation() {
        let mut err = ValidationError::new();
        err.push("features", "at least one feature or requirement is required");
        err.push("technical[0].priority", "unknown priority 'urgent'");

        let text = err.to_string();
        assert!(text.starts_with("Invalid requirement document (2 problems)"));
        assert!(text.contains("features: at least one feature"));
        assert!(text.contains("technical[0].priority: unknown priority 'urgent'"));
    }

    #[test]
    fn test_validation_error_into_result() {
        assert!(ValidationError::new().into_result().is_ok());

        let mut err = ValidationError::new();
        err.push("x", "y");
        assert_eq!(err.clone().into_result().unwrap_err().len(), 1);
    }

    #[test]
    fn test_cycle_message_names_tasks() {
        let err = EngineError::CycleDetected {
            tasks: vec!["TASK-001".into(), "TASK-002".into(), "TASK-001".into()],
        };
        insta::assert_snapshot!(err.to_string(), @"Cycle detected between tasks: TASK-001 -> TASK-002 -> TASK-001");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::NotPlanned.is_fatal());
        assert!(EngineError::CycleDetected { tasks: vec![] }.is_fatal());
        assert!(!EngineError::TaskExecution { task: "t".into(), message: "boom".into() }.is_fatal());
        assert!(!EngineError::TaskTimeout { task: "t".into(), after: Duration::from_secs(1) }
            .is_fatal());
    }
}
