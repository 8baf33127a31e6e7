//! Requirement records tracked by the engine.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// How much a requirement matters to the overall outcome.
///
/// Ordered so that `Critical < Important < Optional`, which is also the
/// admission order of the scheduler.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    #[default]
    Important,
    Optional,
}

impl Priority {
    /// Parse a priority label, accepting common synonyms.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "critical" | "high" | "must" | "p0" => Some(Self::Critical),
            "important" | "medium" | "should" | "p1" => Some(Self::Important),
            "optional" | "low" | "could" | "nice-to-have" | "p2" => Some(Self::Optional),
            _ => None,
        }
    }

    /// Get the canonical label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Important => "important",
            Self::Optional => "optional",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a requirement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl RequirementStatus {
    /// Whether the requirement can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }

    /// Get the canonical label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for RequirementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which list of the input document a requirement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementKind {
    /// `REQ-NNN`
    Feature,
    /// `TECH-NNN`
    Technical,
}

impl RequirementKind {
    /// ID prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Feature => "REQ",
            Self::Technical => "TECH",
        }
    }

    /// Format the `n`th (1-based) ID of this kind.
    pub fn format_id(&self, n: usize) -> String {
        format!("{}-{:03}", self.prefix(), n)
    }
}

/// A discrete unit of desired outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    /// Stable ID (`REQ-001`, `TECH-002`)
    pub id: String,

    /// Source list
    pub kind: RequirementKind,

    /// What has to be achieved
    pub description: String,

    /// Priority
    pub priority: Priority,

    /// Current status
    pub status: RequirementStatus,

    /// Weighted completion, 0-100, never decreases except on reset
    pub completion_percentage: f64,

    /// Share of bound tasks that executed successfully, 0-100
    pub execution_percentage: f64,

    /// Share of bound tasks whose output passed validation, 0-100
    pub validation_percentage: f64,

    /// Requirements that must complete first
    #[serde(default)]
    pub dependency_ids: BTreeSet<String>,

    /// Workers bound to this requirement (including substitutes)
    #[serde(default)]
    pub assigned_worker_ids: Vec<String>,

    /// Ranked candidate workers, used for substitutions
    #[serde(default)]
    pub candidate_worker_ids: Vec<String>,

    /// Categories inferred by the selector
    #[serde(default)]
    pub categories: Vec<String>,

    /// Acceptance criteria passed along to workers
    #[serde(default)]
    pub acceptance: Vec<String>,
}

impl Requirement {
    /// Create a pending requirement.
    pub fn new(
        id: impl Into<String>,
        kind: RequirementKind,
        description: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            description: description.into(),
            priority,
            status: RequirementStatus::Pending,
            completion_percentage: 0.0,
            execution_percentage: 0.0,
            validation_percentage: 0.0,
            dependency_ids: BTreeSet::new(),
            assigned_worker_ids: Vec::new(),
            candidate_worker_ids: Vec::new(),
            categories: Vec::new(),
            acceptance: Vec::new(),
        }
    }

    /// Add dependencies on other requirements.
    pub fn with_dependencies<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Pin workers instead of letting the selector choose.
    pub fn with_workers<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assigned_worker_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Record progress. Values are clamped to 0-100 and never move backwards.
    pub fn record_progress(&mut self, percentage: f64, execution: f64, validation: f64) {
        self.completion_percentage = self.completion_percentage.max(round2(clamp_pct(percentage)));
        self.execution_percentage = round2(clamp_pct(execution));
        self.validation_percentage = round2(clamp_pct(validation));
    }

    /// Explicitly reset progress to zero.
    pub fn reset_progress(&mut self) {
        self.completion_percentage = 0.0;
        self.execution_percentage = 0.0;
        self.validation_percentage = 0.0;
    }

    /// Move to a new status. Terminal statuses are final.
    pub fn transition(&mut self, to: RequirementStatus) -> bool {
        if self.status.is_terminal() || self.status == to {
            return false;
        }
        tracing::debug!(requirement = %self.id, from = %self.status, to = %to, "Requirement status");
        self.status = to;
        true
    }

    /// Whether progress has reached 100%.
    pub fn is_fully_complete(&self) -> bool {
        self.completion_percentage >= 100.0
    }
}

fn clamp_pct(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_parse_synonyms() {
        assert_eq!(Priority::parse("Critical"), Some(Priority::Critical));
        assert_eq!(Priority::parse("high"), Some(Priority::Critical));
        assert_eq!(Priority::parse("should"), Some(Priority::Important));
        assert_eq!(Priority::parse("nice-to-have"), Some(Priority::Optional));
        assert_eq!(Priority::parse("urgent"), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::Important);
        assert!(Priority::Important < Priority::Optional);
    }

    #[test]
    fn test_kind_ids() {
        assert_eq!(RequirementKind::Feature.format_id(1), "REQ-001");
        assert_eq!(RequirementKind::Technical.format_id(12), "TECH-012");
    }

    #[test]
    fn test_progress_is_monotonic_and_clamped() {
        let mut req = Requirement::new("REQ-001", RequirementKind::Feature, "x", Priority::Critical);

        req.record_progress(70.0, 100.0, 0.0);
        assert!((req.completion_percentage - 70.0).abs() < f64::EPSILON);

        req.record_progress(35.0, 50.0, 0.0);
        assert!((req.completion_percentage - 70.0).abs() < f64::EPSILON);

        req.record_progress(140.0, 100.0, 100.0);
        assert!((req.completion_percentage - 100.0).abs() < f64::EPSILON);
        assert!(req.is_fully_complete());

        req.reset_progress();
        assert!(req.completion_percentage.abs() < f64::EPSILON);
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut req = Requirement::new("REQ-001", RequirementKind::Feature, "x", Priority::Optional);

        assert!(req.transition(RequirementStatus::InProgress));
        assert!(req.transition(RequirementStatus::Completed));
        assert!(!req.transition(RequirementStatus::Failed));
        assert_eq!(req.status, RequirementStatus::Completed);
    }

    #[test]
    fn test_status_serializes_as_string() {
        let json = serde_json::to_string(&RequirementStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
