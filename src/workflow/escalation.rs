//! Escalation ladder for repeated failures.
//!
//! Every failed attempt is keyed by `(worker, error signature)`. The number
//! of times that pair has failed picks the next strategy:
//!
//! | occurrence | strategy               |
//! |-----------:|------------------------|
//! | 1          | `retry_same`           |
//! | 2          | `retry_with_context`   |
//! | 3          | `trigger_remediation`  |
//! | 4          | `alternative_worker`   |
//! | 5+         | `manual_intervention`  |
//!
//! The count only goes back to zero when the same pair later succeeds.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::BackoffPolicy;

/// Maximum signature length, in characters.
pub const MAX_SIGNATURE_LEN: usize = 160;

/// Strategy chosen for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStrategy {
    RetrySame,
    RetryWithContext,
    TriggerRemediation,
    AlternativeWorker,
    ManualIntervention,
}

impl EscalationStrategy {
    /// Strategy for the `occurrence`th failure of a pair (1-based).
    pub fn for_occurrence(occurrence: u32) -> Self {
        match occurrence {
            0 | 1 => Self::RetrySame,
            2 => Self::RetryWithContext,
            3 => Self::TriggerRemediation,
            4 => Self::AlternativeWorker,
            _ => Self::ManualIntervention,
        }
    }

    /// Whether the task gets another attempt.
    pub fn retries(&self) -> bool {
        !matches!(self, Self::ManualIntervention)
    }

    /// Get the canonical label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetrySame => "retry_same",
            Self::RetryWithContext => "retry_with_context",
            Self::TriggerRemediation => "trigger_remediation",
            Self::AlternativeWorker => "alternative_worker",
            Self::ManualIntervention => "manual_intervention",
        }
    }
}

impl fmt::Display for EscalationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure history of one `(worker, signature)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Worker id
    pub worker_id: String,

    /// Normalized error signature
    pub signature: String,

    /// Failures since the last success of this pair
    pub occurrence_count: u32,

    /// Strategy applied on the latest failure
    pub last_strategy_applied: Option<EscalationStrategy>,

    /// Raw text of the latest failure
    pub last_message: String,

    /// When the pair last failed
    pub last_seen: DateTime<Utc>,
}

/// All error records of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorLedger {
    records: Vec<ErrorRecord>,
}

impl ErrorLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a pair.
    pub fn get(&self, worker_id: &str, signature: &str) -> Option<&ErrorRecord> {
        self.records.iter().find(|r| r.worker_id == worker_id && r.signature == signature)
    }

    /// Current count for a pair (zero when unknown).
    pub fn occurrences(&self, worker_id: &str, signature: &str) -> u32 {
        self.get(worker_id, signature).map_or(0, |r| r.occurrence_count)
    }

    /// Count one more failure and return the updated record.
    pub fn record_failure(&mut self, worker_id: &str, signature: &str, message: &str) -> &mut ErrorRecord {
        let now = Utc::now();
        let idx = match self
            .records
            .iter()
            .position(|r| r.worker_id == worker_id && r.signature == signature)
        {
            Some(idx) => idx,
            None => {
                self.records.push(ErrorRecord {
                    worker_id: worker_id.to_string(),
                    signature: signature.to_string(),
                    occurrence_count: 0,
                    last_strategy_applied: None,
                    last_message: String::new(),
                    last_seen: now,
                });
                self.records.len() - 1
            }
        };
        let record = &mut self.records[idx];
        record.occurrence_count += 1;
        record.last_message = message.to_string();
        record.last_seen = now;
        record
    }

    /// Reset the count of a pair. Returns whether anything changed.
    pub fn reset(&mut self, worker_id: &str, signature: &str) -> bool {
        match self.records.iter_mut().find(|r| r.worker_id == worker_id && r.signature == signature) {
            Some(record) if record.occurrence_count > 0 => {
                record.occurrence_count = 0;
                true
            }
            _ => false,
        }
    }

    /// All records in first-seen order.
    pub fn records(&self) -> &[ErrorRecord] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("static regex")
});
static HEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b0x[0-9a-f]+\b|\b[0-9a-f]{8,}\b").expect("static regex"));
static PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:[a-z]:)?(?:[\\/][\w.\-]+){2,}[\\/]?").expect("static regex"));
static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("static regex"));
static SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Reduce an error message to a signature that ignores volatile details.
///
/// Lowercases, replaces UUIDs, hex values, file paths and numbers with
/// placeholders, collapses whitespace and truncates.
pub fn normalize_signature(message: &str) -> String {
    let lower = message.to_lowercase();
    let text = UUID_RE.replace_all(&lower, "<uuid>");
    let text = HEX_RE.replace_all(&text, "<hex>");
    let text = PATH_RE.replace_all(&text, "<path>");
    let text = NUMBER_RE.replace_all(&text, "<n>");
    let text = SPACE_RE.replace_all(text.trim(), " ");
    let signature: String = text.chars().take(MAX_SIGNATURE_LEN).collect();
    if signature.is_empty() {
        "<empty>".to_string()
    } else {
        signature
    }
}

/// What to do about a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationDecision {
    /// Strategy to apply
    pub strategy: EscalationStrategy,

    /// Normalized signature of the failure
    pub signature: String,

    /// Failures of this pair so far, including this one
    pub occurrence: u32,

    /// Backoff before the next attempt
    pub delay: Duration,
}

/// Picks strategies and keeps the ledger current.
#[derive(Debug, Clone, Default)]
pub struct EscalationManager {
    backoff: BackoffPolicy,
}

impl EscalationManager {
    /// Create a manager with the given backoff schedule.
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self { backoff }
    }

    /// Record a failure and decide the next step.
    pub fn on_failure(&self, ledger: &mut ErrorLedger, worker_id: &str, message: &str) -> EscalationDecision {
        let signature = normalize_signature(message);
        let record = ledger.record_failure(worker_id, &signature, message);
        let occurrence = record.occurrence_count;
        let strategy = EscalationStrategy::for_occurrence(occurrence);
        record.last_strategy_applied = Some(strategy);

        let delay = if strategy.retries() {
            self.backoff.delay_for_attempt(occurrence)
        } else {
            Duration::ZERO
        };

        tracing::info!(
            worker = %worker_id,
            signature = %signature,
            occurrence,
            strategy = %strategy,
            "Escalation decided"
        );

        EscalationDecision { strategy, signature, occurrence, delay }
    }

    /// Record a success; clears the count of the pair that last failed.
    pub fn on_success(&self, ledger: &mut ErrorLedger, worker_id: &str, last_signature: Option<&str>) {
        if let Some(signature) = last_signature {
            if ledger.reset(worker_id, signature) {
                tracing::debug!(worker = %worker_id, signature = %signature, "Error count reset");
            }
        }
    }

    /// Start a substitute worker with a clean count for the signature.
    pub fn on_substitution(&self, ledger: &mut ErrorLedger, worker_id: &str, signature: &str) {
        ledger.reset(worker_id, signature);
    }
}

/// Share of tasks that are failed or blocked.
pub fn failure_fraction(failed_or_blocked: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        failed_or_blocked as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_order() {
        assert_eq!(EscalationStrategy::for_occurrence(1), EscalationStrategy::RetrySame);
        assert_eq!(EscalationStrategy::for_occurrence(2), EscalationStrategy::RetryWithContext);
        assert_eq!(EscalationStrategy::for_occurrence(3), EscalationStrategy::TriggerRemediation);
        assert_eq!(EscalationStrategy::for_occurrence(4), EscalationStrategy::AlternativeWorker);
        assert_eq!(EscalationStrategy::for_occurrence(5), EscalationStrategy::ManualIntervention);
        assert_eq!(EscalationStrategy::for_occurrence(9), EscalationStrategy::ManualIntervention);
    }

    #[test]
    fn test_ladder_is_monotonic() {
        let mut previous = EscalationStrategy::for_occurrence(1);
        for n in 2..10 {
            let next = EscalationStrategy::for_occurrence(n);
            assert!(next >= previous);
            previous = next;
        }
    }

    #[test]
    fn test_signature_ignores_volatile_details() {
        let a = normalize_signature("Timeout after 30s on /var/tmp/build-123/out.log (id 4f3a9b2c1d)");
        let b = normalize_signature("timeout after 45s on /home/ci/work/out.log (id 0a1b2c3d4e)");
        assert_eq!(a, b);
        assert!(a.starts_with("timeout after <n>s on <path>"));
    }

    #[test]
    fn test_signature_uuid_and_whitespace() {
        let sig = normalize_signature("  Lost   session 123e4567-e89b-12d3-a456-426614174000\n");
        assert_eq!(sig, "lost session <uuid>");
    }

    #[test]
    fn test_signature_truncated() {
        let long = "x".repeat(500);
        assert_eq!(normalize_signature(&long).chars().count(), MAX_SIGNATURE_LEN);
        assert_eq!(normalize_signature("   "), "<empty>");
    }

    #[test]
    fn test_manager_walks_ladder() {
        let manager = EscalationManager::new(BackoffPolicy::immediate());
        let mut ledger = ErrorLedger::new();

        let strategies: Vec<_> = (0..5)
            .map(|_| manager.on_failure(&mut ledger, "W1", "compile error").strategy)
            .collect();
        assert_eq!(
            strategies,
            vec![
                EscalationStrategy::RetrySame,
                EscalationStrategy::RetryWithContext,
                EscalationStrategy::TriggerRemediation,
                EscalationStrategy::AlternativeWorker,
                EscalationStrategy::ManualIntervention,
            ]
        );
        assert_eq!(ledger.occurrences("W1", "compile error"), 5);
    }

    #[test]
    fn test_success_resets_pair_only() {
        let manager = EscalationManager::default();
        let mut ledger = ErrorLedger::new();
        manager.on_failure(&mut ledger, "W1", "boom");
        manager.on_failure(&mut ledger, "W1", "boom");
        manager.on_failure(&mut ledger, "W2", "boom");

        manager.on_success(&mut ledger, "W1", Some("boom"));
        assert_eq!(ledger.occurrences("W1", "boom"), 0);
        assert_eq!(ledger.occurrences("W2", "boom"), 1);

        let decision = manager.on_failure(&mut ledger, "W1", "boom");
        assert_eq!(decision.strategy, EscalationStrategy::RetrySame);
    }

    #[test]
    fn test_different_signatures_count_separately() {
        let manager = EscalationManager::new(BackoffPolicy::immediate());
        let mut ledger = ErrorLedger::new();
        manager.on_failure(&mut ledger, "W1", "disk full");
        let decision = manager.on_failure(&mut ledger, "W1", "network unreachable");
        assert_eq!(decision.occurrence, 1);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_decision_delay_follows_backoff() {
        let manager = EscalationManager::default();
        let mut ledger = ErrorLedger::new();
        assert_eq!(manager.on_failure(&mut ledger, "W", "e").delay, Duration::from_secs(5));
        assert_eq!(manager.on_failure(&mut ledger, "W", "e").delay, Duration::from_secs(15));
    }

    #[test]
    fn test_failure_fraction() {
        assert!((failure_fraction(0, 0)).abs() < f64::EPSILON);
        assert!((failure_fraction(2, 4) - 0.5).abs() < f64::EPSILON);
    }
}
