//! Per-worker success rates, by requirement category.
//!
//! The selector uses these to rank candidates once enough samples exist.
//! Stored as pretty JSON next to the checkpoints.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::state::WorkflowState;
use super::task::TaskStatus;

/// Samples needed before a success rate influences ranking.
pub const MIN_SAMPLES: u32 = 3;

/// Attempts of one worker on one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceEntry {
    /// Worker id
    pub worker_id: String,

    /// Requirement category
    pub category: String,

    /// Finished task count
    pub attempts: u32,

    /// Successful task count
    pub successes: u32,

    /// When this entry last changed
    pub updated_at: DateTime<Utc>,
}

impl PerformanceEntry {
    /// Success rate, once there is something to measure.
    pub fn success_rate(&self) -> Option<f64> {
        if self.attempts == 0 {
            None
        } else {
            Some(f64::from(self.successes) / f64::from(self.attempts))
        }
    }
}

/// Historical success table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceHistory {
    entries: Vec<PerformanceEntry>,
}

impl PerformanceHistory {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default location inside the data directory.
    pub fn default_path() -> Option<PathBuf> {
        crate::core::Config::data_dir().map(|d| d.join("performance.json"))
    }

    /// Load from disk. A missing file yields an empty table.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let history: Self = serde_json::from_str(&content)?;
        Ok(history)
    }

    /// Save to disk atomically.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_vec_pretty(self)?;
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&content)?;
        tmp.flush()?;
        tmp.persist(path)?;
        tracing::debug!(path = %path.display(), entries = self.entries.len(), "Saved performance history");
        Ok(())
    }

    /// Record one finished task.
    pub fn record(&mut self, worker_id: &str, category: &str, success: bool) {
        let now = Utc::now();
        let entry = match self
            .entries
            .iter_mut()
            .find(|e| e.worker_id == worker_id && e.category == category)
        {
            Some(entry) => entry,
            None => {
                self.entries.push(PerformanceEntry {
                    worker_id: worker_id.to_string(),
                    category: category.to_string(),
                    attempts: 0,
                    successes: 0,
                    updated_at: now,
                });
                let last = self.entries.len() - 1;
                &mut self.entries[last]
            }
        };
        entry.attempts += 1;
        if success {
            entry.successes += 1;
        }
        entry.updated_at = now;
    }

    /// Fold every finished task of a workflow into the table.
    pub fn record_workflow(&mut self, state: &WorkflowState) {
        for task in &state.tasks {
            if task.attempt_count == 0
                || !task.status.is_terminal()
                || matches!(task.status, TaskStatus::Skipped | TaskStatus::Aborted)
            {
                continue;
            }
            let success = matches!(task.status, TaskStatus::Succeeded | TaskStatus::SucceededPartial);
            if let Some(req) = state.requirement(&task.requirement_id) {
                for category in &req.categories {
                    self.record(&task.worker_id, category, success);
                }
            }
        }
    }

    /// Look up an entry.
    pub fn entry(&self, worker_id: &str, category: &str) -> Option<&PerformanceEntry> {
        self.entries.iter().find(|e| e.worker_id == worker_id && e.category == category)
    }

    /// Mean success rate of a worker over the given categories.
    ///
    /// Only entries with at least [`MIN_SAMPLES`] attempts count. Returns
    /// `None` when no category has enough data.
    pub fn success_rate(&self, worker_id: &str, categories: &[String]) -> Option<f64> {
        let rates: Vec<f64> = categories
            .iter()
            .filter_map(|c| self.entry(worker_id, c))
            .filter(|e| e.attempts >= MIN_SAMPLES)
            .filter_map(PerformanceEntry::success_rate)
            .collect();
        if rates.is_empty() {
            None
        } else {
            Some(rates.iter().sum::<f64>() / rates.len() as f64)
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_rate() {
        let mut history = PerformanceHistory::new();
        history.record("backend", "api", true);
        history.record("backend", "api", true);
        history.record("backend", "api", false);

        let entry = history.entry("backend", "api").unwrap();
        assert_eq!(entry.attempts, 3);
        assert_eq!(entry.successes, 2);

        let rate = history.success_rate("backend", &["api".to_string()]).unwrap();
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_rate_needs_min_samples() {
        let mut history = PerformanceHistory::new();
        history.record("backend", "api", true);
        assert!(history.success_rate("backend", &["api".to_string()]).is_none());
        assert!(history.success_rate("frontend", &["ui".to_string()]).is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("performance.json");

        let mut history = PerformanceHistory::new();
        history.record("tester", "testing", false);
        history.save(&path).unwrap();

        let loaded = PerformanceHistory::load(&path).unwrap();
        assert_eq!(loaded, history);
    }

    #[test]
    fn test_save_replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("performance.json");
        fs::write(&path, "stale").unwrap();

        let mut history = PerformanceHistory::new();
        history.record("backend", "api", true);
        history.save(&path).unwrap();

        assert_eq!(PerformanceHistory::load(&path).unwrap(), history);
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let history = PerformanceHistory::load(&dir.path().join("absent.json")).unwrap();
        assert!(history.is_empty());
    }
}
