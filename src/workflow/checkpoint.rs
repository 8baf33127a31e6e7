//! Checkpoint persistence.
//!
//! A checkpoint is a JSON document holding the full [`WorkflowState`], the
//! buffered progress events and a SHA-256 digest of the state. Writes go to
//! a temporary file in the target directory which is then renamed over the
//! previous checkpoint, so a crash mid-write never leaves a torn file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::events::ProgressEvent;
use super::state::WorkflowState;
use crate::core::{CheckpointConfig, EngineError, EngineResult};

/// Schema version written by this build.
pub const SCHEMA_VERSION: &str = "1.0";

/// Highest major schema version this build can read.
const SUPPORTED_MAJOR: u32 = 1;

/// On-disk checkpoint document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Schema version (`major.minor`)
    pub schema_version: String,

    /// When the checkpoint was written
    pub saved_at: DateTime<Utc>,

    /// Hex SHA-256 of the serialized state
    pub digest: String,

    /// Workflow state at save time
    pub state: WorkflowState,

    /// Buffered progress events at save time
    #[serde(default)]
    pub events: Vec<ProgressEvent>,
}

impl Checkpoint {
    /// Build a checkpoint for the given state.
    pub fn new(state: WorkflowState, events: Vec<ProgressEvent>) -> EngineResult<Self> {
        let digest = state_digest(&state)?;
        Ok(Self { schema_version: SCHEMA_VERSION.to_string(), saved_at: Utc::now(), digest, state, events })
    }
}

/// Hex SHA-256 of a state's compact JSON form.
pub fn state_digest(state: &WorkflowState) -> EngineResult<String> {
    let bytes = serde_json::to_vec(state)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Reads and writes checkpoint files.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    file_name: String,
}

impl CheckpointManager {
    /// Store checkpoints in `dir` as `checkpoint.json`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), file_name: "checkpoint.json".to_string() }
    }

    /// Use a different file name.
    #[must_use]
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    /// Build from configuration. `None` when no directory can be resolved.
    pub fn from_config(config: &CheckpointConfig) -> Option<Self> {
        config.resolve_dir().map(|dir| Self::new(dir).with_file_name(config.file_name.clone()))
    }

    /// Full path of the checkpoint file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Whether a checkpoint exists.
    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    /// Atomically write a checkpoint and return its path.
    pub fn save(&self, state: &WorkflowState, events: Vec<ProgressEvent>) -> EngineResult<PathBuf> {
        let checkpoint = Checkpoint::new(state.clone(), events)?;
        let content = serde_json::to_vec_pretty(&checkpoint)?;

        fs::create_dir_all(&self.dir)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&content)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;

        let path = self.path();
        tmp.persist(&path).map_err(|e| EngineError::Io(e.error))?;

        tracing::info!(
            path = %path.display(),
            sequence = state.sequence_number,
            tasks = state.tasks.len(),
            "Checkpoint saved"
        );
        Ok(path)
    }

    /// Load this manager's checkpoint.
    pub fn load(&self) -> EngineResult<Checkpoint> {
        Self::load_from(&self.path())
    }

    /// Load and verify a checkpoint file.
    pub fn load_from(path: &Path) -> EngineResult<Checkpoint> {
        let content = fs::read_to_string(path)?;
        let corrupt = |problems: Vec<String>| EngineError::CheckpointCorruption {
            path: path.to_path_buf(),
            problems,
        };

        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| corrupt(vec![format!("not valid JSON: {e}")]))?;

        let version = value
            .get("schema_version")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| corrupt(vec!["missing schema_version".to_string()]))?
            .to_string();
        let major: u32 = version
            .split('.')
            .next()
            .and_then(|m| m.parse().ok())
            .ok_or_else(|| corrupt(vec![format!("malformed schema_version '{version}'")]))?;
        if major > SUPPORTED_MAJOR {
            return Err(EngineError::UnsupportedCheckpointVersion {
                found: version,
                supported: SCHEMA_VERSION.to_string(),
            });
        }

        let checkpoint: Checkpoint =
            serde_json::from_value(value).map_err(|e| corrupt(vec![e.to_string()]))?;

        let mut problems = Vec::new();
        let digest = state_digest(&checkpoint.state)?;
        if digest != checkpoint.digest {
            problems.push("state digest does not match".to_string());
        }
        problems.extend(checkpoint.state.integrity_problems());
        if !problems.is_empty() {
            tracing::error!(path = %path.display(), problems = problems.len(), "Corrupt checkpoint");
            return Err(corrupt(problems));
        }

        tracing::debug!(
            path = %path.display(),
            workflow = %checkpoint.state.workflow_id,
            sequence = checkpoint.state.sequence_number,
            "Checkpoint loaded"
        );
        Ok(checkpoint)
    }
}
