//! Configuration management for Agentrun.
//!
//! Handles loading configuration from TOML files. Every section falls back
//! to its defaults, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::backoff::BackoffPolicy;
use super::error::{EngineError, EngineResult};
use crate::workflow::{CompletionPolicy, KeywordRule, OrderingRule, WorkerDescriptor};

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV: &str = "AGENTRUN_CONFIG";

/// File name looked up in the current directory.
pub const LOCAL_CONFIG_FILE: &str = "agentrun.toml";

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheduler settings
    pub engine: EngineConfig,

    /// Per-task timeouts by execution mode
    pub timeouts: TimeoutConfig,

    /// Delay schedule between a failure and its retry
    pub backoff: BackoffPolicy,

    /// Completion scoring policy
    pub completion: CompletionPolicy,

    /// Consumption limits
    pub budget: BudgetConfig,

    /// Progress event settings
    pub events: EventsConfig,

    /// Checkpoint storage
    pub checkpoint: CheckpointConfig,

    /// External process settings for live mode
    pub runtime: RuntimeConfig,

    /// Worker roster (built-in roster when empty)
    pub workers: Vec<WorkerDescriptor>,

    /// Worker-to-worker ordering rules
    #[serde(default = "default_ordering")]
    pub ordering: Vec<OrderingRule>,

    /// Extra keyword rules for the worker selector
    pub keyword_rules: Vec<KeywordRule>,
}

/// How worker calls are carried out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Deterministic in-process workers
    #[default]
    Simulated,
    /// Real external worker processes
    Live,
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simulated" | "sim" | "test" => Ok(Self::Simulated),
            "live" | "real" => Ok(Self::Live),
            other => Err(format!("unknown execution mode '{other}' (expected simulated or live)")),
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of concurrently running tasks
    pub max_parallel: usize,

    /// Execution mode (selects the timeout)
    pub mode: ExecutionMode,

    /// Save a checkpoint after this many task completions (0 disables)
    pub checkpoint_every: usize,

    /// Grace period granted to running tasks after an abort, in milliseconds
    pub abort_grace_ms: u64,

    /// Fraction of failed+blocked tasks that pauses admission
    pub cascade_threshold: f64,

    /// Number of ranked workers assigned to each requirement
    pub workers_per_requirement: usize,

    /// Maximum budget splits per task lineage
    pub max_splits: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            mode: ExecutionMode::Simulated,
            checkpoint_every: 3,
            abort_grace_ms: 5_000,
            cascade_threshold: 0.5,
            workers_per_requirement: 1,
            max_splits: 3,
        }
    }
}

impl EngineConfig {
    /// Grace period after an abort.
    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }
}

/// Per-task timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Timeout for simulated workers, in seconds
    pub simulated_secs: u64,

    /// Timeout for live workers, in seconds
    pub live_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { simulated_secs: 30, live_secs: 900 }
    }
}

impl TimeoutConfig {
    /// Timeout applied to each worker call in the given mode.
    pub fn for_mode(&self, mode: ExecutionMode) -> Duration {
        match mode {
            ExecutionMode::Simulated => Duration::from_secs(self.simulated_secs),
            ExecutionMode::Live => Duration::from_secs(self.live_secs),
        }
    }
}

/// Consumption limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Per-task soft limit that triggers a checkpoint-and-split
    pub task_soft_limit: Option<u64>,

    /// Workflow-wide soft limit (warning only)
    pub workflow_soft_limit: Option<u64>,
}

/// Progress event settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Ring buffer capacity for late-joining subscribers
    pub buffer_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { buffer_capacity: 1000 }
    }
}

/// Checkpoint storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory for checkpoint files (supports `~` and `$VAR`)
    pub dir: Option<String>,

    /// Checkpoint file name
    pub file_name: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { dir: None, file_name: "checkpoint.json".to_string() }
    }
}

impl CheckpointConfig {
    /// Resolve the checkpoint directory.
    pub fn resolve_dir(&self) -> Option<PathBuf> {
        match &self.dir {
            Some(dir) => Some(expand_path(dir)),
            None => Config::data_dir().map(|d| d.join("checkpoints")),
        }
    }
}

/// External process settings used in live mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Program invoked for every worker call
    pub command: Option<String>,

    /// Arguments passed to the program
    pub args: Vec<String>,

    /// Program that validates a task's output (stdin), exit 0 = pass
    pub validation_command: Option<String>,

    /// Arguments passed to the validation program
    pub validation_args: Vec<String>,

    /// Worker id used for remediation calls
    pub remediation_worker: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            validation_command: None,
            validation_args: Vec::new(),
            remediation_worker: "remediator".to_string(),
        }
    }
}

fn default_ordering() -> Vec<OrderingRule> {
    vec![OrderingRule::within_requirement("architect", "*")]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            timeouts: TimeoutConfig::default(),
            backoff: BackoffPolicy::default(),
            completion: CompletionPolicy::default(),
            budget: BudgetConfig::default(),
            events: EventsConfig::default(),
            checkpoint: CheckpointConfig::default(),
            runtime: RuntimeConfig::default(),
            workers: Vec::new(),
            ordering: default_ordering(),
            keyword_rules: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration using the standard lookup order.
    ///
    /// `AGENTRUN_CONFIG`, then `./agentrun.toml`, then the user config
    /// directory. Falls back to defaults when nothing is found.
    pub fn load() -> EngineResult<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load_from_file(&expand_path(&path));
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Self::load_from_file(&local);
        }

        if let Some(dir) = Self::config_dir() {
            let path = dir.join("config.toml");
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Check settings that would make the engine misbehave.
    pub fn validate(&self) -> EngineResult<()> {
        if self.engine.max_parallel == 0 {
            return Err(EngineError::Config("engine.max_parallel must be at least 1".into()));
        }
        if !(self.engine.cascade_threshold > 0.0 && self.engine.cascade_threshold <= 1.0) {
            return Err(EngineError::Config(format!(
                "engine.cascade_threshold must be in (0, 1], got {}",
                self.engine.cascade_threshold
            )));
        }
        if self.engine.workers_per_requirement == 0 {
            return Err(EngineError::Config(
                "engine.workers_per_requirement must be at least 1".into(),
            ));
        }
        self.completion.validate().map_err(EngineError::Config)?;

        let mut seen = std::collections::HashSet::new();
        for worker in &self.workers {
            if !seen.insert(worker.id.as_str()) {
                return Err(EngineError::Config(format!("duplicate worker id '{}'", worker.id)));
            }
        }
        Ok(())
    }

    /// Workers available to the selector.
    pub fn worker_roster(&self) -> Vec<WorkerDescriptor> {
        if self.workers.is_empty() {
            WorkerDescriptor::builtin_roster()
        } else {
            self.workers.clone()
        }
    }

    /// Timeout for the configured execution mode.
    pub fn task_timeout(&self) -> Duration {
        self.timeouts.for_mode(self.engine.mode)
    }

    /// Get the configuration directory.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("agentrun"))
    }

    /// Get the data directory (checkpoints, performance history).
    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|p| p.join("agentrun"))
    }
}

/// Expand `~` and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.max_parallel, 3);
        assert_eq!(config.engine.checkpoint_every, 3);
        assert_eq!(config.events.buffer_capacity, 1000);
        assert!((config.engine.cascade_threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.ordering.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_parallel, 3);
        assert_eq!(config.ordering.len(), 1);
        assert!(!config.worker_roster().is_empty());
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
ordering = []

[engine]
max_parallel = 5
mode = "live"

[timeouts]
live_secs = 60

[completion]
execution_weight = 0.6
validation_weight = 0.4

[[workers]]
id = "builder"
tags = ["backend"]

[[workers]]
id = "checker"
tags = ["testing"]
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.max_parallel, 5);
        assert_eq!(config.engine.mode, ExecutionMode::Live);
        assert_eq!(config.task_timeout(), Duration::from_secs(60));
        assert_eq!(config.worker_roster().len(), 2);
        assert!((config.completion.execution_weight - 0.6).abs() < f64::EPSILON);
        assert!(config.ordering.is_empty());
    }

    #[test]
    fn test_validate_rejects_zero_parallelism() {
        let mut config = Config::default();
        config.engine.max_parallel = 0;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = Config::default();
        config.engine.cascade_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!("live".parse::<ExecutionMode>().unwrap(), ExecutionMode::Live);
        assert_eq!("Simulated".parse::<ExecutionMode>().unwrap(), ExecutionMode::Simulated);
        assert!("remote".parse::<ExecutionMode>().is_err());
    }

    #[test]
    #[serial(agentrun_config_env)]
    fn test_load_from_env_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[engine]\nmax_parallel = 7\n").unwrap();

        let original = std::env::var(CONFIG_ENV).ok();
        std::env::set_var(CONFIG_ENV, &path);

        let config = Config::load().unwrap();

        match original {
            Some(val) => std::env::set_var(CONFIG_ENV, val),
            None => std::env::remove_var(CONFIG_ENV),
        }

        assert_eq!(config.engine.max_parallel, 7);
    }

    #[test]
    fn test_checkpoint_dir_expansion() {
        let config = CheckpointConfig { dir: Some("/tmp/agentrun-ckpt".into()), ..Default::default() };
        assert_eq!(config.resolve_dir(), Some(PathBuf::from("/tmp/agentrun-ckpt")));
    }
}
