//! Core infrastructure for Agentrun.
//!
//! Configuration, the error taxonomy and the retry backoff schedule shared by
//! every part of the workflow engine.

mod backoff;
mod config;
mod error;

pub use backoff::BackoffPolicy;
pub use config::{
    expand_path, BudgetConfig, CheckpointConfig, Config, EngineConfig, EventsConfig,
    ExecutionMode, RuntimeConfig, TimeoutConfig, CONFIG_ENV, LOCAL_CONFIG_FILE,
};
pub use error::{EngineError, EngineResult, ValidationError, Violation};
