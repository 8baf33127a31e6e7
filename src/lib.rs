//! # Agentrun
//!
//! Adaptive workflow orchestration for agent workers.
//!
//! Agentrun takes a requirements document, assigns each requirement to the
//! best-suited workers, and runs the resulting task graph with bounded
//! parallelism. Repeated failures climb an escalation ladder, long tasks are
//! split at a budget, progress is checkpointed for exact resume, and the
//! final report keeps execution and validation completion apart.
//!
//! ## Features
//!
//! - **Requirement parsing**: YAML, JSON or TOML, validated up front
//! - **Worker selection**: keyword categories plus historical success rates
//! - **Parallel scheduling**: dependency-ordered, deterministic admission
//! - **Escalation**: retry, add context, remediate, rebind, then stop
//! - **Checkpoints**: versioned, digest-checked snapshots with event history
//!
//! ## Quick Start
//!
//! ```bash
//! # Check a requirements file without running anything
//! agentrun validate requirements.yaml
//!
//! # Run it with four parallel workers
//! agentrun run requirements.yaml --max-parallel 4
//!
//! # Pick up an interrupted run
//! agentrun run --resume-from-checkpoint ~/.local/share/agentrun/checkpoints/checkpoint.json
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::significant_drop_in_scrutinee)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::future_not_send)]

pub mod core;
pub mod workflow;

pub use core::{Config, EngineError, EngineResult};
pub use workflow::{EngineHandle, RequirementParser, WorkflowEngine, WorkflowReport};

/// Application version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const APP_NAME: &str = "agentrun";
