//! Workflow engine for agent workers.
//!
//! A requirements document goes in, a report comes out:
//!
//! - [`RequirementParser`] turns YAML/JSON/TOML into typed [`Requirement`]s
//! - [`PlanBuilder`] ranks workers with [`WorkerSelector`], creates one
//!   [`Task`] per (requirement, worker) and rejects dependency cycles
//! - [`WorkflowEngine`] runs tasks in parallel, escalates repeated failures,
//!   splits over-budget tasks, checkpoints, and publishes [`ProgressEvent`]s
//! - [`WorkflowReport`] summarizes the result with separate execution and
//!   validation completion
//!
//! Workers are reached through the [`WorkerRuntime`] trait; the engine never
//! talks to a concrete agent backend.

mod budget;
mod checkpoint;
mod completion;
mod engine;
mod escalation;
mod events;
mod graph;
mod history;
mod parser;
mod plan;
mod report;
mod requirement;
mod runtime;
mod scheduler;
mod selector;
mod state;
mod task;
mod worker;

pub use budget::{BudgetMonitor, BudgetVerdict};
pub use checkpoint::{state_digest, Checkpoint, CheckpointManager, SCHEMA_VERSION};
pub use completion::{CompletionPolicy, CompletionTracker, WorkflowCompletion};
pub use engine::{CascadeDecision, EngineBuilder, EngineHandle, WorkflowEngine};
pub use escalation::{
    failure_fraction, normalize_signature, ErrorLedger, ErrorRecord, EscalationDecision,
    EscalationManager, EscalationStrategy, MAX_SIGNATURE_LEN,
};
pub use events::{EventSubscription, EventType, ProgressEvent, ProgressPublisher};
pub use graph::{
    ensure_acyclic, execution_waves, find_cycle, wire_dependencies, OrderingRule, OrderingScope,
    ANY_WORKER,
};
pub use history::{PerformanceEntry, PerformanceHistory, MIN_SAMPLES};
pub use parser::{DocumentFormat, ParsedRequirements, RequirementParser};
pub use plan::{describe_plan, task_input, PlanBuilder};
pub use report::{RequirementSummary, TaskSummary, WorkflowReport, REPORT_FILE};
pub use requirement::{Priority, Requirement, RequirementKind, RequirementStatus};
pub use runtime::{
    CommandRuntime, CommandValidator, NonEmptyValidator, SimulatedRuntime, WorkerRemediation,
    REQUIREMENT_ID_ENV, TASK_ID_ENV, WORKER_ID_ENV,
};
pub use selector::{Candidate, KeywordRule, WorkerSelector, GENERAL_CATEGORY};
pub use state::{DependencyOutcome, OverallStatus, WorkflowState};
pub use task::{task_id, BlockReason, Task, TaskStatus};
pub use worker::{
    OutputValidator, RemediationRuntime, StopSignal, TaskOutcome, ValidationVerdict,
    WorkerDescriptor, WorkerRequest, WorkerResponse, WorkerRuntime,
};
