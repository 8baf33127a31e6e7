//! The workflow engine.
//!
//! A [`WorkflowEngine`] owns one workflow instance: its state, its event
//! stream and the collaborators it calls. Nothing is global, so tests can
//! run many engines side by side with fake runtimes.
//!
//! ```no_run
//! use agentrun::core::Config;
//! use agentrun::workflow::{RequirementParser, WorkflowEngine};
//!
//! # async fn demo() -> agentrun::core::EngineResult<()> {
//! let engine = WorkflowEngine::builder(Config::default()).build()?;
//! let parsed = RequirementParser::new().parse_file("requirements.yaml".as_ref())?;
//! engine.plan(parsed)?;
//! let report = engine.run().await?;
//! println!("{}", report.to_summary_string());
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use super::budget::BudgetMonitor;
use super::checkpoint::{Checkpoint, CheckpointManager};
use super::completion::CompletionTracker;
use super::escalation::EscalationManager;
use super::events::{EventSubscription, ProgressPublisher};
use super::history::PerformanceHistory;
use super::parser::ParsedRequirements;
use super::plan::PlanBuilder;
use super::report::WorkflowReport;
use super::runtime::{CommandRuntime, CommandValidator, NonEmptyValidator, SimulatedRuntime, WorkerRemediation};
use super::scheduler::{Controls, Scheduler};
use super::state::{OverallStatus, WorkflowState};
use super::worker::{OutputValidator, RemediationRuntime, WorkerRuntime};
use crate::core::{Config, EngineError, EngineResult, ExecutionMode};

/// Answer to a failure-cascade pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeDecision {
    /// Resume admission as is
    Continue,
    /// Skip every task that has not started, then resume
    Skip,
    /// Abort the workflow
    Abort,
}

impl std::str::FromStr for CascadeDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "continue" | "c" => Ok(Self::Continue),
            "skip" | "s" => Ok(Self::Skip),
            "abort" | "a" => Ok(Self::Abort),
            other => Err(format!("unknown cascade decision '{other}' (continue, skip, abort)")),
        }
    }
}

/// Builder for [`WorkflowEngine`].
pub struct EngineBuilder {
    config: Config,
    runtime: Option<Arc<dyn WorkerRuntime>>,
    remediation: Option<Arc<dyn RemediationRuntime>>,
    validator: Option<Arc<dyn OutputValidator>>,
    checkpoints: Option<CheckpointManager>,
    history: Option<PerformanceHistory>,
}

impl EngineBuilder {
    /// Worker runtime. Defaults to the one matching `engine.mode`.
    #[must_use]
    pub fn runtime(mut self, runtime: Arc<dyn WorkerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Remediation collaborator. Defaults to the configured remediation worker.
    #[must_use]
    pub fn remediation(mut self, remediation: Arc<dyn RemediationRuntime>) -> Self {
        self.remediation = Some(remediation);
        self
    }

    /// Output validator. Defaults to `runtime.validation_command`, or a
    /// non-empty output check.
    #[must_use]
    pub fn validator(mut self, validator: Arc<dyn OutputValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Where to write checkpoints. Without one, no checkpoints are written.
    #[must_use]
    pub fn checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    /// Historical performance used when ranking workers.
    #[must_use]
    pub fn history(mut self, history: PerformanceHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Validate the configuration and build the engine.
    pub fn build(self) -> EngineResult<WorkflowEngine> {
        let config = self.config;
        config.validate()?;

        let runtime: Arc<dyn WorkerRuntime> = match self.runtime {
            Some(runtime) => runtime,
            None => match config.engine.mode {
                ExecutionMode::Simulated => Arc::new(SimulatedRuntime::new()),
                ExecutionMode::Live => Arc::new(CommandRuntime::from_config(&config)?),
            },
        };
        let remediation = self.remediation.unwrap_or_else(|| {
            Arc::new(WorkerRemediation::new(runtime.clone(), config.runtime.remediation_worker.clone()))
        });
        let validator: Arc<dyn OutputValidator> = match self.validator {
            Some(validator) => validator,
            None => match CommandValidator::from_config(&config) {
                Some(validator) => Arc::new(validator),
                None => Arc::new(NonEmptyValidator),
            },
        };

        let (abort_tx, abort_rx) = watch::channel(false);
        let (decision_tx, decision_rx) = mpsc::unbounded_channel();
        let (checkpoint_tx, checkpoint_rx) = mpsc::unbounded_channel();

        tracing::debug!(
            runtime = runtime.name(),
            mode = ?config.engine.mode,
            max_parallel = config.engine.max_parallel,
            "Engine built"
        );

        Ok(WorkflowEngine {
            publisher: ProgressPublisher::new(config.events.buffer_capacity),
            tracker: CompletionTracker::new(config.completion.clone()),
            escalation: EscalationManager::new(config.backoff.clone()),
            budget: BudgetMonitor::new(config.budget.clone(), config.engine.max_splits),
            state: Arc::new(Mutex::new(WorkflowState::new(None, Vec::new(), Vec::new()))),
            runtime,
            remediation,
            validator,
            checkpoints: self.checkpoints,
            history: self.history,
            abort_tx: Arc::new(abort_tx),
            decision_tx,
            checkpoint_tx,
            controls: Mutex::new(Some(Controls {
                abort_rx,
                decisions: decision_rx,
                checkpoint_requests: checkpoint_rx,
            })),
            config,
        })
    }
}

/// One workflow instance and everything it needs to run.
pub struct WorkflowEngine {
    pub(crate) config: Config,
    pub(crate) state: Arc<Mutex<WorkflowState>>,
    pub(crate) publisher: ProgressPublisher,
    pub(crate) tracker: CompletionTracker,
    pub(crate) escalation: EscalationManager,
    pub(crate) budget: BudgetMonitor,
    pub(crate) runtime: Arc<dyn WorkerRuntime>,
    pub(crate) remediation: Arc<dyn RemediationRuntime>,
    pub(crate) validator: Arc<dyn OutputValidator>,
    pub(crate) checkpoints: Option<CheckpointManager>,
    history: Option<PerformanceHistory>,
    pub(crate) abort_tx: Arc<watch::Sender<bool>>,
    decision_tx: mpsc::UnboundedSender<CascadeDecision>,
    checkpoint_tx: mpsc::UnboundedSender<()>,
    controls: Mutex<Option<Controls>>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WorkflowEngine")
            .field("workflow_id", &state.workflow_id)
            .field("tasks", &state.tasks.len())
            .field("overall_status", &state.overall_status)
            .field("runtime", &self.runtime.name())
            .finish()
    }
}

impl WorkflowEngine {
    /// Start building an engine.
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            runtime: None,
            remediation: None,
            validator: None,
            checkpoints: None,
            history: None,
        }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the task graph for parsed requirements.
    ///
    /// Fails with [`EngineError::CycleDetected`] before anything runs if the
    /// graph has a cycle.
    pub fn plan(&self, parsed: ParsedRequirements) -> EngineResult<()> {
        self.ensure_idle()?;
        let mut builder = PlanBuilder::from_config(&self.config);
        if let Some(history) = &self.history {
            builder = builder.with_history(history.clone());
        }
        let state = builder.build(parsed)?;
        *self.state.lock() = state;
        Ok(())
    }

    /// Load a checkpoint file and continue from it on the next [`run`](Self::run).
    pub fn resume(&self, path: &Path) -> EngineResult<()> {
        let checkpoint = CheckpointManager::load_from(path)?;
        self.resume_from(checkpoint)
    }

    /// Continue from an already loaded checkpoint.
    pub fn resume_from(&self, checkpoint: Checkpoint) -> EngineResult<()> {
        self.ensure_idle()?;
        let Checkpoint { mut state, events, .. } = checkpoint;
        state.prepare_resume();
        tracing::info!(
            workflow = %state.workflow_id,
            sequence = state.sequence_number,
            done = state.tasks.iter().filter(|t| t.status.is_terminal()).count(),
            total = state.tasks.len(),
            "Resuming workflow"
        );
        self.publisher.restore(events);
        *self.state.lock() = state;
        Ok(())
    }

    /// Run the workflow to a terminal status.
    ///
    /// An engine runs once; a second call fails with
    /// [`EngineError::AlreadyRunning`].
    pub async fn run(&self) -> EngineResult<WorkflowReport> {
        if self.state.lock().tasks.is_empty() {
            return Err(EngineError::NotPlanned);
        }
        let controls = self.controls.lock().take().ok_or(EngineError::AlreadyRunning)?;
        Scheduler::new(self, controls).run().await
    }

    /// A cloneable handle for controlling the engine from other tasks.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            state: self.state.clone(),
            publisher: self.publisher.clone(),
            abort_tx: self.abort_tx.clone(),
            decision_tx: self.decision_tx.clone(),
            checkpoint_tx: self.checkpoint_tx.clone(),
        }
    }

    /// Subscribe to progress events.
    pub fn subscribe(&self) -> EventSubscription {
        self.publisher.subscribe()
    }

    /// A consistent copy of the current state.
    pub fn snapshot(&self) -> WorkflowState {
        self.state.lock().clone()
    }

    fn ensure_idle(&self) -> EngineResult<()> {
        if self.controls.lock().is_none() {
            return Err(EngineError::AlreadyRunning);
        }
        Ok(())
    }
}

/// Controls a running engine from outside the run loop.
#[derive(Clone)]
pub struct EngineHandle {
    state: Arc<Mutex<WorkflowState>>,
    publisher: ProgressPublisher,
    abort_tx: Arc<watch::Sender<bool>>,
    decision_tx: mpsc::UnboundedSender<CascadeDecision>,
    checkpoint_tx: mpsc::UnboundedSender<()>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").field("abort_requested", &self.is_abort_requested()).finish()
    }
}

impl EngineHandle {
    /// Ask the workflow to stop. Running tasks get the grace period.
    pub fn abort(&self) {
        tracing::warn!("Abort requested");
        self.abort_tx.send_replace(true);
    }

    /// Whether an abort was requested.
    pub fn is_abort_requested(&self) -> bool {
        *self.abort_tx.borrow()
    }

    /// Answer a failure-cascade pause.
    pub fn decide(&self, decision: CascadeDecision) {
        if self.decision_tx.send(decision).is_err() {
            tracing::debug!(?decision, "Engine no longer listening for decisions");
        }
    }

    /// The cascade pause waiting for an answer, if any.
    ///
    /// The token differs between pauses, so a caller that polls can tell a
    /// pause it already answered from a new one.
    pub fn pending_cascade(&self) -> Option<usize> {
        let state = self.state.lock();
        (state.overall_status == OverallStatus::Paused).then_some(state.cascade_acknowledged)
    }

    /// Write a checkpoint at the next point where no task is running.
    pub fn request_checkpoint(&self) {
        let _ = self.checkpoint_tx.send(());
    }

    /// Subscribe to progress events.
    pub fn subscribe(&self) -> EventSubscription {
        self.publisher.subscribe()
    }

    /// A consistent copy of the current state.
    pub fn snapshot(&self) -> WorkflowState {
        self.state.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{DocumentFormat, RequirementParser};

    fn parsed() -> ParsedRequirements {
        RequirementParser::new()
            .parse_str("features:\n  - \"Login page\"\n  - \"REST API\"\n", DocumentFormat::Yaml)
            .unwrap()
    }

    #[test]
    fn test_cascade_decision_from_str() {
        assert_eq!("Continue".parse::<CascadeDecision>().unwrap(), CascadeDecision::Continue);
        assert_eq!("s".parse::<CascadeDecision>().unwrap(), CascadeDecision::Skip);
        assert!("maybe".parse::<CascadeDecision>().is_err());
    }

    #[test]
    fn test_live_mode_without_command_fails() {
        let mut config = Config::default();
        config.engine.mode = ExecutionMode::Live;
        assert!(matches!(WorkflowEngine::builder(config).build(), Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_without_plan() {
        let engine = WorkflowEngine::builder(Config::default()).build().unwrap();
        assert!(matches!(engine.run().await, Err(EngineError::NotPlanned)));
    }

    #[tokio::test]
    async fn test_simulated_run_succeeds_once() {
        let engine = WorkflowEngine::builder(Config::default()).build().unwrap();
        engine.plan(parsed()).unwrap();

        let report = engine.run().await.unwrap();
        assert_eq!(report.overall_status, OverallStatus::Succeeded);
        assert!((report.completion - 100.0).abs() < f64::EPSILON);

        assert!(matches!(engine.run().await, Err(EngineError::AlreadyRunning)));
        assert!(matches!(engine.plan(parsed()), Err(EngineError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn test_handle_reflects_abort() {
        let engine = WorkflowEngine::builder(Config::default()).build().unwrap();
        let handle = engine.handle();
        assert!(!handle.is_abort_requested());
        handle.abort();
        assert!(handle.is_abort_requested());

        engine.plan(parsed()).unwrap();
        let report = engine.run().await.unwrap();
        assert_eq!(report.overall_status, OverallStatus::Aborted);
        assert!(report.tasks.iter().all(|t| t.attempts == 0));
    }
}
