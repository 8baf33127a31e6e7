//! The run loop.
//!
//! One loop per workflow owns admission, result handling, escalation,
//! checkpoints, cascade pauses and abort. Worker calls run as jobs on a
//! [`JoinSet`]; each job makes its calls and returns a [`JobResult`], and
//! the loop applies it to the state inside a single lock section. The lock
//! is never held across an `.await`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};

use super::budget::{BudgetMonitor, BudgetVerdict};
use super::engine::{CascadeDecision, WorkflowEngine};
use super::escalation::{failure_fraction, EscalationStrategy};
use super::events::{EventType, ProgressEvent};
use super::report::WorkflowReport;
use super::state::{OverallStatus, WorkflowState};
use super::task::{BlockReason, Task, TaskStatus};
use super::worker::{
    OutputValidator, RemediationRuntime, StopSignal, TaskOutcome, ValidationVerdict, WorkerRequest,
    WorkerRuntime,
};
use crate::core::{EngineError, EngineResult};

/// Receiving ends of the engine's control channels.
pub(crate) struct Controls {
    pub(crate) abort_rx: watch::Receiver<bool>,
    pub(crate) decisions: mpsc::UnboundedReceiver<CascadeDecision>,
    pub(crate) checkpoint_requests: mpsc::UnboundedReceiver<()>,
}

/// What a job needs to know about its task.
#[derive(Debug, Clone)]
struct JobSpec {
    task_id: String,
    requirement_id: String,
    worker_id: String,
    input: String,
    attempt: u32,
    remediate: bool,
}

/// Collaborators and limits handed to each job.
#[derive(Clone)]
struct JobContext {
    runtime: Arc<dyn WorkerRuntime>,
    remediation: Arc<dyn RemediationRuntime>,
    validator: Arc<dyn OutputValidator>,
    timeout: Duration,
    stop: StopSignal,
}

impl JobContext {
    fn request(&self, spec: &JobSpec, input: String) -> WorkerRequest {
        WorkerRequest {
            task_id: spec.task_id.clone(),
            requirement_id: spec.requirement_id.clone(),
            worker_id: spec.worker_id.clone(),
            input,
            timeout: self.timeout,
            attempt: spec.attempt,
            stop: self.stop.clone(),
        }
    }
}

/// What a finished job reports back to the loop.
#[derive(Debug)]
struct JobResult {
    task_id: String,
    outcome: TaskOutcome,
    verdict: Option<ValidationVerdict>,
    remediation: Option<String>,
}

/// Remediation (when due), the worker call, then validation of a success.
async fn run_job(spec: JobSpec, ctx: JobContext) -> JobResult {
    let mut input = spec.input.clone();
    let mut remediation = None;

    if spec.remediate {
        let request = ctx.request(&spec, input.clone());
        match tokio::time::timeout(ctx.timeout, ctx.remediation.remediate(request)).await {
            Ok(response) if response.success => {
                input.push_str("\n\nRemediation notes:\n");
                input.push_str(response.output.trim());
                remediation = Some(response.output);
            }
            Ok(response) => {
                tracing::warn!(task = %spec.task_id, diagnostics = %response.diagnostics, "Remediation failed");
            }
            Err(_) => tracing::warn!(task = %spec.task_id, "Remediation timed out"),
        }
    }

    let request = ctx.request(&spec, input);
    let outcome = match tokio::time::timeout(ctx.timeout, ctx.runtime.execute(request.clone())).await {
        Ok(response) => response.into_outcome(),
        Err(_) => {
            let err = EngineError::TaskTimeout { task: spec.task_id.clone(), after: ctx.timeout };
            TaskOutcome::RetryableError { message: err.to_string(), consumption: 0 }
        }
    };

    let verdict = match &outcome {
        TaskOutcome::Success { output, .. } => {
            match tokio::time::timeout(ctx.timeout, ctx.validator.validate(&request, output)).await {
                Ok(verdict) => Some(verdict),
                Err(_) => Some(ValidationVerdict::fail("validation timed out")),
            }
        }
        _ => None,
    };

    JobResult { task_id: spec.task_id, outcome, verdict, remediation }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "worker job was cancelled".to_string();
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("worker panicked: {detail}")
}

fn retry_after(task: &mut Task, delay: Duration) {
    task.set_status(TaskStatus::RetryScheduled);
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    task.retry_at = Some(Utc::now() + delay);
}

/// Admission order: priority, then requirement id, then creation order.
fn admission_order(state: &WorkflowState) -> Vec<usize> {
    let mut ready: Vec<(super::requirement::Priority, &str, usize)> = state
        .tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.status == TaskStatus::Ready)
        .map(|(idx, t)| {
            let priority = state.requirement(&t.requirement_id).map(|r| r.priority).unwrap_or_default();
            (priority, t.requirement_id.as_str(), idx)
        })
        .collect();
    ready.sort();
    ready.into_iter().map(|(_, _, idx)| idx).collect()
}

/// Drives one workflow run.
pub(crate) struct Scheduler<'a> {
    engine: &'a WorkflowEngine,
    controls: Controls,
    jobs: JoinSet<JobResult>,
    running: HashMap<tokio::task::Id, String>,
    since_checkpoint: usize,
    checkpoint_due: bool,
    last_checkpoint: Option<PathBuf>,
    paused: bool,
    abort_deadline: Option<tokio::time::Instant>,
    budget_warned: bool,
}

impl<'a> Scheduler<'a> {
    pub(crate) fn new(engine: &'a WorkflowEngine, controls: Controls) -> Self {
        Self {
            engine,
            controls,
            jobs: JoinSet::new(),
            running: HashMap::new(),
            since_checkpoint: 0,
            checkpoint_due: false,
            last_checkpoint: None,
            paused: false,
            abort_deadline: None,
            budget_warned: false,
        }
    }

    pub(crate) async fn run(mut self) -> EngineResult<WorkflowReport> {
        let started = Instant::now();
        self.start();

        loop {
            if self.abort_deadline.is_none() && *self.controls.abort_rx.borrow() {
                self.begin_abort();
            }

            if self.abort_deadline.is_some() {
                if self.jobs.is_empty() {
                    break;
                }
            } else {
                if self.checkpoint_due && self.jobs.is_empty() {
                    self.save_checkpoint();
                }
                self.refresh();
                if !self.paused && !self.checkpoint_due {
                    self.admit();
                }
                if self.jobs.is_empty() && !self.paused && !self.checkpoint_due {
                    let state = self.engine.state.lock();
                    if state.next_retry_at().is_none() {
                        if !state.all_terminal() {
                            tracing::error!(
                                waiting = state.tasks.iter().filter(|t| !t.status.is_terminal()).count(),
                                "No task can make progress, stopping"
                            );
                        }
                        break;
                    }
                }
            }

            self.wait().await;
        }

        Ok(self.finish(started.elapsed()))
    }

    fn emit(&self, state: &mut WorkflowState, event_type: EventType, payload: serde_json::Value) {
        self.engine.publisher.emit(state, event_type, payload);
    }

    fn start(&mut self) {
        let engine = self.engine;
        let mut state = engine.state.lock();
        let resumed = state.sequence_number > 0;
        state.overall_status = OverallStatus::Running;
        state.touch();
        tracing::info!(
            workflow = %state.workflow_id,
            tasks = state.tasks.len(),
            max_parallel = engine.config.engine.max_parallel,
            resumed,
            "Workflow started"
        );
        let payload = json!({
            "workflow_id": state.workflow_id,
            "project": state.project,
            "requirements": state.requirements.len(),
            "tasks": state.tasks.len(),
            "resumed": resumed,
        });
        self.emit(&mut state, EventType::WorkflowStarted, payload);
    }

    /// Promote due retries, propagate blocks and look for a cascade.
    fn refresh(&mut self) {
        let engine = self.engine;
        let mut state = engine.state.lock();

        let now = Utc::now();
        for task in &mut state.tasks {
            if task.status == TaskStatus::RetryScheduled && task.retry_at.map_or(true, |at| at <= now) {
                task.retry_at = None;
                task.set_status(TaskStatus::Ready);
            }
        }

        loop {
            let blocked = state.refresh_readiness();
            if blocked.is_empty() {
                break;
            }
            for id in blocked {
                let Some(task) = state.task(&id) else { continue };
                let requirement_id = task.requirement_id.clone();
                let payload = json!({
                    "task_id": task.id,
                    "worker_id": task.worker_id,
                    "requirement_id": task.requirement_id,
                    "reason": task.blocked_reason.as_ref().map(ToString::to_string),
                });
                self.emit(&mut state, EventType::TaskBlocked, payload);
                engine.tracker.recompute(&mut state, &requirement_id);
            }
        }

        self.check_cascade(&mut state);
    }

    fn check_cascade(&mut self, state: &mut WorkflowState) {
        if self.paused {
            return;
        }
        let bad = state.failed_or_blocked_count();
        let total = state.tasks.len();
        let fraction = failure_fraction(bad, total);
        let pending_work = state.tasks.iter().any(|t| t.status.is_waiting());
        if fraction <= self.engine.config.engine.cascade_threshold
            || bad <= state.cascade_acknowledged
            || !pending_work
        {
            return;
        }

        self.paused = true;
        state.overall_status = OverallStatus::Paused;
        tracing::warn!(failed_or_blocked = bad, total, fraction, "Failure cascade detected, admission paused");
        let payload = json!({ "failed_or_blocked": bad, "total": total, "fraction": fraction });
        self.emit(state, EventType::CascadeDetected, payload);
    }

    fn admit(&mut self) {
        let engine = self.engine;
        let capacity = engine.config.engine.max_parallel.saturating_sub(self.jobs.len());
        if capacity == 0 {
            return;
        }

        let specs: Vec<JobSpec> = {
            let mut state = engine.state.lock();
            let order = admission_order(&state);
            order.into_iter().take(capacity).map(|idx| self.start_task(&mut state, idx)).collect()
        };

        let stop = StopSignal::new(self.controls.abort_rx.clone());
        for spec in specs {
            let ctx = JobContext {
                runtime: engine.runtime.clone(),
                remediation: engine.remediation.clone(),
                validator: engine.validator.clone(),
                timeout: engine.config.task_timeout(),
                stop: stop.clone(),
            };
            let task_id = spec.task_id.clone();
            let handle = self.jobs.spawn(run_job(spec, ctx));
            self.running.insert(handle.id(), task_id);
        }
    }

    fn start_task(&self, state: &mut WorkflowState, idx: usize) -> JobSpec {
        let task = &mut state.tasks[idx];
        task.attempt_count += 1;
        task.started_at = Some(Utc::now());
        task.finished_at = None;
        task.set_status(TaskStatus::Running);
        let spec = JobSpec {
            task_id: task.id.clone(),
            requirement_id: task.requirement_id.clone(),
            worker_id: task.worker_id.clone(),
            input: task.render_input(),
            attempt: task.attempt_count,
            remediate: std::mem::take(&mut task.remediation_pending),
        };

        tracing::debug!(task = %spec.task_id, worker = %spec.worker_id, attempt = spec.attempt, "Task admitted");
        self.engine.tracker.recompute(state, &spec.requirement_id);
        let payload = json!({
            "task_id": spec.task_id,
            "worker_id": spec.worker_id,
            "requirement_id": spec.requirement_id,
            "attempt": spec.attempt,
        });
        self.emit(state, EventType::TaskStarted, payload);
        spec
    }

    async fn wait(&mut self) {
        let aborting = self.abort_deadline.is_some();
        let paused = self.paused;
        let retry_in = if paused || aborting {
            None
        } else {
            self.engine
                .state
                .lock()
                .next_retry_at()
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
        };
        let deadline = self.abort_deadline.unwrap_or_else(tokio::time::Instant::now);
        let has_jobs = !self.jobs.is_empty();

        tokio::select! {
            Some(joined) = self.jobs.join_next_with_id(), if has_jobs => self.on_joined(joined),
            changed = self.controls.abort_rx.changed(), if !aborting => {
                if changed.is_err() {
                    tracing::debug!("Abort channel closed");
                }
            }
            Some(decision) = self.controls.decisions.recv(), if !aborting => self.on_decision(decision),
            Some(()) = self.controls.checkpoint_requests.recv(), if !aborting => {
                if self.engine.checkpoints.is_some() {
                    self.checkpoint_due = true;
                }
            }
            () = tokio::time::sleep(retry_in.unwrap_or_default()), if retry_in.is_some() => {}
            () = tokio::time::sleep_until(deadline), if aborting => self.force_abort().await,
            else => {}
        }
    }

    fn on_joined(&mut self, joined: Result<(tokio::task::Id, JobResult), JoinError>) {
        match joined {
            Ok((id, result)) => {
                self.running.remove(&id);
                self.apply(result);
            }
            Err(err) => {
                let Some(task_id) = self.running.remove(&err.id()) else { return };
                let message = panic_message(err);
                tracing::error!(task = %task_id, error = %message, "Worker job ended abnormally");
                self.apply(JobResult {
                    task_id,
                    outcome: TaskOutcome::RetryableError { message, consumption: 0 },
                    verdict: None,
                    remediation: None,
                });
            }
        }
    }

    fn apply(&mut self, result: JobResult) {
        let engine = self.engine;
        let mut state = engine.state.lock();
        let Some(idx) = state.tasks.iter().position(|t| t.id == result.task_id) else { return };
        if state.tasks[idx].status != TaskStatus::Running {
            return;
        }

        let consumption = result.outcome.consumption();
        state.total_consumption += consumption;
        {
            let task = &mut state.tasks[idx];
            task.consumption += consumption;
            task.finished_at = Some(Utc::now());
            if let Some(note) = result.remediation {
                task.context.push(format!("Remediation notes:\n{}", note.trim()));
            }
        }

        let aborting = self.abort_deadline.is_some();
        let completed = match result.outcome {
            TaskOutcome::Success { output, diagnostics, .. } => {
                if !diagnostics.trim().is_empty() {
                    tracing::debug!(task = %result.task_id, diagnostics = %diagnostics, "Worker diagnostics");
                }
                self.on_success(&mut state, idx, output, result.verdict)
            }
            TaskOutcome::RetryableError { .. } | TaskOutcome::FatalError { .. } if aborting => {
                self.mark_aborted(&mut state, idx);
                false
            }
            TaskOutcome::RetryableError { message, .. } => self.on_failure(&mut state, idx, &message),
            TaskOutcome::FatalError { message, .. } => self.on_fatal(&mut state, idx, &message),
        };

        let requirement_id = state.tasks[idx].requirement_id.clone();
        engine.tracker.recompute(&mut state, &requirement_id);
        state.touch();

        if completed {
            state.completed_task_count += 1;
            self.since_checkpoint += 1;
            let every = engine.config.engine.checkpoint_every;
            if engine.checkpoints.is_some() && every > 0 && self.since_checkpoint >= every {
                self.checkpoint_due = true;
            }
        }

        if !self.budget_warned {
            if let Some(limit) = engine.budget.workflow_exceeded(state.total_consumption) {
                tracing::warn!(consumed = state.total_consumption, limit, "Workflow consumption over soft limit");
                self.budget_warned = true;
            }
        }
    }

    fn on_success(
        &mut self,
        state: &mut WorkflowState,
        idx: usize,
        output: String,
        verdict: Option<ValidationVerdict>,
    ) -> bool {
        let engine = self.engine;
        let verdict = verdict.unwrap_or_else(ValidationVerdict::pass);

        let worker_id = state.tasks[idx].worker_id.clone();
        let signature = state.tasks[idx].last_error_signature.take();
        engine.escalation.on_success(&mut state.error_records, &worker_id, signature.as_deref());

        let next_id = state.next_task_id();
        let task = &mut state.tasks[idx];
        task.remediation_pending = false;
        task.retry_at = None;
        task.validation_passed = Some(verdict.passed);
        task.validation_notes = (!verdict.notes.is_empty()).then(|| verdict.notes.clone());
        if !verdict.passed {
            tracing::warn!(task = %task.id, notes = %verdict.notes, "Output failed validation");
        }

        match engine.budget.check(task) {
            BudgetVerdict::Split { consumed, limit } => {
                task.split_count += 1;
                task.set_status(TaskStatus::SucceededPartial);
                let input = BudgetMonitor::continuation_input(task, &output);
                task.output = Some(output);
                task.successor = Some(next_id.clone());
                let continuation = task.successor_task(next_id.clone(), worker_id.clone(), input);
                let payload = json!({
                    "task_id": task.id,
                    "worker_id": worker_id,
                    "requirement_id": task.requirement_id,
                    "continuation_id": next_id,
                    "consumed": consumed,
                    "limit": limit,
                });
                state.tasks.push(continuation);
                self.emit(state, EventType::TaskSplit, payload);
                if engine.checkpoints.is_some() {
                    self.checkpoint_due = true;
                }
            }
            BudgetVerdict::Within | BudgetVerdict::ExhaustedSplits { .. } => {
                task.set_status(TaskStatus::Succeeded);
                task.output = Some(output);
                tracing::debug!(task = %task.id, worker = %worker_id, attempt = task.attempt_count, "Task succeeded");
                let payload = json!({
                    "task_id": task.id,
                    "worker_id": worker_id,
                    "requirement_id": task.requirement_id,
                    "attempt": task.attempt_count,
                    "validation_passed": verdict.passed,
                    "consumption": task.consumption,
                });
                self.emit(state, EventType::TaskSucceeded, payload);
            }
        }
        true
    }

    fn on_failure(&mut self, state: &mut WorkflowState, idx: usize, message: &str) -> bool {
        let engine = self.engine;
        let worker_id = state.tasks[idx].worker_id.clone();
        let decision = engine.escalation.on_failure(&mut state.error_records, &worker_id, message);

        let (task_id, requirement_id, attempt) = {
            let task = &mut state.tasks[idx];
            task.last_error_signature = Some(decision.signature.clone());
            task.last_error = Some(message.to_string());
            (task.id.clone(), task.requirement_id.clone(), task.attempt_count)
        };

        let err = EngineError::TaskExecution { task: task_id.clone(), message: message.to_string() };
        tracing::warn!(
            error = %err,
            worker = %worker_id,
            occurrence = decision.occurrence,
            strategy = %decision.strategy,
            "Escalating failure"
        );
        let payload = json!({
            "task_id": task_id,
            "worker_id": worker_id,
            "requirement_id": requirement_id,
            "attempt": attempt,
            "error": message,
            "signature": decision.signature,
            "occurrence": decision.occurrence,
        });
        self.emit(state, EventType::TaskFailed, payload);

        let mut escalation = json!({
            "task_id": task_id,
            "worker_id": worker_id,
            "strategy": decision.strategy.as_str(),
            "occurrence": decision.occurrence,
            "delay_ms": u64::try_from(decision.delay.as_millis()).unwrap_or(u64::MAX),
        });

        let completed = match decision.strategy {
            EscalationStrategy::RetrySame => {
                retry_after(&mut state.tasks[idx], decision.delay);
                false
            }
            EscalationStrategy::RetryWithContext => {
                let task = &mut state.tasks[idx];
                task.context.push(format!("Previous attempt {attempt} failed with:\n{}", message.trim()));
                retry_after(task, decision.delay);
                false
            }
            EscalationStrategy::TriggerRemediation => {
                let task = &mut state.tasks[idx];
                task.remediation_pending = true;
                retry_after(task, decision.delay);
                false
            }
            EscalationStrategy::AlternativeWorker => match alternative_worker(state, idx) {
                Some(alternative) => {
                    let next_id = state.next_task_id();
                    engine.escalation.on_substitution(&mut state.error_records, &alternative, &decision.signature);
                    let task = &mut state.tasks[idx];
                    let substitute = task.successor_task(next_id.clone(), alternative.clone(), task.input.clone());
                    task.successor = Some(next_id.clone());
                    task.retry_at = None;
                    task.set_status(TaskStatus::Failed);
                    state.tasks.push(substitute);
                    tracing::info!(task = %task_id, substitute = %next_id, worker = %alternative, "Task rebound");
                    escalation["substitute_id"] = json!(next_id);
                    escalation["substitute_worker"] = json!(alternative);
                    true
                }
                None => {
                    tracing::warn!(task = %task_id, "No alternative worker left, retrying on the same worker");
                    retry_after(&mut state.tasks[idx], decision.delay);
                    false
                }
            },
            EscalationStrategy::ManualIntervention => {
                state.tasks[idx].block(BlockReason::ManualIntervention { failures: decision.occurrence });
                true
            }
        };

        self.emit(state, EventType::EscalationApplied, escalation);
        if decision.strategy == EscalationStrategy::ManualIntervention {
            self.emit_blocked(state, idx);
        }
        completed
    }

    fn on_fatal(&mut self, state: &mut WorkflowState, idx: usize, message: &str) -> bool {
        let task = &mut state.tasks[idx];
        task.last_error = Some(message.to_string());
        task.block(BlockReason::Fatal { message: message.to_string() });
        tracing::error!(task = %task.id, worker = %task.worker_id, error = %message, "Unrecoverable task failure");
        let payload = json!({
            "task_id": task.id,
            "worker_id": task.worker_id,
            "requirement_id": task.requirement_id,
            "attempt": task.attempt_count,
            "error": message,
            "fatal": true,
        });
        self.emit(state, EventType::TaskFailed, payload);
        self.emit_blocked(state, idx);
        true
    }

    fn emit_blocked(&self, state: &mut WorkflowState, idx: usize) {
        let task = &state.tasks[idx];
        let payload = json!({
            "task_id": task.id,
            "worker_id": task.worker_id,
            "requirement_id": task.requirement_id,
            "reason": task.blocked_reason.as_ref().map(ToString::to_string),
        });
        self.emit(state, EventType::TaskBlocked, payload);
    }

    fn mark_aborted(&self, state: &mut WorkflowState, idx: usize) {
        let task = &mut state.tasks[idx];
        task.retry_at = None;
        task.finished_at = Some(Utc::now());
        task.set_status(TaskStatus::Aborted);
        let payload = json!({
            "task_id": task.id,
            "worker_id": task.worker_id,
            "requirement_id": task.requirement_id,
        });
        self.emit(state, EventType::TaskAborted, payload);
    }

    fn on_decision(&mut self, decision: CascadeDecision) {
        let engine = self.engine;
        tracing::info!(?decision, "Cascade decision received");
        if decision == CascadeDecision::Abort {
            engine.abort_tx.send_replace(true);
            self.paused = false;
            self.begin_abort();
            return;
        }
        if !self.paused {
            tracing::debug!(?decision, "No cascade pause pending, decision ignored");
            return;
        }

        let mut state = engine.state.lock();
        if decision == CascadeDecision::Skip {
            let mut touched = Vec::new();
            for task in &mut state.tasks {
                if task.status.is_waiting() {
                    task.retry_at = None;
                    task.set_status(TaskStatus::Skipped);
                    touched.push(task.requirement_id.clone());
                }
            }
            touched.dedup();
            tracing::info!(requirements = touched.len(), "Skipped waiting tasks");
            for requirement_id in touched {
                engine.tracker.recompute(&mut state, &requirement_id);
            }
        }

        state.cascade_acknowledged = state.failed_or_blocked_count();
        if state.overall_status == OverallStatus::Paused {
            state.overall_status = OverallStatus::Running;
        }
        state.touch();
        self.paused = false;
    }

    fn save_checkpoint(&mut self) {
        self.checkpoint_due = false;
        self.since_checkpoint = 0;
        let engine = self.engine;
        let Some(manager) = &engine.checkpoints else { return };

        // The saved state already accounts for the checkpoint event's number
        let (snapshot, events, sequence) = {
            let mut state = engine.state.lock();
            state.sequence_number += 1;
            state.touch();
            (state.clone(), engine.publisher.history(), state.sequence_number)
        };

        match manager.save(&snapshot, events) {
            Ok(path) => {
                engine.publisher.publish(ProgressEvent {
                    sequence_number: sequence,
                    event_type: EventType::CheckpointSaved,
                    timestamp: Utc::now(),
                    payload: json!({
                        "path": path.display().to_string(),
                        "sequence": sequence,
                        "completed_tasks": snapshot.completed_task_count,
                    }),
                });
                self.last_checkpoint = Some(path);
            }
            Err(err) => tracing::error!(error = %err, "Failed to write checkpoint"),
        }
    }

    fn begin_abort(&mut self) {
        let grace = self.engine.config.engine.abort_grace();
        self.abort_deadline = Some(tokio::time::Instant::now() + grace);
        self.paused = false;
        tracing::warn!(
            running = self.jobs.len(),
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "Aborting workflow"
        );
    }

    async fn force_abort(&mut self) {
        let engine = self.engine;
        {
            let mut state = engine.state.lock();
            let ids: Vec<String> = self.running.values().cloned().collect();
            for id in ids {
                let Some(idx) = state.tasks.iter().position(|t| t.id == id) else { continue };
                if state.tasks[idx].status == TaskStatus::Running {
                    tracing::warn!(task = %id, "Task did not stop within the grace period");
                    self.mark_aborted(&mut state, idx);
                }
            }
        }
        self.running.clear();
        self.jobs.shutdown().await;
    }

    fn finish(self, elapsed: Duration) -> WorkflowReport {
        let engine = self.engine;
        let aborted = self.abort_deadline.is_some();
        let mut state = engine.state.lock();

        engine.tracker.recompute_all(&mut state);
        let status = engine.tracker.classify(&state, aborted);
        state.overall_status = status;
        state.touch();

        let completion = engine.tracker.workflow_completion(&state);
        tracing::info!(
            workflow = %state.workflow_id,
            status = %status,
            completion = completion.overall,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "Workflow finished"
        );
        let payload = json!({
            "workflow_id": state.workflow_id,
            "overall_status": status.as_str(),
            "completion": completion.overall,
            "execution_completion": completion.execution,
            "validation_completion": completion.validation,
        });
        self.emit(&mut state, EventType::WorkflowTerminal, payload);

        WorkflowReport::from_state(&state, &engine.tracker, elapsed, self.last_checkpoint.clone())
    }
}

/// Next-ranked candidate not yet tried in this lineage and not already
/// working on another slot of the requirement.
fn alternative_worker(state: &WorkflowState, idx: usize) -> Option<String> {
    let task = &state.tasks[idx];
    let requirement = state.requirement(&task.requirement_id)?;
    let busy: Vec<&str> = state
        .tasks
        .iter()
        .filter(|t| t.requirement_id == task.requirement_id && t.lineage != task.lineage && !t.is_superseded())
        .map(|t| t.worker_id.as_str())
        .collect();
    requirement
        .candidate_worker_ids
        .iter()
        .find(|w| !task.tried_workers.contains(w) && !busy.contains(&w.as_str()))
        .cloned()
}
