//! Turning parsed requirements into an executable task graph.

use std::fmt::Write as _;

use super::graph::{ensure_acyclic, execution_waves, wire_dependencies, OrderingRule};
use super::history::PerformanceHistory;
use super::parser::ParsedRequirements;
use super::requirement::Requirement;
use super::selector::WorkerSelector;
use super::state::WorkflowState;
use super::task::{task_id, Task};
use super::worker::WorkerDescriptor;
use crate::core::{Config, EngineError, EngineResult, ValidationError};

/// Builds a [`WorkflowState`] from parsed requirements.
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    workers: Vec<WorkerDescriptor>,
    selector: WorkerSelector,
    ordering: Vec<OrderingRule>,
    per_requirement: usize,
}

impl PlanBuilder {
    /// Plan over the given roster with the built-in keyword table.
    pub fn new(workers: Vec<WorkerDescriptor>) -> Self {
        Self { workers, selector: WorkerSelector::new(), ordering: Vec::new(), per_requirement: 1 }
    }

    /// Take roster, ordering, keyword rules and fan-out from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.worker_roster())
            .with_selector(WorkerSelector::new().with_rules(config.keyword_rules.clone()))
            .with_ordering(config.ordering.clone())
            .with_workers_per_requirement(config.engine.workers_per_requirement)
    }

    /// Use a specific selector.
    #[must_use]
    pub fn with_selector(mut self, selector: WorkerSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Rank with historical success rates.
    #[must_use]
    pub fn with_history(mut self, history: PerformanceHistory) -> Self {
        self.selector = self.selector.with_history(history);
        self
    }

    /// Worker-to-worker ordering rules.
    #[must_use]
    pub fn with_ordering(mut self, rules: Vec<OrderingRule>) -> Self {
        self.ordering = rules;
        self
    }

    /// Number of workers bound to each requirement.
    #[must_use]
    pub fn with_workers_per_requirement(mut self, n: usize) -> Self {
        self.per_requirement = n.max(1);
        self
    }

    /// Assign workers, create tasks, wire dependencies and reject cycles.
    pub fn build(&self, parsed: ParsedRequirements) -> EngineResult<WorkflowState> {
        if self.workers.is_empty() {
            return Err(EngineError::Config("worker roster is empty".into()));
        }

        let ParsedRequirements { project, mut requirements, constraints } = parsed;

        let mut errors = ValidationError::new();
        for req in &requirements {
            for worker in &req.assigned_worker_ids {
                if !self.workers.iter().any(|w| &w.id == worker) {
                    errors.push(format!("{}.workers", req.id), format!("unknown worker id '{worker}'"));
                }
            }
        }
        errors.into_result()?;

        for req in &mut requirements {
            self.selector.assign(req, &self.workers, self.per_requirement);
        }

        let mut tasks = Vec::new();
        for req in &requirements {
            let input = task_input(req, &constraints);
            for worker in &req.assigned_worker_ids {
                tasks.push(Task::new(task_id(tasks.len() + 1), worker.clone(), req.id.clone(), input.clone()));
            }
        }

        wire_dependencies(&requirements, &mut tasks, &self.ordering);
        ensure_acyclic(&tasks)?;

        let mut state = WorkflowState::new(project, constraints, requirements);
        state.tasks = tasks;
        tracing::info!(
            workflow = %state.workflow_id,
            requirements = state.requirements.len(),
            tasks = state.tasks.len(),
            "Plan built"
        );
        Ok(state)
    }
}

/// Base input for every task of a requirement.
pub fn task_input(requirement: &Requirement, constraints: &[String]) -> String {
    let mut input = format!("{}: {}", requirement.id, requirement.description);
    if !requirement.acceptance.is_empty() {
        input.push_str("\n\nAcceptance criteria:");
        for item in &requirement.acceptance {
            let _ = write!(input, "\n- {item}");
        }
    }
    if !constraints.is_empty() {
        input.push_str("\n\nConstraints:");
        for item in constraints {
            let _ = write!(input, "\n- {item}");
        }
    }
    input
}

/// Text rendering of a plan: requirements with their workers, then waves.
pub fn describe_plan(state: &WorkflowState) -> String {
    let mut out = String::new();
    for req in &state.requirements {
        let deps = if req.dependency_ids.is_empty() {
            String::new()
        } else {
            format!(" after {}", req.dependency_ids.iter().cloned().collect::<Vec<_>>().join(", "))
        };
        let _ = writeln!(
            out,
            "{} [{}] {} -> {}{}",
            req.id,
            req.priority,
            req.description,
            req.assigned_worker_ids.join(", "),
            deps
        );
    }
    for (n, wave) in execution_waves(&state.tasks).iter().enumerate() {
        let tasks: Vec<String> = wave
            .iter()
            .filter_map(|id| state.task(id))
            .map(|t| format!("{} ({}/{})", t.id, t.requirement_id, t.worker_id))
            .collect();
        let _ = writeln!(out, "wave {}: {}", n + 1, tasks.join(", "));
    }
    out
}
