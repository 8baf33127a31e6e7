//! Task dependency graph.
//!
//! Edges come from two places: requirement dependencies (every task of a
//! requirement waits for every task of the requirements it depends on) and
//! worker ordering rules (e.g. the architect runs before everyone else on
//! the same requirement). Cycles are rejected before anything runs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::requirement::Requirement;
use super::task::Task;
use crate::core::{EngineError, EngineResult};

/// Wildcard that matches any worker.
pub const ANY_WORKER: &str = "*";

/// Where an ordering rule applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingScope {
    /// Only between tasks of the same requirement
    #[default]
    Requirement,
    /// Between any two tasks of the workflow
    Workflow,
}

/// "Tasks on `before` finish before tasks on `after` start."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingRule {
    /// Worker id (or `*`) that goes first
    pub before: String,

    /// Worker id (or `*`) that waits
    pub after: String,

    /// Where the rule applies
    #[serde(default)]
    pub scope: OrderingScope,
}

impl OrderingRule {
    /// A rule applied within each requirement.
    pub fn within_requirement(before: impl Into<String>, after: impl Into<String>) -> Self {
        Self { before: before.into(), after: after.into(), scope: OrderingScope::Requirement }
    }

    /// A rule applied across the whole workflow.
    pub fn across_workflow(before: impl Into<String>, after: impl Into<String>) -> Self {
        Self { before: before.into(), after: after.into(), scope: OrderingScope::Workflow }
    }

    /// Whether `first` must precede `second` under this rule.
    fn orders(&self, first: &Task, second: &Task) -> bool {
        if first.id == second.id || first.worker_id == second.worker_id {
            return false;
        }
        if self.scope == OrderingScope::Requirement && first.requirement_id != second.requirement_id {
            return false;
        }
        worker_matches(&self.before, &first.worker_id) && worker_matches(&self.after, &second.worker_id)
    }
}

fn worker_matches(pattern: &str, worker_id: &str) -> bool {
    pattern == ANY_WORKER || pattern == worker_id
}

/// Add dependency edges to freshly created tasks.
pub fn wire_dependencies(requirements: &[Requirement], tasks: &mut [Task], rules: &[OrderingRule]) {
    let mut by_requirement: HashMap<&str, Vec<String>> = HashMap::new();
    for task in tasks.iter() {
        by_requirement.entry(task.requirement_id.as_str()).or_default().push(task.id.clone());
    }

    let mut edges: Vec<(usize, String)> = Vec::new();

    for (idx, task) in tasks.iter().enumerate() {
        let Some(req) = requirements.iter().find(|r| r.id == task.requirement_id) else {
            continue;
        };
        for dep_req in &req.dependency_ids {
            if let Some(ids) = by_requirement.get(dep_req.as_str()) {
                edges.extend(ids.iter().map(|id| (idx, id.clone())));
            }
        }
    }

    for rule in rules {
        for (idx, later) in tasks.iter().enumerate() {
            for earlier in tasks.iter() {
                if rule.orders(earlier, later) {
                    edges.push((idx, earlier.id.clone()));
                }
            }
        }
    }

    for (idx, dep) in edges {
        if tasks[idx].id != dep {
            tasks[idx].dependencies.insert(dep);
        }
    }
}

/// Find a dependency cycle, if any.
///
/// The returned path follows dependency edges and repeats its first task at
/// the end (`A -> B -> A` means A depends on B and B depends on A).
pub fn find_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    let index: HashMap<&str, usize> =
        tasks.iter().enumerate().map(|(i, t)| (t.id.as_str(), i)).collect();
    let adjacency: Vec<Vec<usize>> = tasks
        .iter()
        .map(|t| t.dependencies.iter().filter_map(|d| index.get(d.as_str()).copied()).collect())
        .collect();

    const WHITE: u8 = 0;
    const GRAY: u8 = 1;
    const BLACK: u8 = 2;
    let mut color = vec![WHITE; tasks.len()];

    for start in 0..tasks.len() {
        if color[start] != WHITE {
            continue;
        }
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        color[start] = GRAY;

        while let Some(&(node, pos)) = stack.last() {
            if pos < adjacency[node].len() {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let next = adjacency[node][pos];
                match color[next] {
                    WHITE => {
                        color[next] = GRAY;
                        stack.push((next, 0));
                    }
                    GRAY => {
                        let from = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[from..].iter().map(|&(n, _)| tasks[n].id.clone()).collect();
                        cycle.push(tasks[next].id.clone());
                        return Some(cycle);
                    }
                    _ => {}
                }
            } else {
                color[node] = BLACK;
                stack.pop();
            }
        }
    }
    None
}

/// Fail with [`EngineError::CycleDetected`] if the graph has a cycle.
pub fn ensure_acyclic(tasks: &[Task]) -> EngineResult<()> {
    match find_cycle(tasks) {
        Some(cycle) => {
            tracing::error!(cycle = %cycle.join(" -> "), "Dependency cycle");
            Err(EngineError::CycleDetected { tasks: cycle })
        }
        None => Ok(()),
    }
}

/// Group tasks into waves: each wave only depends on earlier waves.
///
/// Tasks inside a wave keep creation order. Tasks on a cycle are left out.
pub fn execution_waves(tasks: &[Task]) -> Vec<Vec<String>> {
    let mut placed: HashMap<&str, usize> = HashMap::new();
    let mut waves: Vec<Vec<String>> = Vec::new();

    loop {
        let wave: Vec<&Task> = tasks
            .iter()
            .filter(|t| !placed.contains_key(t.id.as_str()))
            .filter(|t| {
                t.dependencies.iter().all(|d| {
                    placed.contains_key(d.as_str()) || !tasks.iter().any(|other| &other.id == d)
                })
            })
            .collect();
        if wave.is_empty() {
            break;
        }
        let level = waves.len();
        for task in &wave {
            placed.insert(task.id.as_str(), level);
        }
        waves.push(wave.iter().map(|t| t.id.clone()).collect());
    }
    waves
}
