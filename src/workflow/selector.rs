//! Worker selection.
//!
//! Descriptions are mapped to categories through a keyword table, then
//! workers whose tags cover those categories are ranked. Performance
//! history, when present, refines the ranking. The result is a pure
//! function of the inputs: ties always break by ascending worker id.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::history::PerformanceHistory;
use super::requirement::Requirement;
use super::worker::WorkerDescriptor;

/// Category used when no keyword matches.
pub const GENERAL_CATEGORY: &str = "general";

/// Maps description keywords to a category tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    /// Category emitted when any keyword matches
    pub tag: String,

    /// Whole-word keywords (multi-word phrases allowed)
    pub keywords: Vec<String>,
}

impl KeywordRule {
    /// Create a new rule.
    pub fn new<I, S>(tag: impl Into<String>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { tag: tag.into(), keywords: keywords.into_iter().map(Into::into).collect() }
    }

    /// Check the rule against a description normalized by [`normalize_words`].
    fn matches(&self, normalized: &str) -> bool {
        self.keywords.iter().any(|kw| {
            let kw = normalize_words(kw);
            !kw.trim().is_empty() && normalized.contains(&kw)
        })
    }

    /// The built-in keyword table.
    pub fn builtin() -> Vec<Self> {
        vec![
            Self::new(
                "architecture",
                ["architecture", "architect", "design", "system design", "structure", "plan"],
            ),
            Self::new("backend", ["backend", "server", "service", "business logic", "worker"]),
            Self::new("api", ["api", "rest", "graphql", "endpoint", "endpoints", "webhook"]),
            Self::new(
                "database",
                ["database", "schema", "sql", "migration", "migrations", "storage", "persist"],
            ),
            Self::new(
                "frontend",
                ["frontend", "ui", "page", "component", "dashboard", "form", "css", "layout"],
            ),
            Self::new(
                "devops",
                ["deploy", "deployment", "docker", "kubernetes", "ci", "pipeline", "infrastructure"],
            ),
            Self::new(
                "security",
                ["security", "auth", "authentication", "login", "password", "encryption", "permission"],
            ),
            Self::new("testing", ["test", "tests", "testing", "qa", "coverage"]),
            Self::new("documentation", ["docs", "documentation", "readme", "guide", "manual"]),
        ]
    }
}

/// Lowercase, replace punctuation with spaces and pad, so that
/// `contains(" kw ")` is a whole-word match.
fn normalize_words(text: &str) -> String {
    let words: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();
    format!(" {} ", words.join(" "))
}

/// A ranked worker for a requirement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    /// Worker id
    pub worker_id: String,

    /// Ranking score, higher is better
    pub score: f64,

    /// Categories covered by the worker's tags
    pub matched: Vec<String>,
}

/// Ranks workers for requirements.
#[derive(Debug, Clone)]
pub struct WorkerSelector {
    rules: Vec<KeywordRule>,
    history: Option<PerformanceHistory>,
}

impl Default for WorkerSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSelector {
    /// Create a selector with the built-in keyword table.
    pub fn new() -> Self {
        Self { rules: KeywordRule::builtin(), history: None }
    }

    /// Append extra keyword rules.
    #[must_use]
    pub fn with_rules(mut self, rules: impl IntoIterator<Item = KeywordRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Use historical success rates for ranking.
    #[must_use]
    pub fn with_history(mut self, history: PerformanceHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Categories for a description, in keyword-table order.
    pub fn categorize(&self, description: &str) -> Vec<String> {
        let normalized = normalize_words(description);
        let mut categories: Vec<String> = Vec::new();
        for rule in &self.rules {
            if rule.matches(&normalized) && !categories.contains(&rule.tag) {
                categories.push(rule.tag.clone());
            }
        }
        if categories.is_empty() {
            categories.push(GENERAL_CATEGORY.to_string());
        }
        categories
    }

    /// Rank workers for a set of categories.
    ///
    /// Only workers with at least one matching tag are returned. When no
    /// worker matches, every worker is returned with score zero, by id.
    pub fn rank(&self, categories: &[String], workers: &[WorkerDescriptor]) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = workers
            .iter()
            .filter_map(|worker| {
                let matched: Vec<String> =
                    categories.iter().filter(|c| worker.has_tag(c)).cloned().collect();
                if matched.is_empty() {
                    return None;
                }
                let factor = self
                    .history
                    .as_ref()
                    .and_then(|h| h.success_rate(&worker.id, &matched))
                    .map_or(1.0, |rate| 0.25 + 0.75 * rate);
                Some(Candidate {
                    worker_id: worker.id.clone(),
                    score: matched.len() as f64 * factor,
                    matched,
                })
            })
            .collect();

        if candidates.is_empty() {
            candidates = workers
                .iter()
                .map(|w| Candidate { worker_id: w.id.clone(), score: 0.0, matched: Vec::new() })
                .collect();
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        candidates
    }

    /// Fill in categories, candidates and assignments for a requirement.
    ///
    /// Workers pinned in the document are kept as-is and become the only
    /// candidates.
    pub fn assign(
        &self,
        requirement: &mut Requirement,
        workers: &[WorkerDescriptor],
        per_requirement: usize,
    ) {
        requirement.categories = self.categorize(&requirement.description);

        if !requirement.assigned_worker_ids.is_empty() {
            requirement.candidate_worker_ids = requirement.assigned_worker_ids.clone();
            tracing::debug!(
                requirement = %requirement.id,
                workers = ?requirement.assigned_worker_ids,
                "Using pinned workers"
            );
            return;
        }

        let ranked = self.rank(&requirement.categories, workers);
        requirement.candidate_worker_ids = ranked.iter().map(|c| c.worker_id.clone()).collect();
        requirement.assigned_worker_ids =
            ranked.iter().take(per_requirement.max(1)).map(|c| c.worker_id.clone()).collect();

        tracing::debug!(
            requirement = %requirement.id,
            categories = ?requirement.categories,
            assigned = ?requirement.assigned_worker_ids,
            "Selected workers"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Priority, RequirementKind};

    fn roster() -> Vec<WorkerDescriptor> {
        WorkerDescriptor::builtin_roster()
    }

    #[test]
    fn test_categorize_whole_words() {
        let selector = WorkerSelector::new();
        assert_eq!(selector.categorize("Add a REST API endpoint"), vec!["api"]);
        // "specific" must not trigger the "ci" keyword
        assert_eq!(selector.categorize("Handle specific cases"), vec![GENERAL_CATEGORY]);
    }

    #[test]
    fn test_categorize_multiple() {
        let selector = WorkerSelector::new();
        let cats = selector.categorize("Login page with password reset and tests");
        assert_eq!(cats, vec!["frontend", "security", "testing"]);
    }

    #[test]
    fn test_rank_prefers_more_matches_then_id() {
        let selector = WorkerSelector::new();
        let workers = vec![
            WorkerDescriptor::new("zeta", ["api"]),
            WorkerDescriptor::new("alpha", ["api"]),
            WorkerDescriptor::new("both", ["api", "database"]),
        ];
        let ranked = selector.rank(&["api".into(), "database".into()], &workers);
        let ids: Vec<_> = ranked.iter().map(|c| c.worker_id.as_str()).collect();
        assert_eq!(ids, vec!["both", "alpha", "zeta"]);
    }

    #[test]
    fn test_rank_falls_back_to_all_workers() {
        let selector = WorkerSelector::new();
        let workers = vec![WorkerDescriptor::new("b", ["x"]), WorkerDescriptor::new("a", ["y"])];
        let ranked = selector.rank(&["z".into()], &workers);
        let ids: Vec<_> = ranked.iter().map(|c| c.worker_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_history_changes_ranking() {
        let mut history = PerformanceHistory::new();
        for _ in 0..4 {
            history.record("alpha", "api", false);
            history.record("zeta", "api", true);
        }
        let selector = WorkerSelector::new().with_history(history);
        let workers = vec![WorkerDescriptor::new("alpha", ["api"]), WorkerDescriptor::new("zeta", ["api"])];

        let ranked = selector.rank(&["api".into()], &workers);
        assert_eq!(ranked[0].worker_id, "zeta");
    }

    #[test]
    fn test_selection_is_deterministic() {
        let selector = WorkerSelector::new();
        let cats = selector.categorize("Design the database schema");
        let first = selector.rank(&cats, &roster());
        let second = selector.rank(&cats, &roster());
        assert_eq!(first, second);
    }

    #[test]
    fn test_assign_respects_pinned_workers() {
        let selector = WorkerSelector::new();
        let mut req = Requirement::new("REQ-001", RequirementKind::Feature, "Build the API", Priority::Critical)
            .with_workers(["frontend"]);
        selector.assign(&mut req, &roster(), 1);
        assert_eq!(req.assigned_worker_ids, vec!["frontend"]);
        assert_eq!(req.candidate_worker_ids, vec!["frontend"]);
    }

    #[test]
    fn test_assign_takes_top_ranked() {
        let selector = WorkerSelector::new();
        let mut req =
            Requirement::new("REQ-001", RequirementKind::Feature, "Write the README", Priority::Optional);
        selector.assign(&mut req, &roster(), 1);
        assert_eq!(req.categories, vec!["documentation"]);
        assert_eq!(req.assigned_worker_ids, vec!["docs"]);
    }

    #[test]
    fn test_extra_rules() {
        let selector = WorkerSelector::new().with_rules([KeywordRule::new("ml", ["model training"])]);
        assert_eq!(selector.categorize("Set up model training"), vec!["ml"]);
    }
}
