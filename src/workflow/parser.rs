//! Requirement document parser.
//!
//! Reads a YAML, JSON or TOML document with `features`, `technical` and
//! `constraints` lists and turns it into typed [`Requirement`] records with
//! generated ids. Every problem in the document is collected before
//! failing, so a single run reports all of them.
//!
//! ```yaml
//! project: shop
//! features:
//!   - "Product catalogue page"
//!   - description: "Checkout API"
//!     priority: critical
//!     depends_on: [TECH-001]
//! technical:
//!   - description: "Postgres schema"
//!     workers: [database]
//! constraints:
//!   - "Rust 2021 only"
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde_json::Value;

use super::requirement::{Priority, Requirement, RequirementKind};
use crate::core::{EngineResult, ValidationError};

/// Serialization format of a requirement document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
    Toml,
}

impl DocumentFormat {
    /// Pick the format from a file extension (YAML when unknown).
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()).map(str::to_lowercase).as_deref() {
            Some("json") => Self::Json,
            Some("toml") => Self::Toml,
            _ => Self::Yaml,
        }
    }
}

/// Output of the parser.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequirements {
    /// Project name, if given
    pub project: Option<String>,

    /// Requirements in first-seen order (features, then technical items)
    pub requirements: Vec<Requirement>,

    /// Constraints appended to every task input
    pub constraints: Vec<String>,
}

/// One raw entry before ids are checked.
struct RawEntry {
    field: String,
    requirement: Requirement,
    depends_on: Vec<String>,
}

/// Parses requirement documents.
#[derive(Debug, Clone, Default)]
pub struct RequirementParser {
    known_workers: Option<HashSet<String>>,
}

impl RequirementParser {
    /// Create a parser that accepts any worker id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject worker ids outside the given roster.
    #[must_use]
    pub fn with_known_workers<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_workers = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Parse a file, choosing the format by extension.
    pub fn parse_file(&self, path: &Path) -> EngineResult<ParsedRequirements> {
        let content = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "Parsing requirement document");
        self.parse_str(&content, DocumentFormat::from_path(path))
    }

    /// Parse document text.
    pub fn parse_str(&self, content: &str, format: DocumentFormat) -> EngineResult<ParsedRequirements> {
        let value: Value = match format {
            DocumentFormat::Yaml => serde_yaml::from_str(content)?,
            DocumentFormat::Json => serde_json::from_str(content)?,
            DocumentFormat::Toml => toml::from_str(content)?,
        };
        Ok(self.parse_value(&value)?)
    }

    /// Validate and convert an already-decoded document.
    pub fn parse_value(&self, value: &Value) -> Result<ParsedRequirements, ValidationError> {
        let mut errors = ValidationError::new();

        let Some(doc) = value.as_object() else {
            errors.push("document", "expected a mapping with `features` and/or `technical` lists");
            return Err(errors);
        };

        let project = match doc.get("project") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(name.trim().to_string()).filter(|n| !n.is_empty()),
            Some(_) => {
                errors.push("project", "expected a string");
                None
            }
        };

        let mut entries = Vec::new();
        let mut supplied = 0;
        for (key, kind) in [
            ("features", RequirementKind::Feature),
            ("requirements", RequirementKind::Feature),
            ("technical", RequirementKind::Technical),
            ("technical_requirements", RequirementKind::Technical),
        ] {
            let Some(list) = doc.get(key) else { continue };
            let Some(items) = list.as_array() else {
                errors.push(key, "expected a list");
                continue;
            };
            supplied += items.len();
            for (idx, item) in items.iter().enumerate() {
                let field = format!("{key}[{idx}]");
                let next_n = entries.iter().filter(|e: &&RawEntry| e.requirement.kind == kind).count() + 1;
                if let Some(entry) = parse_entry(item, &field, kind, next_n, &mut errors) {
                    entries.push(entry);
                }
            }
        }

        let constraints = match doc.get("constraints") {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => string_list(value, "constraints", &mut errors),
        };

        if supplied == 0 {
            errors.push("features", "at least one feature or technical requirement is required");
        }

        let ids: HashSet<String> = entries.iter().map(|e| e.requirement.id.clone()).collect();
        for entry in &entries {
            for dep in &entry.depends_on {
                if dep == &entry.requirement.id {
                    errors.push(format!("{}.depends_on", entry.field), format!("{dep} depends on itself"));
                } else if !ids.contains(dep) {
                    errors.push(format!("{}.depends_on", entry.field), format!("unknown requirement id '{dep}'"));
                }
            }
            if let Some(known) = &self.known_workers {
                for worker in &entry.requirement.assigned_worker_ids {
                    if !known.contains(worker) {
                        errors.push(format!("{}.workers", entry.field), format!("unknown worker id '{worker}'"));
                    }
                }
            }
        }

        errors.into_result()?;

        let requirements = entries
            .into_iter()
            .map(|e| e.requirement.with_dependencies(e.depends_on))
            .collect::<Vec<_>>();
        tracing::info!(requirements = requirements.len(), constraints = constraints.len(), "Parsed requirements");
        Ok(ParsedRequirements { project, requirements, constraints })
    }
}

fn parse_entry(
    item: &Value,
    field: &str,
    kind: RequirementKind,
    n: usize,
    errors: &mut ValidationError,
) -> Option<RawEntry> {
    let id = kind.format_id(n);
    match item {
        Value::String(text) => {
            if text.trim().is_empty() {
                errors.push(field, "description must not be empty");
            }
            Some(RawEntry {
                field: field.to_string(),
                requirement: Requirement::new(id, kind, text.trim(), Priority::default()),
                depends_on: Vec::new(),
            })
        }
        Value::Object(map) => {
            let description = match map.get("description") {
                Some(Value::String(text)) if !text.trim().is_empty() => text.trim().to_string(),
                Some(Value::String(_)) => {
                    errors.push(format!("{field}.description"), "must not be empty");
                    String::new()
                }
                Some(_) => {
                    errors.push(format!("{field}.description"), "expected a string");
                    String::new()
                }
                None => {
                    errors.push(format!("{field}.description"), "missing");
                    String::new()
                }
            };

            let priority = match map.get("priority") {
                None | Some(Value::Null) => Priority::default(),
                Some(Value::String(label)) => Priority::parse(label).unwrap_or_else(|| {
                    errors.push(format!("{field}.priority"), format!("unknown priority '{label}'"));
                    Priority::default()
                }),
                Some(_) => {
                    errors.push(format!("{field}.priority"), "expected a string");
                    Priority::default()
                }
            };

            let list = |key: &str, errors: &mut ValidationError| match map.get(key) {
                None | Some(Value::Null) => Vec::new(),
                Some(value) => string_list(value, &format!("{field}.{key}"), errors),
            };
            let depends_on = list("depends_on", errors);
            let workers = list("workers", errors);
            let acceptance = list("acceptance", errors);

            for key in map.keys() {
                if !matches!(key.as_str(), "description" | "priority" | "depends_on" | "workers" | "acceptance") {
                    tracing::warn!(field = %field, key = %key, "Ignoring unknown requirement field");
                }
            }

            let mut requirement = Requirement::new(id, kind, description, priority).with_workers(workers);
            requirement.acceptance = acceptance;
            Some(RawEntry { field: field.to_string(), requirement, depends_on })
        }
        _ => {
            errors.push(field, "expected a string or a mapping");
            None
        }
    }
}

fn string_list(value: &Value, field: &str, errors: &mut ValidationError) -> Vec<String> {
    let Some(items) = value.as_array() else {
        errors.push(field, "expected a list of strings");
        return Vec::new();
    };
    let mut out = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        match item.as_str() {
            Some(text) if !text.trim().is_empty() => out.push(text.trim().to_string()),
            _ => errors.push(format!("{field}[{idx}]"), "expected a non-empty string"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EngineError;

    const SAMPLE: &str = r#"
project: shop
features:
  - "Product catalogue page"
  - description: "Checkout API"
    priority: critical
    depends_on: [TECH-001]
    acceptance: ["returns 201"]
technical:
  - description: "Postgres schema"
    workers: [database]
constraints:
  - "Rust 2021 only"
"#;

    #[test]
    fn test_parse_yaml_document() {
        let parsed = RequirementParser::new().parse_str(SAMPLE, DocumentFormat::Yaml).unwrap();

        assert_eq!(parsed.project.as_deref(), Some("shop"));
        let ids: Vec<_> = parsed.requirements.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["REQ-001", "REQ-002", "TECH-001"]);

        let checkout = &parsed.requirements[1];
        assert_eq!(checkout.priority, Priority::Critical);
        assert!(checkout.dependency_ids.contains("TECH-001"));
        assert_eq!(checkout.acceptance, vec!["returns 201"]);
        assert_eq!(parsed.requirements[0].priority, Priority::Important);
        assert_eq!(parsed.requirements[2].assigned_worker_ids, vec!["database"]);
        assert_eq!(parsed.constraints, vec!["Rust 2021 only"]);
    }

    #[test]
    fn test_parse_json_and_toml() {
        let json = r#"{"features": [{"description": "Login", "priority": "high"}]}"#;
        let parsed = RequirementParser::new().parse_str(json, DocumentFormat::Json).unwrap();
        assert_eq!(parsed.requirements[0].priority, Priority::Critical);

        let toml = "technical = [\"CI pipeline\"]\n";
        let parsed = RequirementParser::new().parse_str(toml, DocumentFormat::Toml).unwrap();
        assert_eq!(parsed.requirements[0].id, "TECH-001");
    }

    #[test]
    fn test_empty_document_rejected() {
        let err = RequirementParser::new().parse_str("project: x\n", DocumentFormat::Yaml).unwrap_err();
        match err {
            EngineError::Validation(v) => {
                assert_eq!(v.len(), 1);
                assert!(v.violations[0].message.contains("at least one"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_requirements_reported_with_other_problems() {
        let err = RequirementParser::new()
            .parse_str("project: 42\nconstraints: []\n", DocumentFormat::Yaml)
            .unwrap_err();
        match err {
            EngineError::Validation(v) => {
                let fields: Vec<_> = v.violations.iter().map(|v| v.field.as_str()).collect();
                assert_eq!(fields, vec!["project", "features"]);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_all_violations_collected() {
        let doc = r#"
features:
  - description: ""
  - description: "A"
    priority: urgent
    depends_on: [REQ-009, REQ-002]
  - 42
constraints: "not a list"
"#;
        let err = RequirementParser::new()
            .parse_value(&serde_yaml::from_str::<Value>(doc).unwrap())
            .unwrap_err();
        let fields: Vec<_> = err.violations.iter().map(|v| v.field.as_str()).collect();

        assert!(fields.contains(&"features[0].description"));
        assert!(fields.contains(&"features[1].priority"));
        assert!(fields.contains(&"features[2]"));
        assert!(fields.contains(&"constraints"));
        assert!(fields.contains(&"features[1].depends_on"));
        let deps: Vec<_> =
            err.violations.iter().filter(|v| v.field == "features[1].depends_on").collect();
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn test_unknown_worker_rejected() {
        let doc = r#"{"features": [{"description": "A", "workers": ["ghost"]}]}"#;
        let err = RequirementParser::new()
            .with_known_workers(["backend"])
            .parse_str(doc, DocumentFormat::Json)
            .unwrap_err();
        assert!(err.to_string().contains("unknown worker id 'ghost'"));
    }

    #[test]
    fn test_non_mapping_rejected() {
        let err = RequirementParser::new().parse_str("- a\n- b\n", DocumentFormat::Yaml).unwrap_err();
        assert!(err.to_string().contains("document: expected a mapping"));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(DocumentFormat::from_path(Path::new("r.JSON")), DocumentFormat::Json);
        assert_eq!(DocumentFormat::from_path(Path::new("r.toml")), DocumentFormat::Toml);
        assert_eq!(DocumentFormat::from_path(Path::new("r.yml")), DocumentFormat::Yaml);
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reqs.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let parsed = RequirementParser::new().parse_file(&path).unwrap();
        assert_eq!(parsed.requirements.len(), 3);
    }
}
