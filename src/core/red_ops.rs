//! Red-operation detection and declaration reconciliation.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::config_tree::ConfigNode;
use crate::core::diff::ChangeRecord;
use crate::core::error::GuardError;
use crate::core::paths::{is_under, normalize_repo_path};
use crate::core::verdict::{Finding, FindingCode, Findings};

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathRule {
    /// Declared with a trailing `/`: plain string prefix.
    Prefix(String),
    /// The path itself, or anything below it.
    Exact(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedOpRule {
    pub id: String,
    paths: Vec<PathRule>,
    tokens: Vec<String>,
}

impl RedOpRule {
    pub fn new<S: AsRef<str>>(id: &str, paths: &[S], tokens: &[S]) -> Self {
        let paths = paths
            .iter()
            .filter_map(|raw| {
                let raw = raw.as_ref().trim();
                let norm = normalize_repo_path(raw);
                if norm.is_empty() {
                    None
                } else if raw.ends_with('/') {
                    Some(PathRule::Prefix(format!("{norm}/")))
                } else {
                    Some(PathRule::Exact(norm))
                }
            })
            .collect();
        let tokens = tokens
            .iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self {
            id: id.trim().to_string(),
            paths,
            tokens,
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = normalize_repo_path(path);
        let by_path = self.paths.iter().any(|rule| match rule {
            PathRule::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathRule::Exact(exact) => is_under(&path, exact),
        });
        if by_path {
            return true;
        }
        let lowered = path.to_lowercase();
        self.tokens.iter().any(|t| lowered.contains(t.as_str()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RedOpRules {
    rules: Vec<RedOpRule>,
}

impl RedOpRules {
    pub fn new(rules: Vec<RedOpRule>) -> Result<Self, GuardError> {
        let mut seen = BTreeSet::new();
        for rule in &rules {
            if rule.id.is_empty() {
                return Err(GuardError::ConfigError(
                    "red operation without an id".to_string(),
                ));
            }
            if !seen.insert(rule.id.clone()) {
                return Err(GuardError::ConfigError(format!(
                    "red operation '{}' is declared twice",
                    rule.id
                )));
            }
        }
        Ok(Self { rules })
    }

    /// `operations: [{id, match: {paths: [...], patterns: [...]}}]`
    pub fn from_tree(node: &ConfigNode) -> Result<Self, GuardError> {
        let Some(ops) = node.get("operations") else {
            return Ok(Self::default());
        };
        if ops.is_null() {
            return Ok(Self::default());
        }
        let Some(items) = ops.as_list() else {
            return Err(GuardError::ConfigError(
                "operations: expected a list".to_string(),
            ));
        };
        let mut rules = Vec::new();
        for (idx, item) in items.iter().enumerate() {
            let id = item
                .get("id")
                .and_then(ConfigNode::scalar_string)
                .unwrap_or_default();
            let what = format!("operations[{idx}]");
            let (paths, patterns) = match item.get("match") {
                Some(m) if !m.is_null() => (
                    list_at(m, "paths", &what)?,
                    list_at(m, "patterns", &what)?,
                ),
                _ => (Vec::new(), Vec::new()),
            };
            rules.push(RedOpRule::new(&id, &paths, &patterns));
        }
        Self::new(rules)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.rules.iter().map(|r| r.id.clone()).collect()
    }
}

fn list_at(node: &ConfigNode, key: &str, what: &str) -> Result<Vec<String>, GuardError> {
    match node.get(key) {
        Some(n) => n.string_list(&format!("{what}.match.{key}")),
        None => Ok(Vec::new()),
    }
}

/// Detected operations and the paths that triggered each.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub triggers: BTreeMap<String, BTreeSet<String>>,
}

impl Detection {
    pub fn ids(&self) -> BTreeSet<String> {
        self.triggers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}

/// Both sides of a rename are candidates.
pub fn detect(changes: &[ChangeRecord], rules: &RedOpRules) -> Detection {
    let mut triggers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for change in changes {
        for path in change.touched_paths() {
            for rule in rules.rules.iter().filter(|r| r.matches(path)) {
                triggers
                    .entry(rule.id.clone())
                    .or_default()
                    .insert(path.to_string());
            }
        }
    }
    Detection { triggers }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclarationSource {
    /// `red_ops_observed` of the change manifest; must match exactly.
    Manifest,
    /// `red_ops_declared` of the intent; advisory.
    Intent,
}

pub fn reconcile(
    detection: &Detection,
    declared: &BTreeSet<String>,
    source: DeclarationSource,
    findings: &mut Findings,
) {
    for (op, paths) in &detection.triggers {
        if declared.contains(op) {
            continue;
        }
        let message = format!("red operation '{op}' detected but not declared");
        let finding = match source {
            DeclarationSource::Manifest => Finding::fail(FindingCode::RedOpUndeclared, message),
            DeclarationSource::Intent => Finding::warn(FindingCode::RedOpUndeclared, message),
        };
        findings.push(finding.with_details(serde_json::json!({
            "operation": op,
            "paths": paths,
        })));
    }

    if source == DeclarationSource::Manifest {
        let detected = detection.ids();
        let extra: Vec<&String> = declared.difference(&detected).collect();
        if !extra.is_empty() {
            findings.push(
                Finding::fail(
                    FindingCode::ManifestRedOpsNotSubset,
                    "manifest declares red operations the diff does not contain",
                )
                .with_details(serde_json::json!({
                    "declared": declared,
                    "detected": detected,
                    "undetected": extra,
                })),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config_tree::parse_yaml_subset;

    fn rules() -> RedOpRules {
        let tree = parse_yaml_subset(
            "operations:\n  - id: secrets\n    match:\n      paths:\n        - secrets/\n        - config/prod.env\n      patterns: [Credential]\n  - id: ci-change\n    match:\n      paths: [.github/workflows/]\n",
        )
        .unwrap();
        RedOpRules::from_tree(&tree).unwrap()
    }

    #[test]
    fn paths_prefixes_and_tokens_match() {
        let r = rules();
        let detection = detect(
            &[
                ChangeRecord::modified("secrets/api.key"),
                ChangeRecord::modified("config/prod.env"),
                ChangeRecord::added("docs/CREDENTIALS.md"),
                ChangeRecord::modified("config/prod.env.example"),
                ChangeRecord::modified(".github/workflows/ci.yml"),
            ],
            &r,
        );
        assert_eq!(
            detection.ids(),
            BTreeSet::from(["ci-change".to_string(), "secrets".to_string()])
        );
        let secret_paths = &detection.triggers["secrets"];
        assert!(secret_paths.contains("docs/CREDENTIALS.md"));
        assert!(!secret_paths.contains("config/prod.env.example"));
    }

    #[test]
    fn rename_source_counts() {
        let detection = detect(&[ChangeRecord::renamed("secrets/a.key", "public/a.key")], &rules());
        assert_eq!(detection.ids(), BTreeSet::from(["secrets".to_string()]));
    }

    #[test]
    fn duplicate_or_missing_ids_are_config_errors() {
        let dup = parse_yaml_subset("operations:\n  - id: a\n  - id: a\n").unwrap();
        assert!(matches!(RedOpRules::from_tree(&dup), Err(GuardError::ConfigError(_))));
        let missing = parse_yaml_subset("operations:\n  - match:\n      paths: [x/]\n").unwrap();
        assert!(matches!(RedOpRules::from_tree(&missing), Err(GuardError::ConfigError(_))));
    }

    #[test]
    fn manifest_declarations_must_match_exactly() {
        let detection = detect(&[ChangeRecord::modified("secrets/a.key")], &rules());

        let mut findings = Findings::new();
        reconcile(
            &detection,
            &BTreeSet::from(["secrets".to_string(), "ci-change".to_string()]),
            DeclarationSource::Manifest,
            &mut findings,
        );
        assert_eq!(findings.codes(), vec![FindingCode::ManifestRedOpsNotSubset]);

        let mut findings = Findings::new();
        reconcile(&detection, &BTreeSet::new(), DeclarationSource::Manifest, &mut findings);
        assert_eq!(findings.codes(), vec![FindingCode::RedOpUndeclared]);
        assert!(findings.has_failures());
    }

    #[test]
    fn intent_declarations_only_warn() {
        let detection = detect(&[ChangeRecord::modified("secrets/a.key")], &rules());
        let mut findings = Findings::new();
        reconcile(
            &detection,
            &BTreeSet::from(["ci-change".to_string()]),
            DeclarationSource::Intent,
            &mut findings,
        );
        assert_eq!(findings.codes(), vec![FindingCode::RedOpUndeclared]);
        assert!(!findings.has_failures());
    }
}
