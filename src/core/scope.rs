//! Intent scope: allow/deny path patterns and expected zones.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::error::GuardError;
use crate::core::glob::PatternSet;
use crate::core::verdict::{Finding, FindingCode, Findings};
use crate::core::zones::ClassifiedChange;

/// Scope block as written in the intent document or development plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDocument {
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub forbidden_paths: Vec<String>,
    #[serde(default)]
    pub expected_zones: Vec<String>,
}

impl ScopeDocument {
    /// Non-empty lists in `plan` replace the corresponding lists here.
    pub fn overlay(&self, plan: &ScopeDocument) -> ScopeDocument {
        let pick = |ours: &Vec<String>, theirs: &Vec<String>| {
            if theirs.is_empty() {
                ours.clone()
            } else {
                theirs.clone()
            }
        };
        ScopeDocument {
            allowed_paths: pick(&self.allowed_paths, &plan.allowed_paths),
            forbidden_paths: pick(&self.forbidden_paths, &plan.forbidden_paths),
            expected_zones: pick(&self.expected_zones, &plan.expected_zones),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlanSection {
    Allowed,
    Forbidden,
}

/// Read `allowed_paths:` / `forbidden_paths:` bullet lists and an
/// `expected_zones: [a, b]` line out of a markdown development plan.
/// Everything else in the document is ignored.
pub fn parse_development_plan(text: &str) -> ScopeDocument {
    let mut doc = ScopeDocument::default();
    let mut section = None;
    for line in text.lines() {
        let stripped = line.trim();
        if stripped.starts_with("allowed_paths:") {
            section = Some(PlanSection::Allowed);
            continue;
        }
        if stripped.starts_with("forbidden_paths:") {
            section = Some(PlanSection::Forbidden);
            continue;
        }
        if let Some(rest) = stripped.strip_prefix("expected_zones:") {
            doc.expected_zones = inline_list(rest);
            section = None;
            continue;
        }
        let Some(item) = stripped.strip_prefix("- ") else {
            continue;
        };
        let item = unquote(strip_trailing_comment(item).trim());
        if item.is_empty() {
            continue;
        }
        match section {
            Some(PlanSection::Allowed) => doc.allowed_paths.push(item.to_string()),
            Some(PlanSection::Forbidden) => doc.forbidden_paths.push(item.to_string()),
            None => {}
        }
    }
    doc
}

fn strip_trailing_comment(item: &str) -> &str {
    match item.find(" #") {
        Some(idx) => &item[..idx],
        None => item,
    }
}

fn unquote(item: &str) -> &str {
    let quoted = item.len() >= 2
        && ((item.starts_with('"') && item.ends_with('"'))
            || (item.starts_with('\'') && item.ends_with('\'')));
    if quoted { &item[1..item.len() - 1] } else { item }
}

fn inline_list(raw: &str) -> Vec<String> {
    let raw = strip_trailing_comment(raw).trim();
    let inner = raw
        .strip_prefix('[')
        .and_then(|r| r.strip_suffix(']'))
        .unwrap_or(raw);
    inner
        .split(',')
        .map(|z| unquote(z.trim()).to_string())
        .filter(|z| !z.is_empty())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeVerdict {
    Allowed,
    Forbidden { pattern: String },
    NotAllowed,
}

#[derive(Debug, Clone, Default)]
pub struct ScopePlan {
    allowed: PatternSet,
    forbidden: PatternSet,
    expected_zones: BTreeSet<String>,
}

impl ScopePlan {
    pub fn compile(doc: &ScopeDocument) -> Result<Self, GuardError> {
        Ok(Self {
            allowed: PatternSet::compile(&doc.allowed_paths)?,
            forbidden: PatternSet::compile(&doc.forbidden_paths)?,
            expected_zones: doc
                .expected_zones
                .iter()
                .map(|z| z.trim().to_string())
                .filter(|z| !z.is_empty())
                .collect(),
        })
    }

    pub fn has_allow_list(&self) -> bool {
        !self.allowed.is_empty()
    }

    /// Deny wins; otherwise a path is allowed only by an explicit allow match.
    pub fn check(&self, path: &str) -> ScopeVerdict {
        if let Some(pattern) = self.forbidden.first_match(path) {
            return ScopeVerdict::Forbidden {
                pattern: pattern.to_string(),
            };
        }
        if self.allowed.any_match(path) {
            ScopeVerdict::Allowed
        } else {
            ScopeVerdict::NotAllowed
        }
    }

    /// An empty expectation list accepts every zone.
    pub fn zone_expected(&self, zone: &str) -> bool {
        self.expected_zones.is_empty() || self.expected_zones.contains(zone)
    }

    pub fn expected_zones(&self) -> Vec<String> {
        self.expected_zones.iter().cloned().collect()
    }
}

/// Scope and zone-expectation gate.
///
/// Deny patterns are checked against every touched path (both sides of a
/// rename); the allow-list against the destination. `implicitly_allowed`
/// exempts control paths from the allow-list when one is declared.
pub fn enforce_scope(
    plan: &ScopePlan,
    classified: &[ClassifiedChange],
    implicitly_allowed: &dyn Fn(&str) -> bool,
    findings: &mut Findings,
) {
    if !plan.has_allow_list() {
        findings.push(Finding::fail(
            FindingCode::PlanScopeInvalid,
            "intent scope declares no allowed_paths; nothing can be in scope",
        ));
    }

    for entry in classified {
        let denied = entry
            .change
            .touched_paths()
            .into_iter()
            .find_map(|p| match plan.check(p) {
                ScopeVerdict::Forbidden { pattern } => Some((p.to_string(), pattern)),
                _ => None,
            });

        if let Some((path, pattern)) = denied {
            findings.push(
                Finding::fail(
                    FindingCode::PlanForbiddenViolation,
                    format!("path matches forbidden pattern '{pattern}'"),
                )
                .at(path)
                .with_details(serde_json::json!({ "pattern": pattern })),
            );
        } else if plan.check(entry.path()) == ScopeVerdict::NotAllowed
            && !(plan.has_allow_list() && implicitly_allowed(entry.path()))
        {
            findings.push(
                Finding::fail(
                    FindingCode::PlanAllowedViolation,
                    "path is not covered by allowed_paths",
                )
                .at(entry.path()),
            );
        }

        if !plan.zone_expected(entry.zone()) {
            findings.push(
                Finding::fail(
                    FindingCode::ZoneExpectationViolation,
                    format!("zone '{}' is not among the expected zones", entry.zone()),
                )
                .at(entry.path())
                .with_details(serde_json::json!({
                    "zone": entry.zone(),
                    "expected_zones": plan.expected_zones(),
                })),
            );
        }
    }
}
