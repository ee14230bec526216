//! Change manifest: the author's declaration of what a diff contains.
//!
//! Reconciliation compares the declaration with what the validator derived
//! from version control; every mismatch is its own finding and carries both
//! sides in `details`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::diff::{ChangeRecord, ChangeType};
use crate::core::error::GuardError;
use crate::core::paths::normalize_repo_path;
use crate::core::stage::Stage;
use crate::core::verdict::{Finding, FindingCode, Findings};
use crate::core::zones::ClassifiedChange;

pub const MANIFEST_SCHEMA_VERSION: &str = "change_manifest.v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub change_type: ChangeType,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "zone")]
    pub zone_expected: Option<String>,
}

impl ManifestEntry {
    /// The change this entry declares. Renames take their source from
    /// `old_path` or from a legacy `"old -> new"` path.
    pub fn record(&self) -> Option<ChangeRecord> {
        match self.change_type {
            ChangeType::Renamed => match (&self.old_path, self.path.split_once(" -> ")) {
                (Some(old), _) if !normalize_repo_path(old).is_empty() => {
                    Some(ChangeRecord::renamed(old, &self.path))
                }
                (_, Some((old, new))) => Some(ChangeRecord::renamed(old.trim(), new.trim())),
                _ => None,
            },
            ChangeType::Added => Some(ChangeRecord::added(&self.path)),
            ChangeType::Deleted => Some(ChangeRecord::deleted(&self.path)),
            ChangeType::Modified => Some(ChangeRecord::modified(&self.path)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeManifest {
    #[serde(default)]
    pub artifact_schema_version: String,
    #[serde(default, alias = "base_sha")]
    pub base_revision: Option<String>,
    #[serde(default, alias = "working_sha")]
    pub working_revision: Option<String>,
    #[serde(default)]
    pub changed_files: Vec<ManifestEntry>,
    #[serde(default, alias = "new_paths")]
    pub new_directories: Vec<String>,
    #[serde(default)]
    pub red_ops_observed: Vec<String>,
}

impl ChangeManifest {
    pub fn parse(source: &str, text: &str) -> Result<Self, GuardError> {
        serde_json::from_str(text)
            .map_err(|e| GuardError::ArtifactError(format!("{source}: {e}")))
    }

    /// A manifest that reconciles cleanly against the given derivation.
    pub fn mirror(
        base_revision: &str,
        working_revision: Option<&str>,
        classified: &[ClassifiedChange],
        new_directories: &BTreeSet<String>,
        red_ops: &BTreeSet<String>,
    ) -> Self {
        Self {
            artifact_schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            base_revision: Some(base_revision.to_string()),
            working_revision: working_revision.map(str::to_string),
            changed_files: classified
                .iter()
                .map(|entry| ManifestEntry {
                    change_type: entry.change.change_type,
                    path: entry.change.path.clone(),
                    old_path: entry.change.old_path.clone(),
                    zone_expected: Some(entry.zone().to_string()),
                })
                .collect(),
            new_directories: new_directories.iter().cloned().collect(),
            red_ops_observed: red_ops.iter().cloned().collect(),
        }
    }

    pub fn declared_red_ops(&self) -> BTreeSet<String> {
        self.red_ops_observed
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn to_pretty_json(&self) -> Result<String, GuardError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// What the validator derived, to reconcile a manifest against.
#[derive(Debug, Clone, Copy)]
pub struct Derived<'a> {
    pub stage: Stage,
    pub base_revision: &'a str,
    pub working_revision: Option<&'a str>,
    pub classified: &'a [ClassifiedChange],
    pub new_directories: &'a BTreeSet<String>,
}

/// Equal, or `declared` is an abbreviation (7+ characters) of `actual`.
fn revision_matches(declared: &str, actual: &str) -> bool {
    let declared = declared.trim();
    declared == actual || (declared.len() >= 7 && actual.starts_with(declared))
}

fn multiset_difference(left: &[ChangeRecord], right: &[ChangeRecord]) -> Vec<ChangeRecord> {
    let mut counts: BTreeMap<&ChangeRecord, usize> = BTreeMap::new();
    for record in right {
        *counts.entry(record).or_default() += 1;
    }
    let mut out = Vec::new();
    for record in left {
        match counts.get_mut(record) {
            Some(n) if *n > 0 => *n -= 1,
            _ => out.push(record.clone()),
        }
    }
    out
}

pub fn reconcile(manifest: &ChangeManifest, derived: &Derived<'_>, findings: &mut Findings) {
    if manifest.artifact_schema_version != MANIFEST_SCHEMA_VERSION {
        findings.push(
            Finding::fail(
                FindingCode::ManifestSchema,
                "unsupported change-manifest schema version",
            )
            .with_details(serde_json::json!({
                "declared": manifest.artifact_schema_version,
                "expected": MANIFEST_SCHEMA_VERSION,
            })),
        );
    }

    let mut declared = Vec::new();
    let mut zone_claims: Vec<(ChangeRecord, String)> = Vec::new();
    for entry in &manifest.changed_files {
        let Some(record) = entry.record() else {
            findings.push(
                Finding::fail(
                    FindingCode::ManifestRename,
                    "rename entry needs old_path or an 'old -> new' path",
                )
                .at(normalize_repo_path(&entry.path)),
            );
            continue;
        };
        if let Some(zone) = &entry.zone_expected {
            zone_claims.push((record.clone(), zone.trim().to_string()));
        }
        declared.push(record);
    }

    declared.sort();
    let mut actual: Vec<ChangeRecord> =
        derived.classified.iter().map(|c| c.change.clone()).collect();
    actual.sort();
    let missing = multiset_difference(&actual, &declared);
    let extra = multiset_difference(&declared, &actual);
    if !missing.is_empty() || !extra.is_empty() {
        findings.push(
            Finding::fail(
                FindingCode::ManifestDiffMismatch,
                "change manifest does not match the diff exactly",
            )
            .with_details(serde_json::json!({
                "missing": missing,
                "extra": extra,
                "declared": declared,
                "actual": actual,
            })),
        );
    }

    for (record, zone) in &zone_claims {
        let Some(entry) = derived.classified.iter().find(|c| &c.change == record) else {
            continue;
        };
        if entry.zone() != zone.as_str() {
            findings.push(
                Finding::fail(
                    FindingCode::ManifestZoneMismatch,
                    "declared zone does not match the zone policy",
                )
                .at(entry.path())
                .with_details(serde_json::json!({
                    "declared": zone,
                    "actual": entry.zone(),
                })),
            );
        }
    }

    let base_ok = manifest
        .base_revision
        .as_deref()
        .is_some_and(|b| revision_matches(b, derived.base_revision));
    if !base_ok {
        findings.push(
            Finding::fail(
                FindingCode::ManifestBaseRevisionMismatch,
                "manifest base revision does not match the validator's base",
            )
            .with_details(serde_json::json!({
                "declared": manifest.base_revision,
                "actual": derived.base_revision,
            })),
        );
    }

    if derived.stage.validates_commits() {
        match (manifest.working_revision.as_deref(), derived.working_revision) {
            (None, actual) => findings.push(
                Finding::fail(
                    FindingCode::ManifestWorkingRevisionMissing,
                    format!("working_revision must be set at stage '{}'", derived.stage),
                )
                .with_details(serde_json::json!({ "declared": null, "actual": actual })),
            ),
            (Some(declared), actual)
                if !actual.is_some_and(|a| revision_matches(declared, a)) =>
            {
                findings.push(
                    Finding::fail(
                        FindingCode::ManifestWorkingRevisionMismatch,
                        "manifest working revision does not match HEAD",
                    )
                    .with_details(serde_json::json!({
                        "declared": declared,
                        "actual": actual,
                    })),
                )
            }
            _ => {}
        }
    }

    let declared_dirs: BTreeSet<String> = manifest
        .new_directories
        .iter()
        .map(|d| normalize_repo_path(d))
        .filter(|d| !d.is_empty())
        .collect();
    if &declared_dirs != derived.new_directories {
        findings.push(
            Finding::fail(
                FindingCode::ManifestNewDirectoriesMismatch,
                "declared new directories do not match the detected ones",
            )
            .with_details(serde_json::json!({
                "declared": declared_dirs,
                "actual": derived.new_directories,
            })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::zones::{Classification, ZoneSource};

    fn classified(change: ChangeRecord, zone: &str) -> ClassifiedChange {
        ClassifiedChange {
            change,
            classification: Classification {
                zone: zone.to_string(),
                source: ZoneSource::Folder(String::new()),
            },
        }
    }

    fn sample() -> (Vec<ClassifiedChange>, BTreeSet<String>) {
        (
            vec![
                classified(ChangeRecord::added("plugins/x/new.py"), "yellow-auto"),
                classified(ChangeRecord::renamed("docs/old.md", "docs/new.md"), "green"),
            ],
            BTreeSet::from(["plugins".to_string(), "plugins/x".to_string()]),
        )
    }

    #[test]
    fn mirrored_manifest_reconciles_cleanly() {
        let (entries, dirs) = sample();
        let manifest = ChangeManifest::mirror("abc1234def", Some("fff0000aaa"), &entries, &dirs, &BTreeSet::new());
        let derived = Derived {
            stage: Stage::Ci,
            base_revision: "abc1234def",
            working_revision: Some("fff0000aaa"),
            classified: &entries,
            new_directories: &dirs,
        };
        let mut findings = Findings::new();
        reconcile(&manifest, &derived, &mut findings);
        assert!(findings.is_empty(), "{:?}", findings.codes());

        let reparsed = ChangeManifest::parse("m", &manifest.to_pretty_json().unwrap()).unwrap();
        assert_eq!(reparsed, manifest);
    }

    #[test]
    fn legacy_rename_form_is_accepted() {
        let json = r#"{
            "artifact_schema_version": "change_manifest.v1",
            "base_sha": "abc1234",
            "changed_files": [
                {"change_type": "R", "path": "docs/old.md -> docs/new.md", "zone_expected": "green"},
                {"change_type": "A", "path": "plugins/x/new.py"}
            ],
            "new_paths": ["plugins/x", "plugins"]
        }"#;
        let manifest = ChangeManifest::parse("m", json).unwrap();
        let (entries, dirs) = sample();
        let derived = Derived {
            stage: Stage::Coding,
            base_revision: "abc1234def",
            working_revision: None,
            classified: &entries,
            new_directories: &dirs,
        };
        let mut findings = Findings::new();
        reconcile(&manifest, &derived, &mut findings);
        assert!(findings.is_empty(), "{:?}", findings.codes());
    }

    #[test]
    fn every_mismatch_is_reported() {
        let json = r#"{
            "artifact_schema_version": "change_manifest.v0",
            "base_revision": "0000000",
            "changed_files": [
                {"change_type": "R", "path": "docs/new.md"},
                {"change_type": "A", "path": "plugins/x/new.py", "zone_expected": "green"},
                {"change_type": "M", "path": "src/extra.rs"}
            ],
            "new_directories": ["plugins"]
        }"#;
        let manifest = ChangeManifest::parse("m", json).unwrap();
        let (entries, dirs) = sample();
        let derived = Derived {
            stage: Stage::Verification,
            base_revision: "abc1234def",
            working_revision: Some("fff0000aaa"),
            classified: &entries,
            new_directories: &dirs,
        };
        let mut findings = Findings::new();
        reconcile(&manifest, &derived, &mut findings);
        assert_eq!(
            findings.codes(),
            vec![
                FindingCode::ManifestSchema,
                FindingCode::ManifestRename,
                FindingCode::ManifestDiffMismatch,
                FindingCode::ManifestZoneMismatch,
                FindingCode::ManifestBaseRevisionMismatch,
                FindingCode::ManifestWorkingRevisionMissing,
                FindingCode::ManifestNewDirectoriesMismatch,
            ]
        );
        let diff = findings
            .iter()
            .find(|f| f.code == FindingCode::ManifestDiffMismatch)
            .and_then(|f| f.details.clone())
            .unwrap();
        assert_eq!(diff["missing"][0]["path"], "docs/new.md");
        assert_eq!(diff["extra"][0]["path"], "src/extra.rs");
    }

    #[test]
    fn duplicate_declarations_are_extra() {
        let (entries, dirs) = sample();
        let mut manifest = ChangeManifest::mirror("abc1234", None, &entries, &dirs, &BTreeSet::new());
        manifest.changed_files.push(manifest.changed_files[0].clone());
        let derived = Derived {
            stage: Stage::Coding,
            base_revision: "abc1234",
            working_revision: None,
            classified: &entries,
            new_directories: &dirs,
        };
        let mut findings = Findings::new();
        reconcile(&manifest, &derived, &mut findings);
        assert_eq!(findings.codes(), vec![FindingCode::ManifestDiffMismatch]);
    }

    #[test]
    fn malformed_manifest_is_an_artifact_error() {
        assert!(matches!(
            ChangeManifest::parse("m", "{not json"),
            Err(GuardError::ArtifactError(_))
        ));
    }
}
