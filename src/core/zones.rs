//! Zone classification.
//!
//! Precedence, first hit wins:
//! 1. exact file override
//! 2. new-folder quarantine (path sits in a directory absent at base and no
//!    non-root folder prefix covers it)
//! 3. longest matching folder prefix (the root prefix `""` included)
//! 4. `yellow-auto`
//!
//! Also home of the protected-zone gate, which needs the classification and
//! the intent's kernel-upgrade allowlist.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::core::config_tree::ConfigNode;
use crate::core::diff::ChangeRecord;
use crate::core::error::GuardError;
use crate::core::glob::PatternSet;
use crate::core::paths::{ancestor_dirs, normalize_dir_prefix, normalize_repo_path};
use crate::core::stage::Stage;
use crate::core::verdict::{Finding, FindingCode, Findings};

/// Zone assigned to anything the policy does not cover.
pub const YELLOW_AUTO: &str = "yellow-auto";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "prefix", rename_all = "snake_case")]
pub enum ZoneSource {
    FileOverride,
    NewFolderQuarantine,
    Folder(String),
    Unclassified,
}

impl ZoneSource {
    pub fn label(&self) -> String {
        match self {
            ZoneSource::FileOverride => "file override".to_string(),
            ZoneSource::NewFolderQuarantine => "new-folder quarantine".to_string(),
            ZoneSource::Folder(prefix) if prefix.is_empty() => "root folder rule".to_string(),
            ZoneSource::Folder(prefix) => format!("folder '{}'", prefix.trim_end_matches('/')),
            ZoneSource::Unclassified => "unclassified".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub zone: String,
    pub source: ZoneSource,
}

impl Classification {
    /// Quarantined paths need explicit classification before they are trusted.
    pub fn is_quarantined(&self) -> bool {
        matches!(
            self.source,
            ZoneSource::Unclassified | ZoneSource::NewFolderQuarantine
        ) || self.zone == YELLOW_AUTO
    }
}

#[derive(Debug, Clone)]
pub struct ClassifiedChange {
    pub change: ChangeRecord,
    pub classification: Classification,
}

impl ClassifiedChange {
    pub fn path(&self) -> &str {
        &self.change.path
    }

    pub fn zone(&self) -> &str {
        &self.classification.zone
    }
}

#[derive(Debug, Clone)]
pub struct ZonePolicy {
    /// Normalized prefixes, longest first.
    folder_zones: Vec<(String, String)>,
    file_overrides: BTreeMap<String, String>,
    default_new_folder_zone: String,
    protected_zones: BTreeSet<String>,
}

impl ZonePolicy {
    pub fn new(
        folder_zones: &BTreeMap<String, String>,
        file_overrides: &BTreeMap<String, String>,
        default_new_folder_zone: &str,
    ) -> Result<Self, GuardError> {
        let mut prefixes: BTreeMap<String, String> = BTreeMap::new();
        for (raw, zone) in folder_zones {
            let zone = validate_zone_name(zone, raw)?;
            let prefix = normalize_dir_prefix(raw);
            if let Some(existing) = prefixes.insert(prefix.clone(), zone) {
                return Err(GuardError::ConfigError(format!(
                    "folder_zones: '{raw}' duplicates prefix '{prefix}' (already mapped to '{existing}')"
                )));
            }
        }
        let mut folder_zones: Vec<(String, String)> = prefixes.into_iter().collect();
        folder_zones.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        let mut overrides = BTreeMap::new();
        for (raw, zone) in file_overrides {
            let zone = validate_zone_name(zone, raw)?;
            let path = normalize_repo_path(raw);
            if path.is_empty() {
                return Err(GuardError::ConfigError(
                    "file_overrides: empty path".to_string(),
                ));
            }
            if overrides.insert(path.clone(), zone).is_some() {
                return Err(GuardError::ConfigError(format!(
                    "file_overrides: '{raw}' duplicates '{path}'"
                )));
            }
        }

        Ok(Self {
            folder_zones,
            file_overrides: overrides,
            default_new_folder_zone: validate_zone_name(default_new_folder_zone, "new_folder_zone")?,
            protected_zones: BTreeSet::from(["purple".to_string()]),
        })
    }

    pub fn with_protected_zones<I, S>(mut self, zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protected_zones = zones.into_iter().map(Into::into).collect();
        self
    }

    /// Build from a parsed `zones` control file.
    pub fn from_tree(node: &ConfigNode) -> Result<Self, GuardError> {
        let folder_zones = match node.get("folder_zones") {
            Some(n) => n.string_map("folder_zones")?,
            None => BTreeMap::new(),
        };
        let file_overrides = match node.get("file_overrides") {
            Some(n) => n.string_map("file_overrides")?,
            None => BTreeMap::new(),
        };
        let default_zone = node
            .lookup(&["defaults", "new_folder_zone"])
            .and_then(ConfigNode::scalar_string)
            .unwrap_or_else(|| YELLOW_AUTO.to_string());
        let policy = Self::new(&folder_zones, &file_overrides, &default_zone)?;
        match node.get("protected_zones") {
            Some(n) => Ok(policy.with_protected_zones(n.string_list("protected_zones")?)),
            None => Ok(policy),
        }
    }

    pub fn default_new_folder_zone(&self) -> &str {
        &self.default_new_folder_zone
    }

    pub fn is_protected(&self, zone: &str) -> bool {
        self.protected_zones.contains(zone)
    }

    pub fn classify(&self, path: &str, new_dirs: &BTreeSet<String>) -> Classification {
        let path = normalize_repo_path(path);
        if let Some(zone) = self.file_overrides.get(&path) {
            return Classification {
                zone: zone.clone(),
                source: ZoneSource::FileOverride,
            };
        }

        let folder = self
            .folder_zones
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()));

        let under_classified_parent = folder.is_some_and(|(prefix, _)| !prefix.is_empty());
        let in_new_dir = ancestor_dirs(&path).iter().any(|d| new_dirs.contains(d));
        if in_new_dir && !under_classified_parent {
            return Classification {
                zone: self.default_new_folder_zone.clone(),
                source: ZoneSource::NewFolderQuarantine,
            };
        }

        match folder {
            Some((prefix, zone)) => Classification {
                zone: zone.clone(),
                source: ZoneSource::Folder(prefix.clone()),
            },
            None => Classification {
                zone: YELLOW_AUTO.to_string(),
                source: ZoneSource::Unclassified,
            },
        }
    }

    pub fn classify_all(
        &self,
        changes: &[ChangeRecord],
        new_dirs: &BTreeSet<String>,
    ) -> Vec<ClassifiedChange> {
        changes
            .iter()
            .map(|change| ClassifiedChange {
                classification: self.classify(&change.path, new_dirs),
                change: change.clone(),
            })
            .collect()
    }
}

fn validate_zone_name(zone: &str, key: &str) -> Result<String, GuardError> {
    let zone = zone.trim();
    if zone.is_empty() {
        return Err(GuardError::ConfigError(format!(
            "zone for '{key}' must not be empty"
        )));
    }
    Ok(zone.to_string())
}

/// Emit quarantine findings: failures from level 2 up, warnings below.
pub fn enforce_quarantine(classified: &[ClassifiedChange], hard_fail: bool, findings: &mut Findings) {
    for entry in classified.iter().filter(|e| e.classification.is_quarantined()) {
        let message = match entry.classification.source {
            ZoneSource::NewFolderQuarantine => {
                "path is in a new folder without a classified parent".to_string()
            }
            _ => format!("path resolves to zone '{}' and needs classification", entry.zone()),
        };
        let finding = if hard_fail {
            Finding::fail(FindingCode::YellowAutoQuarantine, message)
        } else {
            Finding::warn(FindingCode::YellowAutoQuarantine, message)
        };
        findings.push(finding.at(entry.path()).with_details(serde_json::json!({
            "zone": entry.zone(),
            "source": entry.classification.source,
        })));
    }
}

/// Protected zones may only change through a kernel-upgrade intent at a
/// commit-validating stage, and only on allowlisted paths.
pub fn enforce_protected_zones(
    policy: &ZonePolicy,
    classified: &[ClassifiedChange],
    stage: Stage,
    kernel_allowlist: &PatternSet,
    findings: &mut Findings,
) {
    let touched: Vec<&ClassifiedChange> = classified
        .iter()
        .filter(|e| policy.is_protected(e.zone()))
        .collect();
    if touched.is_empty() {
        return;
    }

    if kernel_allowlist.is_empty() {
        for entry in touched {
            findings.push(
                Finding::fail(
                    FindingCode::ProtectedZoneTouched,
                    format!(
                        "zone '{}' is protected; only a kernel-upgrade intent may change it",
                        entry.zone()
                    ),
                )
                .at(entry.path()),
            );
        }
        return;
    }

    for entry in touched {
        if !stage.permits_irreversible_transitions() {
            findings.push(
                Finding::fail(
                    FindingCode::KernelUpgradeForbiddenStage,
                    format!("kernel upgrades are not accepted at stage '{stage}'"),
                )
                .at(entry.path()),
            );
        } else if !kernel_allowlist.any_match(entry.path()) {
            findings.push(
                Finding::fail(
                    FindingCode::ProtectedTouchedNotAllowlisted,
                    "protected path is not in the kernel-upgrade allowlist",
                )
                .at(entry.path())
                .with_details(serde_json::json!({
                    "zone": entry.zone(),
                    "allow_protected_paths": kernel_allowlist.patterns(),
                })),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ZonePolicy {
        let folders: BTreeMap<String, String> = [
            ("", "green"),
            ("src/", "green"),
            ("src/core/", "red"),
            ("infra", "purple"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let overrides: BTreeMap<String, String> = [("src/core/README.md", "green")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ZonePolicy::new(&folders, &overrides, YELLOW_AUTO).unwrap()
    }

    fn dirs(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn longest_prefix_wins() {
        let p = policy();
        let none = BTreeSet::new();
        assert_eq!(p.classify("src/core/kernel.rs", &none).zone, "red");
        assert_eq!(p.classify("src/lib.rs", &none).zone, "green");
        assert_eq!(
            p.classify("src/lib.rs", &none).source,
            ZoneSource::Folder("src/".to_string())
        );
        assert_eq!(p.classify("infra/main.tf", &none).zone, "purple");
        assert_eq!(p.classify("README.md", &none).source, ZoneSource::Folder(String::new()));
    }

    #[test]
    fn file_override_beats_everything() {
        let p = policy();
        let c = p.classify("./src/core/README.md", &dirs(&["src/core"]));
        assert_eq!(c.zone, "green");
        assert_eq!(c.source, ZoneSource::FileOverride);
    }

    #[test]
    fn new_folder_without_classified_parent_is_quarantined() {
        let p = policy();
        let c = p.classify("plugins/x/new.py", &dirs(&["plugins", "plugins/x"]));
        assert_eq!(c.zone, YELLOW_AUTO);
        assert_eq!(c.source, ZoneSource::NewFolderQuarantine);
        assert!(c.is_quarantined());
    }

    #[test]
    fn new_folder_under_classified_parent_inherits() {
        let p = policy();
        let c = p.classify("src/fresh/mod.rs", &dirs(&["src/fresh"]));
        assert_eq!(c.zone, "green");
        assert!(!c.is_quarantined());
    }

    #[test]
    fn uncovered_paths_fall_to_yellow_auto() {
        let folders = BTreeMap::from([("src".to_string(), "green".to_string())]);
        let p = ZonePolicy::new(&folders, &BTreeMap::new(), YELLOW_AUTO).unwrap();
        let c = p.classify("docs/a.md", &BTreeSet::new());
        assert_eq!(c.zone, YELLOW_AUTO);
        assert_eq!(c.source, ZoneSource::Unclassified);
    }

    #[test]
    fn prefixes_that_normalize_equal_are_rejected() {
        let folders = BTreeMap::from([
            ("src".to_string(), "green".to_string()),
            ("./src/".to_string(), "red".to_string()),
        ]);
        assert!(matches!(
            ZonePolicy::new(&folders, &BTreeMap::new(), YELLOW_AUTO),
            Err(GuardError::ConfigError(_))
        ));
    }

    #[test]
    fn protected_zone_requires_kernel_upgrade() {
        let p = policy();
        let classified = p.classify_all(&[ChangeRecord::modified("infra/main.tf")], &BTreeSet::new());
        let mut findings = Findings::new();
        enforce_protected_zones(&p, &classified, Stage::Ci, &PatternSet::default(), &mut findings);
        assert_eq!(findings.codes(), vec![FindingCode::ProtectedZoneTouched]);
    }

    #[test]
    fn kernel_upgrade_is_stage_and_allowlist_bound() {
        let p = policy();
        let classified = p.classify_all(
            &[
                ChangeRecord::modified("infra/main.tf"),
                ChangeRecord::modified("infra/secrets.tf"),
            ],
            &BTreeSet::new(),
        );
        let allow = PatternSet::compile(&["infra/main.tf"]).unwrap();

        let mut findings = Findings::new();
        enforce_protected_zones(&p, &classified, Stage::Coding, &allow, &mut findings);
        assert_eq!(
            findings.codes(),
            vec![
                FindingCode::KernelUpgradeForbiddenStage,
                FindingCode::KernelUpgradeForbiddenStage,
            ]
        );

        let mut findings = Findings::new();
        enforce_protected_zones(&p, &classified, Stage::Verification, &allow, &mut findings);
        assert_eq!(findings.codes(), vec![FindingCode::ProtectedTouchedNotAllowlisted]);
        assert_eq!(findings.as_slice()[0].path.as_deref(), Some("infra/secrets.tf"));
    }

    #[test]
    fn quarantine_severity_follows_level() {
        let p = policy();
        let classified = p.classify_all(&[ChangeRecord::added("plugins/x/new.py")], &dirs(&["plugins", "plugins/x"]));
        let mut soft = Findings::new();
        enforce_quarantine(&classified, false, &mut soft);
        assert!(!soft.has_failures());
        assert_eq!(soft.len(), 1);

        let mut hard = Findings::new();
        enforce_quarantine(&classified, true, &mut hard);
        assert!(hard.has_failures());
    }
}
