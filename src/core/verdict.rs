//! Findings and verdict assembly.
//!
//! A run appends [`Finding`]s to a [`Findings`] list; nothing is ever removed.
//! The verdict is derived from the list once evaluation is complete: any
//! `fail` finding fails the run, and the highest-precedence [`FailCategory`]
//! among the failures selects the process exit code.

use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;

pub const EXIT_PASS: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Fail,
    Warn,
}

/// Failure classes, declared in precedence order (highest first).
/// The first two only ever come from an aborted run. `ProtectedZone` and
/// `Lifecycle` rank below every other policy class, just above `Uncategorized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailCategory {
    RoutingInvalid,
    ConfigInvalid,
    ArtifactInvalid,
    ManifestMismatch,
    Quarantine,
    RedOperation,
    ZoneExpectation,
    ScopePlan,
    ProtectedZone,
    Lifecycle,
    Uncategorized,
}

impl FailCategory {
    pub const ALL: [FailCategory; 11] = [
        FailCategory::RoutingInvalid,
        FailCategory::ConfigInvalid,
        FailCategory::ArtifactInvalid,
        FailCategory::ManifestMismatch,
        FailCategory::Quarantine,
        FailCategory::RedOperation,
        FailCategory::ZoneExpectation,
        FailCategory::ScopePlan,
        FailCategory::ProtectedZone,
        FailCategory::Lifecycle,
        FailCategory::Uncategorized,
    ];

    pub fn exit_code(self) -> i32 {
        match self {
            FailCategory::RoutingInvalid => 10,
            FailCategory::ConfigInvalid => 15,
            FailCategory::ArtifactInvalid => 20,
            FailCategory::ZoneExpectation => 30,
            FailCategory::ProtectedZone => 35,
            FailCategory::RedOperation => 40,
            FailCategory::Lifecycle => 45,
            FailCategory::ScopePlan => 50,
            FailCategory::Quarantine => 60,
            FailCategory::ManifestMismatch => 70,
            FailCategory::Uncategorized => 80,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailCategory::RoutingInvalid => "routing_invalid",
            FailCategory::ConfigInvalid => "config_invalid",
            FailCategory::ArtifactInvalid => "artifact_invalid",
            FailCategory::ManifestMismatch => "manifest_mismatch",
            FailCategory::Quarantine => "quarantine",
            FailCategory::RedOperation => "red_operation",
            FailCategory::ZoneExpectation => "zone_expectation",
            FailCategory::ScopePlan => "scope_plan",
            FailCategory::ProtectedZone => "protected_zone",
            FailCategory::Lifecycle => "lifecycle",
            FailCategory::Uncategorized => "uncategorized",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FindingCode {
    // artifacts / abort
    MissingArtifact,
    MissingManifest,
    ValidatorAbort,
    // manifest
    ManifestSchema,
    ManifestRename,
    ManifestZoneMismatch,
    ManifestDiffMismatch,
    ManifestBaseRevisionMismatch,
    ManifestWorkingRevisionMissing,
    ManifestWorkingRevisionMismatch,
    ManifestNewDirectoriesMismatch,
    ManifestRedOpsNotSubset,
    // quarantine
    YellowAutoQuarantine,
    // red operations
    RedOpUndeclared,
    // zones
    ZoneExpectationViolation,
    ProtectedZoneTouched,
    ProtectedTouchedNotAllowlisted,
    KernelUpgradeForbiddenStage,
    IntentStorageOutsideActivePack,
    // scope
    PlanScopeInvalid,
    PlanAllowedViolation,
    PlanForbiddenViolation,
    // lifecycle
    ActiveIntentIdMismatch,
    ClosedToOpenForbidden,
    ClosedIntentImmutable,
    CloseForbiddenStage,
    CloseTransactionMixedChanges,
    PointerChangedInCoding,
    SwitchTransactionMixedChanges,
    ClosedIntentNotActivatable,
    SwitchAndCloseCombined,
    // workspace
    DirtyWorktree,
    UntrackedPresent,
}

impl FindingCode {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingCode::MissingArtifact => "MISSING_ARTIFACT",
            FindingCode::MissingManifest => "MISSING_MANIFEST",
            FindingCode::ValidatorAbort => "VALIDATOR_ABORT",
            FindingCode::ManifestSchema => "MANIFEST_SCHEMA",
            FindingCode::ManifestRename => "MANIFEST_RENAME",
            FindingCode::ManifestZoneMismatch => "MANIFEST_ZONE_MISMATCH",
            FindingCode::ManifestDiffMismatch => "MANIFEST_DIFF_MISMATCH",
            FindingCode::ManifestBaseRevisionMismatch => "MANIFEST_BASE_REVISION_MISMATCH",
            FindingCode::ManifestWorkingRevisionMissing => "MANIFEST_WORKING_REVISION_MISSING",
            FindingCode::ManifestWorkingRevisionMismatch => "MANIFEST_WORKING_REVISION_MISMATCH",
            FindingCode::ManifestNewDirectoriesMismatch => "MANIFEST_NEW_DIRECTORIES_MISMATCH",
            FindingCode::ManifestRedOpsNotSubset => "MANIFEST_RED_OPS_NOT_SUBSET",
            FindingCode::YellowAutoQuarantine => "YELLOW_AUTO_QUARANTINE",
            FindingCode::RedOpUndeclared => "RED_OP_UNDECLARED",
            FindingCode::ZoneExpectationViolation => "ZONE_EXPECTATION_VIOLATION",
            FindingCode::ProtectedZoneTouched => "PROTECTED_ZONE_TOUCHED",
            FindingCode::ProtectedTouchedNotAllowlisted => "PROTECTED_TOUCHED_NOT_ALLOWLISTED",
            FindingCode::KernelUpgradeForbiddenStage => "KERNEL_UPGRADE_FORBIDDEN_STAGE",
            FindingCode::PlanScopeInvalid => "PLAN_SCOPE_INVALID",
            FindingCode::PlanAllowedViolation => "PLAN_ALLOWED_VIOLATION",
            FindingCode::PlanForbiddenViolation => "PLAN_FORBIDDEN_VIOLATION",
            FindingCode::ActiveIntentIdMismatch => "ACTIVE_INTENT_ID_MISMATCH",
            FindingCode::IntentStorageOutsideActivePack => "INTENT_STORAGE_OUTSIDE_ACTIVE_PACK",
            FindingCode::ClosedToOpenForbidden => "CLOSED_TO_OPEN_FORBIDDEN",
            FindingCode::ClosedIntentImmutable => "CLOSED_INTENT_IMMUTABLE",
            FindingCode::CloseForbiddenStage => "CLOSE_FORBIDDEN_STAGE",
            FindingCode::CloseTransactionMixedChanges => "CLOSE_TRANSACTION_MIXED_CHANGES",
            FindingCode::PointerChangedInCoding => "POINTER_CHANGED_IN_CODING",
            FindingCode::SwitchTransactionMixedChanges => "SWITCH_TRANSACTION_MIXED_CHANGES",
            FindingCode::ClosedIntentNotActivatable => "CLOSED_INTENT_NOT_ACTIVATABLE",
            FindingCode::SwitchAndCloseCombined => "SWITCH_AND_CLOSE_COMBINED",
            FindingCode::DirtyWorktree => "DIRTY_WORKTREE",
            FindingCode::UntrackedPresent => "UNTRACKED_PRESENT",
        }
    }

    pub fn category(self) -> FailCategory {
        match self {
            FindingCode::MissingArtifact | FindingCode::MissingManifest => {
                FailCategory::ArtifactInvalid
            }
            FindingCode::ManifestSchema
            | FindingCode::ManifestRename
            | FindingCode::ManifestZoneMismatch
            | FindingCode::ManifestDiffMismatch
            | FindingCode::ManifestBaseRevisionMismatch
            | FindingCode::ManifestWorkingRevisionMissing
            | FindingCode::ManifestWorkingRevisionMismatch
            | FindingCode::ManifestNewDirectoriesMismatch
            | FindingCode::ManifestRedOpsNotSubset => FailCategory::ManifestMismatch,
            FindingCode::YellowAutoQuarantine => FailCategory::Quarantine,
            FindingCode::RedOpUndeclared => FailCategory::RedOperation,
            FindingCode::ZoneExpectationViolation => FailCategory::ZoneExpectation,
            FindingCode::PlanScopeInvalid
            | FindingCode::PlanAllowedViolation
            | FindingCode::PlanForbiddenViolation => FailCategory::ScopePlan,
            FindingCode::ProtectedZoneTouched
            | FindingCode::ProtectedTouchedNotAllowlisted
            | FindingCode::KernelUpgradeForbiddenStage
            | FindingCode::IntentStorageOutsideActivePack => FailCategory::ProtectedZone,
            FindingCode::ActiveIntentIdMismatch
            | FindingCode::ClosedToOpenForbidden
            | FindingCode::ClosedIntentImmutable
            | FindingCode::CloseForbiddenStage
            | FindingCode::CloseTransactionMixedChanges
            | FindingCode::PointerChangedInCoding
            | FindingCode::SwitchTransactionMixedChanges
            | FindingCode::ClosedIntentNotActivatable
            | FindingCode::SwitchAndCloseCombined => FailCategory::Lifecycle,
            FindingCode::ValidatorAbort | FindingCode::DirtyWorktree | FindingCode::UntrackedPresent => {
                FailCategory::Uncategorized
            }
        }
    }
}

impl std::fmt::Display for FindingCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FindingCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub code: FindingCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

impl Finding {
    pub fn fail(code: FindingCode, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Fail,
            code,
            message: message.into(),
            path: None,
            details: None,
        }
    }

    pub fn warn(code: FindingCode, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warn,
            ..Self::fail(code, message)
        }
    }

    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_fail(&self) -> bool {
        self.severity == Severity::Fail
    }

    /// One-line rendering for terminal previews.
    pub fn summary_line(&self) -> String {
        match &self.path {
            Some(path) => format!("{} {}: {}", self.code, path, self.message),
            None => format!("{}: {}", self.code, self.message),
        }
    }
}

/// Append-only accumulation of findings for one run.
#[derive(Debug, Default, Clone)]
pub struct Findings {
    items: Vec<Finding>,
}

impl Findings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, finding: Finding) {
        self.items.push(finding);
    }

    pub fn extend<I: IntoIterator<Item = Finding>>(&mut self, findings: I) {
        self.items.extend(findings);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Finding> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[Finding] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        self.items.iter().any(Finding::is_fail)
    }

    pub fn fail_count(&self) -> usize {
        self.items.iter().filter(|f| f.is_fail()).count()
    }

    pub fn warn_count(&self) -> usize {
        self.items.len() - self.fail_count()
    }

    pub fn codes(&self) -> Vec<FindingCode> {
        self.items.iter().map(|f| f.code).collect()
    }

    pub fn into_vec(self) -> Vec<Finding> {
        self.items
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub ok: bool,
    pub category: Option<FailCategory>,
    pub exit_code: i32,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            ok: true,
            category: None,
            exit_code: EXIT_PASS,
        }
    }

    pub fn failed(category: FailCategory) -> Self {
        Self {
            ok: false,
            category: Some(category),
            exit_code: category.exit_code(),
        }
    }
}

/// Pass when no finding fails; otherwise surface the single
/// highest-precedence category among failing findings.
pub fn assemble(findings: &[Finding]) -> Verdict {
    findings
        .iter()
        .filter(|f| f.is_fail())
        .map(|f| f.code.category())
        .min()
        .map(Verdict::failed)
        .unwrap_or_else(Verdict::pass)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn protected_zone_and_lifecycle_rank_last_before_uncategorized() {
        let n = FailCategory::ALL.len();
        assert_eq!(
            &FailCategory::ALL[n - 4..],
            &[
                FailCategory::ScopePlan,
                FailCategory::ProtectedZone,
                FailCategory::Lifecycle,
                FailCategory::Uncategorized,
            ]
        );
        assert!(FailCategory::ScopePlan < FailCategory::ProtectedZone);
        assert!(FailCategory::Lifecycle < FailCategory::Uncategorized);
    }

    #[test]
    fn exit_codes_are_distinct_and_non_zero() {
        let codes: HashSet<i32> = FailCategory::ALL.iter().map(|c| c.exit_code()).collect();
        assert_eq!(codes.len(), FailCategory::ALL.len());
        assert!(!codes.contains(&EXIT_PASS));
    }

    #[test]
    fn warnings_alone_pass() {
        let findings = vec![Finding::warn(FindingCode::YellowAutoQuarantine, "new folder")];
        assert_eq!(assemble(&findings), Verdict::pass());
    }

    #[test]
    fn highest_precedence_category_wins() {
        let findings = vec![
            Finding::fail(FindingCode::PlanAllowedViolation, "outside scope").at("src/a.rs"),
            Finding::fail(FindingCode::RedOpUndeclared, "undeclared"),
            Finding::fail(FindingCode::YellowAutoQuarantine, "quarantine"),
            Finding::fail(FindingCode::ZoneExpectationViolation, "zone"),
        ];
        let verdict = assemble(&findings);
        assert!(!verdict.ok);
        assert_eq!(verdict.category, Some(FailCategory::Quarantine));
        assert_eq!(verdict.exit_code, 60);
    }

    #[test]
    fn manifest_outranks_everything_but_artifacts() {
        let findings = vec![
            Finding::fail(FindingCode::ManifestRedOpsNotSubset, "extra declaration"),
            Finding::fail(FindingCode::ClosedIntentImmutable, "sealed"),
        ];
        assert_eq!(assemble(&findings).category, Some(FailCategory::ManifestMismatch));

        let findings = vec![
            Finding::fail(FindingCode::ManifestDiffMismatch, "diff"),
            Finding::fail(FindingCode::MissingArtifact, "missing"),
        ];
        assert_eq!(assemble(&findings).category, Some(FailCategory::ArtifactInvalid));
    }

    #[test]
    fn codes_serialize_as_screaming_strings() {
        let finding = Finding::fail(FindingCode::SwitchTransactionMixedChanges, "mixed")
            .at("src/lib.rs")
            .with_details(serde_json::json!({"b": 1, "a": 2}));
        let json = serde_json::to_string(&finding).unwrap();
        assert_eq!(
            json,
            r#"{"severity":"fail","code":"SWITCH_TRANSACTION_MIXED_CHANGES","message":"mixed","path":"src/lib.rs","details":{"a":2,"b":1}}"#
        );
    }

    #[test]
    fn findings_count_by_severity() {
        let mut findings = Findings::new();
        findings.push(Finding::fail(FindingCode::DirtyWorktree, "dirty"));
        findings.push(Finding::warn(FindingCode::RedOpUndeclared, "undeclared"));
        assert_eq!(findings.fail_count(), 1);
        assert_eq!(findings.warn_count(), 1);
        assert!(findings.has_failures());
        assert_eq!(
            findings.codes(),
            vec![FindingCode::DirtyWorktree, FindingCode::RedOpUndeclared]
        );
    }
}
