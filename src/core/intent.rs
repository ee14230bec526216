//! Active-intent pointer, intent documents and pack layout.
//!
//! The pointer names the active intent and the pack directory (relative to
//! the intents root) that holds its documents:
//!
//! ```text
//! <intents_root>/<pack>/intent.json
//! <intents_root>/<pack>/development-plan.md      (optional)
//! <intents_root>/<pack>/change-manifest.json     (optional below level 3)
//! <intents_root>/<pack>/evidence/validator-report.<stage>.json
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::core::error::GuardError;
use crate::core::paths::{is_contained_relative, is_under, normalize_repo_path};
use crate::core::scope::ScopeDocument;
use crate::core::stage::Stage;
use crate::core::vcs::Repository;
use crate::core::verdict::{Finding, FindingCode, Findings};

pub const INTENT_FILE: &str = "intent.json";
pub const PLAN_FILE: &str = "development-plan.md";
pub const MANIFEST_FILE: &str = "change-manifest.json";
pub const EVIDENCE_DIR: &str = "evidence";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveIntentPointer {
    pub schema_version: String,
    pub active_intent_id: String,
    pub active_pack_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentStatus {
    Open,
    Closed,
}

impl IntentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IntentStatus::Open => "open",
            IntentStatus::Closed => "closed",
        }
    }
}

impl Serialize for IntentStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for IntentStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(IntentStatus::Open),
            "closed" => Ok(IntentStatus::Closed),
            other => Err(serde::de::Error::custom(format!(
                "intent status must be 'open' or 'closed', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelUpgrade {
    #[serde(default)]
    pub allow_protected_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentDocument {
    pub schema_version: String,
    pub intent_id: String,
    pub status: IntentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default)]
    pub scope: ScopeDocument,
    #[serde(default)]
    pub red_ops_declared: Vec<String>,
    #[serde(default)]
    pub kernel_upgrade: KernelUpgrade,
}

/// A parsed intent plus its raw JSON, kept for field-level comparisons.
#[derive(Debug, Clone)]
pub struct IntentRecord {
    pub doc: IntentDocument,
    pub raw: JsonValue,
}

impl IntentRecord {
    pub fn parse(source: &str, text: &str) -> Result<Self, GuardError> {
        let raw: JsonValue = serde_json::from_str(text)
            .map_err(|e| GuardError::RoutingError(format!("{source}: {e}")))?;
        let doc: IntentDocument = serde_json::from_value(raw.clone())
            .map_err(|e| GuardError::RoutingError(format!("{source}: {e}")))?;
        Ok(Self { doc, raw })
    }

    /// Raw document with `status` removed.
    pub fn without_status(&self) -> JsonValue {
        let mut out = self.raw.clone();
        if let Some(obj) = out.as_object_mut() {
            obj.remove("status");
        }
        out
    }
}

/// Location of an intent pack, repo-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentPack {
    pub dir: String,
}

impl IntentPack {
    /// Resolve the pointer's pack path strictly inside the intents root.
    pub fn resolve(intents_root: &str, pack_path: &str) -> Result<Self, GuardError> {
        if !is_contained_relative(pack_path) {
            return Err(GuardError::RoutingError(format!(
                "active_pack_path '{pack_path}' escapes the intents root"
            )));
        }
        let relative = normalize_repo_path(pack_path);
        if relative.is_empty() {
            return Err(GuardError::RoutingError(
                "active_pack_path is empty".to_string(),
            ));
        }
        let root = normalize_repo_path(intents_root);
        let dir = if root.is_empty() {
            relative
        } else {
            format!("{root}/{relative}")
        };
        Ok(Self { dir })
    }

    pub fn file(&self, name: &str) -> String {
        format!("{}/{}", self.dir, name)
    }

    pub fn intent_path(&self) -> String {
        self.file(INTENT_FILE)
    }

    pub fn plan_path(&self) -> String {
        self.file(PLAN_FILE)
    }

    pub fn manifest_path(&self) -> String {
        self.file(MANIFEST_FILE)
    }

    pub fn report_path(&self, stage: Stage) -> String {
        format!("{}/{}/validator-report.{}.json", self.dir, EVIDENCE_DIR, stage)
    }

    pub fn contains(&self, path: &str) -> bool {
        is_under(path, &self.dir)
    }
}

fn parse_pointer(source: &str, text: &str) -> Result<ActiveIntentPointer, GuardError> {
    let pointer: ActiveIntentPointer = serde_json::from_str(text)
        .map_err(|e| GuardError::RoutingError(format!("{source}: {e}")))?;
    if pointer.active_intent_id.trim().is_empty() {
        return Err(GuardError::RoutingError(format!(
            "{source}: active_intent_id is empty"
        )));
    }
    Ok(pointer)
}

/// Working-tree pointer; its absence is a routing failure.
pub fn load_pointer(repo: &dyn Repository, path: &str) -> Result<ActiveIntentPointer, GuardError> {
    let text = repo.read_working_file(path)?.ok_or_else(|| {
        GuardError::RoutingError(format!("active intent pointer {path} not found"))
    })?;
    parse_pointer(path, &text)
}

pub fn load_pointer_at(
    repo: &dyn Repository,
    rev: &str,
    path: &str,
) -> Result<Option<ActiveIntentPointer>, GuardError> {
    match repo.read_file_at(rev, path)? {
        Some(text) => parse_pointer(&format!("{path}@{rev}"), &text).map(Some),
        None => Ok(None),
    }
}

pub fn load_intent(repo: &dyn Repository, pack: &IntentPack) -> Result<IntentRecord, GuardError> {
    let path = pack.intent_path();
    let text = repo
        .read_working_file(&path)?
        .ok_or_else(|| GuardError::RoutingError(format!("intent document {path} not found")))?;
    IntentRecord::parse(&path, &text)
}

pub fn load_intent_at(
    repo: &dyn Repository,
    rev: &str,
    pack: &IntentPack,
) -> Result<Option<IntentRecord>, GuardError> {
    let path = pack.intent_path();
    match repo.read_file_at(rev, &path)? {
        Some(text) => IntentRecord::parse(&format!("{path}@{rev}"), &text).map(Some),
        None => Ok(None),
    }
}

/// Intent storage may only change inside the active pack (the pointer aside).
pub fn enforce_storage_confinement(
    changed_paths: &[&str],
    intents_root: &str,
    pointer_path: &str,
    pack: &IntentPack,
    findings: &mut Findings,
) {
    let root = normalize_repo_path(intents_root);
    for path in changed_paths {
        if *path == pointer_path || !is_under(path, &root) || pack.contains(path) {
            continue;
        }
        findings.push(
            Finding::fail(
                FindingCode::IntentStorageOutsideActivePack,
                format!("intent storage outside the active pack '{}'", pack.dir),
            )
            .at(*path),
        );
    }
}
