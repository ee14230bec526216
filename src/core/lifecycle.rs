//! Intent lifecycle.
//!
//! The transaction a diff performs is looked up in [`TRANSITIONS`] from the
//! intent's status at the base revision, its status in the working state and
//! whether the active pointer changed. Rules then apply per transaction.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::core::diff::ChangeRecord;
use crate::core::error::GuardError;
use crate::core::intent::{IntentPack, IntentRecord, IntentStatus, load_intent_at};
use crate::core::paths::{ancestor_dirs, is_under, normalize_repo_path};
use crate::core::stage::Stage;
use crate::core::vcs::Repository;
use crate::core::verdict::{Finding, FindingCode, Findings};

/// Status at the base revision; `Absent` when the document did not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseStatus {
    Absent,
    Open,
    Closed,
}

impl From<Option<IntentStatus>> for BaseStatus {
    fn from(status: Option<IntentStatus>) -> Self {
        match status {
            None => BaseStatus::Absent,
            Some(IntentStatus::Open) => BaseStatus::Open,
            Some(IntentStatus::Closed) => BaseStatus::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transaction {
    Work,
    Close,
    Switch,
    Sealed,
    Reopen,
    SwitchOntoClosed,
    SwitchWithClose,
    ReopenSwitch,
}

impl Transaction {
    pub fn is_switch(self) -> bool {
        matches!(
            self,
            Transaction::Switch
                | Transaction::SwitchOntoClosed
                | Transaction::SwitchWithClose
                | Transaction::ReopenSwitch
        )
    }

    pub fn is_close(self) -> bool {
        matches!(self, Transaction::Close | Transaction::SwitchWithClose)
    }

    pub fn base_closed(self) -> bool {
        matches!(
            self,
            Transaction::Sealed
                | Transaction::Reopen
                | Transaction::SwitchOntoClosed
                | Transaction::ReopenSwitch
        )
    }

    pub fn reopens(self) -> bool {
        matches!(self, Transaction::Reopen | Transaction::ReopenSwitch)
    }

    pub fn activates_closed(self) -> bool {
        matches!(
            self,
            Transaction::SwitchOntoClosed | Transaction::SwitchWithClose
        )
    }
}

/// `(base, working, pointer_changed) -> transaction`; total over its domain.
pub const TRANSITIONS: [(BaseStatus, IntentStatus, bool, Transaction); 12] = [
    (BaseStatus::Absent, IntentStatus::Open, false, Transaction::Work),
    (BaseStatus::Absent, IntentStatus::Open, true, Transaction::Switch),
    (BaseStatus::Absent, IntentStatus::Closed, false, Transaction::Close),
    (BaseStatus::Absent, IntentStatus::Closed, true, Transaction::SwitchWithClose),
    (BaseStatus::Open, IntentStatus::Open, false, Transaction::Work),
    (BaseStatus::Open, IntentStatus::Open, true, Transaction::Switch),
    (BaseStatus::Open, IntentStatus::Closed, false, Transaction::Close),
    (BaseStatus::Open, IntentStatus::Closed, true, Transaction::SwitchWithClose),
    (BaseStatus::Closed, IntentStatus::Open, false, Transaction::Reopen),
    (BaseStatus::Closed, IntentStatus::Open, true, Transaction::ReopenSwitch),
    (BaseStatus::Closed, IntentStatus::Closed, false, Transaction::Sealed),
    (BaseStatus::Closed, IntentStatus::Closed, true, Transaction::SwitchOntoClosed),
];

pub fn transition(base: BaseStatus, working: IntentStatus, pointer_changed: bool) -> Transaction {
    TRANSITIONS
        .iter()
        .find(|(b, w, p, _)| *b == base && *w == working && *p == pointer_changed)
        .map(|row| row.3)
        .unwrap_or(Transaction::Work)
}

/// Pack named by the base pointer when it differs from the active one.
#[derive(Debug, Clone)]
pub struct PreviousPack<'a> {
    pub pack: &'a IntentPack,
    pub base: Option<&'a IntentRecord>,
    pub working: Option<&'a IntentRecord>,
}

#[derive(Debug, Clone)]
pub struct LifecycleInput<'a> {
    pub stage: Stage,
    pub changes: &'a [ChangeRecord],
    pub pointer_path: &'a str,
    pub pointer_intent_id: &'a str,
    pub pointer_changed: bool,
    pub pack: &'a IntentPack,
    pub base: Option<&'a IntentRecord>,
    pub working: &'a IntentRecord,
    pub previous: Option<PreviousPack<'a>>,
    /// Other packs closed at base that this diff touches.
    pub sealed: &'a [IntentPack],
}

impl LifecycleInput<'_> {
    fn touched(&self) -> impl Iterator<Item = &str> + '_ {
        self.changes.iter().flat_map(|c| c.touched_paths())
    }

    fn intent_changed(&self, path: &str) -> bool {
        self.changes.iter().any(|c| c.touches(path))
    }
}

pub fn evaluate(input: &LifecycleInput<'_>, findings: &mut Findings) -> Transaction {
    let intent_path = input.pack.intent_path();
    let working = &input.working.doc;

    if input.pointer_intent_id != working.intent_id {
        findings.push(
            Finding::fail(
                FindingCode::ActiveIntentIdMismatch,
                format!(
                    "pointer names intent '{}' but the pack holds '{}'",
                    input.pointer_intent_id, working.intent_id
                ),
            )
            .at(&intent_path),
        );
    }

    let base_status = BaseStatus::from(input.base.map(|r| r.doc.status));
    let tx = transition(base_status, working.status, input.pointer_changed);

    if tx.reopens() {
        findings.push(
            Finding::fail(
                FindingCode::ClosedToOpenForbidden,
                "a closed intent cannot be reopened",
            )
            .at(&intent_path),
        );
    }

    if tx.base_closed() {
        seal(input.pack, input.touched(), findings);
    }
    for pack in input.sealed {
        if pack != input.pack {
            seal(pack, input.touched(), findings);
        }
    }

    if tx.is_close() {
        check_close(input, &intent_path, findings);
    }

    if tx.is_switch() {
        check_switch(input, tx, findings);
    }

    tx
}

fn seal<'p>(pack: &IntentPack, touched: impl Iterator<Item = &'p str>, findings: &mut Findings) {
    for path in touched.filter(|p| pack.contains(p)) {
        findings.push(
            Finding::fail(
                FindingCode::ClosedIntentImmutable,
                format!("intent pack '{}' is closed and immutable", pack.dir),
            )
            .at(path),
        );
    }
}

fn check_close(input: &LifecycleInput<'_>, intent_path: &str, findings: &mut Findings) {
    if !input.stage.permits_irreversible_transitions() {
        findings.push(
            Finding::fail(
                FindingCode::CloseForbiddenStage,
                format!("intents cannot be closed at stage '{}'", input.stage),
            )
            .at(intent_path),
        );
    }

    for path in input.touched() {
        if path == intent_path || path == input.pointer_path {
            continue;
        }
        findings.push(
            Finding::fail(
                FindingCode::CloseTransactionMixedChanges,
                "closing an intent must not be combined with other changes",
            )
            .at(path),
        );
    }

    if let Some(base) = input.base {
        let before = base.without_status();
        let after = input.working.without_status();
        if before != after {
            findings.push(
                Finding::fail(
                    FindingCode::CloseTransactionMixedChanges,
                    "closing an intent may only change its status",
                )
                .at(intent_path)
                .with_details(serde_json::json!({
                    "changed_fields": changed_fields(&before, &after),
                })),
            );
        }
    }

    if input.pointer_changed {
        findings.push(
            Finding::fail(
                FindingCode::SwitchAndCloseCombined,
                "an intent cannot be closed in the same change that activates it",
            )
            .at(intent_path),
        );
    }
}

fn changed_fields(before: &serde_json::Value, after: &serde_json::Value) -> Vec<String> {
    let empty = serde_json::Map::new();
    let a = before.as_object().unwrap_or(&empty);
    let b = after.as_object().unwrap_or(&empty);
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    keys.into_iter()
        .filter(|k| a.get(*k) != b.get(*k))
        .cloned()
        .collect()
}

fn check_switch(input: &LifecycleInput<'_>, tx: Transaction, findings: &mut Findings) {
    if !input.stage.permits_irreversible_transitions() {
        findings.push(
            Finding::fail(
                FindingCode::PointerChangedInCoding,
                "the active intent pointer cannot change at stage 'coding'",
            )
            .at(input.pointer_path),
        );
    }

    for path in input.touched() {
        if path == input.pointer_path || input.pack.contains(path) {
            continue;
        }
        findings.push(
            Finding::fail(
                FindingCode::SwitchTransactionMixedChanges,
                "switching intents must not be combined with other changes",
            )
            .at(path)
            .with_details(serde_json::json!({ "active_pack": input.pack.dir })),
        );
    }

    if tx.activates_closed() {
        findings.push(
            Finding::fail(
                FindingCode::ClosedIntentNotActivatable,
                "the pointer activates an intent that is closed",
            )
            .at(input.pack.intent_path()),
        );
    }

    if let Some(prev) = &input.previous {
        let prev_path = prev.pack.intent_path();
        let was_open = prev.base.is_none_or(|r| r.doc.status == IntentStatus::Open);
        let now_closed = prev
            .working
            .is_some_and(|r| r.doc.status == IntentStatus::Closed);
        if prev.pack != input.pack && was_open && now_closed && input.intent_changed(&prev_path) {
            findings.push(
                Finding::fail(
                    FindingCode::SwitchAndCloseCombined,
                    "the previous intent is closed in the same change that switches away from it",
                )
                .at(prev_path),
            );
        }
    }
}

/// Packs other than `active` that were closed at `base` and contain a changed path.
pub fn find_sealed_packs(
    repo: &dyn Repository,
    base: &str,
    intents_root: &str,
    changes: &[ChangeRecord],
    active: &IntentPack,
) -> Result<Vec<IntentPack>, GuardError> {
    let root = normalize_repo_path(intents_root);
    let mut candidates = BTreeSet::new();
    for path in changes.iter().flat_map(|c| c.touched_paths()) {
        if !is_under(path, &root) || active.contains(path) {
            continue;
        }
        for dir in ancestor_dirs(path) {
            if dir.len() > root.len() && is_under(&dir, &root) {
                candidates.insert(dir);
            }
        }
    }

    let mut sealed = Vec::new();
    for dir in candidates {
        let pack = IntentPack { dir };
        if let Some(record) = load_intent_at(repo, base, &pack)?
            && record.doc.status == IntentStatus::Closed
        {
            sealed.push(pack);
        }
    }
    Ok(sealed)
}
