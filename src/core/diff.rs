//! Change records and stage-specific diff collection.
//!
//! Whatever the source, the changed-file list handed to policy evaluation is
//! normalized, sorted by `(change_type, path, old_path)` and free of exact
//! duplicates. Two runs over the same repository state produce the same list.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::core::error::GuardError;
use crate::core::glob::PatternSet;
use crate::core::paths::{ancestor_dirs, normalize_repo_path};
use crate::core::stage::Stage;
use crate::core::vcs::{DiffTarget, EMPTY_TREE, Repository};

/// Ordering follows the git status letter: `A < D < M < R`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeType {
    Added,
    Deleted,
    Modified,
    Renamed,
}

impl ChangeType {
    pub fn code(self) -> &'static str {
        match self {
            ChangeType::Added => "A",
            ChangeType::Deleted => "D",
            ChangeType::Modified => "M",
            ChangeType::Renamed => "R",
        }
    }

    /// Accepts status letters and spelled-out names, case-insensitively.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "a" | "added" | "add" => Some(ChangeType::Added),
            "d" | "deleted" | "delete" => Some(ChangeType::Deleted),
            "m" | "modified" | "modify" => Some(ChangeType::Modified),
            "r" | "renamed" | "rename" => Some(ChangeType::Renamed),
            _ => None,
        }
    }
}

impl Serialize for ChangeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for ChangeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ChangeType::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown change_type '{raw}'")))
    }
}

/// One changed file. `old_path` is present exactly when the record is a rename.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ChangeRecord {
    pub change_type: ChangeType,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
}

impl ChangeRecord {
    pub fn added(path: &str) -> Self {
        Self::simple(ChangeType::Added, path)
    }

    pub fn modified(path: &str) -> Self {
        Self::simple(ChangeType::Modified, path)
    }

    pub fn deleted(path: &str) -> Self {
        Self::simple(ChangeType::Deleted, path)
    }

    pub fn renamed(old_path: &str, path: &str) -> Self {
        Self {
            change_type: ChangeType::Renamed,
            path: normalize_repo_path(path),
            old_path: Some(normalize_repo_path(old_path)),
        }
    }

    fn simple(change_type: ChangeType, path: &str) -> Self {
        Self {
            change_type,
            path: normalize_repo_path(path),
            old_path: None,
        }
    }

    /// Every path the change touches: the destination and, for renames, the source.
    pub fn touched_paths(&self) -> Vec<&str> {
        let mut out = vec![self.path.as_str()];
        if let Some(old) = &self.old_path {
            out.push(old.as_str());
        }
        out
    }

    pub fn touches(&self, path: &str) -> bool {
        self.path == path || self.old_path.as_deref() == Some(path)
    }

    pub fn display(&self) -> String {
        match &self.old_path {
            Some(old) => format!("{old} -> {}", self.path),
            None => self.path.clone(),
        }
    }
}

/// Parse `git diff --name-status -z` output.
///
/// Copies are reported as additions of the destination and type changes as
/// modifications. Unmerged entries and unknown letters are malformed input.
pub fn parse_name_status_z(output: &str) -> Result<Vec<ChangeRecord>, GuardError> {
    let mut tokens = output.split('\0').filter(|t| !t.is_empty());
    let mut records = Vec::new();
    while let Some(status) = tokens.next() {
        let status = status.trim();
        let letter = status.chars().next().unwrap_or(' ');
        let mut next_path = |what: &str| {
            tokens.next().ok_or_else(|| {
                GuardError::MalformedDiff(format!("status '{status}' without {what} path"))
            })
        };
        let record = match letter {
            'A' => ChangeRecord::added(next_path("a")?),
            'M' | 'T' => ChangeRecord::modified(next_path("a")?),
            'D' => ChangeRecord::deleted(next_path("a")?),
            'R' => {
                let old = next_path("a source")?;
                let new = next_path("a destination")?;
                ChangeRecord::renamed(old, new)
            }
            'C' => {
                let _source = next_path("a source")?;
                ChangeRecord::added(next_path("a destination")?)
            }
            'U' => {
                return Err(GuardError::MalformedDiff(format!(
                    "unmerged path '{}'; resolve conflicts before validating",
                    next_path("a")?
                )));
            }
            _ => {
                return Err(GuardError::MalformedDiff(format!(
                    "unknown status '{status}'"
                )));
            }
        };
        records.push(record);
    }
    Ok(records)
}

/// Normalize, validate, sort and deduplicate change records.
pub fn canonicalize<I>(records: I) -> Result<Vec<ChangeRecord>, GuardError>
where
    I: IntoIterator<Item = ChangeRecord>,
{
    let mut out = Vec::new();
    for mut record in records {
        record.path = normalize_repo_path(&record.path);
        record.old_path = record.old_path.as_deref().map(normalize_repo_path);
        if record.path.is_empty() {
            return Err(GuardError::MalformedDiff(format!(
                "{} record without a path",
                record.change_type.code()
            )));
        }
        match (record.change_type, record.old_path.as_deref()) {
            (ChangeType::Renamed, None) | (ChangeType::Renamed, Some("")) => {
                return Err(GuardError::MalformedDiff(format!(
                    "rename to '{}' without a source path",
                    record.path
                )));
            }
            (ChangeType::Renamed, Some(_)) => {}
            (_, Some(_)) => {
                return Err(GuardError::MalformedDiff(format!(
                    "{} record for '{}' carries a source path",
                    record.change_type.code(),
                    record.path
                )));
            }
            (_, None) => {}
        }
        out.push(record);
    }
    out.sort();
    out.dedup();
    Ok(out)
}

/// Split off records whose destination matches an ignore pattern.
pub fn partition_ignored(
    changes: Vec<ChangeRecord>,
    ignore: &PatternSet,
) -> (Vec<ChangeRecord>, Vec<ChangeRecord>) {
    changes.into_iter().partition(|c| !ignore.any_match(&c.path))
}

/// SHA-256 over the canonical JSON of a change list.
pub fn diff_digest(changes: &[ChangeRecord]) -> Result<String, GuardError> {
    let bytes = serde_json::to_vec(changes)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseSelection {
    pub base: String,
    pub head: Option<String>,
    /// How the base was chosen, for the debug trace.
    pub source: String,
}

/// Choose the base revision for a stage.
///
/// - coding: `HEAD` (the empty tree before the first commit)
/// - verification: `HEAD^`, or the empty tree for a root commit
/// - ci: merge-base of `HEAD` with the first resolvable candidate, then `HEAD^`,
///   then the empty tree
///
/// An explicit override wins over all of these.
pub fn select_base(
    repo: &dyn Repository,
    stage: Stage,
    base_override: Option<&str>,
    candidates: &[String],
) -> Result<BaseSelection, GuardError> {
    let head = repo.resolve_revision("HEAD")?;
    if stage.validates_commits() && head.is_none() {
        return Err(GuardError::VcsError(format!(
            "stage '{stage}' needs at least one commit (HEAD does not resolve)"
        )));
    }

    if let Some(raw) = base_override {
        let base = repo.resolve_revision(raw)?.ok_or_else(|| {
            GuardError::VcsError(format!("base revision '{raw}' does not resolve"))
        })?;
        return Ok(BaseSelection {
            base,
            head,
            source: format!("override({raw})"),
        });
    }

    let Some(head_rev) = head.clone() else {
        return Ok(BaseSelection {
            base: EMPTY_TREE.to_string(),
            head,
            source: "empty-tree".to_string(),
        });
    };

    if stage == Stage::Ci {
        for candidate in candidates {
            let Some(resolved) = repo.resolve_revision(candidate)? else {
                continue;
            };
            if let Some(merge_base) = repo.merge_base(&resolved, &head_rev)? {
                return Ok(BaseSelection {
                    base: merge_base,
                    head,
                    source: format!("merge-base({candidate})"),
                });
            }
        }
    }

    if stage == Stage::Coding {
        return Ok(BaseSelection {
            base: head_rev,
            head,
            source: "HEAD".to_string(),
        });
    }

    match repo.resolve_revision("HEAD^")? {
        Some(parent) => Ok(BaseSelection {
            base: parent,
            head,
            source: "HEAD^".to_string(),
        }),
        None => Ok(BaseSelection {
            base: EMPTY_TREE.to_string(),
            head,
            source: "empty-tree".to_string(),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct StageDiff {
    pub base: BaseSelection,
    /// The commit under validation; absent for `coding`.
    pub working_revision: Option<String>,
    pub changes: Vec<ChangeRecord>,
    /// Tracked files modified in the worktree relative to the index.
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
}

/// Collect the canonical change list for a stage against a chosen base.
///
/// `coding` sees committed-plus-uncommitted work: the worktree and the index
/// against the base, plus untracked files as additions. The commit-validating
/// stages see only `base..HEAD`.
pub fn collect_stage_diff(
    repo: &dyn Repository,
    stage: Stage,
    base: BaseSelection,
) -> Result<StageDiff, GuardError> {
    let unstaged = repo
        .unstaged()?
        .iter()
        .map(|p| normalize_repo_path(p))
        .collect::<BTreeSet<_>>();
    let untracked = repo
        .untracked()?
        .iter()
        .map(|p| normalize_repo_path(p))
        .collect::<BTreeSet<_>>();

    let (records, working_revision) = match (stage, base.head.as_deref()) {
        (Stage::Coding, _) => {
            let mut records = repo.name_status(&base.base, &DiffTarget::WorkingTree)?;
            records.extend(repo.name_status(&base.base, &DiffTarget::Index)?);
            records.extend(untracked.iter().map(|p| ChangeRecord::added(p)));
            (records, None)
        }
        (_, Some(head)) => {
            let records =
                repo.name_status(&base.base, &DiffTarget::Revision(head.to_string()))?;
            (records, Some(head.to_string()))
        }
        (_, None) => {
            return Err(GuardError::VcsError(format!(
                "stage '{stage}' needs at least one commit (HEAD does not resolve)"
            )));
        }
    };

    Ok(StageDiff {
        base,
        working_revision,
        changes: canonicalize(records)?,
        unstaged: unstaged.into_iter().collect(),
        untracked: untracked.into_iter().collect(),
    })
}

/// Directories containing a changed path that do not exist at `base`.
///
/// Each ancestor is looked up at most once per run.
pub fn new_directories(
    repo: &dyn Repository,
    base: &str,
    changes: &[ChangeRecord],
) -> Result<BTreeSet<String>, GuardError> {
    let mut known: FxHashMap<String, bool> = FxHashMap::default();
    let mut out = BTreeSet::new();
    for change in changes {
        for dir in ancestor_dirs(&change.path) {
            let exists = match known.get(&dir) {
                Some(exists) => *exists,
                None => {
                    let exists = repo.dir_exists_at(base, &dir)?;
                    known.insert(dir.clone(), exists);
                    exists
                }
            };
            if !exists {
                out.insert(dir);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vcs::MemoryRepository;

    #[test]
    fn parses_nul_separated_name_status() {
        let raw = "M\0src/lib.rs\0R087\0docs/old.md\0docs/new.md\0A\0plugins/x/new.py\0D\0gone.txt\0C100\0a.txt\0b.txt\0T\0link\0";
        let records = parse_name_status_z(raw).unwrap();
        assert_eq!(
            records,
            vec![
                ChangeRecord::modified("src/lib.rs"),
                ChangeRecord::renamed("docs/old.md", "docs/new.md"),
                ChangeRecord::added("plugins/x/new.py"),
                ChangeRecord::deleted("gone.txt"),
                ChangeRecord::added("b.txt"),
                ChangeRecord::modified("link"),
            ]
        );
    }

    #[test]
    fn truncated_and_unmerged_diffs_are_malformed() {
        assert!(matches!(
            parse_name_status_z("R100\0only-old.md\0"),
            Err(GuardError::MalformedDiff(_))
        ));
        assert!(matches!(
            parse_name_status_z("U\0conflict.rs\0"),
            Err(GuardError::MalformedDiff(_))
        ));
        assert!(matches!(
            parse_name_status_z("X\0what\0"),
            Err(GuardError::MalformedDiff(_))
        ));
        assert!(parse_name_status_z("").unwrap().is_empty());
    }

    #[test]
    fn canonical_order_is_type_then_path() {
        let records = vec![
            ChangeRecord::modified("b.rs"),
            ChangeRecord::renamed("z.rs", "a.rs"),
            ChangeRecord::added("./z.rs"),
            ChangeRecord::modified("a.rs"),
            ChangeRecord::deleted("c.rs"),
            ChangeRecord::modified("b.rs"),
        ];
        let out = canonicalize(records).unwrap();
        assert_eq!(
            out,
            vec![
                ChangeRecord::added("z.rs"),
                ChangeRecord::deleted("c.rs"),
                ChangeRecord::modified("a.rs"),
                ChangeRecord::modified("b.rs"),
                ChangeRecord::renamed("z.rs", "a.rs"),
            ]
        );
    }

    #[test]
    fn rename_without_source_is_rejected() {
        let broken = ChangeRecord {
            change_type: ChangeType::Renamed,
            path: "new.rs".to_string(),
            old_path: None,
        };
        assert!(matches!(
            canonicalize(vec![broken]),
            Err(GuardError::MalformedDiff(_))
        ));
    }

    #[test]
    fn digest_is_stable_and_order_sensitive() {
        let a = vec![ChangeRecord::added("a"), ChangeRecord::modified("b")];
        let b = vec![ChangeRecord::modified("b"), ChangeRecord::added("a")];
        assert_eq!(diff_digest(&a).unwrap(), diff_digest(&a.clone()).unwrap());
        assert_ne!(diff_digest(&a).unwrap(), diff_digest(&b).unwrap());
        assert_eq!(diff_digest(&a).unwrap().len(), 64);
    }

    #[test]
    fn ignored_records_are_split_off() {
        let ignore = PatternSet::compile(&["**/evidence/validator-report.*.json"]).unwrap();
        let (kept, ignored) = partition_ignored(
            vec![
                ChangeRecord::added("intents/x/evidence/validator-report.coding.json"),
                ChangeRecord::modified("src/lib.rs"),
            ],
            &ignore,
        );
        assert_eq!(kept, vec![ChangeRecord::modified("src/lib.rs")]);
        assert_eq!(ignored.len(), 1);
    }

    fn repo_with_history() -> MemoryRepository {
        let mut repo = MemoryRepository::new("/repo");
        repo.write_staged("src/lib.rs", "fn a() {}");
        repo.commit("c1");
        repo.write_staged("src/lib.rs", "fn b() {}");
        repo.commit("c2");
        repo
    }

    #[test]
    fn coding_base_is_head_and_includes_untracked() {
        let mut repo = repo_with_history();
        repo.write("src/lib.rs", "fn c() {}");
        repo.write("plugins/x/new.py", "print()");
        let base = select_base(&repo, Stage::Coding, None, &[]).unwrap();
        assert_eq!(base.base, "c2");
        let diff = collect_stage_diff(&repo, Stage::Coding, base).unwrap();
        assert_eq!(
            diff.changes,
            vec![
                ChangeRecord::added("plugins/x/new.py"),
                ChangeRecord::modified("src/lib.rs"),
            ]
        );
        assert_eq!(diff.working_revision, None);
        assert_eq!(diff.untracked, vec!["plugins/x/new.py".to_string()]);
    }

    #[test]
    fn verification_diffs_the_last_commit() {
        let repo = repo_with_history();
        let base = select_base(&repo, Stage::Verification, None, &[]).unwrap();
        assert_eq!(base.base, "c1");
        let diff = collect_stage_diff(&repo, Stage::Verification, base).unwrap();
        assert_eq!(diff.changes, vec![ChangeRecord::modified("src/lib.rs")]);
        assert_eq!(diff.working_revision.as_deref(), Some("c2"));
    }

    #[test]
    fn root_commit_falls_back_to_empty_tree() {
        let mut repo = MemoryRepository::new("/repo");
        repo.write_staged("README.md", "hi");
        repo.commit("root");
        let base = select_base(&repo, Stage::Verification, None, &[]).unwrap();
        assert_eq!(base.base, EMPTY_TREE);
        let diff = collect_stage_diff(&repo, Stage::Verification, base).unwrap();
        assert_eq!(diff.changes, vec![ChangeRecord::added("README.md")]);
    }

    #[test]
    fn ci_uses_first_resolvable_candidate() {
        let mut repo = repo_with_history();
        repo.set_ref("main", "c1");
        let candidates = vec!["origin/main".to_string(), "main".to_string()];
        let base = select_base(&repo, Stage::Ci, None, &candidates).unwrap();
        assert_eq!(base.base, "c1");
        assert_eq!(base.source, "merge-base(main)");
    }

    #[test]
    fn override_must_resolve() {
        let repo = repo_with_history();
        assert!(matches!(
            select_base(&repo, Stage::Ci, Some("nope"), &[]),
            Err(GuardError::VcsError(_))
        ));
        let base = select_base(&repo, Stage::Coding, Some("c1"), &[]).unwrap();
        assert_eq!(base.base, "c1");
    }

    #[test]
    fn new_directories_are_those_missing_at_base() {
        let repo = repo_with_history();
        let changes = vec![
            ChangeRecord::added("plugins/x/new.py"),
            ChangeRecord::added("plugins/x/other.py"),
            ChangeRecord::modified("src/lib.rs"),
            ChangeRecord::added("src/fresh/mod.rs"),
        ];
        let dirs = new_directories(&repo, "c2", &changes).unwrap();
        let expected: BTreeSet<String> = ["plugins", "plugins/x", "src/fresh"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(dirs, expected);
    }
}
