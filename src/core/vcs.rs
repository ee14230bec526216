//! Version-control collaborator.
//!
//! The validator never touches git directly; it asks a [`Repository`] for
//! revisions, name-status diffs and file contents. [`GitRepository`] shells out
//! to the `git` binary, [`MemoryRepository`] answers from in-memory snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::core::diff::{ChangeRecord, parse_name_status_z};
use crate::core::error::GuardError;
use crate::core::paths::{is_under, normalize_repo_path};

/// Object id of git's empty tree; the base for a root commit.
pub const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// What the base revision is compared against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffTarget {
    Revision(String),
    Index,
    WorkingTree,
}

pub trait Repository {
    fn root(&self) -> &Path;

    /// Full revision id, or `None` when `rev` does not name a commit.
    fn resolve_revision(&self, rev: &str) -> Result<Option<String>, GuardError>;

    fn merge_base(&self, a: &str, b: &str) -> Result<Option<String>, GuardError>;

    /// Name-status diff from `base` to `target`. Order is unspecified.
    fn name_status(&self, base: &str, target: &DiffTarget)
    -> Result<Vec<ChangeRecord>, GuardError>;

    fn untracked(&self) -> Result<Vec<String>, GuardError>;

    /// Tracked paths whose worktree content differs from the index.
    fn unstaged(&self) -> Result<Vec<String>, GuardError>;

    fn read_file_at(&self, rev: &str, path: &str) -> Result<Option<String>, GuardError>;

    fn dir_exists_at(&self, rev: &str, dir: &str) -> Result<bool, GuardError>;

    fn read_working_file(&self, path: &str) -> Result<Option<String>, GuardError>;

    fn working_path_exists(&self, path: &str) -> Result<bool, GuardError>;
}

pub struct GitRepository {
    root: PathBuf,
}

impl GitRepository {
    pub fn open(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Locate the work-tree root containing `start`.
    pub fn discover(start: &Path) -> Result<Self, GuardError> {
        let output = git_output(start, &["rev-parse", "--show-toplevel"])?;
        if !output.status.success() {
            return Err(GuardError::VcsError(format!(
                "{} is not inside a git work tree",
                start.display()
            )));
        }
        let top = decode_stdout(&["rev-parse", "--show-toplevel"], output.stdout)?
            .trim()
            .to_string();
        Ok(Self {
            root: PathBuf::from(top),
        })
    }

    fn run_git(&self, args: &[&str]) -> Result<String, GuardError> {
        let output = git_output(&self.root, args)?;
        if !output.status.success() {
            return Err(GuardError::VcsError(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        decode_stdout(args, output.stdout)
    }

    /// `Some(stdout)` on success, `None` when git exits non-zero.
    fn query_git(&self, args: &[&str]) -> Result<Option<String>, GuardError> {
        let output = git_output(&self.root, args)?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(decode_stdout(args, output.stdout)?.trim().to_string()))
    }

    fn object_type(&self, rev: &str, path: &str) -> Result<Option<String>, GuardError> {
        let object = format!("{}:{}", rev, normalize_repo_path(path));
        self.query_git(&["cat-file", "-t", &object])
    }
}

fn git_output(dir: &Path, args: &[&str]) -> Result<Output, GuardError> {
    Command::new("git")
        .args(["-c", "core.quotepath=false"])
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| GuardError::VcsError(format!("git failed: {}", e)))
}

/// Paths that are not valid UTF-8 cannot be matched or reported faithfully.
fn decode_stdout(args: &[&str], stdout: Vec<u8>) -> Result<String, GuardError> {
    String::from_utf8(stdout).map_err(|e| {
        GuardError::VcsError(format!(
            "git {} produced non-UTF-8 output at byte {}",
            args.join(" "),
            e.utf8_error().valid_up_to()
        ))
    })
}

fn split_z(output: &str) -> Vec<String> {
    output
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(normalize_repo_path)
        .collect()
}

impl Repository for GitRepository {
    fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_revision(&self, rev: &str) -> Result<Option<String>, GuardError> {
        if rev == EMPTY_TREE {
            return Ok(Some(EMPTY_TREE.to_string()));
        }
        let object = format!("{rev}^{{commit}}");
        self.query_git(&["rev-parse", "--verify", "--quiet", &object])
    }

    fn merge_base(&self, a: &str, b: &str) -> Result<Option<String>, GuardError> {
        self.query_git(&["merge-base", a, b])
    }

    fn name_status(
        &self,
        base: &str,
        target: &DiffTarget,
    ) -> Result<Vec<ChangeRecord>, GuardError> {
        let mut args = vec!["diff", "--name-status", "-z", "-M"];
        match target {
            DiffTarget::Revision(head) => {
                args.push(base);
                args.push(head.as_str());
            }
            DiffTarget::Index => {
                args.push("--cached");
                args.push(base);
            }
            DiffTarget::WorkingTree => args.push(base),
        }
        args.push("--");
        let raw = self.run_git(&args)?;
        parse_name_status_z(&raw)
    }

    fn untracked(&self) -> Result<Vec<String>, GuardError> {
        let raw = self.run_git(&["ls-files", "--others", "--exclude-standard", "-z"])?;
        Ok(split_z(&raw))
    }

    fn unstaged(&self) -> Result<Vec<String>, GuardError> {
        let raw = self.run_git(&["diff", "--name-only", "-z"])?;
        Ok(split_z(&raw))
    }

    fn read_file_at(&self, rev: &str, path: &str) -> Result<Option<String>, GuardError> {
        if rev == EMPTY_TREE || self.object_type(rev, path)?.as_deref() != Some("blob") {
            return Ok(None);
        }
        let object = format!("{}:{}", rev, normalize_repo_path(path));
        self.run_git(&["cat-file", "blob", &object]).map(Some)
    }

    fn dir_exists_at(&self, rev: &str, dir: &str) -> Result<bool, GuardError> {
        if rev == EMPTY_TREE {
            return Ok(false);
        }
        Ok(self.object_type(rev, dir)?.as_deref() == Some("tree"))
    }

    fn read_working_file(&self, path: &str) -> Result<Option<String>, GuardError> {
        let full = self.root.join(normalize_repo_path(path));
        if full.is_dir() {
            return Ok(None);
        }
        match fs::read_to_string(&full) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GuardError::IoError(e)),
        }
    }

    fn working_path_exists(&self, path: &str) -> Result<bool, GuardError> {
        Ok(self.root.join(normalize_repo_path(path)).exists())
    }
}

#[derive(Debug, Clone)]
struct Commit {
    parent: Option<String>,
    files: BTreeMap<String, String>,
}

/// Snapshot-based repository for tests and embedding.
///
/// Commits are whole-tree snapshots of the index. Renames are detected only
/// when a deleted and an added file have identical content.
#[derive(Debug, Clone)]
pub struct MemoryRepository {
    root: PathBuf,
    commits: BTreeMap<String, Commit>,
    refs: BTreeMap<String, String>,
    head: Option<String>,
    index: BTreeMap<String, String>,
    working: BTreeMap<String, String>,
}

impl MemoryRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            commits: BTreeMap::new(),
            refs: BTreeMap::new(),
            head: None,
            index: BTreeMap::new(),
            working: BTreeMap::new(),
        }
    }

    /// Write to the worktree only.
    pub fn write(&mut self, path: &str, content: &str) -> &mut Self {
        self.working
            .insert(normalize_repo_path(path), content.to_string());
        self
    }

    /// Write to the worktree and stage it.
    pub fn write_staged(&mut self, path: &str, content: &str) -> &mut Self {
        let path = normalize_repo_path(path);
        self.working.insert(path.clone(), content.to_string());
        self.index.insert(path, content.to_string());
        self
    }

    pub fn remove(&mut self, path: &str) -> &mut Self {
        self.working.remove(&normalize_repo_path(path));
        self
    }

    pub fn remove_staged(&mut self, path: &str) -> &mut Self {
        let path = normalize_repo_path(path);
        self.working.remove(&path);
        self.index.remove(&path);
        self
    }

    pub fn rename_staged(&mut self, from: &str, to: &str) -> &mut Self {
        let from = normalize_repo_path(from);
        if let Some(content) = self.index.remove(&from) {
            self.working.remove(&from);
            self.write_staged(to, &content);
        }
        self
    }

    /// Snapshot the index as commit `id` on top of the current head.
    pub fn commit(&mut self, id: &str) -> &mut Self {
        self.commits.insert(
            id.to_string(),
            Commit {
                parent: self.head.clone(),
                files: self.index.clone(),
            },
        );
        self.head = Some(id.to_string());
        self
    }

    pub fn set_ref(&mut self, name: &str, id: &str) -> &mut Self {
        self.refs.insert(name.to_string(), id.to_string());
        self
    }

    pub fn head(&self) -> Option<&str> {
        self.head.as_deref()
    }

    fn resolve(&self, rev: &str) -> Option<String> {
        if rev == EMPTY_TREE {
            return Some(EMPTY_TREE.to_string());
        }
        if let Some(prefix) = rev.strip_suffix('^').or_else(|| rev.strip_suffix("~1")) {
            let child = self.resolve(prefix)?;
            return self.commits.get(&child)?.parent.clone();
        }
        if rev == "HEAD" {
            return self.head.clone();
        }
        if self.commits.contains_key(rev) {
            return Some(rev.to_string());
        }
        self.refs.get(rev).cloned()
    }

    fn snapshot(&self, rev: &str) -> Result<BTreeMap<String, String>, GuardError> {
        let id = self
            .resolve(rev)
            .ok_or_else(|| GuardError::VcsError(format!("unknown revision '{rev}'")))?;
        if id == EMPTY_TREE {
            return Ok(BTreeMap::new());
        }
        self.commits
            .get(&id)
            .map(|c| c.files.clone())
            .ok_or_else(|| GuardError::VcsError(format!("unknown revision '{rev}'")))
    }

    fn ancestry(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut cursor = Some(id.to_string());
        while let Some(current) = cursor {
            cursor = self.commits.get(&current).and_then(|c| c.parent.clone());
            out.push(current);
        }
        out
    }
}

fn diff_snapshots(
    base: &BTreeMap<String, String>,
    target: &BTreeMap<String, String>,
) -> Vec<ChangeRecord> {
    let mut records = Vec::new();
    let mut added: Vec<&String> = target.keys().filter(|p| !base.contains_key(*p)).collect();
    for (path, content) in base {
        match target.get(path) {
            Some(now) if now != content => records.push(ChangeRecord::modified(path)),
            Some(_) => {}
            None => {
                let twin = added.iter().position(|a| target.get(*a) == Some(content));
                match twin {
                    Some(idx) => {
                        let to = added.remove(idx);
                        records.push(ChangeRecord::renamed(path, to));
                    }
                    None => records.push(ChangeRecord::deleted(path)),
                }
            }
        }
    }
    records.extend(added.into_iter().map(|p| ChangeRecord::added(p)));
    records
}

impl Repository for MemoryRepository {
    fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_revision(&self, rev: &str) -> Result<Option<String>, GuardError> {
        Ok(self.resolve(rev))
    }

    fn merge_base(&self, a: &str, b: &str) -> Result<Option<String>, GuardError> {
        let (Some(a), Some(b)) = (self.resolve(a), self.resolve(b)) else {
            return Ok(None);
        };
        let theirs: BTreeSet<String> = self.ancestry(&b).into_iter().collect();
        Ok(self.ancestry(&a).into_iter().find(|c| theirs.contains(c)))
    }

    fn name_status(
        &self,
        base: &str,
        target: &DiffTarget,
    ) -> Result<Vec<ChangeRecord>, GuardError> {
        let base_files = self.snapshot(base)?;
        let target_files = match target {
            DiffTarget::Revision(rev) => self.snapshot(rev)?,
            DiffTarget::Index => self.index.clone(),
            DiffTarget::WorkingTree => self
                .working
                .iter()
                .filter(|(p, _)| self.index.contains_key(*p) || base_files.contains_key(*p))
                .map(|(p, c)| (p.clone(), c.clone()))
                .collect(),
        };
        Ok(diff_snapshots(&base_files, &target_files))
    }

    fn untracked(&self) -> Result<Vec<String>, GuardError> {
        Ok(self
            .working
            .keys()
            .filter(|p| !self.index.contains_key(*p))
            .cloned()
            .collect())
    }

    fn unstaged(&self) -> Result<Vec<String>, GuardError> {
        Ok(self
            .index
            .iter()
            .filter(|(p, c)| self.working.get(*p) != Some(*c))
            .map(|(p, _)| p.clone())
            .collect())
    }

    fn read_file_at(&self, rev: &str, path: &str) -> Result<Option<String>, GuardError> {
        Ok(self.snapshot(rev)?.get(&normalize_repo_path(path)).cloned())
    }

    fn dir_exists_at(&self, rev: &str, dir: &str) -> Result<bool, GuardError> {
        let dir = normalize_repo_path(dir);
        Ok(self
            .snapshot(rev)?
            .keys()
            .any(|p| p != &dir && is_under(p, &dir)))
    }

    fn read_working_file(&self, path: &str) -> Result<Option<String>, GuardError> {
        Ok(self.working.get(&normalize_repo_path(path)).cloned())
    }

    fn working_path_exists(&self, path: &str) -> Result<bool, GuardError> {
        let path = normalize_repo_path(path);
        Ok(self.working.keys().any(|p| is_under(p, &path)))
    }
}
