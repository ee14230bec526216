//! Policy validation run.
//!
//! One run reads the control files, derives the stage diff, classifies every
//! changed path and evaluates the gates in a fixed order:
//!
//! - artifacts (required pack files, manifest at level 3)
//! - worktree cleanliness (commit-validating stages)
//! - protected zones and intent storage confinement
//! - scope plan and zone expectations
//! - new-folder quarantine
//! - red operations
//! - change manifest reconciliation
//! - intent lifecycle
//!
//! Gates only append findings. A [`GuardError`] stops the run early; the
//! report then carries a single `VALIDATOR_ABORT` finding next to whatever
//! artifact findings explain the stop.
//!
//! # Determinism
//!
//! The same repository state yields the same report bytes, except for the
//! `timestamp` field, which `SOURCE_DATE_EPOCH` pins.

use std::collections::BTreeSet;

use crate::core::config::{CONTROL_DIR, GovernanceConfig, PolicyBundle, load_policy};
use crate::core::diff::{
    ChangeRecord, canonicalize, collect_stage_diff, diff_digest, new_directories,
    partition_ignored, select_base,
};
use crate::core::error::GuardError;
use crate::core::glob::PatternSet;
use crate::core::intent::{
    ActiveIntentPointer, EVIDENCE_DIR, IntentPack, IntentRecord, enforce_storage_confinement,
    load_intent, load_intent_at, load_pointer, load_pointer_at,
};
use crate::core::lifecycle::{self, LifecycleInput, PreviousPack, find_sealed_packs};
use crate::core::manifest::{self, ChangeManifest, Derived};
use crate::core::paths::normalize_repo_path;
use crate::core::red_ops::{self, DeclarationSource};
use crate::core::report::{ChangedFileEntry, ValidationReport};
use crate::core::scope::{ScopePlan, enforce_scope, parse_development_plan};
use crate::core::stage::Stage;
use crate::core::time;
use crate::core::vcs::Repository;
use crate::core::verdict::{Finding, FindingCode, Findings, Verdict, assemble};
use crate::core::zones::{
    Classification, ClassifiedChange, enforce_protected_zones, enforce_quarantine,
};

/// Environment switch for gate tracing, equivalent to `--debug`.
pub const TRACE_ENV: &str = "INTENTGUARD_TRACE";

#[derive(Debug, Clone)]
pub struct ValidateOptions {
    pub stage: Stage,
    pub base_override: Option<String>,
    pub debug: bool,
    pub write_report: bool,
}

impl ValidateOptions {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            base_override: None,
            debug: false,
            write_report: true,
        }
    }
}

/// Gate trace lines on stderr.
#[derive(Debug, Clone, Copy)]
pub struct Tracer {
    enabled: bool,
}

impl Tracer {
    pub fn new(debug: bool) -> Self {
        let from_env = std::env::var(TRACE_ENV).ok().as_deref() == Some("1");
        Self {
            enabled: debug || from_env,
        }
    }

    pub fn trace_gate(&self, name: &str) {
        if self.enabled {
            eprintln!("validate: trace {}", name);
        }
    }

    pub fn debug(&self, message: &str) {
        if self.enabled {
            eprintln!("validate: debug {}", message);
        }
    }
}

#[derive(Debug)]
pub struct ValidationOutcome {
    pub report: ValidationReport,
    /// Repo-relative location the report was (or would have been) written to.
    pub report_path: String,
    pub written: bool,
}

impl ValidationOutcome {
    pub fn exit_code(&self) -> i32 {
        self.report.exit_code
    }
}

pub fn fallback_report_path(stage: Stage) -> String {
    format!("{CONTROL_DIR}/validator-report.{stage}.json")
}

/// Generated outputs that never count as changes.
pub fn ignore_patterns(gov: &GovernanceConfig) -> Vec<String> {
    let mut patterns = vec![
        format!(
            "{}/**/{EVIDENCE_DIR}/validator-report.*.json",
            normalize_repo_path(&gov.intents_root)
        ),
        format!("{CONTROL_DIR}/validator-report.*.json"),
    ];
    patterns.extend(gov.ignore.iter().cloned());
    patterns
}

/// The active pointer and its resolved pack.
#[derive(Debug, Clone)]
pub struct ActiveUnit {
    pub pointer: ActiveIntentPointer,
    pub pack: IntentPack,
}

pub fn locate_active_unit(
    repo: &dyn Repository,
    gov: &GovernanceConfig,
) -> Result<ActiveUnit, GuardError> {
    let pointer = load_pointer(repo, &gov.current_intent_file)?;
    let pack = IntentPack::resolve(&gov.intents_root, &pointer.active_pack_path)?;
    if !repo.working_path_exists(&pack.dir)? {
        return Err(GuardError::RoutingError(format!(
            "active pack {} does not exist",
            pack.dir
        )));
    }
    Ok(ActiveUnit { pointer, pack })
}

/// Everything derived from the diff before any gate runs.
#[derive(Debug, Clone)]
pub struct DerivedChanges {
    pub base_revision: String,
    pub working_revision: Option<String>,
    pub changes: Vec<ChangeRecord>,
    pub ignored: Vec<ChangeRecord>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
    pub new_directories: BTreeSet<String>,
    pub classified: Vec<ClassifiedChange>,
}

pub fn derive_changes(
    repo: &dyn Repository,
    policy: &PolicyBundle,
    stage: Stage,
    base_override: Option<&str>,
    tracer: &Tracer,
) -> Result<DerivedChanges, GuardError> {
    let gov = &policy.governance;
    let selection = select_base(repo, stage, base_override, &gov.ci_base_candidates)?;
    tracer.debug(&format!("base {} via {}", selection.base, selection.source));

    let stage_diff = collect_stage_diff(repo, stage, selection)?;
    let ignore = PatternSet::compile(&ignore_patterns(gov))?;
    let (changes, ignored) = partition_ignored(stage_diff.changes, &ignore);
    let unstaged = stage_diff
        .unstaged
        .into_iter()
        .filter(|p| !ignore.any_match(p))
        .collect();
    let untracked = stage_diff
        .untracked
        .into_iter()
        .filter(|p| !ignore.any_match(p))
        .collect();
    tracer.debug(&format!(
        "changes={} ignored={}",
        changes.len(),
        ignored.len()
    ));

    let base_revision = stage_diff.base.base;
    let new_dirs = new_directories(repo, &base_revision, &changes)?;
    let classified = policy.zones.classify_all(&changes, &new_dirs);

    Ok(DerivedChanges {
        base_revision,
        working_revision: stage_diff.working_revision,
        changes,
        ignored,
        unstaged,
        untracked,
        new_directories: new_dirs,
        classified,
    })
}

/// Run every gate for `opts.stage` and write the report unless disabled.
pub fn run_validation(
    repo: &dyn Repository,
    opts: &ValidateOptions,
) -> Result<ValidationOutcome, GuardError> {
    let tracer = Tracer::new(opts.debug);
    let mut run = Run {
        repo,
        opts,
        tracer,
        report: ValidationReport::new(opts.stage, time::report_timestamp()),
        findings: Findings::new(),
        pack: None,
    };

    let verdict = match run.evaluate() {
        Ok(()) => assemble(run.findings.as_slice()),
        Err(err) => {
            let category = err.abort_category();
            tracer.debug(&format!("abort {}: {}", category.as_str(), err));
            run.findings.push(
                Finding::fail(FindingCode::ValidatorAbort, err.to_string())
                    .with_details(serde_json::json!({ "category": category })),
            );
            Verdict::failed(category)
        }
    };

    let report_path = match &run.pack {
        Some(pack) => pack.report_path(opts.stage),
        None => fallback_report_path(opts.stage),
    };
    let Run {
        mut report,
        findings,
        ..
    } = run;
    report.seal(findings.into_vec(), verdict);

    if opts.write_report {
        report.write_to(&repo.root().join(&report_path))?;
    }
    Ok(ValidationOutcome {
        report,
        report_path,
        written: opts.write_report,
    })
}

struct Run<'a> {
    repo: &'a dyn Repository,
    opts: &'a ValidateOptions,
    tracer: Tracer,
    report: ValidationReport,
    findings: Findings,
    pack: Option<IntentPack>,
}

impl Run<'_> {
    fn evaluate(&mut self) -> Result<(), GuardError> {
        let repo = self.repo;
        let stage = self.opts.stage;

        self.tracer.trace_gate("policy");
        let policy = load_policy(repo)?;
        let gov = &policy.governance;
        self.report.governance_level = Some(gov.level);
        self.tracer.debug(&format!(
            "level={} sources={}",
            gov.level.value(),
            policy.sources.join(",")
        ));

        self.tracer.trace_gate("pointer");
        let unit = locate_active_unit(repo, gov)?;
        let pack = unit.pack.clone();
        self.report.active_intent_id = Some(unit.pointer.active_intent_id.clone());
        self.report.active_pack_path = Some(pack.dir.clone());
        self.pack = Some(pack.clone());

        self.tracer.trace_gate("artifacts");
        let manifest_text = self.check_artifacts(gov, &pack)?;

        self.tracer.trace_gate("intent");
        let intent = load_intent(repo, &pack)?;
        let mut scope = intent.doc.scope.clone();
        if let Some(text) = repo.read_working_file(&pack.plan_path())? {
            scope = scope.overlay(&parse_development_plan(&text));
        }
        let plan = ScopePlan::compile(&scope)?;
        let manifest = match manifest_text {
            Some(text) => Some(ChangeManifest::parse(&pack.manifest_path(), &text)?),
            None => None,
        };

        self.tracer.trace_gate("diff");
        let derived = derive_changes(
            repo,
            &policy,
            stage,
            self.opts.base_override.as_deref(),
            &self.tracer,
        )?;
        self.report.base_revision = Some(derived.base_revision.clone());
        self.report.working_revision = derived.working_revision.clone();
        self.report.diff_digest = Some(diff_digest(&derived.changes)?);
        self.report.changed_files = derived.classified.iter().map(ChangedFileEntry::from).collect();
        self.report.ignored_changed_files = derived.ignored.clone();
        self.report.new_directories = derived.new_directories.iter().cloned().collect();

        self.tracer.trace_gate("worktree");
        self.check_worktree(stage, &derived);

        let pointer_path = normalize_repo_path(&gov.current_intent_file);

        self.tracer.trace_gate("protected_zones");
        let allowlist = PatternSet::compile(&intent.doc.kernel_upgrade.allow_protected_paths)?;
        enforce_protected_zones(
            &policy.zones,
            &derived.classified,
            stage,
            &allowlist,
            &mut self.findings,
        );
        let touched: Vec<&str> = derived
            .changes
            .iter()
            .flat_map(ChangeRecord::touched_paths)
            .collect();
        enforce_storage_confinement(
            &touched,
            &gov.intents_root,
            &pointer_path,
            &pack,
            &mut self.findings,
        );

        self.tracer.trace_gate("scope");
        let implicitly_allowed = |path: &str| path == pointer_path || pack.contains(path);
        enforce_scope(&plan, &derived.classified, &implicitly_allowed, &mut self.findings);

        self.tracer.trace_gate("quarantine");
        enforce_quarantine(
            &derived.classified,
            gov.level.quarantine_is_fatal(),
            &mut self.findings,
        );

        self.tracer.trace_gate("red_operations");
        let detection = red_ops::detect(&derived.changes, &policy.red_ops);
        self.report.detected_red_ops = detection.ids().into_iter().collect();
        match (&manifest, gov.level.requires_manifest()) {
            (Some(m), true) => red_ops::reconcile(
                &detection,
                &m.declared_red_ops(),
                DeclarationSource::Manifest,
                &mut self.findings,
            ),
            _ => {
                let declared: BTreeSet<String> =
                    intent.doc.red_ops_declared.iter().cloned().collect();
                red_ops::reconcile(
                    &detection,
                    &declared,
                    DeclarationSource::Intent,
                    &mut self.findings,
                );
            }
        }

        if let Some(m) = &manifest {
            self.tracer.trace_gate("manifest");
            manifest::reconcile(
                m,
                &Derived {
                    stage,
                    base_revision: &derived.base_revision,
                    working_revision: derived.working_revision.as_deref(),
                    classified: &derived.classified,
                    new_directories: &derived.new_directories,
                },
                &mut self.findings,
            );
        }

        self.tracer.trace_gate("lifecycle");
        self.check_lifecycle(gov, &unit, &intent, &derived, &pointer_path)?;

        Ok(())
    }

    /// Missing required files are collected first, then reported as one abort.
    fn check_artifacts(
        &mut self,
        gov: &GovernanceConfig,
        pack: &IntentPack,
    ) -> Result<Option<String>, GuardError> {
        let mut missing = Vec::new();
        for name in &gov.required_artifacts {
            let path = pack.file(name);
            if !self.repo.working_path_exists(&path)? {
                self.findings.push(
                    Finding::fail(
                        FindingCode::MissingArtifact,
                        format!("required artifact '{name}' is missing"),
                    )
                    .at(path.clone()),
                );
                missing.push(path);
            }
        }

        let manifest_path = pack.manifest_path();
        let manifest_text = self.repo.read_working_file(&manifest_path)?;
        if manifest_text.is_none() && gov.level.requires_manifest() {
            self.findings.push(
                Finding::fail(
                    FindingCode::MissingManifest,
                    "governance level 3 requires a change manifest",
                )
                .at(manifest_path.clone()),
            );
            missing.push(manifest_path);
        }

        if !missing.is_empty() {
            return Err(GuardError::ArtifactError(format!(
                "missing from {}: {}",
                pack.dir,
                missing.join(", ")
            )));
        }
        Ok(manifest_text)
    }

    fn check_worktree(&mut self, stage: Stage, derived: &DerivedChanges) {
        if !stage.validates_commits() {
            return;
        }
        if !derived.unstaged.is_empty() {
            self.findings.push(
                Finding::fail(
                    FindingCode::DirtyWorktree,
                    format!(
                        "{} tracked file(s) differ from the index; stage '{stage}' validates commits only",
                        derived.unstaged.len()
                    ),
                )
                .with_details(serde_json::json!({ "paths": derived.unstaged })),
            );
        }
        if stage == Stage::Ci && !derived.untracked.is_empty() {
            self.findings.push(
                Finding::fail(
                    FindingCode::UntrackedPresent,
                    format!("{} untracked file(s) present", derived.untracked.len()),
                )
                .with_details(serde_json::json!({ "paths": derived.untracked })),
            );
        }
    }

    fn check_lifecycle(
        &mut self,
        gov: &GovernanceConfig,
        unit: &ActiveUnit,
        intent: &IntentRecord,
        derived: &DerivedChanges,
        pointer_path: &str,
    ) -> Result<(), GuardError> {
        let repo = self.repo;
        let base = derived.base_revision.as_str();
        let pack = &unit.pack;

        // A rewrite naming the same intent and pack is not a switch.
        let prior_pack = match load_pointer_at(repo, base, pointer_path)? {
            Some(prior) => Some((
                prior.active_intent_id,
                IntentPack::resolve(&gov.intents_root, &prior.active_pack_path)?,
            )),
            None => None,
        };
        let pointer_changed = match &prior_pack {
            Some((prior_id, prior)) => {
                *prior_id != unit.pointer.active_intent_id || prior != pack
            }
            None => derived.changes.iter().any(|c| c.touches(pointer_path)),
        };
        let base_intent = load_intent_at(repo, base, pack)?;

        let previous_pack = match prior_pack {
            Some((_, prior)) if pointer_changed && prior != *pack => Some(prior),
            _ => None,
        };
        let (previous_base, previous_working) = match &previous_pack {
            Some(prev) => (
                load_intent_at(repo, base, prev)?,
                read_working_intent(repo, prev)?,
            ),
            None => (None, None),
        };
        let previous = previous_pack.as_ref().map(|prev| PreviousPack {
            pack: prev,
            base: previous_base.as_ref(),
            working: previous_working.as_ref(),
        });

        let sealed = find_sealed_packs(repo, base, &gov.intents_root, &derived.changes, pack)?;

        let input = LifecycleInput {
            stage: self.opts.stage,
            changes: &derived.changes,
            pointer_path,
            pointer_intent_id: &unit.pointer.active_intent_id,
            pointer_changed,
            pack,
            base: base_intent.as_ref(),
            working: intent,
            previous,
            sealed: &sealed,
        };
        let tx = lifecycle::evaluate(&input, &mut self.findings);
        self.tracer.debug(&format!("lifecycle transaction {tx:?}"));
        Ok(())
    }
}

fn read_working_intent(
    repo: &dyn Repository,
    pack: &IntentPack,
) -> Result<Option<IntentRecord>, GuardError> {
    let path = pack.intent_path();
    match repo.read_working_file(&path)? {
        Some(text) => IntentRecord::parse(&path, &text).map(Some),
        None => Ok(None),
    }
}

/// A manifest mirroring the current stage diff, including its own entry.
pub fn build_mirror_manifest(
    repo: &dyn Repository,
    stage: Stage,
    base_override: Option<&str>,
    tracer: &Tracer,
) -> Result<ChangeManifest, GuardError> {
    let policy = load_policy(repo)?;
    let unit = locate_active_unit(repo, &policy.governance)?;
    let mut derived = derive_changes(repo, &policy, stage, base_override, tracer)?;

    let manifest_path = unit.pack.manifest_path();
    if !derived.changes.iter().any(|c| c.path == manifest_path) {
        let record = if repo
            .read_file_at(&derived.base_revision, &manifest_path)?
            .is_some()
        {
            ChangeRecord::modified(&manifest_path)
        } else {
            ChangeRecord::added(&manifest_path)
        };
        let mut changes = derived.changes.clone();
        changes.push(record);
        derived.changes = canonicalize(changes)?;
        derived.new_directories =
            new_directories(repo, &derived.base_revision, &derived.changes)?;
        derived.classified = policy
            .zones
            .classify_all(&derived.changes, &derived.new_directories);
    }

    let detection = red_ops::detect(&derived.changes, &policy.red_ops);
    Ok(ChangeManifest::mirror(
        &derived.base_revision,
        derived.working_revision.as_deref(),
        &derived.classified,
        &derived.new_directories,
        &detection.ids(),
    ))
}

/// Zone classification for arbitrary paths, as if each were changed.
pub fn classify_paths(
    repo: &dyn Repository,
    stage: Stage,
    base_override: Option<&str>,
    paths: &[String],
) -> Result<Vec<(String, Classification)>, GuardError> {
    let policy = load_policy(repo)?;
    let selection = select_base(
        repo,
        stage,
        base_override,
        &policy.governance.ci_base_candidates,
    )?;
    let records: Vec<ChangeRecord> = paths
        .iter()
        .map(|p| ChangeRecord::modified(&normalize_repo_path(p)))
        .collect();
    let new_dirs = new_directories(repo, &selection.base, &records)?;
    Ok(records
        .into_iter()
        .map(|r| {
            let classification = policy.zones.classify(&r.path, &new_dirs);
            (r.path, classification)
        })
        .collect())
}
