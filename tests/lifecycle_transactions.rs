use intentguard::core::stage::Stage;
use intentguard::core::validate::{ValidateOptions, ValidationOutcome, run_validation};
use intentguard::core::vcs::MemoryRepository;
use intentguard::core::verdict::{FailCategory, FindingCode};

const POINTER_PATH: &str = ".intentguard/current-intent.json";

fn pointer(id: &str) -> String {
    serde_json::json!({
        "schema_version": "1",
        "active_intent_id": id,
        "active_pack_path": id,
    })
    .to_string()
}

fn intent(id: &str, status: &str, goal: &str) -> String {
    serde_json::json!({
        "schema_version": "intent.v1",
        "intent_id": id,
        "status": status,
        "goal": goal,
        "scope": {"allowed_paths": ["src/**", "docs/**"]},
    })
    .to_string()
}

fn intent_path(id: &str) -> String {
    format!(".intentguard/intents/{id}/intent.json")
}

/// Two packs, `alpha` active and open, `beta` open; one commit.
fn fixture() -> MemoryRepository {
    let mut repo = MemoryRepository::new("/nonexistent/lifecycle");
    repo.write_staged(
        ".intentguard/zones.yml",
        "folder_zones:\n  \"\": yellow\n  src: yellow\n  docs: green\n",
    )
    .write_staged(POINTER_PATH, &pointer("alpha"))
    .write_staged(&intent_path("alpha"), &intent("alpha", "open", "first"))
    .write_staged(&intent_path("beta"), &intent("beta", "open", "second"))
    .write_staged("src/lib.rs", "pub fn f() {}\n")
    .commit("c1");
    repo
}

fn validate(repo: &MemoryRepository, stage: Stage) -> ValidationOutcome {
    let opts = ValidateOptions {
        write_report: false,
        ..ValidateOptions::new(stage)
    };
    run_validation(repo, &opts).expect("validation run")
}

fn has(outcome: &ValidationOutcome, code: FindingCode) -> bool {
    outcome.report.findings.iter().any(|f| f.code == code)
}

#[test]
fn clean_close_passes_at_verification() {
    let mut repo = fixture();
    repo.write_staged(&intent_path("alpha"), &intent("alpha", "closed", "first"))
        .commit("c2");
    let outcome = validate(&repo, Stage::Verification);
    assert!(outcome.report.ok, "{:?}", outcome.report.findings);
}

#[test]
fn close_is_forbidden_while_coding() {
    let mut repo = fixture();
    repo.write(&intent_path("alpha"), &intent("alpha", "closed", "first"));
    let outcome = validate(&repo, Stage::Coding);
    assert!(has(&outcome, FindingCode::CloseForbiddenStage));
    assert_eq!(outcome.report.category, Some(FailCategory::Lifecycle));
    assert_eq!(outcome.exit_code(), 45);
}

#[test]
fn close_with_other_edits_is_mixed() {
    let mut repo = fixture();
    repo.write_staged(&intent_path("alpha"), &intent("alpha", "closed", "first"))
        .write_staged("src/lib.rs", "pub fn g() {}\n")
        .commit("c2");
    let outcome = validate(&repo, Stage::Verification);
    let mixed: Vec<_> = outcome
        .report
        .findings
        .iter()
        .filter(|f| f.code == FindingCode::CloseTransactionMixedChanges)
        .collect();
    assert_eq!(mixed.len(), 1);
    assert_eq!(mixed[0].path.as_deref(), Some("src/lib.rs"));
}

#[test]
fn close_must_only_change_status() {
    let mut repo = fixture();
    repo.write_staged(&intent_path("alpha"), &intent("alpha", "closed", "rewritten"))
        .commit("c2");
    let outcome = validate(&repo, Stage::Verification);
    let finding = outcome
        .report
        .findings
        .iter()
        .find(|f| f.code == FindingCode::CloseTransactionMixedChanges)
        .expect("mixed close finding");
    let details = finding.details.as_ref().expect("details");
    assert_eq!(details["changed_fields"], serde_json::json!(["goal"]));
}

#[test]
fn closed_intent_is_sealed_and_cannot_reopen() {
    let mut repo = fixture();
    repo.write_staged(&intent_path("alpha"), &intent("alpha", "closed", "first"))
        .commit("c2");
    repo.write(&intent_path("alpha"), &intent("alpha", "open", "first"));
    let outcome = validate(&repo, Stage::Coding);
    assert!(!outcome.report.ok);
    assert!(has(&outcome, FindingCode::ClosedToOpenForbidden));
    assert!(has(&outcome, FindingCode::ClosedIntentImmutable));
}

#[test]
fn edits_inside_another_closed_pack_are_rejected() {
    let mut repo = fixture();
    repo.write_staged(&intent_path("beta"), &intent("beta", "closed", "second"))
        .commit("c2");
    repo.write(".intentguard/intents/beta/notes.md", "late addition\n");
    let outcome = validate(&repo, Stage::Coding);
    assert!(has(&outcome, FindingCode::ClosedIntentImmutable));
    assert!(has(&outcome, FindingCode::IntentStorageOutsideActivePack));
}

#[test]
fn clean_switch_passes_at_ci() {
    let mut repo = fixture();
    repo.set_ref("main", "c1");
    repo.write_staged(POINTER_PATH, &pointer("beta")).commit("c2");
    let outcome = validate(&repo, Stage::Ci);
    assert!(outcome.report.ok, "{:?}", outcome.report.findings);
    assert_eq!(outcome.report.base_revision.as_deref(), Some("c1"));
}

#[test]
fn pointer_change_is_forbidden_while_coding() {
    let mut repo = fixture();
    repo.write(POINTER_PATH, &pointer("beta"));
    let outcome = validate(&repo, Stage::Coding);
    assert!(has(&outcome, FindingCode::PointerChangedInCoding));
}

#[test]
fn rewriting_the_pointer_without_retargeting_is_ordinary_work() {
    let mut repo = fixture();
    let reformatted = serde_json::to_string_pretty(&serde_json::json!({
        "active_pack_path": "alpha",
        "active_intent_id": "alpha",
        "schema_version": "1",
    }))
    .unwrap();
    repo.write(POINTER_PATH, &format!("{reformatted}\n"));
    let outcome = validate(&repo, Stage::Coding);
    assert!(outcome.report.ok, "{:?}", outcome.report.findings);

    repo.write_staged(POINTER_PATH, &format!("{reformatted}\n"))
        .write_staged("src/lib.rs", "pub fn g() {}\n")
        .commit("c2");
    let outcome = validate(&repo, Stage::Verification);
    assert!(outcome.report.ok, "{:?}", outcome.report.findings);
    assert!(!has(&outcome, FindingCode::SwitchTransactionMixedChanges));
}

#[test]
fn retargeting_only_the_pack_path_is_a_switch() {
    let mut repo = fixture();
    let retargeted = serde_json::json!({
        "schema_version": "1",
        "active_intent_id": "alpha",
        "active_pack_path": "beta",
    })
    .to_string();
    repo.write(POINTER_PATH, &retargeted);
    let outcome = validate(&repo, Stage::Coding);
    assert!(has(&outcome, FindingCode::PointerChangedInCoding));
}

#[test]
fn switching_onto_a_closed_intent_fails() {
    let mut repo = fixture();
    repo.write_staged(&intent_path("beta"), &intent("beta", "closed", "second"))
        .commit("c2");
    repo.write_staged(POINTER_PATH, &pointer("beta")).commit("c3");
    let outcome = validate(&repo, Stage::Verification);
    assert!(has(&outcome, FindingCode::ClosedIntentNotActivatable));
}

#[test]
fn closing_the_previous_intent_while_switching_fails() {
    let mut repo = fixture();
    repo.write_staged(POINTER_PATH, &pointer("beta"))
        .write_staged(&intent_path("alpha"), &intent("alpha", "closed", "first"))
        .commit("c2");
    let outcome = validate(&repo, Stage::Verification);
    assert!(has(&outcome, FindingCode::SwitchAndCloseCombined));
    assert!(has(&outcome, FindingCode::SwitchTransactionMixedChanges));
}

#[test]
fn pointer_and_intent_ids_must_agree() {
    let mut repo = fixture();
    let mismatched = serde_json::json!({
        "schema_version": "1",
        "active_intent_id": "gamma",
        "active_pack_path": "alpha",
    })
    .to_string();
    repo.write_staged(POINTER_PATH, &mismatched).commit("c2");
    let outcome = validate(&repo, Stage::Verification);
    assert!(has(&outcome, FindingCode::ActiveIntentIdMismatch));
}

#[test]
fn pack_path_escaping_the_intents_root_aborts() {
    let mut repo = fixture();
    let escaping = serde_json::json!({
        "schema_version": "1",
        "active_intent_id": "alpha",
        "active_pack_path": "../../src",
    })
    .to_string();
    repo.write(POINTER_PATH, &escaping);
    let outcome = validate(&repo, Stage::Coding);
    assert_eq!(outcome.report.category, Some(FailCategory::RoutingInvalid));
    assert_eq!(outcome.exit_code(), 10);
}
