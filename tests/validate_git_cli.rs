use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const POINTER: &str =
    r#"{"schema_version":"1","active_intent_id":"feat-docs","active_pack_path":"feat-docs"}"#;
const INTENT: &str = r#"{
  "schema_version": "intent.v1",
  "intent_id": "feat-docs",
  "status": "open",
  "scope": {"allowed_paths": ["docs/**"]}
}"#;

fn run_intentguard(dir: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_intentguard"))
        .current_dir(dir)
        .args(args)
        .env("SOURCE_DATE_EPOCH", "1700000000")
        .env_remove("INTENTGUARD_TRACE")
        .output()
        .expect("run intentguard")
}

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .current_dir(dir)
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(args)
        .output()
        .expect("run git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create dirs");
    }
    fs::write(path, content).expect("write file");
}

fn setup_repo() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().expect("tmpdir");
    let dir = tmp.path().to_path_buf();
    git(&dir, &["init", "-b", "main"]);
    write(
        &dir,
        ".intentguard/zones.yml",
        "folder_zones:\n  \"\": yellow\n  docs: green\n  core: purple\n",
    );
    write(&dir, ".intentguard/current-intent.json", POINTER);
    write(&dir, ".intentguard/intents/feat-docs/intent.json", INTENT);
    write(&dir, "docs/readme.md", "# readme\n");
    write(&dir, "core/engine.c", "int main(void) { return 0; }\n");
    git(&dir, &["add", "-A"]);
    git(&dir, &["commit", "-m", "initial"]);
    (tmp, dir)
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn coding_pass_writes_report_into_pack_evidence() {
    let (_tmp, dir) = setup_repo();
    write(&dir, "docs/readme.md", "# readme\n\nupdated\n");

    let out = run_intentguard(&dir, &["validate", "--stage", "coding"]);
    assert_eq!(out.status.code(), Some(0), "stdout:\n{}", stdout(&out));
    assert!(stdout(&out).contains("validate: summary ok=true fail=0 warn=0"));

    let report_path = dir.join(".intentguard/intents/feat-docs/evidence/validator-report.coding.json");
    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(report_path).expect("report written"))
            .expect("report json");
    assert_eq!(report["ok"], true);
    assert_eq!(report["timestamp"], "1700000000Z");
    assert_eq!(report["changed_files"][0]["path"], "docs/readme.md");
    assert_eq!(report["changed_files"][0]["change_type"], "M");

    // A second run ignores the report it wrote.
    let again = run_intentguard(&dir, &["validate", "--stage", "coding", "--format", "json", "--no-write"]);
    assert_eq!(again.status.code(), Some(0));
    let report: serde_json::Value = serde_json::from_str(&stdout(&again)).expect("json output");
    assert_eq!(report["ignored_changed_files"].as_array().map(Vec::len), Some(1));
}

#[test]
fn protected_zone_edit_exits_with_its_category() {
    let (_tmp, dir) = setup_repo();
    write(&dir, "core/engine.c", "int main(void) { return 1; }\n");

    let out = run_intentguard(
        &dir,
        &["validate", "--stage", "coding", "--format", "json", "--no-write"],
    );
    // Scope (allowed_paths lacks core/**) outranks the protected-zone failure.
    assert_eq!(out.status.code(), Some(50));
    let report: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("json output");
    assert_eq!(report["category"], "scope_plan");
    let codes: Vec<&str> = report["findings"]
        .as_array()
        .expect("findings")
        .iter()
        .filter_map(|f| f["code"].as_str())
        .collect();
    assert!(codes.contains(&"PROTECTED_ZONE_TOUCHED"));
    assert!(codes.contains(&"PLAN_ALLOWED_VIOLATION"));
    assert!(!dir.join(".intentguard/intents/feat-docs/evidence").exists());
}

#[test]
fn verification_validates_the_last_commit() {
    let (_tmp, dir) = setup_repo();
    write(&dir, "docs/guide.md", "guide\n");
    git(&dir, &["add", "-A"]);
    git(&dir, &["commit", "-m", "docs: guide"]);

    let out = run_intentguard(
        &dir,
        &["validate", "--stage", "verification", "--format", "json", "--no-write"],
    );
    assert_eq!(out.status.code(), Some(0), "stdout:\n{}", stdout(&out));
    let report: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("json output");
    assert_eq!(report["changed_files"][0]["path"], "docs/guide.md");
    assert_eq!(report["changed_files"][0]["change_type"], "A");
    assert!(report["working_revision"].is_string());
}

#[test]
fn ci_rejects_a_dirty_worktree() {
    let (_tmp, dir) = setup_repo();
    write(&dir, "docs/readme.md", "# uncommitted\n");
    write(&dir, "docs/scratch.md", "scratch\n");

    let out = run_intentguard(
        &dir,
        &["validate", "--stage", "ci", "--format", "json", "--no-write"],
    );
    assert_eq!(out.status.code(), Some(80));
    let report: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("json output");
    let codes: Vec<&str> = report["findings"]
        .as_array()
        .expect("findings")
        .iter()
        .filter_map(|f| f["code"].as_str())
        .collect();
    assert_eq!(codes, vec!["DIRTY_WORKTREE", "UNTRACKED_PRESENT"]);
}

#[test]
fn classify_explains_zones() {
    let (_tmp, dir) = setup_repo();
    let out = run_intentguard(&dir, &["classify", "docs/readme.md", "plugins/x/new.py"]);
    assert_eq!(out.status.code(), Some(0));
    let text = stdout(&out);
    assert!(text.contains("docs/readme.md: green (folder 'docs')"), "{text}");
    assert!(text.contains("plugins/x/new.py: yellow-auto (new-folder quarantine) [quarantine]"), "{text}");
}

#[test]
fn manifest_command_prints_a_mirror() {
    let (_tmp, dir) = setup_repo();
    write(&dir, "docs/readme.md", "# readme v2\n");
    let out = run_intentguard(&dir, &["manifest", "--stage", "coding"]);
    assert_eq!(out.status.code(), Some(0));
    let manifest: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("json output");
    assert_eq!(manifest["artifact_schema_version"], "change_manifest.v1");
    let paths: Vec<&str> = manifest["changed_files"]
        .as_array()
        .expect("changed_files")
        .iter()
        .filter_map(|e| e["path"].as_str())
        .collect();
    assert_eq!(
        paths,
        vec![
            ".intentguard/intents/feat-docs/change-manifest.json",
            "docs/readme.md"
        ]
    );

    // Saving the mirror makes the run reconcile cleanly.
    write(
        &dir,
        ".intentguard/intents/feat-docs/change-manifest.json",
        &stdout(&out),
    );
    let check = run_intentguard(&dir, &["validate", "--stage", "coding", "--no-write"]);
    assert_eq!(check.status.code(), Some(0), "stdout:\n{}", stdout(&check));
}

#[test]
fn missing_zone_policy_aborts_as_config_invalid() {
    let (_tmp, dir) = setup_repo();
    fs::remove_file(dir.join(".intentguard/zones.yml")).expect("remove zones");
    let out = run_intentguard(&dir, &["validate", "--stage", "coding"]);
    assert_eq!(out.status.code(), Some(15));
    let fallback = dir.join(".intentguard/validator-report.coding.json");
    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(fallback).expect("fallback report"))
            .expect("report json");
    assert_eq!(report["findings"][0]["code"], "VALIDATOR_ABORT");
}
