//! Validator report: the JSON evidence artifact and its terminal rendering.

use std::path::Path;

use serde::Serialize;

use crate::core::config::GovernanceLevel;
use crate::core::diff::{ChangeRecord, ChangeType};
use crate::core::error::GuardError;
use crate::core::output;
use crate::core::stage::Stage;
use crate::core::verdict::{FailCategory, Finding, Verdict};
use crate::core::zones::ClassifiedChange;

pub const REPORT_VERSION: &str = "validator_report.v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangedFileEntry {
    pub change_type: ChangeType,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    pub zone: String,
}

impl From<&ClassifiedChange> for ChangedFileEntry {
    fn from(entry: &ClassifiedChange) -> Self {
        Self {
            change_type: entry.change.change_type,
            path: entry.change.path.clone(),
            old_path: entry.change.old_path.clone(),
            zone: entry.zone().to_string(),
        }
    }
}

/// One run's outcome. Field order is the serialized order.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub report_version: String,
    pub ok: bool,
    pub stage: Stage,
    pub exit_code: i32,
    pub category: Option<FailCategory>,
    pub governance_level: Option<GovernanceLevel>,
    pub active_intent_id: Option<String>,
    pub active_pack_path: Option<String>,
    pub base_revision: Option<String>,
    pub working_revision: Option<String>,
    pub diff_digest: Option<String>,
    pub changed_files: Vec<ChangedFileEntry>,
    pub ignored_changed_files: Vec<ChangeRecord>,
    pub new_directories: Vec<String>,
    pub detected_red_ops: Vec<String>,
    pub findings: Vec<Finding>,
    pub timestamp: String,
}

impl ValidationReport {
    /// Empty report for `stage`; the verdict is applied with [`Self::seal`].
    pub fn new(stage: Stage, timestamp: String) -> Self {
        Self {
            report_version: REPORT_VERSION.to_string(),
            ok: true,
            stage,
            exit_code: 0,
            category: None,
            governance_level: None,
            active_intent_id: None,
            active_pack_path: None,
            base_revision: None,
            working_revision: None,
            diff_digest: None,
            changed_files: Vec::new(),
            ignored_changed_files: Vec::new(),
            new_directories: Vec::new(),
            detected_red_ops: Vec::new(),
            findings: Vec::new(),
            timestamp,
        }
    }

    pub fn seal(&mut self, findings: Vec<Finding>, verdict: Verdict) {
        self.findings = findings;
        self.ok = verdict.ok;
        self.category = verdict.category;
        self.exit_code = verdict.exit_code;
    }

    /// Pretty JSON with a trailing newline.
    pub fn to_json(&self) -> Result<String, GuardError> {
        let mut out = serde_json::to_string_pretty(self)?;
        out.push('\n');
        Ok(out)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), GuardError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    fn messages(&self, fail: bool) -> Vec<String> {
        self.findings
            .iter()
            .filter(|f| f.is_fail() == fail)
            .map(Finding::summary_line)
            .collect()
    }

    /// Terminal rendering: header, one line per finding, summary, verdict.
    pub fn render_text(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "validate: stage={} level={} intent={} base={}",
            self.stage,
            self.governance_level
                .map(|l| l.value().to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.active_intent_id.as_deref().unwrap_or("-"),
            self.base_revision.as_deref().map(short_rev).unwrap_or("-"),
        ));
        lines.push(format!(
            "validate: changed={} ignored={} new_dirs={} red_ops={}",
            self.changed_files.len(),
            self.ignored_changed_files.len(),
            self.new_directories.len(),
            if self.detected_red_ops.is_empty() {
                "-".to_string()
            } else {
                self.detected_red_ops.join(",")
            },
        ));
        for finding in &self.findings {
            lines.push(format!(
                "  {} {}",
                output::severity_label(finding.is_fail()),
                finding.summary_line()
            ));
        }

        let fails = self.messages(true);
        let warns = self.messages(false);
        lines.push(format!(
            "validate: summary ok={} fail={} warn={}",
            self.ok,
            fails.len(),
            warns.len()
        ));
        if !fails.is_empty() {
            lines.push(format!(
                "validate: failures {}: {}",
                fails.len(),
                output::preview_messages(&fails, 2, 110)
            ));
        }
        if !warns.is_empty() {
            lines.push(format!(
                "validate: warnings {}: {}",
                warns.len(),
                output::preview_messages(&warns, 2, 110)
            ));
        }
        lines.push(match self.category {
            Some(category) => format!(
                "validate: {} category={} exit={}",
                output::verdict_badge(self.ok),
                category.as_str(),
                self.exit_code
            ),
            None => format!("validate: {} exit={}", output::verdict_badge(self.ok), self.exit_code),
        });
        lines.join("\n")
    }
}

fn short_rev(rev: &str) -> &str {
    rev.get(..12).unwrap_or(rev)
}
