use serde::Serialize;

/// Workflow stage a run validates for. The stage selects the diff source and
/// decides whether irreversible lifecycle transitions are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Coding,
    Verification,
    Ci,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Coding => "coding",
            Stage::Verification => "verification",
            Stage::Ci => "ci",
        }
    }

    /// Close and switch transactions are only accepted outside `coding`.
    pub fn permits_irreversible_transitions(self) -> bool {
        !matches!(self, Stage::Coding)
    }

    /// Stages that validate committed history and so require a clean worktree.
    pub fn validates_commits(self) -> bool {
        matches!(self, Stage::Verification | Stage::Ci)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coding" => Ok(Stage::Coding),
            "verification" => Ok(Stage::Verification),
            "ci" => Ok(Stage::Ci),
            other => Err(format!(
                "unknown stage '{other}' (expected coding, verification or ci)"
            )),
        }
    }
}
