//! Policy configuration under `.intentguard/`.
//!
//! - `governance.{yml,yaml,toml}` (optional, defaults below)
//! - `zones.{yml,yaml,toml}` (required)
//! - `red_operations.{yml,yaml,toml}` (optional)
//!
//! Control files are read from the working tree through the repository, so
//! the same loader serves git checkouts and in-memory snapshots.

use serde::Serialize;

use crate::core::config_tree::{CONFIG_EXTENSIONS, ConfigNode, parse_config_text};
use crate::core::error::GuardError;
use crate::core::paths::{is_contained_relative, normalize_repo_path};
use crate::core::red_ops::RedOpRules;
use crate::core::vcs::Repository;
use crate::core::zones::ZonePolicy;

pub const CONTROL_DIR: &str = ".intentguard";
pub const DEFAULT_INTENTS_ROOT: &str = ".intentguard/intents";
pub const DEFAULT_POINTER_FILE: &str = ".intentguard/current-intent.json";
pub const DEFAULT_REQUIRED_ARTIFACTS: [&str; 1] = ["intent.json"];
pub const DEFAULT_BASE_CANDIDATES: [&str; 4] = ["origin/main", "origin/master", "main", "master"];

/// Governance strictness, 1 through 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct GovernanceLevel(u8);

impl GovernanceLevel {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 3;

    pub fn new(level: u8) -> Result<Self, GuardError> {
        if (Self::MIN..=Self::MAX).contains(&level) {
            Ok(Self(level))
        } else {
            Err(GuardError::ConfigError(format!(
                "governance level must be between {} and {}, got {}",
                Self::MIN,
                Self::MAX,
                level
            )))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Level 2 and up: quarantined paths fail instead of warn.
    pub fn quarantine_is_fatal(self) -> bool {
        self.0 >= 2
    }

    /// Level 3: the change manifest is mandatory and is the red-op declaration.
    pub fn requires_manifest(self) -> bool {
        self.0 >= 3
    }
}

impl Default for GovernanceLevel {
    fn default() -> Self {
        Self(Self::MIN)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GovernanceConfig {
    pub level: GovernanceLevel,
    pub intents_root: String,
    pub current_intent_file: String,
    /// File names every active pack must contain.
    pub required_artifacts: Vec<String>,
    pub ci_base_candidates: Vec<String>,
    /// Extra globs of generated files excluded from evaluation.
    pub ignore: Vec<String>,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            level: GovernanceLevel::default(),
            intents_root: DEFAULT_INTENTS_ROOT.to_string(),
            current_intent_file: DEFAULT_POINTER_FILE.to_string(),
            required_artifacts: DEFAULT_REQUIRED_ARTIFACTS.iter().map(|s| s.to_string()).collect(),
            ci_base_candidates: DEFAULT_BASE_CANDIDATES.iter().map(|s| s.to_string()).collect(),
            ignore: Vec::new(),
        }
    }
}

impl GovernanceConfig {
    pub fn from_tree(node: &ConfigNode) -> Result<Self, GuardError> {
        let mut cfg = Self::default();

        if let Some(raw) = node
            .lookup(&["governance", "level"])
            .or_else(|| node.get("level"))
        {
            cfg.level = parse_level(raw)?;
        }
        if let Some(root) = node
            .lookup(&["paths", "intents_root"])
            .and_then(ConfigNode::scalar_string)
        {
            cfg.intents_root = contained_path("paths.intents_root", &root)?;
        }
        if let Some(pointer) = node
            .lookup(&["paths", "current_intent_file"])
            .and_then(ConfigNode::scalar_string)
        {
            cfg.current_intent_file = contained_path("paths.current_intent_file", &pointer)?;
        }
        if let Some(list) = node.lookup(&["artifacts", "required"]) {
            cfg.required_artifacts = list
                .string_list("artifacts.required")?
                .iter()
                .map(|name| contained_path("artifacts.required", name))
                .collect::<Result<Vec<_>, _>>()?;
        }
        if let Some(list) = node.lookup(&["ci", "base_candidates"]) {
            cfg.ci_base_candidates = list.string_list("ci.base_candidates")?;
        }
        if let Some(list) = node.get("ignore") {
            cfg.ignore = list.string_list("ignore")?;
        }
        Ok(cfg)
    }
}

fn parse_level(raw: &ConfigNode) -> Result<GovernanceLevel, GuardError> {
    let level = match raw {
        ConfigNode::Int(i) => u8::try_from(*i).ok(),
        ConfigNode::Str(s) => s.trim().parse::<u8>().ok(),
        _ => None,
    };
    match level {
        Some(level) => GovernanceLevel::new(level),
        None => Err(GuardError::ConfigError(format!(
            "governance.level must be an integer, got {raw:?}"
        ))),
    }
}

fn contained_path(what: &str, raw: &str) -> Result<String, GuardError> {
    let normalized = normalize_repo_path(raw);
    if normalized.is_empty() || !is_contained_relative(raw) {
        return Err(GuardError::ConfigError(format!(
            "{what}: '{raw}' must be a relative path inside the repository"
        )));
    }
    Ok(normalized)
}

/// Everything the validator needs from configuration.
#[derive(Debug, Clone)]
pub struct PolicyBundle {
    pub governance: GovernanceConfig,
    pub zones: ZonePolicy,
    pub red_ops: RedOpRules,
    /// Control files that were read, in load order.
    pub sources: Vec<String>,
}

fn read_control_file(
    repo: &dyn Repository,
    stem: &str,
) -> Result<Option<(String, ConfigNode)>, GuardError> {
    for ext in CONFIG_EXTENSIONS {
        let name = format!("{CONTROL_DIR}/{stem}.{ext}");
        if let Some(text) = repo.read_working_file(&name)? {
            let tree = parse_config_text(&name, &text)?;
            return Ok(Some((name, tree)));
        }
    }
    Ok(None)
}

pub fn load_policy(repo: &dyn Repository) -> Result<PolicyBundle, GuardError> {
    let mut sources = Vec::new();

    let governance = match read_control_file(repo, "governance")? {
        Some((name, tree)) => {
            sources.push(name);
            GovernanceConfig::from_tree(&tree)?
        }
        None => GovernanceConfig::default(),
    };

    let zones = match read_control_file(repo, "zones")? {
        Some((name, tree)) => {
            let policy = ZonePolicy::from_tree(&tree)
                .map_err(|e| prefix_config_error(&name, e))?;
            sources.push(name);
            policy
        }
        None => {
            return Err(GuardError::ConfigError(format!(
                "no zone policy found ({CONTROL_DIR}/zones.yml, .yaml or .toml)"
            )));
        }
    };

    let red_ops = match read_control_file(repo, "red_operations")? {
        Some((name, tree)) => {
            let rules = RedOpRules::from_tree(&tree)
                .map_err(|e| prefix_config_error(&name, e))?;
            sources.push(name);
            rules
        }
        None => RedOpRules::default(),
    };

    Ok(PolicyBundle {
        governance,
        zones,
        red_ops,
        sources,
    })
}

fn prefix_config_error(name: &str, err: GuardError) -> GuardError {
    match err {
        GuardError::ConfigError(msg) => GuardError::ConfigError(format!("{name}: {msg}")),
        other => other,
    }
}
