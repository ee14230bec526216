//! CLI struct definitions for the intentguard command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use crate::core::stage::Stage;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "intentguard",
    version = env!("CARGO_PKG_VERSION"),
    about = "Deterministic repository-policy gate: zones, intent scope, lifecycle transactions, red operations and change manifests."
)]
pub(crate) struct Cli {
    /// Repository to operate on (defaults to the git work tree containing the current directory).
    #[clap(long, global = true)]
    pub repo: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(clap::Args, Debug)]
pub(crate) struct ValidateCli {
    /// Workflow stage to validate for.
    #[clap(long, value_enum)]
    pub stage: Stage,
    /// Output format: 'text' or 'json'.
    #[clap(long, value_enum, default_value = "text")]
    pub format: OutputFormat,
    /// Base revision, overriding the stage's selection.
    #[clap(long)]
    pub base: Option<String>,
    /// Do not write the report file.
    #[clap(long)]
    pub no_write: bool,
    /// Trace gates and base selection on stderr.
    #[clap(long)]
    pub debug: bool,
}

#[derive(clap::Args, Debug)]
pub(crate) struct ClassifyCli {
    /// Paths to classify, relative to the repository root.
    #[clap(required = true)]
    pub paths: Vec<String>,
    /// Stage whose base revision decides which folders are new.
    #[clap(long, value_enum, default_value = "coding")]
    pub stage: Stage,
    #[clap(long)]
    pub base: Option<String>,
    #[clap(long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(clap::Args, Debug)]
pub(crate) struct ManifestCli {
    #[clap(long, value_enum)]
    pub stage: Stage,
    #[clap(long)]
    pub base: Option<String>,
    #[clap(long)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Evaluate every policy gate and write the validator report
    #[clap(name = "validate", visible_alias = "v")]
    Validate(ValidateCli),

    /// Explain the zone of each path and where it came from
    #[clap(name = "classify", visible_alias = "c")]
    Classify(ClassifyCli),

    /// Print a change manifest mirroring the current diff
    #[clap(name = "manifest", visible_alias = "m")]
    Manifest(ManifestCli),
}
