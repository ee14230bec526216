//! intentguard: a deterministic repository-policy validator.
//!
//! A run looks at one change (the worktree at `coding`, the last commit at
//! `verification`, the branch at `ci`) and decides whether it stays inside
//! the active intent:
//!
//! - every changed path gets a **zone** from `.intentguard/zones.yml`
//! - the active intent's **scope plan** allows or forbids paths and zones
//! - paths in brand-new folders are **quarantined** until classified
//! - **red operations** must be declared
//! - a **change manifest**, when present, must mirror the diff exactly
//! - **lifecycle** transactions (close, switch) must be clean
//!
//! The result is a JSON report plus a process exit code naming the
//! highest-precedence failure category.
//!
//! # Examples
//!
//! ```bash
//! # Gate local work before committing
//! intentguard validate --stage coding
//!
//! # Gate a branch in CI, machine-readable
//! intentguard validate --stage ci --format json
//!
//! # Where does this path land?
//! intentguard classify src/new_module/lib.rs
//!
//! # Draft the manifest for the current diff
//! intentguard manifest --stage coding > change-manifest.json
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: configuration, diff reader, policy gates, verdict and report

pub mod core;

mod cli;

use crate::cli::{ClassifyCli, Cli, Command, ManifestCli, OutputFormat, ValidateCli};
use crate::core::error::GuardError;
use crate::core::validate::{
    Tracer, ValidateOptions, build_mirror_manifest, classify_paths, run_validation,
};
use crate::core::vcs::{GitRepository, Repository};

use clap::Parser;
use std::path::Path;

fn open_repository(repo: Option<&Path>) -> Result<GitRepository, GuardError> {
    match repo {
        Some(dir) => GitRepository::discover(dir),
        None => GitRepository::discover(&std::env::current_dir()?),
    }
}

/// Parse the command line, run the command and return the process exit code.
pub fn run() -> Result<i32, GuardError> {
    let cli = Cli::parse();
    let repo = open_repository(cli.repo.as_deref())?;

    match cli.command {
        Command::Validate(args) => run_validate(&repo, args),
        Command::Classify(args) => run_classify(&repo, args),
        Command::Manifest(args) => run_manifest(&repo, args),
    }
}

fn run_validate(repo: &dyn Repository, args: ValidateCli) -> Result<i32, GuardError> {
    let opts = ValidateOptions {
        stage: args.stage,
        base_override: args.base,
        debug: args.debug,
        write_report: !args.no_write,
    };
    let outcome = run_validation(repo, &opts)?;
    match args.format {
        OutputFormat::Json => print!("{}", outcome.report.to_json()?),
        OutputFormat::Text => {
            println!("{}", outcome.report.render_text());
            if outcome.written {
                println!("validate: report {}", outcome.report_path);
            }
        }
    }
    Ok(outcome.exit_code())
}

fn run_classify(repo: &dyn Repository, args: ClassifyCli) -> Result<i32, GuardError> {
    let results = classify_paths(repo, args.stage, args.base.as_deref(), &args.paths)?;
    match args.format {
        OutputFormat::Json => {
            let items: Vec<serde_json::Value> = results
                .iter()
                .map(|(path, c)| {
                    serde_json::json!({
                        "path": path,
                        "zone": c.zone,
                        "source": c.source,
                        "quarantined": c.is_quarantined(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Text => {
            for (path, c) in &results {
                let flag = if c.is_quarantined() { " [quarantine]" } else { "" };
                println!("{path}: {} ({}){flag}", c.zone, c.source.label());
            }
        }
    }
    Ok(0)
}

fn run_manifest(repo: &dyn Repository, args: ManifestCli) -> Result<i32, GuardError> {
    let tracer = Tracer::new(args.debug);
    let manifest = build_mirror_manifest(repo, args.stage, args.base.as_deref(), &tracer)?;
    println!("{}", manifest.to_pretty_json()?);
    Ok(0)
}
