//! Core modules for intentguard's policy evaluation.
//!
//! Everything a validation run needs lives here: configuration and path
//! matching, the diff reader, each policy gate and the verdict/report layer.

pub mod config;
pub mod config_tree;
pub mod diff;
pub mod error;
pub mod glob;
pub mod intent;
pub mod lifecycle;
pub mod manifest;
pub mod output;
pub mod paths;
pub mod red_ops;
pub mod report;
pub mod scope;
pub mod stage;
pub mod time;
pub mod validate;
pub mod vcs;
pub mod verdict;
pub mod zones;
