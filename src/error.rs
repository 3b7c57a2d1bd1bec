//! Typed error taxonomy for the component seams (§7).
//!
//! Most modules return `anyhow::Result` the way the teacher does throughout
//! `justinmoon-crank`. These three enums exist where a caller must match on
//! the *kind* of failure rather than just display it: the executor façade
//! converting a policy denial into a task failure, the sandbox reporting
//! resource exhaustion as a value rather than raising, and the scheduler
//! aborting outright on ledger corruption.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("file read denied: {target} ({rule})")]
    FileReadDenied { target: PathBuf, rule: String },
    #[error("file write denied: {target} ({rule})")]
    FileWriteDenied { target: PathBuf, rule: String },
    #[error("command denied: {target} ({rule})")]
    CommandDenied { target: String, rule: String },
    #[error("approval required for {target}: {class}")]
    ApprovalRequired { target: String, class: String },
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("file deleted in sandbox: {0}")]
    FileDeletedInSandbox(PathBuf),
    #[error("command limit exceeded")]
    CommandLimitExceeded,
    #[error("command not allowed")]
    CommandNotAllowed,
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger corrupt at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Raised by the executor façade when a policy decision blocks an action;
/// the scheduler may catch this specifically and convert it into a task
/// failure rather than aborting the whole run (§4.7, §7).
#[derive(Debug, Error)]
#[error("policy denied: {0}")]
pub struct PolicyDenied(#[from] pub PolicyError);
