// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::process::{Command, Output};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("{0}")]
    Git(String),
    #[error("Not a git repository: {0}. Run 'git init' first.")]
    NotARepo(String),
    #[error("HEAD is on '{current}', expected 'main'. {hint}")]
    NotOnMain { current: String, hint: String },
    #[error("Branch '{0}' does not exist.")]
    NoSuchBranch(String),
    #[error("No merge in progress.")]
    NoMergeInProgress,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run a git command in `cwd`; non-zero exit is a [`VcsError::Git`] with
/// the trimmed stderr.
pub(crate) fn git(cwd: &Path, args: &[&str]) -> Result<String, VcsError> {
    let output = run(cwd, args)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(VcsError::Git(if stderr.is_empty() {
            format!("git {} failed (exit {:?})", args.join(" "), output.status.code())
        } else {
            stderr
        }));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a git command and hand back the raw output; callers interpret the
/// exit status themselves (probes like `rev-parse --verify`).
pub(crate) fn git_raw(cwd: &Path, args: &[&str]) -> Result<Output, VcsError> {
    run(cwd, args)
}

fn run(cwd: &Path, args: &[&str]) -> Result<Output, VcsError> {
    Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(VcsError::Io)
}

pub(crate) fn branch_exists(cwd: &Path, branch: &str) -> bool {
    git_raw(cwd, &["rev-parse", "--verify", branch])
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub(crate) fn short_head(cwd: &Path) -> Result<String, VcsError> {
    Ok(git(cwd, &["rev-parse", "--short", "HEAD"])?.trim().to_string())
}

pub(crate) fn current_branch(cwd: &Path) -> Result<String, VcsError> {
    Ok(git(cwd, &["rev-parse", "--abbrev-ref", "HEAD"])?
        .trim()
        .to_string())
}
