// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use tracing::debug;

use crate::git::{branch_exists, current_branch, git, git_raw, short_head, VcsError};

/// Outcome of a merge attempt. Conflicts are a structured result, not an
/// error – resolution continues interactively.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    Merged { branch: String, commit: String },
    Skipped { branch: String, reason: String },
    Conflicted { branch: String, conflicts: Vec<String> },
}

/// Per-file conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    Ours,
    Theirs,
    /// Content produced by the model; written to the file and staged.
    Ai,
}

/// The three sides of one conflicted file, plus the working copy with
/// conflict markers.
#[derive(Debug, Clone)]
pub struct ConflictContents {
    pub path: String,
    /// `None` when both branches added the file independently.
    pub base: Option<String>,
    pub ours: String,
    pub theirs: String,
    pub working: String,
}

pub fn is_merge_in_progress(project_root: &Path) -> bool {
    let Ok(out) = git_raw(project_root, &["rev-parse", "--git-path", "MERGE_HEAD"]) else {
        return false;
    };
    if !out.status.success() {
        return false;
    }
    let path_str = String::from_utf8_lossy(&out.stdout).trim().to_string();
    let path = Path::new(&path_str);
    if path.is_absolute() {
        path.exists()
    } else {
        project_root.join(path).exists()
    }
}

fn ensure_on_clean_main(project_root: &Path) -> Result<(), VcsError> {
    let current = current_branch(project_root)?;
    if current != "main" {
        return Err(VcsError::NotOnMain {
            current,
            hint: "Merging requires the default branch to be named 'main'.".into(),
        });
    }
    let status = git(project_root, &["status", "--porcelain"])?;
    if !status.trim().is_empty() {
        return Err(VcsError::Git(
            "main working tree is dirty; commit or stash before merging".into(),
        ));
    }
    Ok(())
}

/// Merge a branch into main with `--no-ff`. Refuses unless HEAD is a clean
/// main; already-merged and empty branches are skipped.
pub fn merge_branch(project_root: &Path, branch: &str) -> Result<MergeOutcome, VcsError> {
    ensure_on_clean_main(project_root)?;
    if !branch_exists(project_root, branch) {
        return Err(VcsError::NoSuchBranch(branch.to_string()));
    }
    if crate::review::is_branch_merged(project_root, branch) {
        return Ok(MergeOutcome::Skipped {
            branch: branch.to_string(),
            reason: "already merged".into(),
        });
    }
    if crate::review::diff_branch(project_root, branch)?.empty {
        return Ok(MergeOutcome::Skipped {
            branch: branch.to_string(),
            reason: "no changes".into(),
        });
    }

    let message = format!("Merge {branch} into main");
    let out = git_raw(project_root, &["merge", "--no-ff", "-m", &message, branch])?;
    if out.status.success() {
        let commit = short_head(project_root)?;
        debug!(branch, commit, "merged");
        return Ok(MergeOutcome::Merged {
            branch: branch.to_string(),
            commit,
        });
    }

    if is_merge_in_progress(project_root) {
        return Ok(MergeOutcome::Conflicted {
            branch: branch.to_string(),
            conflicts: unresolved_conflict_files(project_root)?,
        });
    }
    // Non-conflict failure is a hard error.
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    Err(VcsError::Git(if stderr.is_empty() {
        format!("git merge {branch} failed")
    } else {
        stderr
    }))
}

/// Files still in the unmerged state.
pub fn unresolved_conflict_files(project_root: &Path) -> Result<Vec<String>, VcsError> {
    let out = git(project_root, &["diff", "--name-only", "--diff-filter=U"])?;
    Ok(out.lines().filter(|l| !l.is_empty()).map(String::from).collect())
}

/// Load the three sides of a conflicted file from the index.
pub fn conflict_file_contents(project_root: &Path, path: &str) -> Result<ConflictContents, VcsError> {
    let stage = |n: u8| -> Option<String> {
        let spec = format!(":{n}:{path}");
        git_raw(project_root, &["show", &spec])
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).into_owned())
    };
    Ok(ConflictContents {
        path: path.to_string(),
        base: stage(1),
        ours: stage(2).unwrap_or_default(),
        theirs: stage(3).unwrap_or_default(),
        working: std::fs::read_to_string(project_root.join(path)).unwrap_or_default(),
    })
}

/// Resolve one conflicted file and stage it. The AI strategy requires the
/// resolved content produced by the model.
pub fn resolve_conflict_file(
    project_root: &Path,
    path: &str,
    strategy: ResolutionStrategy,
    content: Option<&str>,
) -> Result<(), VcsError> {
    match strategy {
        ResolutionStrategy::Ours => {
            git(project_root, &["checkout", "--ours", "--", path])?;
        }
        ResolutionStrategy::Theirs => {
            git(project_root, &["checkout", "--theirs", "--", path])?;
        }
        ResolutionStrategy::Ai => {
            let content = content.ok_or_else(|| {
                VcsError::Git("AI resolution requires resolved content".into())
            })?;
            std::fs::write(project_root.join(path), content)?;
        }
    }
    git(project_root, &["add", "--", path])?;
    debug!(path, ?strategy, "conflict resolved");
    Ok(())
}

/// Commit the in-progress merge once every conflict is resolved.
pub fn finalize_merge(project_root: &Path, branch: &str) -> Result<MergeOutcome, VcsError> {
    if !is_merge_in_progress(project_root) {
        return Err(VcsError::NoMergeInProgress);
    }
    let unresolved = unresolved_conflict_files(project_root)?;
    if !unresolved.is_empty() {
        return Err(VcsError::Git(format!(
            "unresolved conflicts remain: {}",
            unresolved.join(", ")
        )));
    }
    git(project_root, &["commit", "--no-edit"])?;
    Ok(MergeOutcome::Merged {
        branch: branch.to_string(),
        commit: short_head(project_root)?,
    })
}

/// Abort the in-progress merge and restore the pre-merge state.
pub fn abort_merge(project_root: &Path) -> Result<(), VcsError> {
    if !is_merge_in_progress(project_root) {
        return Err(VcsError::NoMergeInProgress);
    }
    git(project_root, &["merge", "--abort"])?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
