// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::git::{branch_exists, git, git_raw, short_head, VcsError};

/// Directory under the project root holding all agent worktrees.
pub const WORKTREE_BASE: &str = ".worktrees";

/// Entries that must be ignored by git in a managed project.
pub const GITIGNORE_ENTRIES: [&str; 3] = ["/.worktrees/", "/.team/", ".env"];

/// `agent-1`, layer 0 → `agent-1-layer-0`
pub fn worktree_dir_name(agent_name: &str, layer: u32) -> String {
    format!("{agent_name}-layer-{layer}")
}

/// `agent-1`, layer 0 → `agent-1/layer-0`
pub fn branch_name(agent_name: &str, layer: u32) -> String {
    format!("{agent_name}/layer-{layer}")
}

/// Path construction only; no git commands.
pub fn worktree_path(project_root: &Path, agent_name: &str, layer: u32) -> PathBuf {
    project_root
        .join(WORKTREE_BASE)
        .join(worktree_dir_name(agent_name, layer))
}

/// Verify the project is a git repository.
pub fn ensure_git_repo(project_root: &Path) -> Result<(), VcsError> {
    if project_root.join(".git").exists() {
        Ok(())
    } else {
        Err(VcsError::NotARepo(project_root.display().to_string()))
    }
}

/// Ensure `.worktrees/`, `.team/`, and `.env` are git-ignored. Returns
/// warnings for entries that are already tracked and need manual
/// untracking.
pub fn ensure_gitignore_entries(project_root: &Path) -> Result<Vec<String>, VcsError> {
    let gitignore = project_root.join(".gitignore");
    let mut content = if gitignore.exists() {
        std::fs::read_to_string(&gitignore)?
    } else {
        String::new()
    };

    let existing: Vec<&str> = content.lines().map(str::trim).collect();
    let added: Vec<&str> = GITIGNORE_ENTRIES
        .iter()
        .copied()
        .filter(|e| !existing.contains(e))
        .collect();

    if !added.is_empty() {
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&added.join("\n"));
        content.push('\n');
        std::fs::write(&gitignore, content)?;
    }

    let mut warnings = Vec::new();
    for check in [".team", ".env"] {
        let tracked = git_raw(project_root, &["ls-files", "--error-unmatch", check])
            .map(|o| o.status.success())
            .unwrap_or(false);
        if tracked {
            warnings.push(format!(
                "'{check}' is tracked by git. Run 'git rm -r --cached {check}' to untrack it."
            ));
        }
    }
    Ok(warnings)
}

fn is_known_worktree(project_root: &Path, wt_path: &Path) -> bool {
    let Ok(listing) = git(project_root, &["worktree", "list", "--porcelain"]) else {
        return false;
    };
    let resolved = wt_path
        .canonicalize()
        .unwrap_or_else(|_| wt_path.to_path_buf());
    listing
        .lines()
        .filter_map(|l| l.strip_prefix("worktree "))
        .any(|p| Path::new(p) == resolved)
}

/// Create the branch and worktree for `(agent, layer)`, branching from the
/// current HEAD of the main working tree.
///
/// Idempotent across four cases: registered worktree (reuse), nothing
/// (create both), branch without worktree (re-attach), unregistered
/// leftover directory (delete and recreate).
pub fn create_worktree(
    project_root: &Path,
    agent_name: &str,
    layer: u32,
) -> Result<PathBuf, VcsError> {
    let wt_path = worktree_path(project_root, agent_name, layer);
    let branch = branch_name(agent_name, layer);

    if wt_path.exists() {
        if is_known_worktree(project_root, &wt_path) {
            return Ok(wt_path);
        }
        debug!(path = %wt_path.display(), "removing unregistered worktree directory");
        std::fs::remove_dir_all(&wt_path)?;
    }

    let wt_str = wt_path.to_string_lossy();
    if branch_exists(project_root, &branch) {
        git(project_root, &["worktree", "add", &wt_str, &branch])?;
    } else {
        git(project_root, &["worktree", "add", "-b", &branch, &wt_str])?;
    }
    debug!(branch, path = %wt_path.display(), "worktree ready");
    Ok(wt_path)
}

pub fn remove_worktree(project_root: &Path, wt_path: &Path) -> Result<(), VcsError> {
    git(
        project_root,
        &["worktree", "remove", &wt_path.to_string_lossy(), "--force"],
    )?;
    Ok(())
}

/// Remove every worktree for a layer; returns the removed directory names.
pub fn cleanup_layer_worktrees(project_root: &Path, layer: u32) -> Vec<String> {
    let suffix = format!("-layer-{layer}");
    let base = project_root.join(WORKTREE_BASE);
    let mut removed = Vec::new();
    for entry in std::fs::read_dir(&base).into_iter().flatten().filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.path().is_dir()
            && name.ends_with(&suffix)
            && remove_worktree(project_root, &entry.path()).is_ok()
        {
            removed.push(name);
        }
    }
    removed
}

pub fn is_worktree_dirty(worktree_path: &Path) -> Result<bool, VcsError> {
    Ok(!git(worktree_path, &["status", "--porcelain"])?.trim().is_empty())
}

/// Stage everything and commit. Returns the short hash, or `None` when the
/// tree was already clean.
pub fn commit_worktree(worktree_path: &Path, message: &str) -> Result<Option<String>, VcsError> {
    if !is_worktree_dirty(worktree_path)? {
        return Ok(None);
    }
    git(worktree_path, &["add", "-A"])?;
    git(worktree_path, &["commit", "-m", message])?;
    Ok(Some(short_head(worktree_path)?))
}

/// One registered worktree other than the main working tree.
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
}

/// Parse `git worktree list --porcelain`, excluding the main worktree.
pub fn list_active_worktrees(project_root: &Path) -> Result<Vec<WorktreeInfo>, VcsError> {
    let listing = git(project_root, &["worktree", "list", "--porcelain"])?;
    let main_path = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());

    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;
    for line in listing.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(wt) = current.take() {
                if wt.path != main_path {
                    worktrees.push(wt);
                }
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                branch: None,
                head: None,
            });
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            if let Some(wt) = current.as_mut() {
                wt.head = Some(head.to_string());
            }
        } else if let Some(branch_ref) = line.strip_prefix("branch ") {
            if let Some(wt) = current.as_mut() {
                wt.branch = Some(
                    branch_ref
                        .strip_prefix("refs/heads/")
                        .unwrap_or(branch_ref)
                        .to_string(),
                );
            }
        }
    }
    if let Some(wt) = current {
        if wt.path != main_path {
            worktrees.push(wt);
        }
    }
    Ok(worktrees)
}

/// Commit dirty worktrees whose branch ends in `/layer-{layer}`.
/// Returns `(branch, Ok(hash) | Err(message))` per dirty worktree.
pub fn auto_commit_layer_worktrees(
    project_root: &Path,
    layer: u32,
) -> Vec<(String, Result<String, String>)> {
    let suffix = format!("/layer-{layer}");
    let message = format!("Implementation complete (layer {layer})");
    let mut results = Vec::new();
    let worktrees = match list_active_worktrees(project_root) {
        Ok(w) => w,
        Err(_) => return results,
    };
    for wt in worktrees {
        let Some(branch) = wt.branch else { continue };
        if !branch.ends_with(&suffix) {
            continue;
        }
        match commit_worktree(&wt.path, &message) {
            Ok(Some(hash)) => results.push((branch, Ok(hash))),
            Ok(None) => {} // clean tree, skipped
            Err(e) => results.push((branch, Err(e.to_string()))),
        }
    }
    results
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
