// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use crate::git::{branch_exists, git, git_raw, VcsError};

/// Three-dot diff of one branch against main.
#[derive(Debug, Clone)]
pub struct BranchDiff {
    pub branch: String,
    pub stat: String,
    pub diff: String,
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
    pub merged: bool,
    pub empty: bool,
}

/// Branches matching `*/layer-{N}`, sorted.
pub fn list_layer_branches(project_root: &Path, layer: u32) -> Result<Vec<String>, VcsError> {
    let pattern = format!("refs/heads/*/layer-{layer}");
    let out = git(
        project_root,
        &["for-each-ref", "--format=%(refname:short)", &pattern],
    )?;
    let mut branches: Vec<String> = out.lines().filter(|l| !l.is_empty()).map(String::from).collect();
    branches.sort();
    Ok(branches)
}

/// Is the branch fully merged into the current HEAD?
pub fn is_branch_merged(project_root: &Path, branch: &str) -> bool {
    git_raw(project_root, &["merge-base", "--is-ancestor", branch, "HEAD"])
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Diff a branch against main using the three-dot form (changes since
/// divergence), with numstat aggregation.
pub fn diff_branch(project_root: &Path, branch: &str) -> Result<BranchDiff, VcsError> {
    if !branch_exists(project_root, branch) {
        return Err(VcsError::NoSuchBranch(branch.to_string()));
    }
    let range = format!("main...{branch}");
    let stat = git(project_root, &["diff", "--stat", &range])?;
    let diff = git(project_root, &["diff", &range])?;
    let numstat = git(project_root, &["diff", "--numstat", &range])?;

    let mut files_changed = 0u32;
    let mut insertions = 0u32;
    let mut deletions = 0u32;
    for line in numstat.lines().filter(|l| !l.trim().is_empty()) {
        let mut parts = line.split('\t');
        let add = parts.next().unwrap_or("-");
        let del = parts.next().unwrap_or("-");
        files_changed += 1;
        // Binary files report "-" for both counts.
        insertions += add.parse::<u32>().unwrap_or(0);
        deletions += del.parse::<u32>().unwrap_or(0);
    }

    Ok(BranchDiff {
        branch: branch.to_string(),
        stat,
        diff,
        files_changed,
        insertions,
        deletions,
        merged: is_branch_merged(project_root, branch),
        empty: files_changed == 0,
    })
}

/// Diffs for every branch of a layer, for the code-review discussion
/// prompt. Empty branches are skipped; `None` when there is nothing to
/// review.
pub fn format_diffs_for_prompt(project_root: &Path, layer: u32) -> Result<Option<String>, VcsError> {
    let branches = list_layer_branches(project_root, layer)?;
    let mut sections = Vec::new();
    for branch in branches {
        let d = diff_branch(project_root, &branch)?;
        if d.empty {
            continue;
        }
        sections.push(format!(
            "=== {} ({} files, +{} -{}) ===\n{}\n{}",
            d.branch, d.files_changed, d.insertions, d.deletions, d.stat.trim_end(), d.diff
        ));
    }
    if sections.is_empty() {
        Ok(None)
    } else {
        Ok(Some(sections.join("\n\n")))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
