// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Git adapter for the sandbox and merge layer: per-agent worktrees
//! branched from main, three-dot review diffs, `--no-ff` merges with
//! structured conflict results, and per-file conflict resolution.
//!
//! Everything shells out to the `git` binary; no libgit2 dependency.

mod git;
mod merge;
mod review;
mod worktree;

pub use git::VcsError;
pub use merge::*;
pub use review::*;
pub use worktree::*;
