// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use troupe_config::FileAccessConfig;

/// Directories that are never writable, regardless of user configuration.
const HARD_DENY_DIRS: [&str; 2] = [".team", ".git"];

#[derive(Debug, Error)]
pub enum MediatorError {
    #[error("Absolute paths not allowed: {0}")]
    AbsolutePath(String),
    #[error("Path traversal not allowed: {0}")]
    Traversal(String),
    #[error("Path escapes project root: {0}")]
    Escape(String),
    #[error("Protected path: {0}")]
    Protected(String),
    #[error("Path not in writable paths: {0}")]
    NotWritable(String),
}

/// Outcome of a write check that does not raise.
#[derive(Debug)]
pub enum WriteDecision {
    Allowed(PathBuf),
    /// Inside the project but outside writable paths, with approvals on.
    ApprovalRequired { resolved: PathBuf, reason: String },
    Denied { reason: String },
}

/// Validates and constrains file operations to project boundaries.
///
/// A mediator carries the write policy (writable/protected globs, size and
/// per-turn limits) and, for worktree variants created with
/// [`with_root`](FileMediator::with_root), a fallback root so reads that
/// miss in the worktree can see committed code on main.
#[derive(Debug, Clone)]
pub struct FileMediator {
    project_root: PathBuf,
    fallback_root: Option<PathBuf>,
    pub writable_paths: Vec<String>,
    pub protected_paths: Vec<String>,
    pub max_file_size: u64,
    pub max_files_per_turn: u32,
    pub enable_approvals: bool,
}

impl FileMediator {
    pub fn new(project_root: impl Into<PathBuf>, config: &FileAccessConfig) -> Self {
        let root: PathBuf = project_root.into();
        Self {
            project_root: root.canonicalize().unwrap_or(root),
            fallback_root: None,
            writable_paths: config.writable_paths.clone(),
            protected_paths: config.protected_paths.clone(),
            max_file_size: config.max_file_size_bytes,
            max_files_per_turn: config.max_files_per_turn,
            enable_approvals: config.enable_approvals,
        }
    }

    /// Same policy, different root. The original project root becomes the
    /// fallback so reads that miss in the new root (an agent worktree) fall
    /// through to committed code on main.
    pub fn with_root(&self, new_root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = new_root.into();
        Self {
            project_root: root.canonicalize().unwrap_or(root),
            fallback_root: Some(self.project_root.clone()),
            writable_paths: self.writable_paths.clone(),
            protected_paths: self.protected_paths.clone(),
            max_file_size: self.max_file_size,
            max_files_per_turn: self.max_files_per_turn,
            enable_approvals: self.enable_approvals,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Validate a read. Returns the resolved absolute path, falling back to
    /// the fallback root when the file is absent in the primary root.
    pub fn validate_read(&self, relative_path: &str) -> Result<PathBuf, MediatorError> {
        let resolved = self.resolve_contained(relative_path)?;
        let rel = self.rel_of(&resolved);
        if is_hard_denied(&rel) {
            return Err(MediatorError::Protected(display(&rel)));
        }
        if !resolved.exists() {
            if let Some(fallback) = self.resolve_fallback(relative_path) {
                return Ok(fallback);
            }
        }
        Ok(resolved)
    }

    /// Validate a directory listing. Same fallback behavior as reads.
    pub fn validate_list(&self, relative_path: &str) -> Result<PathBuf, MediatorError> {
        let resolved = self.resolve_contained(relative_path)?;
        if !resolved.exists() {
            if let Some(fallback) = self.resolve_fallback(relative_path) {
                return Ok(fallback);
            }
        }
        Ok(resolved)
    }

    /// Validate a write. Returns the resolved absolute path or the policy
    /// violation.
    pub fn validate_write(&self, relative_path: &str) -> Result<PathBuf, MediatorError> {
        let resolved = self.resolve_contained(relative_path)?;
        let rel = self.rel_of(&resolved);
        if is_hard_denied(&rel) || self.is_protected(&rel) {
            return Err(MediatorError::Protected(display(&rel)));
        }
        if !self.is_writable(&rel) {
            return Err(MediatorError::NotWritable(display(&rel)));
        }
        Ok(resolved)
    }

    /// Check a write without raising, distinguishing hard denials from
    /// approval-eligible ones.
    pub fn check_write(&self, relative_path: &str) -> WriteDecision {
        let resolved = match self.resolve_contained(relative_path) {
            Ok(p) => p,
            Err(e) => {
                return WriteDecision::Denied {
                    reason: e.to_string(),
                }
            }
        };
        let rel = self.rel_of(&resolved);
        if is_hard_denied(&rel) || self.is_protected(&rel) {
            return WriteDecision::Denied {
                reason: MediatorError::Protected(display(&rel)).to_string(),
            };
        }
        if self.is_writable(&rel) {
            return WriteDecision::Allowed(resolved);
        }
        let reason = MediatorError::NotWritable(display(&rel)).to_string();
        if self.enable_approvals {
            debug!(path = %rel.display(), "write requires approval");
            WriteDecision::ApprovalRequired { resolved, reason }
        } else {
            WriteDecision::Denied { reason }
        }
    }

    /// Validate a write for an approved request: containment, hard-deny and
    /// protected checks still apply, the writable-paths check does not.
    pub fn validate_write_approved(&self, relative_path: &str) -> Result<PathBuf, MediatorError> {
        let resolved = self.resolve_contained(relative_path)?;
        let rel = self.rel_of(&resolved);
        if is_hard_denied(&rel) || self.is_protected(&rel) {
            return Err(MediatorError::Protected(display(&rel)));
        }
        Ok(resolved)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// Resolve a relative path and verify it stays within the project root,
    /// including through symlinks.
    fn resolve_contained(&self, relative_path: &str) -> Result<PathBuf, MediatorError> {
        if relative_path.is_empty() {
            return Ok(self.project_root.clone());
        }
        if relative_path.starts_with('/') {
            return Err(MediatorError::AbsolutePath(relative_path.into()));
        }
        if Path::new(relative_path)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(MediatorError::Traversal(relative_path.into()));
        }
        let resolved = normalize(&self.project_root.join(relative_path));
        if !resolved.starts_with(&self.project_root) {
            return Err(MediatorError::Escape(relative_path.into()));
        }
        Ok(resolved)
    }

    /// Resolve a read path against the fallback root. Returns the path only
    /// if it exists and passes the same policy checks; the read-denial
    /// policy must hold across the sandbox boundary too.
    fn resolve_fallback(&self, relative_path: &str) -> Option<PathBuf> {
        let fallback_root = self.fallback_root.as_ref()?;
        if relative_path.is_empty() || relative_path.starts_with('/') {
            return None;
        }
        if Path::new(relative_path)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return None;
        }
        let resolved = normalize(&fallback_root.join(relative_path));
        if !resolved.starts_with(fallback_root) {
            return None;
        }
        let rel = resolved
            .strip_prefix(fallback_root)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        if is_hard_denied(&rel) || !resolved.exists() {
            return None;
        }
        Some(resolved)
    }

    fn rel_of(&self, resolved: &Path) -> PathBuf {
        resolved
            .strip_prefix(&self.project_root)
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    fn is_protected(&self, rel: &Path) -> bool {
        let rel_str = display(rel);
        let filename = file_name(rel);
        self.protected_paths
            .iter()
            .any(|p| path_matches_pattern(&rel_str, &filename, p))
    }

    fn is_writable(&self, rel: &Path) -> bool {
        if self.writable_paths.is_empty() {
            return false;
        }
        let rel_str = display(rel);
        let filename = file_name(rel);
        self.writable_paths
            .iter()
            .any(|p| path_matches_pattern(&rel_str, &filename, p))
    }
}

fn display(rel: &Path) -> String {
    rel.to_string_lossy().into_owned()
}

fn file_name(rel: &Path) -> String {
    rel.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `.env` in any of its spellings: `.env`, `.env.*`, `*.env`.
fn is_env_file(rel: &Path) -> bool {
    let name = file_name(rel);
    name == ".env" || name.starts_with(".env.") || name.ends_with(".env")
}

fn is_hard_denied(rel: &Path) -> bool {
    if let Some(Component::Normal(first)) = rel.components().next() {
        if HARD_DENY_DIRS.contains(&first.to_string_lossy().as_ref()) {
            return true;
        }
    }
    is_env_file(rel)
}

/// Check a relative path against one policy pattern.
///
/// `dir/**` matches `dir` and anything under `dir/`; every other pattern
/// matches on the file name with shell-style wildcards.
fn path_matches_pattern(rel_str: &str, filename: &str, pattern: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return rel_str == prefix || rel_str.starts_with(&format!("{prefix}/"));
    }
    fnmatch(filename, pattern)
}

/// Shell-style wildcard match: `*` matches any run, `?` one character.
fn fnmatch(name: &str, pattern: &str) -> bool {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    regex::Regex::new(&re).map(|r| r.is_match(name)).unwrap_or(false)
}

/// Resolve symlinks on the existing prefix of `path` without requiring the
/// full path to exist yet (writes target paths that are not there).
fn normalize(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
    let mut out = existing.canonicalize().unwrap_or(existing);
    for part in tail.iter().rev() {
        out.push(part);
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
