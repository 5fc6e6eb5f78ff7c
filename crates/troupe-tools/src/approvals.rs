// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::{FileMediator, MediatorError};

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval request '{0}' not found")]
    NotFound(String),
    #[error("request '{id}' already {status}")]
    AlreadyResolved { id: String, status: ApprovalStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalStatus::Pending => write!(f, "pending"),
            ApprovalStatus::Approved => write!(f, "approved"),
            ApprovalStatus::Denied => write!(f, "denied"),
        }
    }
}

/// A supervised write outside the writable paths, captured in full at
/// request time so approval can replay it later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub path: String,
    pub content: String,
    pub content_size: u64,
    pub requested_by: String,
    /// Original tool input, kept verbatim for auditing.
    pub tool_input: Value,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    /// Set once an approved write has been executed.
    #[serde(default)]
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    /// Set once a denial has been injected back into the conversation.
    #[serde(default)]
    pub injected: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ApprovalFile {
    requests: Vec<ApprovalRequest>,
}

/// Single JSON file of approval requests, updated read-modify-write.
/// Safe here because only the supervisor writes, and only in response to
/// engine events.
#[derive(Debug)]
pub struct ApprovalStore {
    path: PathBuf,
    requests: Vec<ApprovalRequest>,
}

impl ApprovalStore {
    /// Open the store at `path`. A missing or corrupt file is treated as
    /// empty – fresh start for this subsystem.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let requests = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| {
                serde_json::from_str::<ApprovalFile>(&text)
                    .map_err(|e| warn!(error = %e, "corrupt approvals file; starting empty"))
                    .ok()
            })
            .map(|f| f.requests)
            .unwrap_or_default();
        Self { path, requests }
    }

    fn save(&self) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = ApprovalFile {
            requests: self.requests.clone(),
        };
        match serde_json::to_string_pretty(&file) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.path, text + "\n") {
                    warn!(error = %e, path = %self.path.display(), "failed to persist approvals");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize approvals"),
        }
    }

    /// Record a new pending request. Ids are sequential: `a1`, `a2`, …
    pub fn add_request(
        &mut self,
        path: &str,
        content: &str,
        requested_by: &str,
        tool_input: Value,
    ) -> String {
        let id = format!("a{}", self.requests.len() + 1);
        self.requests.push(ApprovalRequest {
            id: id.clone(),
            path: path.to_string(),
            content: content.to_string(),
            content_size: content.len() as u64,
            requested_by: requested_by.to_string(),
            tool_input,
            status: ApprovalStatus::Pending,
            denial_reason: None,
            requested_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
            applied: false,
            applied_at: None,
            injected: false,
        });
        self.save();
        id
    }

    pub fn get_pending(&self) -> Vec<&ApprovalRequest> {
        self.requests
            .iter()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&ApprovalRequest> {
        self.requests.iter().find(|r| r.id == id)
    }

    fn resolve(
        &mut self,
        id: &str,
        status: ApprovalStatus,
        denial_reason: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let req = self
            .requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;
        if req.status != ApprovalStatus::Pending {
            return Err(ApprovalError::AlreadyResolved {
                id: id.to_string(),
                status: req.status,
            });
        }
        req.status = status;
        req.denial_reason = denial_reason;
        req.resolved_at = Some(Utc::now());
        req.resolved_by = Some("pm".into());
        let snapshot = req.clone();
        self.save();
        Ok(snapshot)
    }

    pub fn approve(&mut self, id: &str) -> Result<ApprovalRequest, ApprovalError> {
        self.resolve(id, ApprovalStatus::Approved, None)
    }

    pub fn deny(&mut self, id: &str, reason: &str) -> Result<ApprovalRequest, ApprovalError> {
        self.resolve(id, ApprovalStatus::Denied, Some(reason.to_string()))
    }

    /// Approve every pending request; returns the approved snapshots.
    pub fn approve_all(&mut self) -> Vec<ApprovalRequest> {
        let ids: Vec<String> = self
            .get_pending()
            .iter()
            .map(|r| r.id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.approve(id).ok())
            .collect()
    }

    pub fn get_approved_unapplied(&self) -> Vec<&ApprovalRequest> {
        self.requests
            .iter()
            .filter(|r| r.status == ApprovalStatus::Approved && !r.applied)
            .collect()
    }

    pub fn get_denied_uninjected(&self) -> Vec<&ApprovalRequest> {
        self.requests
            .iter()
            .filter(|r| r.status == ApprovalStatus::Denied && !r.injected)
            .collect()
    }

    pub fn mark_applied(&mut self, id: &str) {
        if let Some(req) = self.requests.iter_mut().find(|r| r.id == id) {
            req.applied = true;
            req.applied_at = Some(Utc::now());
            self.save();
        }
    }

    pub fn mark_injected(&mut self, id: &str) {
        if let Some(req) = self.requests.iter_mut().find(|r| r.id == id) {
            req.injected = true;
            self.save();
        }
    }
}

/// Result of replaying one approved write.
#[derive(Debug, Clone)]
pub struct AppliedWrite {
    pub id: String,
    pub path: String,
    pub requested_by: String,
    pub success: bool,
    pub message: String,
}

/// Replay approved-but-unapplied writes through the mediator.
///
/// `mediator_for_agent` routes each write to the requester's own mediator
/// (its worktree root) when worktrees are enabled; without it, per-agent
/// isolation breaks. Hard-deny, protected-path, and size limits still
/// apply – approval never bypasses containment.
pub fn apply_approved_writes(
    store: &mut ApprovalStore,
    mediator: &FileMediator,
    mediator_for_agent: Option<&dyn Fn(&str) -> FileMediator>,
) -> Vec<AppliedWrite> {
    let pending: Vec<ApprovalRequest> = store
        .get_approved_unapplied()
        .into_iter()
        .cloned()
        .collect();

    let mut results = Vec::with_capacity(pending.len());
    for req in pending {
        let agent_mediator =
            mediator_for_agent.map(|resolve| resolve(&req.requested_by));
        let target = agent_mediator.as_ref().unwrap_or(mediator);

        let outcome = write_approved(target, &req);
        let (success, message) = match outcome {
            Ok(path) => (true, format!("Written: {}", path.display())),
            Err(msg) => (false, msg),
        };
        store.mark_applied(&req.id);
        results.push(AppliedWrite {
            id: req.id.clone(),
            path: req.path.clone(),
            requested_by: req.requested_by.clone(),
            success,
            message,
        });
    }
    results
}

fn write_approved(mediator: &FileMediator, req: &ApprovalRequest) -> Result<PathBuf, String> {
    if req.content_size > mediator.max_file_size {
        return Err(format!(
            "content too large ({} bytes, max {})",
            req.content_size, mediator.max_file_size
        ));
    }
    let resolved = mediator
        .validate_write_approved(&req.path)
        .map_err(|e: MediatorError| e.to_string())?;
    if let Some(parent) = resolved.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    std::fs::write(&resolved, &req.content).map_err(|e| e.to_string())?;
    Ok(resolved)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;
    use troupe_config::FileAccessConfig;

    use super::*;

    fn store_at(dir: &Path) -> ApprovalStore {
        ApprovalStore::open(dir.join("approvals.json"))
    }

    fn approval_mediator(root: &Path) -> FileMediator {
        FileMediator::new(
            root,
            &FileAccessConfig {
                writable_paths: vec!["src/**".into()],
                enable_approvals: true,
                ..FileAccessConfig::default()
            },
        )
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    #[test]
    fn add_request_creates_file_and_sequential_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = store_at(tmp.path());
        assert_eq!(store.add_request("f1.txt", "a", "agent-1", json!({})), "a1");
        assert_eq!(store.add_request("f2.txt", "b", "agent-1", json!({})), "a2");
        assert_eq!(store.add_request("f3.txt", "c", "agent-2", json!({})), "a3");
        assert!(tmp.path().join("approvals.json").exists());
    }

    #[test]
    fn request_captures_content_at_request_time() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = store_at(tmp.path());
        let input = json!({"path": "Dockerfile", "content": "FROM python:3.12"});
        store.add_request("Dockerfile", "FROM python:3.12", "agent-1", input.clone());
        let pending = store.get_pending();
        assert_eq!(pending[0].content, "FROM python:3.12");
        assert_eq!(pending[0].content_size, 16);
        assert_eq!(pending[0].requested_by, "agent-1");
        assert_eq!(pending[0].status, ApprovalStatus::Pending);
        assert_eq!(pending[0].tool_input, input);
    }

    // ── Resolution ────────────────────────────────────────────────────────────

    #[test]
    fn approve_transitions_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = store_at(tmp.path());
        store.add_request("f.txt", "x", "agent-1", json!({}));
        let req = store.approve("a1").unwrap();
        assert_eq!(req.status, ApprovalStatus::Approved);
        assert!(req.resolved_at.is_some());
        assert_eq!(req.resolved_by.as_deref(), Some("pm"));
        assert!(matches!(
            store.approve("a1"),
            Err(ApprovalError::AlreadyResolved { .. })
        ));
    }

    #[test]
    fn deny_records_reason() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = store_at(tmp.path());
        store.add_request("f.txt", "x", "agent-1", json!({}));
        let req = store.deny("a1", "Use src/ instead").unwrap();
        assert_eq!(req.status, ApprovalStatus::Denied);
        assert_eq!(req.denial_reason.as_deref(), Some("Use src/ instead"));
        assert!(store.deny("a1", "again").is_err());
    }

    #[test]
    fn unknown_id_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = store_at(tmp.path());
        assert!(matches!(store.approve("a999"), Err(ApprovalError::NotFound(_))));
    }

    #[test]
    fn approve_all_skips_resolved() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = store_at(tmp.path());
        store.add_request("f1", "a", "agent-1", json!({}));
        store.add_request("f2", "b", "agent-1", json!({}));
        store.add_request("f3", "c", "agent-1", json!({}));
        store.deny("a2", "no").unwrap();
        let approved = store.approve_all();
        let ids: Vec<&str> = approved.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a3"]);
    }

    #[test]
    fn applied_and_injected_filters() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = store_at(tmp.path());
        store.add_request("f1", "a", "agent-1", json!({}));
        store.add_request("f2", "b", "agent-1", json!({}));
        store.approve("a1").unwrap();
        store.approve("a2").unwrap();
        store.mark_applied("a1");
        let unapplied: Vec<&str> = store
            .get_approved_unapplied()
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(unapplied, vec!["a2"]);

        store.add_request("f3", "c", "agent-1", json!({}));
        store.add_request("f4", "d", "agent-1", json!({}));
        store.deny("a3", "no").unwrap();
        store.deny("a4", "no").unwrap();
        store.mark_injected("a3");
        let uninjected: Vec<&str> = store
            .get_denied_uninjected()
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(uninjected, vec!["a4"]);
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    #[test]
    fn persists_across_instances() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut store = store_at(tmp.path());
            store.add_request("f1.txt", "hello", "agent-1", json!({}));
        }
        let store = store_at(tmp.path());
        assert_eq!(store.get_pending().len(), 1);
        assert_eq!(store.get_pending()[0].content, "hello");
    }

    #[test]
    fn missing_file_loads_clean() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ApprovalStore::open(tmp.path().join("nope").join("approvals.json"));
        assert!(store.get_pending().is_empty());
    }

    #[test]
    fn corrupt_file_loads_clean() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("approvals.json"), "{not json").unwrap();
        let store = store_at(tmp.path());
        assert!(store.get_pending().is_empty());
    }

    // ── Replay ────────────────────────────────────────────────────────────────

    #[test]
    fn apply_writes_file_and_marks_applied() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        let mediator = approval_mediator(tmp.path());
        let mut store = store_at(tmp.path());
        store.add_request("Dockerfile", "FROM python:3.12", "agent-1", json!({}));
        store.approve("a1").unwrap();

        let results = apply_approved_writes(&mut store, &mediator, None);
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("Dockerfile")).unwrap(),
            "FROM python:3.12"
        );
        assert!(store.get("a1").unwrap().applied);

        // Second replay is a no-op.
        std::fs::write(tmp.path().join("Dockerfile"), "overwritten").unwrap();
        assert!(apply_approved_writes(&mut store, &mediator, None).is_empty());
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("Dockerfile")).unwrap(),
            "overwritten"
        );
    }

    #[test]
    fn apply_creates_parent_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let mediator = approval_mediator(tmp.path());
        let mut store = store_at(tmp.path());
        store.add_request("newdir/sub/file.txt", "hello", "agent-1", json!({}));
        store.approve("a1").unwrap();
        let results = apply_approved_writes(&mut store, &mediator, None);
        assert!(results[0].success);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("newdir/sub/file.txt")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn apply_still_enforces_hard_deny() {
        let tmp = tempfile::tempdir().unwrap();
        let mediator = approval_mediator(tmp.path());
        let mut store = store_at(tmp.path());
        store.add_request(".team/hack.json", "evil", "agent-1", json!({}));
        store.approve("a1").unwrap();
        let results = apply_approved_writes(&mut store, &mediator, None);
        assert!(!results[0].success);
        assert!(results[0].message.contains("Protected path"));
    }

    #[test]
    fn apply_enforces_size_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = FileAccessConfig::default();
        cfg.writable_paths = vec!["src/**".into()];
        cfg.enable_approvals = true;
        cfg.max_file_size_bytes = 10;
        let mediator = FileMediator::new(tmp.path(), &cfg);
        let mut store = store_at(tmp.path());
        store.add_request("big.txt", &"x".repeat(100), "agent-1", json!({}));
        store.approve("a1").unwrap();
        let results = apply_approved_writes(&mut store, &mediator, None);
        assert!(!results[0].success);
        assert!(results[0].message.contains("too large"));
    }

    #[test]
    fn apply_routes_through_agent_mediator() {
        let tmp = tempfile::tempdir().unwrap();
        let wt1 = tmp.path().join("wt-agent-1");
        let wt2 = tmp.path().join("wt-agent-2");
        std::fs::create_dir_all(&wt1).unwrap();
        std::fs::create_dir_all(&wt2).unwrap();

        let mediator = approval_mediator(tmp.path());
        let mut store = store_at(tmp.path());
        store.add_request("README.md", "agent 1 readme", "agent-1", json!({}));
        store.add_request("README.md", "agent 2 readme", "agent-2", json!({}));
        store.approve_all();

        let base = mediator.clone();
        let wt1c = wt1.clone();
        let wt2c = wt2.clone();
        let resolver = move |agent: &str| {
            if agent == "agent-1" {
                base.with_root(&wt1c)
            } else {
                base.with_root(&wt2c)
            }
        };
        let results = apply_approved_writes(&mut store, &mediator, Some(&resolver));
        assert!(results.iter().all(|r| r.success));
        assert_eq!(
            std::fs::read_to_string(wt1.join("README.md")).unwrap(),
            "agent 1 readme"
        );
        assert_eq!(
            std::fs::read_to_string(wt2.join("README.md")).unwrap(),
            "agent 2 readme"
        );
        assert!(!tmp.path().join("README.md").exists());
    }
}
