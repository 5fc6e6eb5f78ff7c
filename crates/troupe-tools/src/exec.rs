// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use serde_json::{json, Value};
use tracing::debug;

use troupe_model::ToolOperation;

use crate::{ApprovalStore, FileMediator, WriteDecision};

/// Execute one policy-gated file tool and encode the outcome as a string.
///
/// Every failure mode is a returned `Error: …` string, never a panic or a
/// propagated error – the model sees the string and adapts.
pub fn execute_file_tool(
    name: &str,
    input: &Value,
    mediator: &FileMediator,
    approval_store: Option<&Mutex<ApprovalStore>>,
    agent_name: &str,
) -> String {
    match name {
        "file_read" => {
            let Some(path) = input["path"].as_str() else {
                return "Error: malformed tool call: missing 'path'".into();
            };
            read_file(path, mediator)
        }
        "file_list" => {
            let Some(path) = input["path"].as_str() else {
                return "Error: malformed tool call: missing 'path'".into();
            };
            list_dir(path, mediator)
        }
        "file_write" => {
            let Some(path) = input["path"].as_str() else {
                return "Error: malformed tool call: missing 'path'".into();
            };
            let Some(content) = input["content"].as_str() else {
                return "Error: malformed tool call: missing 'content'".into();
            };
            write_file(path, content, mediator, approval_store, agent_name)
        }
        other => format!("Error: unknown tool: {other}"),
    }
}

fn read_file(path: &str, mediator: &FileMediator) -> String {
    let resolved = match mediator.validate_read(path) {
        Ok(p) => p,
        Err(e) => return format!("Error: {e}"),
    };
    if !resolved.exists() {
        return format!("Error: file not found: {path}");
    }
    if !resolved.is_file() {
        return format!("Error: not a file: {path}");
    }
    match std::fs::metadata(&resolved) {
        Ok(meta) if meta.len() > mediator.max_file_size => {
            return format!(
                "Error: file too large ({} bytes, max {})",
                meta.len(),
                mediator.max_file_size
            );
        }
        Err(e) => return format!("Error: {e}"),
        _ => {}
    }
    match std::fs::read_to_string(&resolved) {
        Ok(content) => content,
        Err(e) => format!("Error: {e}"),
    }
}

fn list_dir(path: &str, mediator: &FileMediator) -> String {
    let resolved = match mediator.validate_list(path) {
        Ok(p) => p,
        Err(e) => return format!("Error: {e}"),
    };
    if !resolved.exists() {
        return format!("Error: directory not found: {path}");
    }
    if !resolved.is_dir() {
        return format!("Error: not a directory: {path}");
    }
    let mut entries: Vec<String> = match std::fs::read_dir(&resolved) {
        Ok(iter) => iter
            .filter_map(Result::ok)
            .map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                if e.path().is_dir() {
                    format!("{name}/")
                } else {
                    name
                }
            })
            .collect(),
        Err(e) => return format!("Error: {e}"),
    };
    entries.sort();
    if entries.is_empty() {
        "(empty directory)".into()
    } else {
        entries.join("\n")
    }
}

fn write_file(
    path: &str,
    content: &str,
    mediator: &FileMediator,
    approval_store: Option<&Mutex<ApprovalStore>>,
    agent_name: &str,
) -> String {
    if content.len() as u64 > mediator.max_file_size {
        return format!(
            "Error: content too large ({} bytes, max {})",
            content.len(),
            mediator.max_file_size
        );
    }
    match mediator.check_write(path) {
        WriteDecision::Allowed(resolved) => {
            if let Some(parent) = resolved.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return format!("Error: {e}");
                }
            }
            match std::fs::write(&resolved, content) {
                Ok(()) => {
                    debug!(path, bytes = content.len(), "file written");
                    format!("Written: {path} ({} bytes)", content.len())
                }
                Err(e) => format!("Error: {e}"),
            }
        }
        WriteDecision::ApprovalRequired { .. } => {
            let Some(store) = approval_store else {
                // Approvals enabled in policy but no store configured.
                return format!("Error: Path not in writable paths: {path}");
            };
            let id = store.lock().unwrap().add_request(
                path,
                content,
                agent_name,
                json!({"path": path, "content": content}),
            );
            format!("Pending approval [{id}]: write to {path}")
        }
        WriteDecision::Denied { reason } => format!("Error: {reason}"),
    }
}

// ─── Operation formatting ─────────────────────────────────────────────────────

/// Render a tool operation as a one-line conversation-log entry.
pub fn format_tool_operation(op: &ToolOperation) -> String {
    let path = op.input["path"].as_str().unwrap_or("");
    match op.name.as_str() {
        "file_write" => {
            if op.result.starts_with("Error:") {
                let reason = op.result.trim_start_matches("Error:").trim();
                format!("[file_write] DENIED: {path} ({reason})")
            } else if op.result.starts_with("Pending approval") {
                format!("[file_write] PENDING APPROVAL: {path}")
            } else {
                let bytes = op.input["content"].as_str().map(str::len).unwrap_or(0);
                format!("[file_write] {path} ({bytes} bytes)")
            }
        }
        name => format!("[{name}] {path}"),
    }
}

/// Like [`format_tool_operation`] but attributed to an agent; used by the
/// implementation executor where several agents act in one session.
pub fn format_agent_tool_operation(agent_name: &str, op: &ToolOperation) -> String {
    format!("[{agent_name}] {}", format_tool_operation(op))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
