// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use troupe_model::ToolSchema;
use troupe_tools::{agent_tools, execute_file_tool, file_tools, ApprovalStore, FileMediator};

/// Session-wide capability policy: what tools agents get, where writes
/// go, and whether output streams.
#[derive(Clone, Default)]
pub struct SessionPolicy {
    /// File tools are available only when a mediator is configured.
    pub mediator: Option<FileMediator>,
    pub approval_store: Option<Arc<Mutex<ApprovalStore>>>,
    /// Agent name → worktree root, when worktree isolation is active.
    pub worktree_map: HashMap<String, PathBuf>,
    pub streaming: bool,
    /// Seeded system message injected at session start.
    pub kickoff_text: Option<String>,
}

impl SessionPolicy {
    pub fn has_file_tools(&self) -> bool {
        self.mediator.is_some()
    }

    pub fn writable_paths_hint(&self) -> Option<String> {
        let mediator = self.mediator.as_ref()?;
        if mediator.writable_paths.is_empty() {
            return None;
        }
        Some(mediator.writable_paths.join(", "))
    }

    /// The mediator an agent's file operations go through: rooted at its
    /// worktree when one exists, the shared project root otherwise.
    pub fn agent_mediator(&self, agent_name: &str) -> Option<FileMediator> {
        let mediator = self.mediator.as_ref()?;
        match self.worktree_map.get(agent_name) {
            Some(root) => Some(mediator.with_root(root)),
            None => Some(mediator.clone()),
        }
    }

    pub fn in_worktree(&self, agent_name: &str) -> bool {
        self.worktree_map.contains_key(agent_name)
    }
}

/// Build the tool list and executor closure for one agent dispatch.
///
/// The executor encodes every failure as a result string. The write
/// counter lives in the closure, so the per-turn write limit covers the
/// whole dispatch it was built for.
pub fn build_tool_executor(
    agent_name: &str,
    policy: &SessionPolicy,
) -> (Vec<ToolSchema>, Box<dyn FnMut(&str, &Value) -> String + Send>) {
    let mut tools = agent_tools();

    let Some(mediator) = policy.agent_mediator(agent_name) else {
        let executor = move |name: &str, _input: &Value| -> String {
            if name == "pass_turn" {
                "Turn passed.".into()
            } else {
                format!("Unknown tool: {name}")
            }
        };
        return (tools, Box::new(executor));
    };

    tools.extend(file_tools());
    let approval_store = policy.approval_store.clone();
    let agent = agent_name.to_string();
    let mut write_count: u32 = 0;

    let executor = move |name: &str, input: &Value| -> String {
        if name == "pass_turn" {
            return "Turn passed.".into();
        }
        if name == "file_write" {
            write_count += 1;
            if write_count > mediator.max_files_per_turn {
                return format!(
                    "Error: write limit reached ({} per turn)",
                    mediator.max_files_per_turn
                );
            }
        }
        execute_file_tool(name, input, &mediator, approval_store.as_deref(), &agent)
    };
    (tools, Box::new(executor))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
