// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::STATE_FILE;

/// Round-level checkpoint of one agent's in-flight implementation loop.
///
/// Written whole-file after every round and cleared on clean exit, so a
/// crashed process resumes the same agent at the top of the interrupted
/// round. The transcript is stored as raw JSON; the executor owns the
/// message shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumableState {
    pub layer: u32,
    pub agent_name: String,
    pub llm_messages: Vec<Value>,
    pub round_num: u32,
    #[serde(default)]
    pub read_only_streak: u32,
    #[serde(default)]
    pub no_tool_streak: u32,
    #[serde(default)]
    pub saw_tool_activity: bool,
    #[serde(default)]
    pub writes_since_reminder: u32,
}

/// Load state for `layer`. Missing, corrupt, or stale (different layer,
/// malformed fields) files are treated as no state.
pub fn load_state(iter_dir: &Path, layer: u32) -> Option<ResumableState> {
    let path = iter_dir.join(STATE_FILE);
    let text = std::fs::read_to_string(&path).ok()?;
    let state: ResumableState = match serde_json::from_str(&text) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "corrupt resumable state; starting fresh");
            return None;
        }
    };
    if state.layer != layer {
        debug!(
            state_layer = state.layer,
            layer, "resumable state is for another layer; ignoring"
        );
        return None;
    }
    Some(state)
}

pub fn save_state(iter_dir: &Path, state: &ResumableState) -> anyhow::Result<()> {
    let path = iter_dir.join(STATE_FILE);
    let text = serde_json::to_string_pretty(state)?;
    std::fs::write(&path, text + "\n")?;
    Ok(())
}

pub fn clear_state(iter_dir: &Path) {
    let _ = std::fs::remove_file(iter_dir.join(STATE_FILE));
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
