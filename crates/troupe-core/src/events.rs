// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

use troupe_store::LogMessage;

/// Result classification of one tool call, for progress display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    Ok,
    Error,
    PendingApproval,
}

/// Events emitted by the session engine and the implementation executor.
///
/// Carriers of data only; the consumer (the supervisor) persists
/// `AppendMessage`/`AppendDebug` and renders the rest. Every
/// state-changing decision emits its event before on-disk state is
/// updated, so a crashed process can be replayed from the log.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    SessionStarted {
        iteration_id: String,
        description: String,
        phase: String,
        current_layer: Option<u32>,
        agents: Vec<String>,
        coach: Option<String>,
        has_file_tools: bool,
        writable_paths: Option<String>,
        worktree_count: usize,
        turn: u32,
        max_turns: u32,
    },
    /// A message for the conversation log. The supervisor is the single
    /// log writer and appends these in arrival order.
    AppendMessage(LogMessage),
    /// A diagnostic record for the debug log (prompt and tool dumps).
    AppendDebug(Value),
    /// A streamed chunk of an agent's in-flight reply.
    TextDelta {
        agent: String,
        turn_id: String,
        text: String,
    },
    /// Final content of a streamed turn.
    AgentTurnComplete {
        agent: String,
        turn_id: String,
        content: String,
    },
    ToolCallProgress {
        agent: String,
        tool_name: String,
        path: String,
        status: ToolCallStatus,
        bytes: Option<u64>,
        error: Option<String>,
    },
    /// Pending write approvals exist; the session halts for the human.
    PauseForApprovals { pending: usize },
    /// The coach asked the product manager for input; the session halts.
    CoachAskedPM {
        question: String,
        response_type: String,
        options: Vec<String>,
    },
    /// The coach signaled that the phase goal is met; the session halts.
    PhaseCompleteSignaled { phase: String },
    TaskBlocked {
        agent: String,
        layer: u32,
        task_ids: Vec<String>,
        reason: String,
    },
    LayerComplete {
        layer: u32,
        completed_tasks: Vec<String>,
    },
    SessionComplete { total_turns: u32 },
}

/// Classify a tool-result string by its prefix convention.
pub fn classify_result(result: &str) -> ToolCallStatus {
    if result.starts_with("Error:") {
        ToolCallStatus::Error
    } else if result.starts_with("Pending approval") {
        ToolCallStatus::PendingApproval
    } else {
        ToolCallStatus::Ok
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
