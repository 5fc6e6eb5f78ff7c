// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::json;

use troupe_model::ToolSchema;

/// Tools every agent has in discussion phases.
pub fn agent_tools() -> Vec<ToolSchema> {
    vec![pass_turn_tool()]
}

/// Policy-gated file tools, added when a mediator is configured.
pub fn file_tools() -> Vec<ToolSchema> {
    vec![
        ToolSchema {
            name: "file_read".into(),
            description: "Read a file from the project. Path is relative to the project root."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Relative path of the file to read"},
                },
                "required": ["path"],
            }),
        },
        ToolSchema {
            name: "file_list".into(),
            description: "List a project directory. Directories are suffixed with '/'.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Relative path of the directory"},
                },
                "required": ["path"],
            }),
        },
        ToolSchema {
            name: "file_write".into(),
            description: "Write a file in the project. Only writable paths are allowed; \
                          other paths may require product-manager approval."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Relative path of the file to write"},
                    "content": {"type": "string", "description": "Full file content"},
                },
                "required": ["path", "content"],
            }),
        },
    ]
}

pub fn pass_turn_tool() -> ToolSchema {
    ToolSchema {
        name: "pass_turn".into(),
        description: "Pass your turn when you have nothing to add right now.".into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "reason": {"type": "string", "description": "Short reason for passing"},
            },
            "required": ["reason"],
        }),
    }
}

/// The two coach-exclusive signaling tools.
pub fn coach_tools() -> Vec<ToolSchema> {
    vec![
        ToolSchema {
            name: "signal_phase_complete".into(),
            description: "Signal that the current phase has achieved its goal and the team \
                          is ready to advance."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "summary": {"type": "string", "description": "One-paragraph summary of what was agreed"},
                },
                "required": ["summary"],
            }),
        },
        ToolSchema {
            name: "ask_pm".into(),
            description: "Ask the product manager a question. Use response_type 'decision' \
                          with options for a choice, 'feedback' for free-form input."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "question": {"type": "string"},
                    "response_type": {"type": "string", "enum": ["feedback", "decision"]},
                    "options": {"type": "array", "items": {"type": "string"}},
                },
                "required": ["question", "response_type"],
            }),
        },
    ]
}

/// Terminal tool for the implementation loop: mark tasks done.
pub fn complete_tasks_tool() -> ToolSchema {
    ToolSchema {
        name: "complete_tasks".into(),
        description: "Mark one or more of your assigned tasks as done. Only call this after \
                      the work is written."
            .into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "task_ids": {"type": "array", "items": {"type": "string"}},
                "summary": {"type": "string", "description": "What was implemented"},
            },
            "required": ["task_ids", "summary"],
        }),
    }
}

/// Terminal tool for the implementation loop: report tasks blocked.
pub fn report_blocked_tool() -> ToolSchema {
    ToolSchema {
        name: "report_blocked".into(),
        description: "Report that you cannot complete one or more tasks, with the reason."
            .into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "task_ids": {"type": "array", "items": {"type": "string"}},
                "reason": {"type": "string"},
            },
            "required": ["task_ids", "reason"],
        }),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
