// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn is_false(b: &bool) -> bool {
    !*b
}

/// One conversation-log entry: one JSON object per line on disk.
///
/// Senders are agent names, `"coach"`-named facilitators, `"system"`, or
/// `"human"`. A `phase_boundary` entry separates the log into phase
/// segments; `pass_turn` entries are excluded from prompt reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogMessage {
    pub from: String,
    pub iteration: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub pass_turn: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub phase_boundary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_phase: Option<String>,
}

impl LogMessage {
    pub fn new(
        from: impl Into<String>,
        iteration: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            iteration: iteration.into(),
            content: content.into(),
            pass_turn: false,
            phase_boundary: false,
            from_phase: None,
            to_phase: None,
        }
    }

    pub fn system(iteration: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new("system", iteration, content)
    }
}

/// Append one message to the conversation log. Strict append; never
/// rewrites earlier lines.
pub fn append_message(log_path: &Path, msg: &LogMessage) -> anyhow::Result<()> {
    append_line(log_path, &serde_json::to_string(msg)?)
}

/// Append one diagnostic record to the debug log.
pub fn append_debug(debug_path: &Path, entry: &Value) -> anyhow::Result<()> {
    append_line(debug_path, &serde_json::to_string(entry)?)
}

fn append_line(path: &Path, line: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("appending to {}", path.display()))
}

/// Read the whole log. A missing file is an empty conversation; blank
/// lines are skipped; a malformed line is an error (the log is the source
/// of truth and must not be silently truncated).
pub fn read_log(log_path: &Path) -> anyhow::Result<Vec<LogMessage>> {
    if !log_path.is_file() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(log_path)
        .with_context(|| format!("reading {}", log_path.display()))?;
    let mut messages = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let msg: LogMessage = serde_json::from_str(line)
            .with_context(|| format!("{}:{}", log_path.display(), lineno + 1))?;
        messages.push(msg);
    }
    Ok(messages)
}

/// Retain only the messages after the last phase boundary. A log with no
/// boundary is a single segment.
pub fn current_phase_segment(messages: &[LogMessage]) -> &[LogMessage] {
    let start = messages
        .iter()
        .rposition(|m| m.phase_boundary)
        .map_or(0, |i| i + 1);
    &messages[start..]
}

/// One-line display form of a message.
pub fn render_message(msg: &LogMessage) -> String {
    format!("[{}] {}", msg.from, msg.content)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("conversation.jsonl");
        append_message(&log, &LogMessage::new("agent-1", "iter-1", "hello")).unwrap();
        append_message(&log, &LogMessage::new("agent-2", "iter-1", "hi")).unwrap();
        let messages = read_log(&log).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].from, "agent-1");
        assert_eq!(messages[1].content, "hi");
    }

    #[test]
    fn missing_log_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_log(&tmp.path().join("none.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn malformed_line_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("conversation.jsonl");
        std::fs::write(&log, "{\"from\": \"a\"\n").unwrap();
        assert!(read_log(&log).is_err());
    }

    #[test]
    fn optional_flags_omitted_when_unset() {
        let json = serde_json::to_string(&LogMessage::new("a", "i", "c")).unwrap();
        assert!(!json.contains("pass_turn"));
        assert!(!json.contains("phase_boundary"));
        assert!(!json.contains("from_phase"));
    }

    #[test]
    fn pass_turn_flag_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("conversation.jsonl");
        let mut msg = LogMessage::system("iter-1", "(agent-1 passes: nothing to add)");
        msg.pass_turn = true;
        append_message(&log, &msg).unwrap();
        let messages = read_log(&log).unwrap();
        assert!(messages[0].pass_turn);
    }

    #[test]
    fn phase_boundary_fields_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("conversation.jsonl");
        let mut msg = LogMessage::system("iter-1", "--- HISTORY BOUNDARY ---");
        msg.phase_boundary = true;
        msg.from_phase = Some("refinement".into());
        msg.to_phase = Some("planning".into());
        append_message(&log, &msg).unwrap();
        let messages = read_log(&log).unwrap();
        assert!(messages[0].phase_boundary);
        assert_eq!(messages[0].to_phase.as_deref(), Some("planning"));
    }

    #[test]
    fn segment_without_boundary_is_whole_log() {
        let messages = vec![
            LogMessage::new("a", "i", "1"),
            LogMessage::new("b", "i", "2"),
        ];
        assert_eq!(current_phase_segment(&messages).len(), 2);
    }

    #[test]
    fn segment_after_last_boundary() {
        let mut boundary = LogMessage::system("i", "--- HISTORY BOUNDARY ---");
        boundary.phase_boundary = true;
        let messages = vec![
            LogMessage::new("a", "i", "old"),
            boundary.clone(),
            LogMessage::new("a", "i", "mid"),
            boundary,
            LogMessage::new("b", "i", "new"),
        ];
        let segment = current_phase_segment(&messages);
        assert_eq!(segment.len(), 1);
        assert_eq!(segment[0].content, "new");
    }

    #[test]
    fn blank_lines_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("conversation.jsonl");
        std::fs::write(
            &log,
            "{\"from\":\"a\",\"iteration\":\"i\",\"content\":\"x\"}\n\n",
        )
        .unwrap();
        assert_eq!(read_log(&log).unwrap().len(), 1);
    }

    #[test]
    fn debug_log_appends_raw_json() {
        let tmp = tempfile::tempdir().unwrap();
        let debug = tmp.path().join("debug.jsonl");
        append_debug(&debug, &serde_json::json!({"turn": 0, "agent": "a1"})).unwrap();
        append_debug(&debug, &serde_json::json!({"turn": 1})).unwrap();
        let text = std::fs::read_to_string(&debug).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn render_is_speaker_prefixed() {
        assert_eq!(
            render_message(&LogMessage::new("coach", "i", "summary")),
            "[coach] summary"
        );
    }
}
