// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Phase-transition procedures: one-shot extractions over the log,
//! boundary messages, and the deterministic conversation skeleton.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use troupe_model::{ChatMessage, ModelClient};
use troupe_store::{compute_layers, LogMessage, Task};

use crate::prompts::{
    merge_conflict_prompt, COACH_NOTES_EXTRACTION_PROMPT, COACH_PLANNING_PROMPT,
    COACH_REFINEMENT_PROMPT,
};

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("coach produced invalid JSON: {error}")]
    InvalidJson { error: String, raw: String },
    #[error("coach produced valid JSON but bad task structure: {error}")]
    BadTaskStructure { error: String, raw: String },
    #[error("could not parse AI resolution: {0}")]
    BadResolution(String),
    #[error(transparent)]
    Model(#[from] anyhow::Error),
}

impl TransitionError {
    /// The raw model output, for storing as a sidecar artifact when
    /// parsing failed.
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            TransitionError::InvalidJson { raw, .. }
            | TransitionError::BadTaskStructure { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

/// Strip a surrounding markdown code fence, if any.
pub fn strip_code_fences(text: &str) -> String {
    let mut text = text.trim();
    if text.starts_with("```") {
        text = match text.split_once('\n') {
            Some((_, rest)) => rest,
            None => &text[3..],
        };
        text = text.strip_suffix("```").unwrap_or(text);
        text = text.trim();
    }
    text.to_string()
}

// ─── Conversation skeleton ────────────────────────────────────────────────────

fn decision_markers() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            "(?i)(?:agreed|decided|will use|let's go with|consensus|approved|settled on|we'll|approach:|plan is|ruling out|excluding|not going to|won't|must not|instead of|rather than|`[^`]+`)",
        )
        .expect("decision marker regex")
    })
}

const MAX_INDEX_LINES: usize = 15;

/// Deterministic compression of a phase conversation: a DECISIONS section
/// (sentences with agreement/rejection language or backtick-quoted code)
/// plus a bounded one-line-per-message index. No model call.
pub fn build_phase_skeleton(history: &[LogMessage], phase: &str) -> String {
    let mut decisions: Vec<String> = Vec::new();
    let mut index_lines: Vec<String> = Vec::new();

    for msg in history {
        if msg.from == "system" || msg.pass_turn {
            continue;
        }
        let content = msg.content.trim();
        if content.is_empty() {
            continue;
        }

        let mut first_line = content.lines().next().unwrap_or("").to_string();
        if first_line.chars().count() > 100 {
            first_line = first_line.chars().take(97).collect::<String>() + "...";
        }
        index_lines.push(format!("[{}]: {first_line}", msg.from));

        for sentence in split_sentences(content) {
            if decision_markers().is_match(sentence) {
                decisions.push(format!("[{}]: {}", msg.from, sentence.trim()));
            }
        }
    }

    if index_lines.len() > MAX_INDEX_LINES {
        index_lines.drain(..index_lines.len() - MAX_INDEX_LINES);
    }

    let mut parts = vec![format!("## {} phase", phase.to_uppercase())];
    if !decisions.is_empty() {
        parts.push("Decisions:".into());
        parts.extend(decisions.into_iter().map(|d| format!("- {d}")));
    }
    parts.push("\nConversation index:".into());
    parts.extend(index_lines);
    parts.join("\n")
}

/// Sentence split on `.`/`!`/`?` followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"[.!?]\s+").expect("sentence split regex"));
    let mut out = Vec::new();
    let mut start = 0;
    for m in re.find_iter(text) {
        out.push(&text[start..m.end()]);
        start = m.end();
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

/// Raw transcript for one-shot coach extraction: system and coach
/// messages excluded, no transcript markers.
pub fn extract_conversation_for_coach(history: &[LogMessage], coach_name: &str) -> String {
    history
        .iter()
        .filter(|m| m.from != "system" && m.from != coach_name)
        .map(|m| format!("[{}]: {}", m.from, m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── One-shot extractions ─────────────────────────────────────────────────────

/// Re-invoke the coach as a one-shot summarizer over the refinement
/// segment. Returns the markdown scope summary.
pub async fn extract_refinement_summary(
    history: &[LogMessage],
    coach_name: &str,
    client: &dyn ModelClient,
) -> Result<String, TransitionError> {
    let conversation = extract_conversation_for_coach(history, coach_name);
    let messages = vec![
        ChatMessage::system(COACH_REFINEMENT_PROMPT),
        ChatMessage::user(format!(
            "=== TRANSCRIPT START ===\n{conversation}\n=== TRANSCRIPT END ==="
        )),
    ];
    Ok(client.complete_text(&messages).await?)
}

/// Re-invoke the coach as a one-shot task extractor, then compute layers.
///
/// JSON and structural failures carry the raw output so the supervisor
/// can store it as a sidecar and leave the phase on planning.
pub async fn extract_tasks(
    history: &[LogMessage],
    coach_name: &str,
    client: &dyn ModelClient,
    refinement_summary: Option<&str>,
) -> Result<Vec<Task>, TransitionError> {
    let conversation = extract_conversation_for_coach(history, coach_name);
    let mut user_content =
        format!("=== TRANSCRIPT START ===\n{conversation}\n=== TRANSCRIPT END ===");
    if let Some(summary) = refinement_summary {
        user_content.push_str(&format!(
            "\n\n=== SCOPE SUMMARY ===\n{summary}\n=== END SCOPE SUMMARY ==="
        ));
    }
    let messages = vec![
        ChatMessage::system(COACH_PLANNING_PROMPT),
        ChatMessage::user(user_content),
    ];
    let raw = client.complete_text(&messages).await?;
    let text = strip_code_fences(&raw);

    let mut tasks: Vec<Task> =
        serde_json::from_str(&text).map_err(|e| TransitionError::InvalidJson {
            error: e.to_string(),
            raw: raw.clone(),
        })?;
    let layers = compute_layers(&tasks).map_err(|e| TransitionError::BadTaskStructure {
        error: e.to_string(),
        raw: raw.clone(),
    })?;
    for task in &mut tasks {
        task.layer = layers[&task.id];
    }
    Ok(tasks)
}

/// One-shot extraction of per-task "files to create" notes. Parse
/// failures are non-fatal; the caller decides whether to warn.
pub async fn extract_task_notes(
    history: &[LogMessage],
    tasks: &[Task],
    coach_name: &str,
    client: &dyn ModelClient,
) -> Result<std::collections::HashMap<String, String>, TransitionError> {
    let conversation = extract_conversation_for_coach(history, coach_name);
    let tasks_json = serde_json::to_string_pretty(tasks).unwrap_or_default();
    let prompt = format!(
        "{COACH_NOTES_EXTRACTION_PROMPT}\n\n=== TASKS ===\n{tasks_json}\n\n\
         === CONVERSATION ===\n{conversation}"
    );
    let raw = client.complete_text(&[ChatMessage::user(prompt)]).await?;
    let text = strip_code_fences(&raw);
    let entries: Vec<Value> =
        serde_json::from_str(&text).map_err(|e| TransitionError::InvalidJson {
            error: e.to_string(),
            raw,
        })?;
    Ok(entries
        .iter()
        .filter_map(|e| {
            let id = e["id"].as_str()?;
            let notes = e["notes"].as_str().filter(|n| !n.is_empty())?;
            Some((id.to_string(), notes.to_string()))
        })
        .collect())
}

/// One-shot merge-conflict resolution. Returns `(content, explanation)`.
pub async fn resolve_merge_conflict(
    file_path: &str,
    branch: &str,
    base_content: Option<&str>,
    ours_content: &str,
    theirs_content: &str,
    task_context: &str,
    client: &dyn ModelClient,
) -> Result<(String, String), TransitionError> {
    let base_section = match base_content {
        Some(base) => format!(
            "=== BASE (common ancestor) START ===\n{base}\n=== BASE (common ancestor) END ==="
        ),
        None => "(No common ancestor: both branches added this file independently.)".to_string(),
    };
    let prompt = merge_conflict_prompt(
        file_path,
        branch,
        &base_section,
        ours_content,
        theirs_content,
        task_context,
    );
    let raw = client.complete_text(&[ChatMessage::user(prompt)]).await?;
    let text = strip_code_fences(&raw);
    let data: Value = serde_json::from_str(&text)
        .map_err(|e| TransitionError::BadResolution(e.to_string()))?;
    let content = data["content"]
        .as_str()
        .ok_or_else(|| TransitionError::BadResolution("missing 'content'".into()))?;
    let explanation = data["explanation"].as_str().unwrap_or("");
    Ok((content.to_string(), explanation.to_string()))
}

// ─── Boundary messages ────────────────────────────────────────────────────────

/// The boundary marker plus the human-readable transition line written at
/// every phase advance.
pub fn build_transition_messages(
    iteration_id: &str,
    from_phase: &str,
    to_phase: &str,
    tasks_written: bool,
    coach_ran: bool,
) -> (LogMessage, LogMessage) {
    let mut boundary = LogMessage::system(iteration_id, "--- HISTORY BOUNDARY ---");
    boundary.phase_boundary = true;
    boundary.from_phase = Some(from_phase.to_string());
    boundary.to_phase = Some(to_phase.to_string());

    let content = if tasks_written {
        format!("--- Phase advanced: {from_phase} → {to_phase}. Task list written to tasks.json ---")
    } else if coach_ran && from_phase == "refinement" {
        format!(
            "--- Phase advanced: {from_phase} → {to_phase}. Scope summary written to scope_summary.md ---"
        )
    } else {
        format!("--- Phase advanced: {from_phase} → {to_phase} ---")
    };
    (boundary, LogMessage::system(iteration_id, content))
}

/// Pull the "Agreed Requirements" and "Out of Scope" sections out of a
/// scope summary, for the implementation kickoff.
pub fn extract_scope_boundaries(summary: &str) -> String {
    const WANTED: [&str; 2] = ["Out of Scope", "Agreed Requirements"];
    let mut sections: Vec<String> = Vec::new();
    let mut current_section: Option<String> = None;
    let mut current_lines: Vec<String> = Vec::new();

    let mut flush = |section: &Option<String>, lines: &mut Vec<String>, out: &mut Vec<String>| {
        if let Some(name) = section {
            if WANTED.contains(&name.as_str()) && !lines.is_empty() {
                out.push(format!("{name}:"));
                out.append(lines);
            }
        }
        lines.clear();
    };

    for line in summary.lines() {
        let stripped = line.trim();
        if let Some(heading) = stripped.strip_prefix("## ") {
            flush(&current_section, &mut current_lines, &mut sections);
            current_section = Some(heading.trim().to_string());
        } else if !stripped.is_empty() && current_section.is_some() {
            current_lines.push(format!("  {stripped}"));
        }
    }
    flush(&current_section, &mut current_lines, &mut sections);
    sections.join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
