// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use troupe_config::Iteration;

use crate::{read_log, CHECKPOINTS_DIR, CONVERSATION_FILE, DEBUG_FILE, STATE_FILE};

/// Direct children of the iteration directory that never enter a
/// checkpoint: diagnostics, the checkpoint tree itself, and the resumable
/// loop state (which is only valid for the live process lineage).
pub const CHECKPOINT_EXCLUDE: [&str; 3] = [DEBUG_FILE, CHECKPOINTS_DIR, STATE_FILE];

/// `state.json` written beside every checkpoint copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub number: u32,
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    pub status: String,
    pub max_turns: u32,
    pub description: String,
    pub trigger: String,
    pub turn_count: u32,
}

/// Direct-child artifact files eligible for checkpointing, sorted.
/// Subdirectories are not recursed into.
fn iter_files(iter_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(iter_dir)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| !CHECKPOINT_EXCLUDE.contains(&name.as_str()))
        .collect();
    names.sort();
    names
}

/// Next checkpoint number: max existing + 1, gaps included; non-numeric
/// directory names are ignored.
fn next_checkpoint_number(iter_dir: &Path) -> u32 {
    let dir = iter_dir.join(CHECKPOINTS_DIR);
    std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_string_lossy().parse::<u32>().ok())
        .max()
        .unwrap_or(0)
        + 1
}

/// Count engineering-agent turns in the conversation log. Coach, system,
/// and human messages are excluded; pass the coach's actual name since it
/// is configurable.
fn count_agent_turns(iter_dir: &Path, coach_name: &str) -> u32 {
    let log = iter_dir.join(CONVERSATION_FILE);
    let Ok(messages) = read_log(&log) else {
        return 0;
    };
    let excluded: HashSet<&str> = ["human", "system", coach_name].into();
    messages
        .iter()
        .filter(|m| !excluded.contains(m.from.as_str()))
        .count() as u32
}

/// Snapshot every eligible artifact into `checkpoints/N/` and write the
/// accompanying `state.json`. Returns the checkpoint number.
pub fn create_checkpoint(
    iter_dir: &Path,
    iteration: &Iteration,
    description: Option<&str>,
    trigger: &str,
    coach_name: &str,
) -> anyhow::Result<u32> {
    let number = next_checkpoint_number(iter_dir);
    let cp_dir = iter_dir.join(CHECKPOINTS_DIR).join(number.to_string());
    std::fs::create_dir_all(&cp_dir)
        .with_context(|| format!("creating {}", cp_dir.display()))?;

    for name in iter_files(iter_dir) {
        let src = iter_dir.join(&name);
        if let Err(e) = std::fs::copy(&src, cp_dir.join(&name)) {
            warn!(file = %name, error = %e, "skipping artifact during checkpoint");
        }
    }

    let state = CheckpointState {
        number,
        timestamp: Utc::now(),
        phase: iteration.phase.to_string(),
        status: iteration.status.to_string(),
        max_turns: iteration.max_turns,
        description: description
            .map(str::to_string)
            .unwrap_or_else(|| format!("Auto after {trigger}")),
        trigger: trigger.to_string(),
        turn_count: count_agent_turns(iter_dir, coach_name),
    };
    std::fs::write(
        cp_dir.join("state.json"),
        serde_json::to_string_pretty(&state)? + "\n",
    )?;
    debug!(number, trigger, "checkpoint created");
    Ok(number)
}

/// All checkpoints with a readable `state.json`, ordered by number.
pub fn list_checkpoints(iter_dir: &Path) -> Vec<CheckpointState> {
    let dir = iter_dir.join(CHECKPOINTS_DIR);
    let mut states: Vec<CheckpointState> = std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .filter_map(|e| std::fs::read_to_string(e.path().join("state.json")).ok())
        .filter_map(|text| serde_json::from_str(&text).ok())
        .collect();
    states.sort_by_key(|s: &CheckpointState| s.number);
    states
}

/// Restore the iteration directory from checkpoint `number`: checkpointed
/// files are copied back, and current artifact files absent from the
/// checkpoint are deleted. The `checkpoints/` tree itself is never
/// touched.
pub fn restore_checkpoint(iter_dir: &Path, number: u32) -> anyhow::Result<CheckpointState> {
    let cp_dir = iter_dir.join(CHECKPOINTS_DIR).join(number.to_string());
    if !cp_dir.is_dir() {
        bail!("checkpoint {number} does not exist");
    }
    let state_text = std::fs::read_to_string(cp_dir.join("state.json"))
        .with_context(|| format!("checkpoint {number} has no state.json"))?;
    let state: CheckpointState = serde_json::from_str(&state_text)?;

    let checkpointed: HashSet<String> = std::fs::read_dir(&cp_dir)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n != "state.json")
        .collect();

    // Remove artifacts created after the checkpoint.
    for name in iter_files(iter_dir) {
        if !checkpointed.contains(&name) {
            let _ = std::fs::remove_file(iter_dir.join(&name));
        }
    }
    for name in &checkpointed {
        std::fs::copy(cp_dir.join(name), iter_dir.join(name))
            .with_context(|| format!("restoring {name}"))?;
    }
    debug!(number, "checkpoint restored");
    Ok(state)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use troupe_config::{Iteration, IterationStatus, Phase};

    use super::*;
    use crate::{append_message, LogMessage};

    fn iteration() -> Iteration {
        let mut it = Iteration::new("iter-1", "Test iteration");
        it.status = IterationStatus::InProgress;
        it.max_turns = 10;
        it
    }

    fn write_log(iter_dir: &Path, senders: &[&str]) {
        let log = iter_dir.join(CONVERSATION_FILE);
        for s in senders {
            append_message(&log, &LogMessage::new(*s, "iter-1", "msg")).unwrap();
        }
    }

    // ── File discovery ────────────────────────────────────────────────────────

    #[test]
    fn iter_files_excludes_debug_checkpoints_and_state() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("conversation.jsonl"), "").unwrap();
        std::fs::write(tmp.path().join("debug.jsonl"), "").unwrap();
        std::fs::write(tmp.path().join(STATE_FILE), "{}").unwrap();
        std::fs::create_dir_all(tmp.path().join("checkpoints")).unwrap();
        let files = iter_files(tmp.path());
        assert_eq!(files, vec!["conversation.jsonl"]);
    }

    #[test]
    fn iter_files_does_not_recurse() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("subdir")).unwrap();
        std::fs::write(tmp.path().join("subdir/nested.txt"), "").unwrap();
        assert!(iter_files(tmp.path()).is_empty());
    }

    // ── Numbering ─────────────────────────────────────────────────────────────

    #[test]
    fn first_checkpoint_is_one() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(next_checkpoint_number(tmp.path()), 1);
    }

    #[test]
    fn numbering_is_max_plus_one_with_gaps() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("checkpoints/1")).unwrap();
        std::fs::create_dir_all(tmp.path().join("checkpoints/5")).unwrap();
        std::fs::create_dir_all(tmp.path().join("checkpoints/temp")).unwrap();
        assert_eq!(next_checkpoint_number(tmp.path()), 6);
    }

    // ── Turn counting ─────────────────────────────────────────────────────────

    #[test]
    fn counts_only_agent_turns() {
        let tmp = tempfile::tempdir().unwrap();
        write_log(
            tmp.path(),
            &["agent-1", "human", "agent-2", "coach", "system", "agent-1"],
        );
        assert_eq!(count_agent_turns(tmp.path(), "coach"), 3);
    }

    #[test]
    fn renamed_coach_is_excluded_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        write_log(tmp.path(), &["agent-1", "scrum-master", "agent-2"]);
        assert_eq!(count_agent_turns(tmp.path(), "coach"), 3);
        assert_eq!(count_agent_turns(tmp.path(), "scrum-master"), 2);
    }

    // ── Create ────────────────────────────────────────────────────────────────

    #[test]
    fn create_copies_artifacts_and_writes_state() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("conversation.jsonl"), "line\n").unwrap();
        std::fs::write(tmp.path().join("scope_summary.md"), "scope").unwrap();
        std::fs::write(tmp.path().join("debug.jsonl"), "excluded").unwrap();

        let mut it = iteration();
        it.phase = Phase::Planning;
        it.max_turns = 20;
        let n = create_checkpoint(tmp.path(), &it, Some("test save"), "manual", "coach").unwrap();
        assert_eq!(n, 1);

        let cp = tmp.path().join("checkpoints/1");
        assert_eq!(
            std::fs::read_to_string(cp.join("conversation.jsonl")).unwrap(),
            "line\n"
        );
        assert_eq!(std::fs::read_to_string(cp.join("scope_summary.md")).unwrap(), "scope");
        assert!(!cp.join("debug.jsonl").exists());

        let state: CheckpointState =
            serde_json::from_str(&std::fs::read_to_string(cp.join("state.json")).unwrap()).unwrap();
        assert_eq!(state.number, 1);
        assert_eq!(state.phase, "planning");
        assert_eq!(state.status, "in-progress");
        assert_eq!(state.max_turns, 20);
        assert_eq!(state.description, "test save");
        assert_eq!(state.trigger, "manual");
    }

    #[test]
    fn auto_description_names_trigger() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("conversation.jsonl"), "").unwrap();
        create_checkpoint(tmp.path(), &iteration(), None, "auto", "coach").unwrap();
        let states = list_checkpoints(tmp.path());
        assert_eq!(states[0].description, "Auto after auto");
    }

    #[test]
    fn create_increments() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("conversation.jsonl"), "").unwrap();
        let it = iteration();
        let ns: Vec<u32> = (0..3)
            .map(|_| create_checkpoint(tmp.path(), &it, None, "auto", "coach").unwrap())
            .collect();
        assert_eq!(ns, vec![1, 2, 3]);
    }

    #[test]
    fn state_records_turn_count() {
        let tmp = tempfile::tempdir().unwrap();
        write_log(tmp.path(), &["agent-1", "agent-2", "coach"]);
        create_checkpoint(tmp.path(), &iteration(), None, "auto", "coach").unwrap();
        assert_eq!(list_checkpoints(tmp.path())[0].turn_count, 2);
    }

    #[test]
    fn unknown_artifacts_are_included() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("conversation.jsonl"), "").unwrap();
        std::fs::write(tmp.path().join("new_artifact.txt"), "future data").unwrap();
        create_checkpoint(tmp.path(), &iteration(), None, "auto", "coach").unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("checkpoints/1/new_artifact.txt")).unwrap(),
            "future data"
        );
    }

    // ── List ──────────────────────────────────────────────────────────────────

    #[test]
    fn list_empty_and_missing_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(list_checkpoints(tmp.path()).is_empty());
    }

    #[test]
    fn list_is_ordered_and_skips_broken() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("conversation.jsonl"), "").unwrap();
        let it = iteration();
        create_checkpoint(tmp.path(), &it, Some("first"), "manual", "coach").unwrap();
        create_checkpoint(tmp.path(), &it, Some("second"), "manual", "coach").unwrap();
        // A directory without state.json is skipped.
        std::fs::create_dir_all(tmp.path().join("checkpoints/9")).unwrap();
        let states = list_checkpoints(tmp.path());
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].description, "first");
        assert_eq!(states[1].description, "second");
    }

    // ── Restore ───────────────────────────────────────────────────────────────

    #[test]
    fn restore_replaces_and_deletes() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("conversation.jsonl"), "original\n").unwrap();
        create_checkpoint(tmp.path(), &iteration(), None, "auto", "coach").unwrap();

        std::fs::write(tmp.path().join("conversation.jsonl"), "modified\n").unwrap();
        std::fs::write(tmp.path().join("tasks.json"), "[]").unwrap();

        restore_checkpoint(tmp.path(), 1).unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("conversation.jsonl")).unwrap(),
            "original\n"
        );
        assert!(!tmp.path().join("tasks.json").exists());
    }

    #[test]
    fn restore_returns_state() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("conversation.jsonl"), "").unwrap();
        let mut it = iteration();
        it.phase = Phase::Planning;
        it.max_turns = 20;
        create_checkpoint(tmp.path(), &it, None, "auto", "coach").unwrap();
        let state = restore_checkpoint(tmp.path(), 1).unwrap();
        assert_eq!(state.phase, "planning");
        assert_eq!(state.max_turns, 20);
    }

    #[test]
    fn restore_missing_number_errors() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(restore_checkpoint(tmp.path(), 99).is_err());
    }

    #[test]
    fn restore_preserves_checkpoint_tree() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("conversation.jsonl"), "").unwrap();
        let it = iteration();
        create_checkpoint(tmp.path(), &it, None, "auto", "coach").unwrap();
        create_checkpoint(tmp.path(), &it, None, "auto", "coach").unwrap();
        restore_checkpoint(tmp.path(), 1).unwrap();
        assert!(tmp.path().join("checkpoints/1").exists());
        assert!(tmp.path().join("checkpoints/2").exists());
    }
}
