// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The phase controller: a finite state machine over
//! `refinement → planning → pre-code-review → implementation ⇄ code-review → done`,
//! with each transition running its extraction procedure, writing a phase
//! boundary to the log, and taking an auto-checkpoint.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use troupe_config::{Iteration, IterationStatus, Phase};
use troupe_model::ModelClient;
use troupe_store::{
    append_message, create_checkpoint, current_phase_segment, load_tasks, max_layer, read_log,
    save_tasks, Task, TaskStatus, CONVERSATION_FILE, SCOPE_SUMMARY_FILE,
};

use crate::{
    build_transition_messages, extract_refinement_summary, extract_task_notes, extract_tasks,
    TransitionError,
};

/// Sidecar file holding unparseable planning output.
pub const TASKS_RAW_FILE: &str = "tasks_raw.txt";

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("iteration status is '{0}', expected 'in-progress'")]
    NotInProgress(IterationStatus),
    #[error("phase '{0}' has no next phase")]
    TerminalPhase(Phase),
    #[error("all tasks must be assigned before {phase}. Unassigned tasks: {ids}")]
    UnassignedTasks { phase: Phase, ids: String },
    #[error("layer {layer} is not finished. Tasks not done: {ids}")]
    LayerIncomplete { layer: u32, ids: String },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What a successful `advance_phase` did.
#[derive(Debug)]
pub enum AdvanceOutcome {
    Advanced { from: Phase, to: Phase },
    /// The planning coach produced unusable output: the phase stays on
    /// planning and the raw text is stored for inspection.
    PlanningFailed { error: String, raw_artifact: PathBuf },
}

/// Advance the iteration one phase, mutating `iteration` in place. The
/// caller persists `iteration.json` afterwards.
pub async fn advance_phase(
    iteration: &mut Iteration,
    iter_dir: &Path,
    coach_name: &str,
    client: &dyn ModelClient,
) -> Result<AdvanceOutcome, ControllerError> {
    if iteration.status != IterationStatus::InProgress {
        return Err(ControllerError::NotInProgress(iteration.status));
    }

    let from = iteration.phase;
    let log_path = iter_dir.join(CONVERSATION_FILE);
    let history = read_log(&log_path)?;
    let segment = current_phase_segment(&history);

    let mut tasks_written = false;
    let mut coach_ran = false;

    let to = match from {
        Phase::Refinement => {
            let summary = extract_refinement_summary(segment, coach_name, client).await?;
            std::fs::write(iter_dir.join(SCOPE_SUMMARY_FILE), &summary)
                .map_err(|e| ControllerError::Other(e.into()))?;
            coach_ran = true;
            Phase::Planning
        }
        Phase::Planning => {
            let scope_summary = std::fs::read_to_string(iter_dir.join(SCOPE_SUMMARY_FILE)).ok();
            let mut tasks =
                match extract_tasks(segment, coach_name, client, scope_summary.as_deref()).await {
                    Ok(tasks) => tasks,
                    Err(e) => {
                        if let Some(raw) = e.raw_output() {
                            let raw_path = iter_dir.join(TASKS_RAW_FILE);
                            if let Err(io) = std::fs::write(&raw_path, raw) {
                                warn!(error = %io, "failed to store raw planning output");
                            }
                            return Ok(AdvanceOutcome::PlanningFailed {
                                error: e.to_string(),
                                raw_artifact: raw_path,
                            });
                        }
                        return Err(e.into());
                    }
                };
            // Notes are an enrichment; their failure never blocks planning.
            match extract_task_notes(segment, &tasks, coach_name, client).await {
                Ok(notes) => {
                    for task in &mut tasks {
                        if let Some(n) = notes.get(&task.id) {
                            task.notes = Some(n.clone());
                        }
                    }
                }
                Err(e) => warn!(error = %e, "task notes extraction failed"),
            }
            save_tasks(iter_dir, &tasks)?;
            tasks_written = true;
            coach_ran = true;
            Phase::PreCodeReview
        }
        Phase::PreCodeReview => {
            let tasks = load_tasks(iter_dir)?;
            let unassigned: Vec<&str> = tasks
                .iter()
                .filter(|t| t.assigned_to.as_deref().unwrap_or("").is_empty())
                .map(|t| t.id.as_str())
                .collect();
            if !unassigned.is_empty() {
                return Err(ControllerError::UnassignedTasks {
                    phase: Phase::Implementation,
                    ids: unassigned.join(", "),
                });
            }
            iteration.current_layer = Some(0);
            Phase::Implementation
        }
        Phase::Implementation => Phase::CodeReview,
        Phase::CodeReview => {
            let tasks = load_tasks(iter_dir)?;
            let layer = iteration.current_layer.unwrap_or(0);
            let not_done = undone_through_layer(&tasks, layer);
            if !not_done.is_empty() {
                return Err(ControllerError::LayerIncomplete {
                    layer,
                    ids: not_done.join(", "),
                });
            }
            if max_layer(&tasks).is_some_and(|deepest| deepest > layer) {
                iteration.current_layer = Some(layer + 1);
                Phase::Implementation
            } else {
                iteration.status = IterationStatus::Done;
                Phase::Done
            }
        }
        Phase::Done => return Err(ControllerError::TerminalPhase(Phase::Done)),
    };

    let (boundary, transition) = build_transition_messages(
        &iteration.id,
        from.as_str(),
        to.as_str(),
        tasks_written,
        coach_ran,
    );
    append_message(&log_path, &boundary)?;
    append_message(&log_path, &transition)?;

    iteration.phase = to;
    create_checkpoint(iter_dir, iteration, Some("Auto after advance"), "auto", coach_name)?;
    debug!(from = %from, to = %to, "phase advanced");
    Ok(AdvanceOutcome::Advanced { from, to })
}

/// Ids of tasks at or above `layer` depth that are not done.
fn undone_through_layer(tasks: &[Task], layer: u32) -> Vec<String> {
    tasks
        .iter()
        .filter(|t| t.layer <= layer && t.status != TaskStatus::Done)
        .map(|t| t.id.clone())
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use troupe_model::mock::ScriptedClient;
    use troupe_store::{read_log, LogMessage};

    use super::*;

    fn iteration(phase: Phase) -> Iteration {
        let mut it = Iteration::new("iter-1", "Build a todo app");
        it.status = IterationStatus::InProgress;
        it.phase = phase;
        it
    }

    fn write_history(iter_dir: &Path, lines: &[(&str, &str)]) {
        let path = iter_dir.join(CONVERSATION_FILE);
        for (from, content) in lines {
            append_message(&path, &LogMessage::new(*from, "iter-1", *content)).unwrap();
        }
    }

    fn assigned_task(id: &str, agent: &str, layer: u32, status: TaskStatus) -> Task {
        let mut t = Task::new(id, format!("work on {id}"));
        t.assigned_to = Some(agent.into());
        t.layer = layer;
        t.status = status;
        t
    }

    // ── Guards ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn requires_in_progress_status() {
        let tmp = tempfile::tempdir().unwrap();
        let mut it = iteration(Phase::Refinement);
        it.status = IterationStatus::Pending;
        let client = ScriptedClient::always_text("x");
        let err = advance_phase(&mut it, tmp.path(), "coach", &client).await.unwrap_err();
        assert!(matches!(err, ControllerError::NotInProgress(_)));
    }

    #[tokio::test]
    async fn done_is_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        let mut it = iteration(Phase::Done);
        let client = ScriptedClient::always_text("x");
        let err = advance_phase(&mut it, tmp.path(), "coach", &client).await.unwrap_err();
        assert!(matches!(err, ControllerError::TerminalPhase(_)));
    }

    // ── Refinement → planning ─────────────────────────────────────────────────

    #[tokio::test]
    async fn refinement_stores_scope_summary_and_boundary() {
        let tmp = tempfile::tempdir().unwrap();
        write_history(tmp.path(), &[("a1", "let's agree on scope")]);
        let mut it = iteration(Phase::Refinement);
        let client = ScriptedClient::always_text("## Agreed Requirements\n- todos");

        let outcome = advance_phase(&mut it, tmp.path(), "coach", &client).await.unwrap();
        assert!(matches!(
            outcome,
            AdvanceOutcome::Advanced { from: Phase::Refinement, to: Phase::Planning }
        ));
        assert_eq!(it.phase, Phase::Planning);
        assert!(std::fs::read_to_string(tmp.path().join(SCOPE_SUMMARY_FILE))
            .unwrap()
            .contains("Agreed Requirements"));

        let log = read_log(&tmp.path().join(CONVERSATION_FILE)).unwrap();
        let boundary = log.iter().find(|m| m.phase_boundary).unwrap();
        assert_eq!(boundary.from_phase.as_deref(), Some("refinement"));
        assert_eq!(boundary.to_phase.as_deref(), Some("planning"));
        assert!(log.last().unwrap().content.contains("Scope summary written"));
        // Auto-checkpoint was taken.
        assert!(tmp.path().join("checkpoints/1/state.json").exists());
    }

    // ── Planning → pre-code-review ────────────────────────────────────────────

    #[tokio::test]
    async fn planning_extracts_tasks_with_layers_and_notes() {
        let tmp = tempfile::tempdir().unwrap();
        write_history(tmp.path(), &[("a1", "tasks discussed")]);
        let mut it = iteration(Phase::Planning);
        let client = ScriptedClient::new(vec![
            troupe_model::CompletionRound::scripted(
                r#"[{"id": "t1", "description": "base", "done_criteria": "works", "depends_on": []},
                    {"id": "t2", "description": "top", "done_criteria": "works", "depends_on": ["t1"]}]"#,
                vec![],
            ),
            troupe_model::CompletionRound::scripted(
                r#"[{"id": "t1", "notes": "src/base.py"}]"#,
                vec![],
            ),
        ]);

        advance_phase(&mut it, tmp.path(), "coach", &client).await.unwrap();
        assert_eq!(it.phase, Phase::PreCodeReview);
        let tasks = load_tasks(tmp.path()).unwrap();
        assert_eq!(tasks[0].layer, 0);
        assert_eq!(tasks[1].layer, 1);
        assert_eq!(tasks[0].notes.as_deref(), Some("src/base.py"));
        let log = read_log(&tmp.path().join(CONVERSATION_FILE)).unwrap();
        assert!(log.last().unwrap().content.contains("Task list written"));
    }

    #[tokio::test]
    async fn planning_failure_stores_raw_and_stays() {
        let tmp = tempfile::tempdir().unwrap();
        write_history(tmp.path(), &[("a1", "tasks discussed")]);
        let mut it = iteration(Phase::Planning);
        let client = ScriptedClient::always_text("this is not json");

        let outcome = advance_phase(&mut it, tmp.path(), "coach", &client).await.unwrap();
        match outcome {
            AdvanceOutcome::PlanningFailed { raw_artifact, .. } => {
                assert_eq!(
                    std::fs::read_to_string(raw_artifact).unwrap(),
                    "this is not json"
                );
            }
            other => panic!("expected PlanningFailed, got {other:?}"),
        }
        assert_eq!(it.phase, Phase::Planning);
        // No boundary written for a failed transition.
        let log = read_log(&tmp.path().join(CONVERSATION_FILE)).unwrap();
        assert!(!log.iter().any(|m| m.phase_boundary));
    }

    #[tokio::test]
    async fn planning_cycle_stores_raw_and_stays() {
        let tmp = tempfile::tempdir().unwrap();
        write_history(tmp.path(), &[("a1", "talk")]);
        let mut it = iteration(Phase::Planning);
        let client = ScriptedClient::always_text(
            r#"[{"id": "t1", "description": "a", "depends_on": ["t2"]},
                {"id": "t2", "description": "b", "depends_on": ["t1"]}]"#,
        );
        let outcome = advance_phase(&mut it, tmp.path(), "coach", &client).await.unwrap();
        assert!(matches!(outcome, AdvanceOutcome::PlanningFailed { .. }));
        assert_eq!(it.phase, Phase::Planning);
    }

    // ── Pre-code-review → implementation ──────────────────────────────────────

    #[tokio::test]
    async fn pre_code_review_requires_assignees() {
        let tmp = tempfile::tempdir().unwrap();
        write_history(tmp.path(), &[("a1", "review")]);
        let mut unassigned = Task::new("t1", "orphan");
        unassigned.layer = 0;
        save_tasks(tmp.path(), &[unassigned]).unwrap();
        let mut it = iteration(Phase::PreCodeReview);
        let client = ScriptedClient::always_text("x");

        let err = advance_phase(&mut it, tmp.path(), "coach", &client).await.unwrap_err();
        match err {
            ControllerError::UnassignedTasks { ids, .. } => assert_eq!(ids, "t1"),
            other => panic!("unexpected: {other}"),
        }
        assert_eq!(it.phase, Phase::PreCodeReview);
    }

    #[tokio::test]
    async fn pre_code_review_sets_layer_zero() {
        let tmp = tempfile::tempdir().unwrap();
        write_history(tmp.path(), &[("a1", "review")]);
        save_tasks(tmp.path(), &[assigned_task("t1", "a1", 0, TaskStatus::Pending)]).unwrap();
        let mut it = iteration(Phase::PreCodeReview);
        let client = ScriptedClient::always_text("x");

        advance_phase(&mut it, tmp.path(), "coach", &client).await.unwrap();
        assert_eq!(it.phase, Phase::Implementation);
        assert_eq!(it.current_layer, Some(0));
    }

    // ── The implementation ⇄ code-review cycle ────────────────────────────────

    #[tokio::test]
    async fn implementation_advances_to_code_review() {
        let tmp = tempfile::tempdir().unwrap();
        write_history(tmp.path(), &[("a1", "impl")]);
        let mut it = iteration(Phase::Implementation);
        it.current_layer = Some(0);
        let client = ScriptedClient::always_text("x");
        advance_phase(&mut it, tmp.path(), "coach", &client).await.unwrap();
        assert_eq!(it.phase, Phase::CodeReview);
        assert_eq!(it.current_layer, Some(0));
    }

    #[tokio::test]
    async fn code_review_loops_back_while_layers_remain() {
        let tmp = tempfile::tempdir().unwrap();
        write_history(tmp.path(), &[("a1", "review")]);
        save_tasks(
            tmp.path(),
            &[
                assigned_task("t1", "a1", 0, TaskStatus::Done),
                assigned_task("t2", "a1", 1, TaskStatus::Pending),
            ],
        )
        .unwrap();
        let mut it = iteration(Phase::CodeReview);
        it.current_layer = Some(0);
        let client = ScriptedClient::always_text("x");

        advance_phase(&mut it, tmp.path(), "coach", &client).await.unwrap();
        assert_eq!(it.phase, Phase::Implementation);
        assert_eq!(it.current_layer, Some(1));
        assert_eq!(it.status, IterationStatus::InProgress);
    }

    #[tokio::test]
    async fn code_review_finishes_after_deepest_layer() {
        let tmp = tempfile::tempdir().unwrap();
        write_history(tmp.path(), &[("a1", "review")]);
        save_tasks(
            tmp.path(),
            &[
                assigned_task("t1", "a1", 0, TaskStatus::Done),
                assigned_task("t2", "a1", 1, TaskStatus::Done),
            ],
        )
        .unwrap();
        let mut it = iteration(Phase::CodeReview);
        it.current_layer = Some(1);
        let client = ScriptedClient::always_text("x");

        advance_phase(&mut it, tmp.path(), "coach", &client).await.unwrap();
        assert_eq!(it.phase, Phase::Done);
        assert_eq!(it.status, IterationStatus::Done);
    }

    #[tokio::test]
    async fn code_review_blocks_on_unfinished_layer() {
        let tmp = tempfile::tempdir().unwrap();
        write_history(tmp.path(), &[("a1", "review")]);
        save_tasks(tmp.path(), &[assigned_task("t1", "a1", 0, TaskStatus::Pending)]).unwrap();
        let mut it = iteration(Phase::CodeReview);
        it.current_layer = Some(0);
        let client = ScriptedClient::always_text("x");

        let err = advance_phase(&mut it, tmp.path(), "coach", &client).await.unwrap_err();
        assert!(matches!(err, ControllerError::LayerIncomplete { .. }));
        assert_eq!(it.phase, Phase::CodeReview);
    }

    // ── Boundary counting ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn exactly_one_boundary_per_transition() {
        let tmp = tempfile::tempdir().unwrap();
        write_history(tmp.path(), &[("a1", "scope talk")]);
        let mut it = iteration(Phase::Refinement);
        let client = ScriptedClient::always_text("## Agreed Requirements\n- x");
        advance_phase(&mut it, tmp.path(), "coach", &client).await.unwrap();

        let log = read_log(&tmp.path().join(CONVERSATION_FILE)).unwrap();
        assert_eq!(log.iter().filter(|m| m.phase_boundary).count(), 1);
        // Boundary precedes any post-transition message.
        let boundary_pos = log.iter().position(|m| m.phase_boundary).unwrap();
        assert!(boundary_pos >= 1);
    }
}
