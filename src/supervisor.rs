// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The supervisor: drives sessions and the phase controller over a
//! project directory, persists events, replays approval resolutions, and
//! exposes the merge workflow. This is the library surface a CLI or TUI
//! sits on top of.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use troupe_config::{
    iteration_dir, load_iterations, load_team_config, save_iterations, team_dir, Iteration, Phase,
    TeamConfig,
};
use troupe_core::{
    advance_phase, build_phase_skeleton, extract_scope_boundaries, resolve_merge_conflict,
    run_implementation, run_session, AdvanceOutcome, PhaseContext, SessionEvent, SessionPolicy,
};
use troupe_model::{client_from_config, implementation_client_from_config, ModelClient};
use troupe_store::{
    create_checkpoint, current_phase_segment, list_checkpoints, load_tasks, read_log,
    restore_checkpoint, CheckpointState, LogMessage, CONVERSATION_FILE, DEBUG_FILE,
    SCOPE_SUMMARY_FILE,
};
use troupe_tools::{apply_approved_writes, ApprovalRequest, ApprovalStore};
use troupe_vcs::{
    conflict_file_contents, finalize_merge, merge_branch, resolve_conflict_file, MergeOutcome,
    ResolutionStrategy,
};

use crate::session::{
    build_file_infra, format_tasks_for_prompt, load_diffs_for_review, persist_event,
    setup_worktrees, validate_iteration_for_run, SessionSetupError,
};

/// Why the session stopped.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Completed {
        total_turns: u32,
    },
    PausedForApprovals {
        pending: usize,
    },
    CoachAskedPm {
        question: String,
        response_type: String,
        options: Vec<String>,
    },
    PhaseCompleteSignaled {
        phase: String,
    },
    LayerComplete {
        layer: u32,
        completed_tasks: Vec<String>,
    },
}

/// A project directory with a `.team/` inside it.
pub struct Workspace {
    project_root: PathBuf,
    team_dir: PathBuf,
}

impl Workspace {
    /// Open an initialized project. The bootstrap command that creates
    /// `.team/` lives outside this crate.
    pub fn open(project_root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let project_root: PathBuf = project_root.into();
        let team_dir = team_dir(&project_root);
        if !team_dir.is_dir() {
            bail!(
                "no .team directory in {}; initialize the project first",
                project_root.display()
            );
        }
        Ok(Self {
            project_root,
            team_dir,
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn team_config(&self) -> anyhow::Result<TeamConfig> {
        load_team_config(&self.team_dir, &self.project_root)
    }

    /// The currently selected iteration.
    pub fn current_iteration(&self) -> anyhow::Result<Iteration> {
        let file = load_iterations(&self.team_dir)?;
        file.current_iteration()
            .cloned()
            .context("no current iteration selected in .team/iteration.json")
    }

    fn save_iteration(&self, iteration: &Iteration) -> anyhow::Result<()> {
        let mut file = load_iterations(&self.team_dir)?;
        if let Some(slot) = file.iterations.iter_mut().find(|i| i.id == iteration.id) {
            *slot = iteration.clone();
        }
        save_iterations(&self.team_dir, &file)
    }

    pub fn iter_dir(&self, iteration: &Iteration) -> PathBuf {
        iteration_dir(&self.team_dir, &iteration.id)
    }

    // ── Running sessions ──────────────────────────────────────────────────────

    /// Run (or resume) a session for the current iteration, pumping every
    /// event through `on_event` after persisting it.
    pub async fn run(
        &self,
        on_event: impl FnMut(&SessionEvent),
    ) -> Result<SessionOutcome, SessionSetupError> {
        self.run_inner(None, false, on_event).await
    }

    /// Continue a paused session: replay approval resolutions, inject an
    /// optional human message, then run.
    pub async fn continue_with(
        &self,
        human_message: Option<&str>,
        on_event: impl FnMut(&SessionEvent),
    ) -> Result<SessionOutcome, SessionSetupError> {
        self.run_inner(human_message, true, on_event).await
    }

    async fn run_inner(
        &self,
        human_message: Option<&str>,
        apply_resolutions: bool,
        mut on_event: impl FnMut(&SessionEvent),
    ) -> Result<SessionOutcome, SessionSetupError> {
        let config = self.team_config().map_err(SessionSetupError::Other)?;
        let iteration = self.current_iteration().map_err(SessionSetupError::Other)?;
        let iter_dir = self.iter_dir(&iteration);
        std::fs::create_dir_all(&iter_dir)
            .map_err(|e| SessionSetupError::Other(e.into()))?;

        validate_iteration_for_run(&iteration, &iter_dir, &config.agents)?;

        let log_path = iter_dir.join(CONVERSATION_FILE);
        let debug_path = iter_dir.join(DEBUG_FILE);

        let (mediator, approval_store) =
            build_file_infra(&self.project_root, config.file_access.as_ref(), &iter_dir);
        let (worktree_map, warnings) = setup_worktrees(
            &self.project_root,
            &config,
            &iteration,
            None,
            mediator.is_some(),
        )?;
        for w in &warnings {
            warn!("{w}");
        }

        // Approval resolutions are replayed before the next session so the
        // agent sees outcomes in its next turn.
        if apply_resolutions {
            if let (Some(store), Some(mediator)) = (&approval_store, &mediator) {
                let mut store = store.lock().unwrap();
                let base = mediator.clone();
                let map = worktree_map.clone();
                let resolver = move |agent: &str| match map.get(agent) {
                    Some(root) => base.with_root(root),
                    None => base.clone(),
                };
                let applied = apply_approved_writes(&mut store, mediator, Some(&resolver));
                for a in &applied {
                    debug!(id = %a.id, path = %a.path, success = a.success, "approved write replayed");
                }
                for denied in store
                    .get_denied_uninjected()
                    .iter()
                    .map(|r| (r.id.clone(), r.path.clone(), r.denial_reason.clone()))
                    .collect::<Vec<_>>()
                {
                    let (id, path, reason) = denied;
                    let msg = LogMessage::system(
                        &iteration.id,
                        format!(
                            "Write request [{id}] to {path} was denied: {}",
                            reason.unwrap_or_default()
                        ),
                    );
                    troupe_store::append_message(&log_path, &msg)
                        .map_err(SessionSetupError::Other)?;
                    store.mark_injected(&id);
                }
            }
        }

        if let Some(text) = human_message {
            let msg = LogMessage::new("human", &iteration.id, text);
            troupe_store::append_message(&log_path, &msg).map_err(SessionSetupError::Other)?;
        }

        let mut history = read_log(&log_path).map_err(SessionSetupError::Other)?;
        let scope_summary = std::fs::read_to_string(iter_dir.join(SCOPE_SUMMARY_FILE)).ok();
        let tasks_summary = load_tasks(&iter_dir)
            .ok()
            .map(|tasks| format_tasks_for_prompt(&tasks));
        let (diffs_summary, diff_warnings) =
            load_diffs_for_review(&self.project_root, &config, &iteration, None);
        for w in &diff_warnings {
            warn!("{w}");
        }

        let kickoff_text = build_kickoff(&history, iteration.phase, scope_summary.as_deref());
        let policy = SessionPolicy {
            mediator,
            approval_store,
            worktree_map,
            streaming: config.streaming,
            kickoff_text,
        };
        let context = PhaseContext {
            scope_summary,
            tasks_summary,
            diffs_summary,
        };

        let client: std::sync::Arc<dyn ModelClient> = if iteration.phase == Phase::Implementation {
            implementation_client_from_config(&config.model).map_err(SessionSetupError::Other)?
        } else {
            client_from_config(&config.model).map_err(SessionSetupError::Other)?
        };

        let (tx, mut rx) = mpsc::channel::<SessionEvent>(64);
        let engine = async {
            let result = if iteration.phase == Phase::Implementation {
                run_implementation(
                    &config.agents,
                    &iteration,
                    iteration.current_layer.unwrap_or(0),
                    &iter_dir,
                    &policy,
                    client.as_ref(),
                    &mut history,
                    None,
                    &tx,
                )
                .await
            } else {
                run_session(
                    &config.agents,
                    config.coach.as_ref(),
                    &iteration,
                    iteration.max_turns,
                    &policy,
                    &context,
                    client.as_ref(),
                    &mut history,
                    &tx,
                )
                .await
            };
            drop(tx);
            result
        };

        let consumer = async {
            let mut outcome = SessionOutcome::Completed { total_turns: 0 };
            while let Some(event) = rx.recv().await {
                persist_event(&event, &log_path, &debug_path);
                match &event {
                    SessionEvent::SessionComplete { total_turns } => {
                        outcome = SessionOutcome::Completed {
                            total_turns: *total_turns,
                        };
                    }
                    SessionEvent::PauseForApprovals { pending } => {
                        outcome = SessionOutcome::PausedForApprovals { pending: *pending };
                    }
                    SessionEvent::CoachAskedPM {
                        question,
                        response_type,
                        options,
                    } => {
                        outcome = SessionOutcome::CoachAskedPm {
                            question: question.clone(),
                            response_type: response_type.clone(),
                            options: options.clone(),
                        };
                    }
                    SessionEvent::PhaseCompleteSignaled { phase } => {
                        outcome = SessionOutcome::PhaseCompleteSignaled {
                            phase: phase.clone(),
                        };
                    }
                    SessionEvent::LayerComplete {
                        layer,
                        completed_tasks,
                    } => {
                        outcome = SessionOutcome::LayerComplete {
                            layer: *layer,
                            completed_tasks: completed_tasks.clone(),
                        };
                    }
                    _ => {}
                }
                on_event(&event);
            }
            outcome
        };

        let (engine_result, outcome) = tokio::join!(engine, consumer);
        engine_result.map_err(SessionSetupError::Other)?;

        let coach_name = config.coach.as_ref().map(|c| c.name.as_str()).unwrap_or("coach");
        if let Err(e) = create_checkpoint(&iter_dir, &iteration, None, "auto", coach_name) {
            warn!(error = %e, "auto-checkpoint after run failed");
        }
        Ok(outcome)
    }

    // ── Phase control ─────────────────────────────────────────────────────────

    /// Advance the current iteration to its next phase.
    pub async fn advance(&self) -> anyhow::Result<AdvanceOutcome> {
        let config = self.team_config()?;
        let mut iteration = self.current_iteration()?;
        let iter_dir = self.iter_dir(&iteration);
        let client = client_from_config(&config.model)?;
        let coach_name = config.coach.as_ref().map(|c| c.name.as_str()).unwrap_or("coach");

        let outcome =
            advance_phase(&mut iteration, &iter_dir, coach_name, client.as_ref()).await?;
        self.save_iteration(&iteration)?;
        Ok(outcome)
    }

    // ── Approvals ─────────────────────────────────────────────────────────────

    fn approval_store(&self) -> anyhow::Result<ApprovalStore> {
        let iteration = self.current_iteration()?;
        let iter_dir = self.iter_dir(&iteration);
        Ok(ApprovalStore::open(
            iter_dir.join(troupe_store::APPROVALS_FILE),
        ))
    }

    pub fn pending_approvals(&self) -> anyhow::Result<Vec<ApprovalRequest>> {
        Ok(self
            .approval_store()?
            .get_pending()
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn approve(&self, id: &str) -> anyhow::Result<ApprovalRequest> {
        Ok(self.approval_store()?.approve(id)?)
    }

    pub fn deny(&self, id: &str, reason: &str) -> anyhow::Result<ApprovalRequest> {
        Ok(self.approval_store()?.deny(id, reason)?)
    }

    pub fn approve_all(&self) -> anyhow::Result<Vec<ApprovalRequest>> {
        Ok(self.approval_store()?.approve_all())
    }

    // ── Checkpoints ───────────────────────────────────────────────────────────

    pub fn checkpoints(&self) -> anyhow::Result<Vec<CheckpointState>> {
        let iteration = self.current_iteration()?;
        Ok(list_checkpoints(&self.iter_dir(&iteration)))
    }

    pub fn checkpoint(&self, description: &str) -> anyhow::Result<u32> {
        let config = self.team_config()?;
        let iteration = self.current_iteration()?;
        let coach_name = config.coach.as_ref().map(|c| c.name.as_str()).unwrap_or("coach");
        create_checkpoint(
            &self.iter_dir(&iteration),
            &iteration,
            Some(description),
            "manual",
            coach_name,
        )
    }

    /// Restore iteration artifacts from a checkpoint and sync the
    /// iteration record to the restored state.
    pub fn restore(&self, number: u32) -> anyhow::Result<CheckpointState> {
        let mut iteration = self.current_iteration()?;
        let state = restore_checkpoint(&self.iter_dir(&iteration), number)?;
        if let Ok(phase) = serde_json::from_value::<Phase>(serde_json::json!(state.phase)) {
            iteration.phase = phase;
        }
        iteration.max_turns = state.max_turns;
        self.save_iteration(&iteration)?;
        Ok(state)
    }

    // ── Review and merge ──────────────────────────────────────────────────────

    pub fn review_layer(&self, layer_override: Option<u32>) -> anyhow::Result<Vec<troupe_vcs::BranchDiff>> {
        let iteration = self.current_iteration()?;
        let layer = crate::session::resolve_layer(layer_override, &iteration);
        let branches = troupe_vcs::list_layer_branches(&self.project_root, layer)?;
        let mut diffs = Vec::with_capacity(branches.len());
        for branch in branches {
            diffs.push(troupe_vcs::diff_branch(&self.project_root, &branch)?);
        }
        Ok(diffs)
    }

    pub fn merge_branch(&self, branch: &str) -> anyhow::Result<MergeOutcome> {
        Ok(merge_branch(&self.project_root, branch)?)
    }

    /// Resolve one conflicted file with the `ours`/`theirs` strategy.
    pub fn resolve_conflict(&self, path: &str, strategy: ResolutionStrategy) -> anyhow::Result<()> {
        Ok(resolve_conflict_file(&self.project_root, path, strategy, None)?)
    }

    /// Resolve one conflicted file with the model. Returns the
    /// explanation supplied alongside the resolved content.
    pub async fn resolve_conflict_ai(
        &self,
        branch: &str,
        path: &str,
        task_context: &str,
    ) -> anyhow::Result<String> {
        let config = self.team_config()?;
        let client = client_from_config(&config.model)?;
        let contents = conflict_file_contents(&self.project_root, path)?;
        let (resolved, explanation) = resolve_merge_conflict(
            path,
            branch,
            contents.base.as_deref(),
            &contents.ours,
            &contents.theirs,
            task_context,
            client.as_ref(),
        )
        .await?;
        resolve_conflict_file(
            &self.project_root,
            path,
            ResolutionStrategy::Ai,
            Some(&resolved),
        )?;
        Ok(explanation)
    }

    pub fn finalize_merge(&self, branch: &str) -> anyhow::Result<MergeOutcome> {
        Ok(finalize_merge(&self.project_root, branch)?)
    }

    pub fn abort_merge(&self) -> anyhow::Result<()> {
        Ok(troupe_vcs::abort_merge(&self.project_root)?)
    }
}

/// Seed a resuming phase conversation with context: the scope boundaries
/// for implementation, the previous segment's skeleton elsewhere. A phase
/// already underway gets no kickoff.
fn build_kickoff(
    history: &[LogMessage],
    phase: Phase,
    scope_summary: Option<&str>,
) -> Option<String> {
    if !current_phase_segment(history).is_empty() {
        return None;
    }
    if phase == Phase::Implementation {
        let boundaries = scope_summary.map(extract_scope_boundaries).unwrap_or_default();
        if boundaries.is_empty() {
            return None;
        }
        return Some(format!("Scope boundaries from refinement:\n{boundaries}"));
    }

    // Compress the segment before the last boundary.
    let last_boundary = history.iter().rposition(|m| m.phase_boundary)?;
    let prev_start = history[..last_boundary]
        .iter()
        .rposition(|m| m.phase_boundary)
        .map_or(0, |i| i + 1);
    let prev_segment = &history[prev_start..last_boundary];
    if prev_segment.is_empty() {
        return None;
    }
    let from_phase = history[last_boundary]
        .from_phase
        .clone()
        .unwrap_or_else(|| "previous".into());
    Some(build_phase_skeleton(prev_segment, &from_phase))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn boundary(from: &str, to: &str) -> LogMessage {
        let mut msg = LogMessage::system("iter-1", "--- HISTORY BOUNDARY ---");
        msg.phase_boundary = true;
        msg.from_phase = Some(from.into());
        msg.to_phase = Some(to.into());
        msg
    }

    #[test]
    fn no_kickoff_mid_phase() {
        let history = vec![LogMessage::new("a1", "iter-1", "talking")];
        assert!(build_kickoff(&history, Phase::Refinement, None).is_none());
    }

    #[test]
    fn kickoff_compresses_previous_segment() {
        let history = vec![
            LogMessage::new("a1", "iter-1", "we agreed to use sqlite"),
            boundary("refinement", "planning"),
        ];
        let kickoff = build_kickoff(&history, Phase::Planning, None).unwrap();
        assert!(kickoff.starts_with("## REFINEMENT phase"));
        assert!(kickoff.contains("agreed to use sqlite"));
    }

    #[test]
    fn implementation_kickoff_uses_scope_boundaries() {
        let history = vec![
            LogMessage::new("a1", "iter-1", "planning talk"),
            boundary("pre-code-review", "implementation"),
        ];
        let summary = "## Agreed Requirements\n- parse args\n## Out of Scope\n- sync";
        let kickoff = build_kickoff(&history, Phase::Implementation, Some(summary)).unwrap();
        assert!(kickoff.starts_with("Scope boundaries from refinement:"));
        assert!(kickoff.contains("Agreed Requirements:"));
        assert!(kickoff.contains("Out of Scope:"));
    }

    #[test]
    fn fresh_log_has_no_kickoff() {
        assert!(build_kickoff(&[], Phase::Refinement, None).is_none());
    }

    #[test]
    fn open_requires_team_dir() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(Workspace::open(tmp.path()).is_err());
        std::fs::create_dir_all(tmp.path().join(".team")).unwrap();
        assert!(Workspace::open(tmp.path()).is_ok());
    }
}
