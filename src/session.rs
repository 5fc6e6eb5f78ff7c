// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session setup shared by the supervisor drivers: validation, file
//! infrastructure, worktrees, and event persistence.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::warn;

use troupe_config::{AgentConfig, FileAccessConfig, Iteration, IterationStatus, Phase, TeamConfig};
use troupe_core::SessionEvent;
use troupe_store::{append_debug, append_message, load_tasks, Task, TaskStatus};
use troupe_tools::{ApprovalStore, FileMediator};
use troupe_vcs::{create_worktree, ensure_git_repo, ensure_gitignore_entries};

/// Raised when a session cannot start. The caller decides how to display.
#[derive(Debug, Error)]
pub enum SessionSetupError {
    #[error("Iteration description is empty. Edit .team/iteration.json first.")]
    EmptyDescription,
    #[error("Iteration status is '{0}', expected 'in-progress'.")]
    WrongStatus(IterationStatus),
    #[error("Need at least 2 agents in .team/team.json.")]
    TooFewAgents,
    #[error("{phase} requires tasks.json. Run advance from planning first.")]
    MissingTasks { phase: Phase },
    #[error(
        "{scope} must be assigned before starting {phase}. Unassigned tasks: {ids}. \
         Edit .team/iterations/<id>/tasks.json to assign agents."
    )]
    UnassignedTasks {
        phase: Phase,
        scope: String,
        ids: String,
    },
    #[error("worktrees require HEAD on 'main', found '{0}'")]
    NotOnMain(String),
    #[error(transparent)]
    Vcs(#[from] troupe_vcs::VcsError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Persist one event to the on-disk logs. Non-persistence events are
/// no-ops. The supervisor is the single log writer; it calls this in
/// event arrival order.
pub fn persist_event(event: &SessionEvent, log_path: &Path, debug_path: &Path) {
    let result = match event {
        SessionEvent::AppendMessage(msg) => append_message(log_path, msg),
        SessionEvent::AppendDebug(entry) => append_debug(debug_path, entry),
        _ => Ok(()),
    };
    if let Err(e) = result {
        warn!(error = %e, "failed to persist session event");
    }
}

/// Resolve the layer to operate on: explicit override, iteration state,
/// or zero.
pub fn resolve_layer(layer_override: Option<u32>, iteration: &Iteration) -> u32 {
    layer_override
        .or(iteration.current_layer)
        .unwrap_or(0)
}

/// Validate that an iteration is ready to run a session.
pub fn validate_iteration_for_run(
    iteration: &Iteration,
    iter_dir: &Path,
    agents: &[AgentConfig],
) -> Result<(), SessionSetupError> {
    if iteration.description.trim().is_empty() {
        return Err(SessionSetupError::EmptyDescription);
    }
    if iteration.status != IterationStatus::InProgress {
        return Err(SessionSetupError::WrongStatus(iteration.status));
    }
    if agents.len() < 2 {
        return Err(SessionSetupError::TooFewAgents);
    }

    let phase = iteration.phase;
    if !matches!(phase, Phase::PreCodeReview | Phase::Implementation) {
        return Ok(());
    }

    let tasks = load_tasks(iter_dir).map_err(|_| SessionSetupError::MissingTasks { phase })?;
    let (scoped, scope): (Vec<&Task>, String) = match (phase, iteration.current_layer) {
        (Phase::Implementation, Some(layer)) => (
            tasks.iter().filter(|t| t.layer == layer).collect(),
            format!("layer {layer} tasks"),
        ),
        _ => (tasks.iter().collect(), "all tasks".into()),
    };
    let unassigned: Vec<&str> = scoped
        .iter()
        .filter(|t| t.assigned_to.as_deref().unwrap_or("").is_empty())
        .map(|t| t.id.as_str())
        .collect();
    if !unassigned.is_empty() {
        return Err(SessionSetupError::UnassignedTasks {
            phase,
            scope,
            ids: unassigned.join(", "),
        });
    }
    Ok(())
}

/// Build the mediator and approval store from the file-access config.
pub fn build_file_infra(
    project_root: &Path,
    file_access: Option<&FileAccessConfig>,
    iter_dir: &Path,
) -> (Option<FileMediator>, Option<Arc<Mutex<ApprovalStore>>>) {
    let Some(config) = file_access else {
        return (None, None);
    };
    let mediator = FileMediator::new(project_root, config);
    let store = config.enable_approvals.then(|| {
        Arc::new(Mutex::new(ApprovalStore::open(
            iter_dir.join(troupe_store::APPROVALS_FILE),
        )))
    });
    (Some(mediator), store)
}

/// Create per-agent worktrees for the current layer when worktrees are
/// enabled and the phase uses them. Returns the worktree map and any
/// warnings.
pub fn setup_worktrees(
    project_root: &Path,
    config: &TeamConfig,
    iteration: &Iteration,
    layer_override: Option<u32>,
    has_mediator: bool,
) -> Result<(std::collections::HashMap<String, PathBuf>, Vec<String>), SessionSetupError> {
    let mut map = std::collections::HashMap::new();
    let mut warnings = Vec::new();

    if !config.worktrees.map(|w| w.enabled).unwrap_or(false) {
        return Ok((map, warnings));
    }
    if !matches!(iteration.phase, Phase::Implementation | Phase::CodeReview) {
        return Ok((map, warnings));
    }
    if !has_mediator {
        warnings.push(
            "worktrees enabled but file_access not configured; worktrees require file tools."
                .into(),
        );
        return Ok((map, warnings));
    }

    ensure_git_repo(project_root)?;
    let head = std::process::Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(project_root)
        .output()
        .map_err(|e| SessionSetupError::Other(e.into()))?;
    let current = String::from_utf8_lossy(&head.stdout).trim().to_string();
    if current != "main" {
        return Err(SessionSetupError::NotOnMain(current));
    }

    warnings.extend(ensure_gitignore_entries(project_root)?);

    let layer = resolve_layer(layer_override, iteration);
    for agent in &config.agents {
        let path = create_worktree(project_root, &agent.name, layer)?;
        map.insert(agent.name.clone(), path);
    }
    Ok((map, warnings))
}

/// Load review diffs for the code-review phase. `None` outside that
/// phase or when there is nothing to review (with a warning).
pub fn load_diffs_for_review(
    project_root: &Path,
    config: &TeamConfig,
    iteration: &Iteration,
    layer_override: Option<u32>,
) -> (Option<String>, Vec<String>) {
    if iteration.phase != Phase::CodeReview {
        return (None, Vec::new());
    }
    if !config.worktrees.map(|w| w.enabled).unwrap_or(false) {
        return (
            None,
            vec!["code-review phase but worktrees not enabled. No diffs to load.".into()],
        );
    }
    let layer = resolve_layer(layer_override, iteration);
    match troupe_vcs::format_diffs_for_prompt(project_root, layer) {
        Ok(Some(diffs)) => (Some(diffs), Vec::new()),
        Ok(None) => (
            None,
            vec![format!("no branches found for layer {layer}. No diffs to review.")],
        ),
        Err(e) => (None, vec![format!("failed to load diffs: {e}")]),
    }
}

/// One-line-per-task summary injected into discussion prompts once the
/// task list exists.
pub fn format_tasks_for_prompt(tasks: &[Task]) -> String {
    tasks
        .iter()
        .map(|t| {
            let assignee = t.assigned_to.as_deref().unwrap_or("unassigned");
            let status = match t.status {
                TaskStatus::Pending => "pending",
                TaskStatus::Done => "done",
                TaskStatus::Blocked => "blocked",
            };
            let mut line = format!(
                "- {} (layer {}, {assignee}, {status}): {}",
                t.id, t.layer, t.description
            );
            if !t.done_criteria.is_empty() {
                line.push_str(&format!(" [done when: {}]", t.done_criteria));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
