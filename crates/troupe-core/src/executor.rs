// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The implementation executor: a peer of the session engine for the
//! implementation phase. No rotation – agents are dispatched sequentially
//! per layer, each running an inner tool-call loop until it completes or
//! blocks its tasks, hits the round ceiling, or pauses for approvals.
//!
//! Resumable state is written after every round and cleared on clean
//! exit, so a crashed process replays the interrupted round. Tool
//! executions are not transactional; `complete_tasks`/`report_blocked`
//! are idempotent, file writes are overwrites, and drift checks are pure,
//! so replay needs no write-time deduplication.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use troupe_config::{AgentConfig, Iteration};
use troupe_model::{ChatMessage, CompletionRound, ModelClient, ToolOperation, ToolResult, ToolSchema};
use troupe_store::{
    clear_state, load_state, load_tasks, save_state, save_tasks, LogMessage, ResumableState, Task,
    TaskStatus,
};
use troupe_tools::{complete_tasks_tool, format_agent_tool_operation, report_blocked_tool};

use crate::{
    build_tool_executor,
    engine::{absorb_cancel, emit},
    prompts::drift_check_prompt,
    strip_code_fences, classify_result, SessionEvent, SessionPolicy,
};

const READ_ONLY_TOOLS: [&str; 2] = ["file_read", "file_list"];
const REMINDER_CADENCE: u32 = 5;
const WRITES_SINCE_REMINDER_THRESHOLD: u32 = 3;
const HARD_ROUND_CEILING: u32 = 25;

// ─── Task filters ─────────────────────────────────────────────────────────────

fn layer_tasks(tasks: &[Task], layer: u32) -> Vec<&Task> {
    tasks.iter().filter(|t| t.layer == layer).collect()
}

fn agent_layer_tasks<'a>(tasks: &'a [Task], layer: u32, agent: &str) -> Vec<&'a Task> {
    tasks
        .iter()
        .filter(|t| t.layer == layer && t.assigned_to.as_deref() == Some(agent))
        .collect()
}

fn pending_ids(tasks: &[&Task]) -> Vec<String> {
    tasks
        .iter()
        .filter(|t| t.is_pending())
        .map(|t| t.id.clone())
        .collect()
}

fn all_done(tasks: &[&Task]) -> bool {
    tasks.iter().all(|t| t.status == TaskStatus::Done)
}

fn agents_with_pending_work<'a>(
    agents: &'a [AgentConfig],
    tasks: &[Task],
    layer: u32,
) -> Vec<&'a AgentConfig> {
    agents
        .iter()
        .filter(|a| !pending_ids(&agent_layer_tasks(tasks, layer, &a.name)).is_empty())
        .collect()
}

// ─── Prompt assembly ──────────────────────────────────────────────────────────

/// Strip a leading "Do not " / "Do not: " and re-capitalize, so DO NOT
/// blocks read as imperatives instead of double negatives.
fn strip_do_not(text: &str) -> String {
    for prefix in ["Do not ", "Do not: "] {
        if let Some(rest) = text.strip_prefix(prefix) {
            let mut chars = rest.chars();
            return match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => text.to_string(),
            };
        }
    }
    text.to_string()
}

/// Numbered TASK blocks with explicit field prefixes for one agent.
fn format_agent_tasks(tasks: &[Task], agent_name: &str, layer: u32) -> String {
    let my_tasks = agent_layer_tasks(tasks, layer, agent_name);
    if my_tasks.is_empty() {
        return "No tasks assigned to you in this layer.".into();
    }
    let mut parts: Vec<String> = Vec::new();
    for (i, t) in my_tasks.iter().enumerate() {
        let tag = format!("TASK {}", i + 1);
        let mut lines = vec![format!("{tag} ID: {}", t.id)];
        lines.push(format!("{tag} DESCRIPTION: {}", t.description));
        if !t.requirements.is_empty() {
            let items: Vec<String> = t.requirements.iter().map(|r| format!("- {r}")).collect();
            lines.push(format!("{tag} DO:\n{}", items.join("\n")));
        }
        if let Some(approach) = &t.approach {
            lines.push(format!("{tag} APPROACH: {approach}"));
        }
        if !t.anti_patterns.is_empty() {
            let items: Vec<String> = t
                .anti_patterns
                .iter()
                .map(|a| format!("- {}", strip_do_not(a)))
                .collect();
            lines.push(format!("{tag} DO NOT:\n{}", items.join("\n")));
        }
        lines.push(format!("{tag} DONE WHEN: {}", t.done_criteria));
        if let Some(notes) = &t.notes {
            lines.push(format!("{tag} FILES TO CREATE:\n{notes}"));
        }
        parts.push(lines.join("\n\n"));
    }
    parts.join("\n\n")
}

/// Focused two-message implementation prompt: identity, project context,
/// process constraints, and the task blocks. No teammates, no discussion
/// norms.
fn build_implementation_prompt(
    agent_name: &str,
    project_description: &str,
    tasks_text: &str,
    policy: &SessionPolicy,
) -> Vec<ChatMessage> {
    let writable = policy
        .writable_paths_hint()
        .unwrap_or_else(|| "src/**, tests/**, docs/**".into());

    let mut parts = vec![
        format!("You are {agent_name}, implementing assigned tasks."),
        format!("These tasks are part of a larger project called: {project_description}"),
        String::new(),
        "Write exactly what is specified for the tasks below, nothing more, nothing less.".into(),
        "Do not add features, classes, abstractions, or improvements beyond what each task requires.".into(),
        "Do not create files that are not mentioned in your task specifications.".into(),
        String::new(),
        "PROCESS TO FOLLOW:".into(),
        "1. Read existing code with file_read before writing.".into(),
        "2. Write code based on the task specifics below.".into(),
        "3. Call complete_tasks with task_ids and summary when done.".into(),
        String::new(),
        "Call report_blocked if you cannot proceed.".into(),
        String::new(),
        format!("Files: You can read all project files and write to: {writable}."),
    ];
    if policy.in_worktree(agent_name) {
        parts.push(
            "Worktree: You are in your own isolated git worktree. Your writes go only to your worktree."
                .into(),
        );
    }
    parts.push(String::new());
    parts.push("YOUR TASKS:\n".into());
    parts.push(tasks_text.to_string());

    vec![
        ChatMessage::system(parts.join("\n")),
        ChatMessage::user("Implement your assigned tasks."),
    ]
}

/// Brief mid-loop constraint reminder, using the same field labels as the
/// task blocks.
fn build_constraint_reminder(agent_tasks: &[&Task]) -> String {
    let mut parts = vec!["Reminder, your task constraints:".to_string()];
    for t in agent_tasks {
        let has_any =
            t.approach.is_some() || !t.anti_patterns.is_empty() || !t.done_criteria.is_empty();
        if !has_any {
            continue;
        }
        parts.push(format!("  {}:", t.id));
        if let Some(approach) = &t.approach {
            parts.push(format!("    APPROACH: {approach}"));
        }
        for a in &t.anti_patterns {
            parts.push(format!("    DO NOT: {}", strip_do_not(a)));
        }
        if !t.done_criteria.is_empty() {
            parts.push(format!("    DONE WHEN: {}", t.done_criteria));
        }
    }
    parts.join("\n")
}

fn completion_nudge(agent_name: &str, pending: &[String]) -> String {
    format!(
        "{agent_name}: you still have pending tasks ({}). Take concrete action now: \
         use file_write and then call complete_tasks. If truly blocked, call \
         report_blocked. Do not end this round without one of those tools.",
        pending.join(", ")
    )
}

fn loop_nudge() -> &'static str {
    "You are looping on read/list calls without making progress. Stop browsing. \
     Either write code now and call complete_tasks, or call report_blocked."
}

// ─── Terminal tool handlers ───────────────────────────────────────────────────

/// Validate and persist a `complete_tasks` call. Ids must belong to this
/// layer and this agent; already-done ids are skipped; an empty list is
/// rejected. Idempotent, so a replayed round cannot double-complete.
fn handle_complete_tasks(
    input: &Value,
    agent_name: &str,
    tasks: &mut Vec<Task>,
    layer: u32,
    iter_dir: &Path,
) -> String {
    let task_ids: Vec<String> = string_list(&input["task_ids"]);
    let summary = input["summary"].as_str().unwrap_or("");
    if task_ids.is_empty() {
        return "Error: task_ids is empty".into();
    }

    let lt_ids: HashSet<String> = layer_tasks(tasks, layer).iter().map(|t| t.id.clone()).collect();
    let mine: HashSet<String> = agent_layer_tasks(tasks, layer, agent_name)
        .iter()
        .map(|t| t.id.clone())
        .collect();
    for tid in &task_ids {
        if !lt_ids.contains(tid) {
            return format!("Error: task '{tid}' is not in layer {layer}");
        }
        if !mine.contains(tid) {
            return format!("Error: task '{tid}' is not assigned to you");
        }
    }

    let mut completed = Vec::new();
    for t in tasks.iter_mut() {
        if task_ids.contains(&t.id) && t.status != TaskStatus::Done {
            t.status = TaskStatus::Done;
            t.completed_by = Some(agent_name.to_string());
            t.completion_summary = Some(summary.to_string());
            t.blocked_by = None;
            t.blocked_reason = None;
            completed.push(t.id.clone());
        }
    }
    if let Err(e) = save_tasks(iter_dir, tasks) {
        return format!("Error: {e}");
    }

    if completed.is_empty() {
        "Tasks already marked as done.".into()
    } else {
        format!("Completed tasks: {}", completed.join(", "))
    }
}

/// Validate and persist a `report_blocked` call. Returns the result
/// string and the newly-blocked ids (when any).
fn handle_report_blocked(
    input: &Value,
    agent_name: &str,
    tasks: &mut Vec<Task>,
    layer: u32,
    iter_dir: &Path,
) -> (String, Option<Vec<String>>) {
    let task_ids: Vec<String> = string_list(&input["task_ids"]);
    let reason = input["reason"].as_str().unwrap_or("").trim().to_string();
    if task_ids.is_empty() {
        return ("Error: task_ids is empty".into(), None);
    }
    if reason.is_empty() {
        return ("Error: reason is required".into(), None);
    }

    let lt_ids: HashSet<String> = layer_tasks(tasks, layer).iter().map(|t| t.id.clone()).collect();
    let mine: HashSet<String> = agent_layer_tasks(tasks, layer, agent_name)
        .iter()
        .map(|t| t.id.clone())
        .collect();
    for tid in &task_ids {
        if !lt_ids.contains(tid) {
            return (format!("Error: task '{tid}' is not in layer {layer}"), None);
        }
        if !mine.contains(tid) {
            return (format!("Error: task '{tid}' is not assigned to you"), None);
        }
    }
    for t in tasks.iter() {
        if task_ids.contains(&t.id) && t.status == TaskStatus::Done {
            return (format!("Error: task '{}' is already done", t.id), None);
        }
    }

    let mut blocked = Vec::new();
    for t in tasks.iter_mut() {
        if task_ids.contains(&t.id) && t.status != TaskStatus::Blocked {
            t.status = TaskStatus::Blocked;
            t.blocked_by = Some(agent_name.to_string());
            t.blocked_reason = Some(reason.clone());
            blocked.push(t.id.clone());
        }
    }
    if let Err(e) = save_tasks(iter_dir, tasks) {
        return (format!("Error: {e}"), None);
    }

    if blocked.is_empty() {
        ("Tasks already marked as blocked.".into(), Some(Vec::new()))
    } else {
        (format!("Blocked tasks: {}", blocked.join(", ")), Some(blocked))
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

// ─── Drift check ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DriftCheck {
    task_id: String,
    #[serde(default = "default_true")]
    approach_ok: bool,
    #[serde(default)]
    anti_pattern_violations: Vec<String>,
    #[serde(default = "default_true")]
    done_criteria_ok: bool,
    #[serde(default)]
    notes: String,
}

fn default_true() -> bool {
    true
}

/// One-shot verification of the written files against the task specs.
/// Model or parse failures are swallowed; drift checking never blocks
/// progress on its own.
async fn run_drift_check(
    file_contents: &HashMap<String, String>,
    agent_tasks: &[&Task],
    client: &dyn ModelClient,
) -> Vec<DriftCheck> {
    if file_contents.is_empty() || agent_tasks.is_empty() {
        return Vec::new();
    }
    let mut fc_parts: Vec<String> = Vec::new();
    let mut paths: Vec<&String> = file_contents.keys().collect();
    paths.sort();
    for path in paths {
        let content = &file_contents[path];
        let lines: Vec<&str> = content.lines().collect();
        let shown = if lines.len() > 500 {
            format!("{}\n... (truncated)", lines[..500].join("\n"))
        } else {
            content.clone()
        };
        fc_parts.push(format!("=== {path} ===\n{shown}"));
    }
    let mut specs: Vec<String> = Vec::new();
    for t in agent_tasks {
        let mut spec = format!("Task {}: {}", t.id, t.description);
        if let Some(approach) = &t.approach {
            spec.push_str(&format!("\n  APPROACH: {approach}"));
        }
        for ap in &t.anti_patterns {
            spec.push_str(&format!("\n  MUST NOT: {ap}"));
        }
        spec.push_str(&format!("\n  DONE WHEN: {}", t.done_criteria));
        specs.push(spec);
    }
    let prompt = drift_check_prompt(&fc_parts.join("\n\n"), &specs.join("\n\n"));

    let raw = match client.complete_text(&[ChatMessage::user(prompt)]).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "drift check call failed; skipping");
            return Vec::new();
        }
    };
    match serde_json::from_str(&strip_code_fences(&raw)) {
        Ok(checks) => checks,
        Err(e) => {
            warn!(error = %e, "drift check output unparseable; skipping");
            Vec::new()
        }
    }
}

// ─── Executor ─────────────────────────────────────────────────────────────────

/// Run the implementation phase for one layer, dispatching each agent
/// with pending work sequentially.
#[allow(clippy::too_many_arguments)]
pub async fn run_implementation(
    agents: &[AgentConfig],
    iteration: &Iteration,
    current_layer: u32,
    iter_dir: &Path,
    policy: &SessionPolicy,
    client: &dyn ModelClient,
    history: &mut Vec<LogMessage>,
    max_tool_rounds: Option<u32>,
    tx: &mpsc::Sender<SessionEvent>,
) -> anyhow::Result<()> {
    absorb_cancel(
        implementation_loop(
            agents,
            iteration,
            current_layer,
            iter_dir,
            policy,
            client,
            history,
            max_tool_rounds,
            tx,
        )
        .await,
    )
}

#[allow(clippy::too_many_arguments)]
async fn implementation_loop(
    agents: &[AgentConfig],
    iteration: &Iteration,
    current_layer: u32,
    iter_dir: &Path,
    policy: &SessionPolicy,
    client: &dyn ModelClient,
    history: &mut Vec<LogMessage>,
    max_tool_rounds: Option<u32>,
    tx: &mpsc::Sender<SessionEvent>,
) -> anyhow::Result<()> {
    let mut rounds_limit = max_tool_rounds.unwrap_or(iteration.max_turns);
    if rounds_limit == 0 {
        rounds_limit = HARD_ROUND_CEILING;
    }
    let max_rounds = rounds_limit.min(HARD_ROUND_CEILING);

    let mut tasks = load_tasks(iter_dir)?;
    let active_agents = agents_with_pending_work(agents, &tasks, current_layer);

    emit(
        tx,
        SessionEvent::SessionStarted {
            iteration_id: iteration.id.clone(),
            description: iteration.description.clone(),
            phase: "implementation".into(),
            current_layer: Some(current_layer),
            agents: active_agents.iter().map(|a| a.name.clone()).collect(),
            coach: None,
            has_file_tools: policy.has_file_tools(),
            writable_paths: policy.writable_paths_hint(),
            worktree_count: policy.worktree_map.len(),
            turn: 0,
            max_turns: active_agents.len() as u32,
        },
    )
    .await?;

    if active_agents.is_empty() {
        let lt = layer_tasks(&tasks, current_layer);
        if !lt.is_empty() && all_done(&lt) {
            clear_state(iter_dir);
            emit(
                tx,
                SessionEvent::LayerComplete {
                    layer: current_layer,
                    completed_tasks: lt.iter().map(|t| t.id.clone()).collect(),
                },
            )
            .await?;
        } else {
            emit(tx, SessionEvent::SessionComplete { total_turns: 0 }).await?;
        }
        return Ok(());
    }

    if let Some(kickoff) = &policy.kickoff_text {
        let msg = LogMessage::system(&iteration.id, kickoff);
        emit(tx, SessionEvent::AppendMessage(msg.clone())).await?;
        history.push(msg);
    }

    let mut resumed = load_state(iter_dir, current_layer);
    if let Some(state) = &resumed {
        if !active_agents.iter().any(|a| a.name == state.agent_name) {
            clear_state(iter_dir);
            resumed = None;
        }
    }
    let mut resume_gate = resumed.as_ref().map(|s| s.agent_name.clone());
    let mut dispatched: u32 = 0;

    for agent in &active_agents {
        let agent_name = agent.name.clone();
        if let Some(gate) = &resume_gate {
            if *gate != agent_name {
                continue;
            }
        }

        tasks = load_tasks(iter_dir)?;
        let agent_pending = pending_ids(&agent_layer_tasks(&tasks, current_layer, &agent_name));
        if agent_pending.is_empty() {
            if resume_gate.as_deref() == Some(agent_name.as_str()) {
                resume_gate = None;
            }
            continue;
        }

        let tasks_text = format_agent_tasks(&tasks, &agent_name, current_layer);
        let prompt =
            build_implementation_prompt(&agent_name, &iteration.description, &tasks_text, policy);
        emit(
            tx,
            SessionEvent::AppendDebug(json!({
                "turn": format!("impl-{agent_name}"),
                "agent": agent_name,
                "messages": &prompt,
            })),
        )
        .await?;

        // Terminal tools replace pass_turn in the implementation tool set.
        let (base_tools, mut base_executor) = build_tool_executor(&agent_name, policy);
        let mut impl_tools: Vec<ToolSchema> = base_tools
            .into_iter()
            .filter(|t| t.name != "pass_turn")
            .collect();
        impl_tools.push(complete_tasks_tool());
        impl_tools.push(report_blocked_tool());

        let resumed_state = if resume_gate.as_deref() == Some(agent_name.as_str()) {
            resume_gate = None;
            resumed.take()
        } else {
            None
        };
        let (mut llm_messages, start_round, mut counters) = match resumed_state {
            Some(state) => {
                let messages: Vec<ChatMessage> = state
                    .llm_messages
                    .iter()
                    .cloned()
                    .map(serde_json::from_value)
                    .collect::<Result<_, _>>()
                    .unwrap_or_else(|_| prompt.clone());
                debug!(agent = %agent_name, round = state.round_num, "resuming implementation loop");
                (
                    messages,
                    state.round_num,
                    LoopCounters {
                        read_only_streak: state.read_only_streak,
                        no_tool_streak: state.no_tool_streak,
                        saw_tool_activity: state.saw_tool_activity,
                        writes_since_reminder: state.writes_since_reminder,
                    },
                )
            }
            None => (prompt.clone(), 0, LoopCounters::default()),
        };

        let mut agent_file_contents: HashMap<String, String> = HashMap::new();
        dispatched += 1;
        let mut clean_exit = false;

        for round_num in start_round..max_rounds {
            let turn_id = format!("impl-{agent_name}-r{round_num}");
            let round =
                one_round(client, policy.streaming, &llm_messages, &impl_tools, &agent_name, &turn_id, tx)
                    .await?;

            if round.tool_calls.is_empty() {
                tasks = load_tasks(iter_dir)?;
                let pending = pending_ids(&agent_layer_tasks(&tasks, current_layer, &agent_name));

                if !pending.is_empty() {
                    // One nudge-retry, and only after real tool activity;
                    // otherwise text-only responses would burn all rounds.
                    if counters.saw_tool_activity && counters.no_tool_streak == 0 {
                        counters.no_tool_streak = 1;
                        llm_messages
                            .push(ChatMessage::system(completion_nudge(&agent_name, &pending)));
                        persist(iter_dir, current_layer, &agent_name, &llm_messages, round_num + 1, &counters);
                        continue;
                    }
                    clear_state(iter_dir);
                    clean_exit = true;
                    break;
                }

                if !round.content.trim().is_empty() {
                    finish_streamed_turn(policy, &agent_name, &turn_id, &round, tx).await?;
                    let msg = LogMessage::new(&agent_name, &iteration.id, &round.content);
                    emit(tx, SessionEvent::AppendMessage(msg.clone())).await?;
                    history.push(msg);
                }
                clear_state(iter_dir);
                clean_exit = true;
                break;
            }

            if !round.content.trim().is_empty() {
                finish_streamed_turn(policy, &agent_name, &turn_id, &round, tx).await?;
                let msg = LogMessage::new(&agent_name, &iteration.id, &round.content);
                emit(tx, SessionEvent::AppendMessage(msg.clone())).await?;
                history.push(msg);
            }

            let mut tool_results: Vec<ToolResult> = Vec::new();
            let mut round_ops: Vec<ToolOperation> = Vec::new();
            let mut round_was_read_only = true;

            for tc in &round.tool_calls {
                counters.saw_tool_activity = true;
                let mut blocked_ids: Option<Vec<String>> = None;

                let mut result = match tc.name.as_str() {
                    "complete_tasks" => {
                        round_was_read_only = false;
                        handle_complete_tasks(&tc.input, &agent_name, &mut tasks, current_layer, iter_dir)
                    }
                    "report_blocked" => {
                        round_was_read_only = false;
                        let (result, ids) = handle_report_blocked(
                            &tc.input,
                            &agent_name,
                            &mut tasks,
                            current_layer,
                            iter_dir,
                        );
                        blocked_ids = ids;
                        result
                    }
                    name => {
                        if !READ_ONLY_TOOLS.contains(&name) {
                            round_was_read_only = false;
                        }
                        base_executor(name, &tc.input)
                    }
                };

                if tc.name == "file_write" {
                    counters.writes_since_reminder += 1;
                    if let (Some(path), Some(content)) =
                        (tc.input["path"].as_str(), tc.input["content"].as_str())
                    {
                        agent_file_contents.insert(path.to_string(), content.to_string());
                    }
                }

                // Drift check after a successful completion claim.
                if tc.name == "complete_tasks" && !result.starts_with("Error:") {
                    let mine = agent_layer_tasks(&tasks, current_layer, &agent_name);
                    let checks = run_drift_check(&agent_file_contents, &mine, client).await;
                    let mut blocking: Vec<(String, String)> = Vec::new();
                    for check in &checks {
                        for v in &check.anti_pattern_violations {
                            blocking.push((check.task_id.clone(), v.clone()));
                        }
                        if !check.approach_ok {
                            let warn_msg = LogMessage::system(
                                &iteration.id,
                                format!(
                                    "[drift-check] task {}: approach may not match — {}",
                                    check.task_id, check.notes
                                ),
                            );
                            emit(tx, SessionEvent::AppendMessage(warn_msg.clone())).await?;
                            history.push(warn_msg);
                        }
                        if !check.done_criteria_ok {
                            let warn_msg = LogMessage::system(
                                &iteration.id,
                                format!(
                                    "[drift-check] task {}: done_criteria may not be satisfied — {}",
                                    check.task_id, check.notes
                                ),
                            );
                            emit(tx, SessionEvent::AppendMessage(warn_msg.clone())).await?;
                            history.push(warn_msg);
                        }
                    }
                    if !blocking.is_empty() {
                        let violated: HashSet<&String> = blocking.iter().map(|(tid, _)| tid).collect();
                        for t in tasks.iter_mut() {
                            if violated.contains(&t.id) && t.status == TaskStatus::Done {
                                t.status = TaskStatus::Pending;
                                t.completed_by = None;
                                t.completion_summary = None;
                            }
                        }
                        save_tasks(iter_dir, &tasks)?;
                        let violation_lines: Vec<String> = blocking
                            .iter()
                            .map(|(tid, v)| format!("MUST NOT violated on {tid}: {v}"))
                            .collect();
                        result = format!(
                            "Drift detected — completion reverted. Fix these issues and call \
                             complete_tasks again:\n{}",
                            violation_lines.join("\n")
                        );
                        for (tid, v) in &blocking {
                            let warn_msg = LogMessage::system(
                                &iteration.id,
                                format!("[drift-check] task {tid}: MUST NOT violated — {v}"),
                            );
                            emit(tx, SessionEvent::AppendMessage(warn_msg.clone())).await?;
                            history.push(warn_msg);
                        }
                    }
                }

                tool_results.push(ToolResult {
                    id: tc.id.clone(),
                    result: result.clone(),
                });
                let op = ToolOperation {
                    name: tc.name.clone(),
                    input: tc.input.clone(),
                    result: result.clone(),
                };

                let status = classify_result(&result);
                emit(
                    tx,
                    SessionEvent::ToolCallProgress {
                        agent: agent_name.clone(),
                        tool_name: tc.name.clone(),
                        path: tc.input["path"].as_str().unwrap_or("").to_string(),
                        status,
                        bytes: (tc.name == "file_write")
                            .then(|| tc.input["content"].as_str().map(|c| c.len() as u64))
                            .flatten(),
                        error: (status == crate::ToolCallStatus::Error).then(|| result.clone()),
                    },
                )
                .await?;

                let op_msg = if tc.name == "complete_tasks" || tc.name == "report_blocked" {
                    LogMessage::system(
                        &iteration.id,
                        format!("[{agent_name}] [{}] {result}", tc.name),
                    )
                } else {
                    LogMessage::system(&iteration.id, format_agent_tool_operation(&agent_name, &op))
                };
                emit(tx, SessionEvent::AppendMessage(op_msg.clone())).await?;
                history.push(op_msg);

                if tc.name == "report_blocked" {
                    if let Some(ids) = blocked_ids.filter(|ids| !ids.is_empty()) {
                        emit(
                            tx,
                            SessionEvent::TaskBlocked {
                                agent: agent_name.clone(),
                                layer: current_layer,
                                task_ids: ids,
                                reason: tc.input["reason"].as_str().unwrap_or("").to_string(),
                            },
                        )
                        .await?;
                    }
                }
                round_ops.push(op);
            }

            if !round_ops.is_empty() {
                emit(
                    tx,
                    SessionEvent::AppendDebug(json!({
                        "turn": turn_id,
                        "agent": agent_name,
                        "tool_operations": &round_ops,
                    })),
                )
                .await?;
            }

            llm_messages.extend(round.build_continuation(&tool_results));

            if let Some(store) = &policy.approval_store {
                let pending_count = store.lock().unwrap().get_pending().len();
                if pending_count > 0 {
                    persist(iter_dir, current_layer, &agent_name, &llm_messages, round_num + 1, &counters);
                    emit(tx, SessionEvent::PauseForApprovals { pending: pending_count }).await?;
                    return Ok(());
                }
            }

            tasks = load_tasks(iter_dir)?;
            let mine = agent_layer_tasks(&tasks, current_layer, &agent_name);
            let pending = pending_ids(&mine);
            if pending.is_empty() {
                clear_state(iter_dir);
                clean_exit = true;
                break;
            }

            if round_was_read_only {
                counters.read_only_streak += 1;
                if counters.read_only_streak >= 2 {
                    llm_messages.push(ChatMessage::system(loop_nudge()));
                }
            } else {
                counters.read_only_streak = 0;
            }
            counters.no_tool_streak = 0;

            let should_remind = (round_num + 1) % REMINDER_CADENCE == 0
                || counters.writes_since_reminder >= WRITES_SINCE_REMINDER_THRESHOLD;
            if should_remind {
                let reminder = build_constraint_reminder(&mine);
                if reminder.contains("APPROACH:") || reminder.contains("DO NOT:") {
                    llm_messages.push(ChatMessage::system(reminder));
                    counters.writes_since_reminder = 0;
                }
            }

            persist(iter_dir, current_layer, &agent_name, &llm_messages, round_num + 1, &counters);
        }

        if !clean_exit {
            // Round ceiling hit.
            clear_state(iter_dir);
        }
    }

    tasks = load_tasks(iter_dir)?;
    let lt = layer_tasks(&tasks, current_layer);
    if !lt.is_empty() && all_done(&lt) {
        clear_state(iter_dir);
        auto_commit_worktrees(policy, current_layer);
        emit(
            tx,
            SessionEvent::LayerComplete {
                layer: current_layer,
                completed_tasks: lt
                    .iter()
                    .filter(|t| t.status == TaskStatus::Done)
                    .map(|t| t.id.clone())
                    .collect(),
            },
        )
        .await?;
    } else {
        emit(tx, SessionEvent::SessionComplete { total_turns: dispatched }).await?;
    }
    Ok(())
}

#[derive(Default)]
struct LoopCounters {
    read_only_streak: u32,
    no_tool_streak: u32,
    saw_tool_activity: bool,
    writes_since_reminder: u32,
}

fn persist(
    iter_dir: &Path,
    layer: u32,
    agent_name: &str,
    llm_messages: &[ChatMessage],
    round_num: u32,
    counters: &LoopCounters,
) {
    let state = ResumableState {
        layer,
        agent_name: agent_name.to_string(),
        llm_messages: llm_messages
            .iter()
            .filter_map(|m| serde_json::to_value(m).ok())
            .collect(),
        round_num,
        read_only_streak: counters.read_only_streak,
        no_tool_streak: counters.no_tool_streak,
        saw_tool_activity: counters.saw_tool_activity,
        writes_since_reminder: counters.writes_since_reminder,
    };
    if let Err(e) = save_state(iter_dir, &state) {
        warn!(error = %e, "failed to persist resumable state");
    }
}

/// One model round, streamed when the policy asks for it.
async fn one_round(
    client: &dyn ModelClient,
    streaming: bool,
    messages: &[ChatMessage],
    tools: &[ToolSchema],
    agent_name: &str,
    turn_id: &str,
    tx: &mpsc::Sender<SessionEvent>,
) -> anyhow::Result<CompletionRound> {
    if !streaming {
        return client.complete_round(messages, tools).await;
    }
    let mut stream = client.stream_round(messages, tools).await?;
    while let Some(delta) = stream.next_delta().await {
        emit(
            tx,
            SessionEvent::TextDelta {
                agent: agent_name.to_string(),
                turn_id: turn_id.to_string(),
                text: delta?,
            },
        )
        .await?;
    }
    stream.into_round()
}

/// Emit `AgentTurnComplete` for a streamed round so consumers can replace
/// the accumulated deltas with final content.
async fn finish_streamed_turn(
    policy: &SessionPolicy,
    agent_name: &str,
    turn_id: &str,
    round: &CompletionRound,
    tx: &mpsc::Sender<SessionEvent>,
) -> anyhow::Result<()> {
    if policy.streaming {
        emit(
            tx,
            SessionEvent::AgentTurnComplete {
                agent: agent_name.to_string(),
                turn_id: turn_id.to_string(),
                content: round.content.clone(),
            },
        )
        .await?;
    }
    Ok(())
}

/// Commit any dirty worktree at layer end. Failures are ignored; a dirty
/// worktree surfaces again at merge time.
fn auto_commit_worktrees(policy: &SessionPolicy, layer: u32) {
    for wt_path in policy.worktree_map.values() {
        match troupe_vcs::is_worktree_dirty(wt_path) {
            Ok(true) => {
                if let Err(e) = troupe_vcs::commit_worktree(
                    wt_path,
                    &format!("Implementation complete (layer {layer})"),
                ) {
                    warn!(path = %wt_path.display(), error = %e, "worktree auto-commit failed");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(path = %wt_path.display(), error = %e, "worktree dirty check failed"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
