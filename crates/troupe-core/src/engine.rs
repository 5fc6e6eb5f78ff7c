// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The session engine: drives a multi-agent conversation until a stop
//! condition, emitting [`SessionEvent`]s as it goes.
//!
//! The engine performs no I/O beyond its injected collaborators, never
//! prints, and never persists the log itself – events are the
//! persistence interface, and the consumer pumps them in order.
//! Dropping the receiver cancels the session; no compensation runs, and
//! turn-count recovery picks up from the truncated log on the next start.

use std::collections::HashSet;

use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use troupe_config::{AgentConfig, CoachConfig, Iteration};
use troupe_model::{
    agentic_completion, AgenticOutcome, ChatMessage, ModelClient, ToolOperation, ToolResult,
    ToolSchema, AGENTIC_MAX_ROUNDS,
};
use troupe_store::LogMessage;
use troupe_tools::{coach_tools, format_tool_operation};

use crate::{
    build_prompt, build_tool_executor, classify_result, participants, PhaseContext, SessionEvent,
    SessionPolicy,
};

/// Internal marker: the consumer dropped the receiver. Mapped to a clean
/// return at the engine boundary.
#[derive(Debug, Error)]
#[error("session cancelled by consumer")]
pub(crate) struct Cancelled;

pub(crate) async fn emit(
    tx: &mpsc::Sender<SessionEvent>,
    event: SessionEvent,
) -> Result<(), Cancelled> {
    tx.send(event).await.map_err(|_| Cancelled)
}

/// Map a cancelled-session error to a clean return.
pub(crate) fn absorb_cancel(result: anyhow::Result<()>) -> anyhow::Result<()> {
    match result {
        Err(e) if e.is::<Cancelled>() => Ok(()),
        other => other,
    }
}

/// Run a conversation session. One agent speaks per turn in fixed list
/// order; a coach turn follows every full rotation. Stops on max_turns,
/// approval pause, or a coach signal. Model/transport errors bubble up
/// and kill the session – the log plus resumable state make that
/// crash-safe.
#[allow(clippy::too_many_arguments)]
pub async fn run_session(
    agents: &[AgentConfig],
    coach: Option<&CoachConfig>,
    iteration: &Iteration,
    max_turns: u32,
    policy: &SessionPolicy,
    context: &PhaseContext,
    client: &dyn ModelClient,
    history: &mut Vec<LogMessage>,
    tx: &mpsc::Sender<SessionEvent>,
) -> anyhow::Result<()> {
    absorb_cancel(
        session_loop(
            agents, coach, iteration, max_turns, policy, context, client, history, tx,
        )
        .await,
    )
}

#[allow(clippy::too_many_arguments)]
async fn session_loop(
    agents: &[AgentConfig],
    coach: Option<&CoachConfig>,
    iteration: &Iteration,
    max_turns: u32,
    policy: &SessionPolicy,
    context: &PhaseContext,
    client: &dyn ModelClient,
    history: &mut Vec<LogMessage>,
    tx: &mpsc::Sender<SessionEvent>,
) -> anyhow::Result<()> {
    let all_participants = participants(agents, coach, history);

    // Turn recovery: only engineering-agent messages consume turn slots.
    let mut non_agent: HashSet<&str> = ["human", "system"].into();
    if let Some(c) = coach {
        non_agent.insert(c.name.as_str());
    }
    let mut turn = history
        .iter()
        .filter(|m| !non_agent.contains(m.from.as_str()))
        .count() as u32;
    let num_agents = agents.len() as u32;

    emit(
        tx,
        SessionEvent::SessionStarted {
            iteration_id: iteration.id.clone(),
            description: iteration.description.clone(),
            phase: iteration.phase.to_string(),
            current_layer: iteration.current_layer,
            agents: agents.iter().map(|a| a.name.clone()).collect(),
            coach: coach.map(|c| c.name.clone()),
            has_file_tools: policy.has_file_tools(),
            writable_paths: policy.writable_paths_hint(),
            worktree_count: policy.worktree_map.len(),
            turn,
            max_turns,
        },
    )
    .await?;

    if let Some(kickoff) = &policy.kickoff_text {
        let msg = LogMessage::system(&iteration.id, kickoff);
        emit(tx, SessionEvent::AppendMessage(msg.clone())).await?;
        history.push(msg);
    }

    while turn < max_turns {
        let agent = &agents[(turn % num_agents) as usize];

        let prompt = build_prompt(
            agent,
            iteration,
            history,
            &all_participants,
            context,
            policy.writable_paths_hint().as_deref(),
            policy.in_worktree(&agent.name),
        );
        emit(
            tx,
            SessionEvent::AppendDebug(json!({
                "turn": turn,
                "agent": agent.name,
                "messages": &prompt,
            })),
        )
        .await?;

        let (tools, mut executor) = build_tool_executor(&agent.name, policy);
        let outcome = if policy.streaming {
            streamed_agentic_turn(client, prompt, &tools, &mut *executor, &agent.name, turn, tx)
                .await?
        } else {
            agentic_completion(client, &prompt, &tools, &mut *executor).await?
        };

        process_agent_result(agent, iteration, &outcome, history, turn, tx).await?;
        turn += 1;

        if let Some(store) = &policy.approval_store {
            let pending = store.lock().unwrap().get_pending().len();
            if pending > 0 {
                emit(tx, SessionEvent::PauseForApprovals { pending }).await?;
                return Ok(());
            }
        }

        if let Some(coach) = coach {
            if turn % num_agents == 0 {
                let stop =
                    coach_turn(coach, iteration, context, client, history, &all_participants, turn, tx)
                        .await?;
                if stop {
                    return Ok(());
                }
            }
        }
    }

    emit(tx, SessionEvent::SessionComplete { total_turns: turn }).await?;
    Ok(())
}

/// Engine-driven agentic loop with streaming: deltas surface as
/// `TextDelta`, each round's text as `AgentTurnComplete`, tool calls run
/// through the executor between rounds.
async fn streamed_agentic_turn(
    client: &dyn ModelClient,
    prompt: Vec<ChatMessage>,
    tools: &[ToolSchema],
    executor: &mut (dyn FnMut(&str, &serde_json::Value) -> String + Send),
    agent_name: &str,
    turn: u32,
    tx: &mpsc::Sender<SessionEvent>,
) -> anyhow::Result<AgenticOutcome> {
    let mut transcript = prompt;
    let mut operations: Vec<ToolOperation> = Vec::new();
    let mut last_text = String::new();

    for round_num in 0..AGENTIC_MAX_ROUNDS {
        let turn_id = format!("{agent_name}-t{turn}-r{round_num}");
        let mut stream = client.stream_round(&transcript, tools).await?;
        while let Some(delta) = stream.next_delta().await {
            let text = delta?;
            emit(
                tx,
                SessionEvent::TextDelta {
                    agent: agent_name.to_string(),
                    turn_id: turn_id.clone(),
                    text,
                },
            )
            .await?;
        }
        let round = stream.into_round()?;
        if !round.content.trim().is_empty() {
            emit(
                tx,
                SessionEvent::AgentTurnComplete {
                    agent: agent_name.to_string(),
                    turn_id,
                    content: round.content.clone(),
                },
            )
            .await?;
        }

        if round.tool_calls.is_empty() {
            return Ok(AgenticOutcome {
                content: round.content,
                operations,
            });
        }
        last_text = round.content.clone();

        let mut results = Vec::with_capacity(round.tool_calls.len());
        for tc in &round.tool_calls {
            let result = executor(&tc.name, &tc.input);
            operations.push(ToolOperation {
                name: tc.name.clone(),
                input: tc.input.clone(),
                result: result.clone(),
            });
            results.push(ToolResult {
                id: tc.id.clone(),
                result,
            });
        }
        transcript.extend(round.build_continuation(&results));
    }

    Ok(AgenticOutcome {
        content: last_text,
        operations,
    })
}

/// Translate one agent outcome into events and history mutations, in the
/// documented order: tool progress and op messages, then the agent's
/// message (or a pass marker), then the op debug record.
async fn process_agent_result(
    agent: &AgentConfig,
    iteration: &Iteration,
    outcome: &AgenticOutcome,
    history: &mut Vec<LogMessage>,
    turn: u32,
    tx: &mpsc::Sender<SessionEvent>,
) -> anyhow::Result<()> {
    for op in &outcome.operations {
        if op.name == "pass_turn" {
            continue;
        }
        let status = classify_result(&op.result);
        let bytes = (op.name == "file_write")
            .then(|| op.input["content"].as_str().map(|c| c.len() as u64))
            .flatten();
        emit(
            tx,
            SessionEvent::ToolCallProgress {
                agent: agent.name.clone(),
                tool_name: op.name.clone(),
                path: op.input["path"].as_str().unwrap_or("").to_string(),
                status,
                bytes,
                error: (status == crate::ToolCallStatus::Error).then(|| op.result.clone()),
            },
        )
        .await?;
        let op_msg = LogMessage::system(&iteration.id, format_tool_operation(op));
        emit(tx, SessionEvent::AppendMessage(op_msg.clone())).await?;
        history.push(op_msg);
    }

    let pass_reason = outcome
        .operations
        .iter()
        .find(|op| op.name == "pass_turn")
        .map(|op| op.input["reason"].as_str().unwrap_or("").to_string());

    if let Some(reason) = pass_reason {
        let mut msg = LogMessage::system(
            &iteration.id,
            format!("({} passes: {reason})", agent.name),
        );
        msg.pass_turn = true;
        emit(tx, SessionEvent::AppendMessage(msg.clone())).await?;
        history.push(msg);
    } else {
        let msg = LogMessage::new(&agent.name, &iteration.id, &outcome.content);
        emit(tx, SessionEvent::AppendMessage(msg.clone())).await?;
        history.push(msg);
    }

    if !outcome.operations.is_empty() {
        emit(
            tx,
            SessionEvent::AppendDebug(json!({
                "turn": turn,
                "agent": agent.name,
                "tool_operations": &outcome.operations,
            })),
        )
        .await?;
    }
    Ok(())
}

/// One coach turn. Returns `true` when the session should stop (phase
/// signal or PM question).
#[allow(clippy::too_many_arguments)]
async fn coach_turn(
    coach: &CoachConfig,
    iteration: &Iteration,
    context: &PhaseContext,
    client: &dyn ModelClient,
    history: &mut Vec<LogMessage>,
    all_participants: &[crate::Participant],
    turn: u32,
    tx: &mpsc::Sender<SessionEvent>,
) -> anyhow::Result<bool> {
    let prompt = crate::build_coach_prompt(coach, iteration, history, all_participants, context);
    emit(
        tx,
        SessionEvent::AppendDebug(json!({
            "turn": format!("coach-after-{turn}"),
            "agent": coach.name,
            "messages": &prompt,
        })),
    )
    .await?;

    let round = client.complete_round(&prompt, &coach_tools()).await?;
    let signal = round.tool_calls.iter().find(|tc| tc.name == "signal_phase_complete");
    let ask = round.tool_calls.iter().find(|tc| tc.name == "ask_pm");

    // The log must never contain a blank coach turn.
    let mut coach_text = round.content.clone();
    if coach_text.trim().is_empty() {
        if signal.is_some() {
            coach_text = "(Phase complete signal sent.)".into();
        } else if let Some(ask) = ask {
            let question = ask.input["question"].as_str().unwrap_or("");
            coach_text = format!("(Requesting PM input: {question})");
        }
    }

    let msg = LogMessage::new(&coach.name, &iteration.id, &coach_text);
    emit(tx, SessionEvent::AppendMessage(msg.clone())).await?;
    history.push(msg);

    if signal.is_some() {
        debug!(phase = %iteration.phase, "coach signaled phase complete");
        emit(
            tx,
            SessionEvent::PhaseCompleteSignaled {
                phase: iteration.phase.to_string(),
            },
        )
        .await?;
        return Ok(true);
    }

    if let Some(ask) = ask {
        emit(
            tx,
            SessionEvent::CoachAskedPM {
                question: ask.input["question"].as_str().unwrap_or("").to_string(),
                response_type: ask.input["response_type"].as_str().unwrap_or("feedback").to_string(),
                options: ask.input["options"]
                    .as_array()
                    .map(|opts| {
                        opts.iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default(),
            },
        )
        .await?;
        return Ok(true);
    }

    Ok(false)
}
