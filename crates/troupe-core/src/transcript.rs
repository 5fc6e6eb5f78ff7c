// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Prompt reconstruction: turn the shared conversation log into a
//! per-agent model transcript.

use troupe_config::{AgentConfig, CoachConfig, Iteration};
use troupe_model::ChatMessage;
use troupe_store::LogMessage;

use crate::prompts::{phase_prompt, COACH_FACILITATION_PROMPT, DEFAULT_SYSTEM_PROMPT};

/// A session participant as seen in prompts: agents, the coach, and the
/// human product manager when one has spoken.
#[derive(Debug, Clone)]
pub struct Participant {
    pub name: String,
    pub role: String,
}

pub fn participants(
    agents: &[AgentConfig],
    coach: Option<&CoachConfig>,
    history: &[LogMessage],
) -> Vec<Participant> {
    let mut all: Vec<Participant> = agents
        .iter()
        .map(|a| Participant {
            name: a.name.clone(),
            role: a.role.clone(),
        })
        .collect();
    if let Some(c) = coach {
        all.push(Participant {
            name: c.name.clone(),
            role: c.role.clone(),
        });
    }
    if history.iter().any(|m| m.from == "human") {
        all.push(Participant {
            name: "human".into(),
            role: "Team Member".into(),
        });
    }
    all
}

/// Artifacts injected into phase prompts once they exist.
#[derive(Debug, Clone, Default)]
pub struct PhaseContext {
    pub scope_summary: Option<String>,
    pub tasks_summary: Option<String>,
    pub diffs_summary: Option<String>,
}

/// The prefix every non-self message gets in an agent's transcript.
/// Referenced by agent behavior; must not change.
pub fn speaker_prefix(name: &str) -> String {
    format!("[{name}] add the following to the conversation:\n")
}

/// Build the model transcript for one agent from the shared log.
///
/// The agent's own messages become assistant entries; everything else is
/// translated to prefixed user content, and *consecutive* runs of non-self
/// messages are consolidated into a single user entry – several model APIs
/// reject consecutive same-role messages. `pass_turn` messages never enter
/// a prompt.
pub fn build_prompt(
    agent: &AgentConfig,
    iteration: &Iteration,
    history: &[LogMessage],
    all_participants: &[Participant],
    context: &PhaseContext,
    writable_paths_hint: Option<&str>,
    in_worktree: bool,
) -> Vec<ChatMessage> {
    let mut system_parts: Vec<String> = Vec::new();
    system_parts.push(
        agent
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
    );
    system_parts.push(format!("Your name is {}.", agent.name));

    let teammates: Vec<&Participant> = all_participants
        .iter()
        .filter(|p| p.name != agent.name)
        .collect();
    if !teammates.is_empty() {
        let list = teammates
            .iter()
            .map(|p| format!("{} ({})", p.name, p.role))
            .collect::<Vec<_>>()
            .join(", ");
        system_parts.push(format!("Your teammates are: {list}."));

        if teammates.iter().any(|p| p.role == "Agile Coach") {
            system_parts.push(
                "Your team has an Agile Coach who facilitates the conversation. \
                 You can make suggestions to the coach, point out omissions in their \
                 summaries, and push back on their conclusions, but generally allow \
                 the coach to take the lead in organizing the group. Focus your \
                 energy on the substance of the discussion, not on process \
                 management."
                    .to_string(),
            );
        }
    }

    system_parts.push(
        "You may get messages from more than one teammate at a time. You'll know \
         because a teammate's message will be prefixed by \
         \"[teammate-name] add the following to the conversation:\""
            .to_string(),
    );
    system_parts.push(format!(
        "When addressing a specific teammate, use @name. Watch for messages \
         directed at you with @{}.",
        agent.name
    ));
    system_parts.push(format!("Current task: {}", iteration.description));

    if let Some(extra) = phase_prompt(iteration.phase) {
        system_parts.push(extra.to_string());
    }
    if let Some(hint) = writable_paths_hint {
        system_parts.push(format!(
            "You have file tools (file_read, file_list, file_write). You can read \
             all project files and write to: {hint}."
        ));
    }
    if in_worktree {
        system_parts.push(
            "You are working in your own isolated git worktree. Your writes go \
             only to your worktree."
                .to_string(),
        );
    }
    push_artifacts(&mut system_parts, context);

    assemble(
        &agent.name,
        system_parts.join("\n\n"),
        history,
        &format!(
            "The task is: {}. What are your initial thoughts?",
            iteration.description
        ),
    )
}

/// Build the facilitation transcript for the coach.
pub fn build_coach_prompt(
    coach: &CoachConfig,
    iteration: &Iteration,
    history: &[LogMessage],
    all_participants: &[Participant],
    context: &PhaseContext,
) -> Vec<ChatMessage> {
    let mut system_parts: Vec<String> = vec![
        COACH_FACILITATION_PROMPT.to_string(),
        format!("Your name is {}.", coach.name),
    ];
    let members: Vec<String> = all_participants
        .iter()
        .filter(|p| p.name != coach.name)
        .map(|p| format!("{} ({})", p.name, p.role))
        .collect();
    if !members.is_empty() {
        system_parts.push(format!("The team members are: {}.", members.join(", ")));
    }
    system_parts.push(format!("Current task: {}", iteration.description));
    push_artifacts(&mut system_parts, context);

    assemble(
        &coach.name,
        system_parts.join("\n\n"),
        history,
        &format!(
            "The team is about to discuss: {}. Introduce yourself briefly.",
            iteration.description
        ),
    )
}

fn push_artifacts(system_parts: &mut Vec<String>, context: &PhaseContext) {
    if let Some(scope) = &context.scope_summary {
        system_parts.push(format!("GROOMED SCOPE SUMMARY:\n\n{scope}"));
    }
    if let Some(tasks) = &context.tasks_summary {
        system_parts.push(format!("TASK LIST:\n\n{tasks}"));
    }
    if let Some(diffs) = &context.diffs_summary {
        system_parts.push(format!("DIFFS UNDER REVIEW:\n\n{diffs}"));
    }
}

fn assemble(
    self_name: &str,
    system_content: String,
    history: &[LogMessage],
    seed: &str,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_content)];

    let visible: Vec<&LogMessage> = history.iter().filter(|m| !m.pass_turn).collect();
    if visible.is_empty() {
        messages.push(ChatMessage::user(seed));
        return messages;
    }

    let mut pending_parts: Vec<String> = Vec::new();
    for msg in visible {
        if msg.from == self_name {
            if !pending_parts.is_empty() {
                messages.push(ChatMessage::user(pending_parts.join("\n\n")));
                pending_parts.clear();
            }
            messages.push(ChatMessage::assistant(&msg.content));
        } else {
            pending_parts.push(format!("{}{}", speaker_prefix(&msg.from), msg.content));
        }
    }
    if !pending_parts.is_empty() {
        messages.push(ChatMessage::user(pending_parts.join("\n\n")));
    }
    messages
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
