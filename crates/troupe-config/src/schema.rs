// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helpers.
///
/// `#[serde(default)]` on numeric fields falls back to `0`, so named
/// functions carry the real defaults.
fn default_max_file_size() -> u64 {
    1_048_576
}
fn default_max_files_per_turn() -> u32 {
    10
}
fn default_max_turns() -> u32 {
    30
}

/// Top-level team configuration (`.team/team.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeamConfig {
    #[serde(default)]
    pub model: ModelConfig,
    /// Engineering agents. A session needs at least two.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    /// Optional facilitator. Speaks once per full agent rotation and holds
    /// the phase-advance and PM-question tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coach: Option<CoachConfig>,
    /// File-tool policy. When absent, agents get no file tools at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_access: Option<FileAccessConfig>,
    /// Per-agent git worktree isolation for implementation/code-review.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktrees: Option<WorktreeConfig>,
    /// Stream model output incrementally (opt-in).
    #[serde(default)]
    pub streaming: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "ollama" | "openai" | "anthropic".
    /// "ollama" and "openai" share the OpenAI-compatible wire format.
    pub provider: String,
    /// Base URL of the provider endpoint (no trailing path).
    pub base_url: String,
    /// Model name forwarded to the provider API.
    pub model: String,
    /// API key, or a `$NAME` reference resolved from `.env` first and the
    /// process environment second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".into(),
            base_url: "http://localhost:11434".into(),
            model: "qwen2.5-coder".into(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique within the team; also used for branch and worktree names.
    pub name: String,
    #[serde(default = "default_engineer_role")]
    pub role: String,
    /// System prompt override; leave None to use the built-in prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_engineer_role() -> String {
    "Software Engineer".into()
}

fn default_coach_role() -> String {
    "Agile Coach".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoachConfig {
    pub name: String,
    #[serde(default = "default_coach_role")]
    pub role: String,
}

/// Write-policy configuration for the file mediator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAccessConfig {
    /// Globs an agent may write under. `dir/**` matches anything under
    /// `dir/`; other patterns match on the file name.
    #[serde(default)]
    pub writable_paths: Vec<String>,
    /// Globs always denied for writes, on top of the built-in deny list.
    #[serde(default)]
    pub protected_paths: Vec<String>,
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    #[serde(default = "default_max_files_per_turn")]
    pub max_files_per_turn: u32,
    /// Convert out-of-writable-path writes into pending approval requests
    /// instead of rejecting them.
    #[serde(default)]
    pub enable_approvals: bool,
}

impl Default for FileAccessConfig {
    fn default() -> Self {
        Self {
            writable_paths: Vec::new(),
            protected_paths: Vec::new(),
            max_file_size_bytes: default_max_file_size(),
            max_files_per_turn: default_max_files_per_turn(),
            enable_approvals: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WorktreeConfig {
    #[serde(default)]
    pub enabled: bool,
}

// ─── Iterations ───────────────────────────────────────────────────────────────

/// Lifecycle phase of an iteration.
///
/// Transition graph:
/// `refinement → planning → pre-code-review → implementation ⇄ code-review → done`
/// with the implementation/code-review cycle advancing `current_layer` on each
/// round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Refinement,
    Planning,
    PreCodeReview,
    Implementation,
    CodeReview,
    Done,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Refinement => "refinement",
            Phase::Planning => "planning",
            Phase::PreCodeReview => "pre-code-review",
            Phase::Implementation => "implementation",
            Phase::CodeReview => "code-review",
            Phase::Done => "done",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IterationStatus {
    Pending,
    InProgress,
    Done,
}

impl std::fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IterationStatus::Pending => write!(f, "pending"),
            IterationStatus::InProgress => write!(f, "in-progress"),
            IterationStatus::Done => write!(f, "done"),
        }
    }
}

/// One unit of work for the team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub id: String,
    pub description: String,
    pub status: IterationStatus,
    pub phase: Phase,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Only meaningful during implementation/code-review. Incremented by
    /// phase transitions, never by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_layer: Option<u32>,
}

impl Iteration {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: IterationStatus::Pending,
            phase: Phase::Refinement,
            max_turns: default_max_turns(),
            current_layer: None,
        }
    }
}

/// `.team/iteration.json` – all iterations plus the currently selected one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IterationFile {
    #[serde(default)]
    pub iterations: Vec<Iteration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
}

impl IterationFile {
    /// The iteration selected as current, if any.
    pub fn current_iteration(&self) -> Option<&Iteration> {
        let id = self.current.as_deref()?;
        self.iterations.iter().find(|i| i.id == id)
    }

    pub fn current_iteration_mut(&mut self) -> Option<&mut Iteration> {
        let id = self.current.clone()?;
        self.iterations.iter_mut().find(|i| i.id == id)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_access_defaults() {
        let fa: FileAccessConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(fa.max_file_size_bytes, 1_048_576);
        assert_eq!(fa.max_files_per_turn, 10);
        assert!(!fa.enable_approvals);
        assert!(fa.writable_paths.is_empty());
    }

    #[test]
    fn phase_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&Phase::PreCodeReview).unwrap(),
            "\"pre-code-review\""
        );
        assert_eq!(
            serde_json::from_str::<Phase>("\"code-review\"").unwrap(),
            Phase::CodeReview
        );
    }

    #[test]
    fn status_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&IterationStatus::InProgress).unwrap(),
            "\"in-progress\""
        );
    }

    #[test]
    fn team_config_minimal_parses() {
        let cfg: TeamConfig = serde_json::from_str(
            r#"{
                "model": {"provider": "openai", "base_url": "https://api.openai.com", "model": "gpt-4o"},
                "agents": [{"name": "agent-1"}, {"name": "agent-2", "role": "QA Engineer"}]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.agents.len(), 2);
        assert_eq!(cfg.agents[0].role, "Software Engineer");
        assert_eq!(cfg.agents[1].role, "QA Engineer");
        assert!(cfg.coach.is_none());
        assert!(!cfg.streaming);
    }

    #[test]
    fn iteration_file_current_lookup() {
        let mut file = IterationFile::default();
        file.iterations.push(Iteration::new("iter-1", "first"));
        file.iterations.push(Iteration::new("iter-2", "second"));
        file.current = Some("iter-2".into());
        assert_eq!(file.current_iteration().unwrap().id, "iter-2");
    }

    #[test]
    fn iteration_file_no_current() {
        let file = IterationFile::default();
        assert!(file.current_iteration().is_none());
    }

    #[test]
    fn iteration_defaults() {
        let it = Iteration::new("iter-1", "Build a todo app");
        assert_eq!(it.status, IterationStatus::Pending);
        assert_eq!(it.phase, Phase::Refinement);
        assert_eq!(it.max_turns, 30);
        assert!(it.current_layer.is_none());
    }

    #[test]
    fn current_layer_round_trips() {
        let mut it = Iteration::new("iter-1", "x");
        it.current_layer = Some(2);
        let json = serde_json::to_string(&it).unwrap();
        let back: Iteration = serde_json::from_str(&json).unwrap();
        assert_eq!(back.current_layer, Some(2));
    }
}
