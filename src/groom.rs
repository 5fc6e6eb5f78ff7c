// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Grooming: freeform pre-iteration refinement sessions, independent of
//! the iteration lifecycle. Each lives in `.team/grooming/<slug>/` with
//! its own conversation log.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{bail, Context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use troupe_config::{grooming_dir, Iteration, IterationStatus, TeamConfig};
use troupe_core::{run_session, PhaseContext, SessionEvent, SessionPolicy};
use troupe_model::client_from_config;
use troupe_store::{read_log, CONVERSATION_FILE, DEBUG_FILE};

use crate::session::persist_event;

// ─── Slug generation ──────────────────────────────────────────────────────────

const STOP_WORDS: [&str; 47] = [
    "a", "an", "the", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had", "do", "does",
    "did", "will", "would", "could", "should", "may", "might", "can", "shall", "how", "what",
    "when", "where", "why", "who", "which", "that", "this", "we", "our",
];

const MAX_SLUG_LENGTH: usize = 50;

fn slug_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[a-z0-9][a-z0-9-]{0,49}$").expect("slug regex"))
}

/// Generate a kebab-case slug from a topic: stop words stripped (keeping
/// at least two words), truncated at a word boundary, deduplicated with
/// `-2`, `-3`, … suffixes against `existing`.
pub fn generate_slug(topic: &str, existing: &HashSet<String>) -> String {
    let lowered = topic.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace() || *c == '-')
        .collect();
    let words: Vec<&str> = cleaned.split_whitespace().collect();

    let mut filtered: Vec<&str> = words
        .iter()
        .copied()
        .filter(|w| !STOP_WORDS.contains(w))
        .collect();
    if filtered.len() < 2 && !words.is_empty() {
        filtered = words.iter().copied().take(3).collect();
    }
    if filtered.is_empty() {
        filtered.push("groom");
    }

    let mut slug = filtered.join("-");
    if slug.len() > MAX_SLUG_LENGTH {
        let truncated = &slug[..MAX_SLUG_LENGTH];
        slug = match truncated.rfind('-') {
            Some(pos) => truncated[..pos].to_string(),
            None => truncated.to_string(),
        };
    }

    if existing.contains(&slug) {
        let mut n = 2;
        while existing.contains(&format!("{slug}-{n}")) {
            n += 1;
        }
        slug = format!("{slug}-{n}");
    }
    slug
}

/// A slug safe to use as a directory name.
pub fn validate_slug(slug: &str) -> bool {
    slug_pattern().is_match(slug)
}

// ─── Metadata ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroomingMetadata {
    pub slug: String,
    pub topic: String,
    pub coach: bool,
    pub max_turns: u32,
    pub status: String,
}

const METADATA_FILE: &str = "grooming.json";

/// Create the grooming directory and its metadata. Fails if the slug is
/// already taken.
pub fn create_grooming_session(
    team_dir: &Path,
    slug: &str,
    topic: &str,
    coach: bool,
    max_turns: u32,
) -> anyhow::Result<PathBuf> {
    if !validate_slug(slug) {
        bail!("invalid slug '{slug}'");
    }
    let dir = grooming_dir(team_dir, slug);
    if dir.exists() {
        bail!("grooming session '{slug}' already exists");
    }
    std::fs::create_dir_all(&dir)?;
    std::fs::File::create(dir.join(CONVERSATION_FILE))?;

    let metadata = GroomingMetadata {
        slug: slug.to_string(),
        topic: topic.to_string(),
        coach,
        max_turns,
        status: "active".into(),
    };
    std::fs::write(
        dir.join(METADATA_FILE),
        serde_json::to_string_pretty(&metadata)? + "\n",
    )?;
    Ok(dir)
}

pub fn load_grooming_metadata(
    team_dir: &Path,
    slug: &str,
) -> anyhow::Result<(GroomingMetadata, PathBuf)> {
    let dir = grooming_dir(team_dir, slug);
    let path = dir.join(METADATA_FILE);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("grooming session '{slug}' not found"))?;
    Ok((serde_json::from_str(&text)?, dir))
}

/// All grooming sessions, sorted by slug.
pub fn list_grooming_sessions(team_dir: &Path) -> Vec<GroomingMetadata> {
    let root = team_dir.join("grooming");
    let mut sessions: Vec<GroomingMetadata> = std::fs::read_dir(root)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .filter_map(|e| std::fs::read_to_string(e.path().join(METADATA_FILE)).ok())
        .filter_map(|text| serde_json::from_str(&text).ok())
        .collect();
    sessions.sort_by(|a, b| a.slug.cmp(&b.slug));
    sessions
}

pub fn existing_slugs(team_dir: &Path) -> HashSet<String> {
    std::fs::read_dir(team_dir.join("grooming"))
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect()
}

// ─── Running ──────────────────────────────────────────────────────────────────

/// Run (or continue) a grooming conversation. Grooming sessions carry no
/// file tools and no approvals; the coach may still participate when the
/// session was created with one.
pub async fn run_grooming_conversation(
    team_dir: &Path,
    config: &TeamConfig,
    slug: &str,
    human_message: Option<&str>,
    mut on_event: impl FnMut(&SessionEvent),
) -> anyhow::Result<()> {
    let (metadata, groom_dir) = load_grooming_metadata(team_dir, slug)?;
    let log_path = groom_dir.join(CONVERSATION_FILE);
    let debug_path = groom_dir.join(DEBUG_FILE);

    if let Some(text) = human_message {
        troupe_store::append_message(
            &log_path,
            &troupe_store::LogMessage::new("human", slug, text),
        )?;
    }
    let mut history = read_log(&log_path)?;

    // Grooming borrows the iteration shape; the slug doubles as the id.
    let mut iteration = Iteration::new(slug, &metadata.topic);
    iteration.status = IterationStatus::InProgress;

    let coach = metadata.coach.then(|| config.coach.clone()).flatten();
    let client = client_from_config(&config.model)?;

    // No file tools and no approvals in grooming.
    let policy = SessionPolicy::default();
    let (tx, mut rx) = mpsc::channel::<SessionEvent>(64);
    let engine = async {
        let result = run_session(
            &config.agents,
            coach.as_ref(),
            &iteration,
            metadata.max_turns,
            &policy,
            &PhaseContext::default(),
            client.as_ref(),
            &mut history,
            &tx,
        )
        .await;
        drop(tx);
        result
    };
    let consumer = async {
        while let Some(event) = rx.recv().await {
            persist_event(&event, &log_path, &debug_path);
            on_event(&event);
        }
    };
    let (result, ()) = tokio::join!(engine, consumer);
    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn no_existing() -> HashSet<String> {
        HashSet::new()
    }

    // ── Slugs ─────────────────────────────────────────────────────────────────

    #[test]
    fn slug_strips_stop_words() {
        assert_eq!(
            generate_slug("How should we handle authentication?", &no_existing()),
            "handle-authentication"
        );
    }

    #[test]
    fn slug_keeps_words_when_everything_is_a_stop_word() {
        assert_eq!(generate_slug("what should we do", &no_existing()), "what-should-we");
    }

    #[test]
    fn slug_empty_topic_falls_back() {
        assert_eq!(generate_slug("???", &no_existing()), "groom");
    }

    #[test]
    fn slug_truncates_at_word_boundary() {
        let topic = "implement a very long topic name that goes on and on forever about nothing";
        let slug = generate_slug(topic, &no_existing());
        assert!(slug.len() <= MAX_SLUG_LENGTH);
        assert!(!slug.ends_with('-'));
        assert!(validate_slug(&slug));
    }

    #[test]
    fn slug_deduplicates_with_suffix() {
        let mut existing = HashSet::new();
        existing.insert("handle-authentication".to_string());
        assert_eq!(
            generate_slug("handle authentication", &existing),
            "handle-authentication-2"
        );
        existing.insert("handle-authentication-2".to_string());
        assert_eq!(
            generate_slug("handle authentication", &existing),
            "handle-authentication-3"
        );
    }

    #[test]
    fn slug_validation() {
        assert!(validate_slug("auth-flow"));
        assert!(validate_slug("a2"));
        assert!(!validate_slug("-leading-dash"));
        assert!(!validate_slug("Has-Caps"));
        assert!(!validate_slug(""));
        assert!(!validate_slug(&"x".repeat(51)));
    }

    // ── Metadata ──────────────────────────────────────────────────────────────

    #[test]
    fn create_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = create_grooming_session(tmp.path(), "auth-flow", "authentication", true, 20)
            .unwrap();
        assert!(dir.join(CONVERSATION_FILE).exists());
        let (metadata, _) = load_grooming_metadata(tmp.path(), "auth-flow").unwrap();
        assert_eq!(metadata.topic, "authentication");
        assert!(metadata.coach);
        assert_eq!(metadata.max_turns, 20);
        assert_eq!(metadata.status, "active");
    }

    #[test]
    fn create_rejects_duplicate_slug() {
        let tmp = tempfile::tempdir().unwrap();
        create_grooming_session(tmp.path(), "auth", "x", false, 10).unwrap();
        assert!(create_grooming_session(tmp.path(), "auth", "y", false, 10).is_err());
    }

    #[test]
    fn create_rejects_invalid_slug() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(create_grooming_session(tmp.path(), "../escape", "x", false, 10).is_err());
    }

    #[test]
    fn list_sessions_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        create_grooming_session(tmp.path(), "zeta", "z", false, 10).unwrap();
        create_grooming_session(tmp.path(), "alpha", "a", false, 10).unwrap();
        let sessions = list_grooming_sessions(tmp.path());
        let slugs: Vec<&str> = sessions.iter().map(|s| s.slug.as_str()).collect();
        assert_eq!(slugs, vec!["alpha", "zeta"]);
        assert_eq!(existing_slugs(tmp.path()).len(), 2);
    }

    #[test]
    fn missing_session_errors() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load_grooming_metadata(tmp.path(), "ghost").is_err());
    }
}
