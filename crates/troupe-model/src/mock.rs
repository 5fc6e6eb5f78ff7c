// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{
    stream::{RoundChunk, RoundStream},
    ChatMessage, CompletionRound, ModelClient, ToolSchema,
};

/// What the scripted client has seen, for assertions.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<ChatMessage>,
    pub tool_names: Vec<String>,
}

/// A pre-scripted mock client. Each `complete_round` call pops the next
/// scripted result from the front of the queue, so tests can specify exact
/// round sequences – including tool calls – without network access.
pub struct ScriptedClient {
    scripts: Mutex<VecDeque<Result<CompletionRound, String>>>,
    /// When true, `stream_round` emits the round content as a single text
    /// delta before resolving, exercising the streaming path.
    streaming: bool,
    /// When true, the final script entry repeats instead of running out.
    repeat_last: bool,
    /// Every request seen by this client, in call order.
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ScriptedClient {
    pub fn new(rounds: Vec<CompletionRound>) -> Self {
        Self {
            scripts: Mutex::new(rounds.into_iter().map(Ok).collect()),
            streaming: false,
            repeat_last: false,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Build from explicit per-call results; `Err` entries make that call
    /// fail with the given message.
    pub fn from_results(results: Vec<Result<CompletionRound, String>>) -> Self {
        Self {
            scripts: Mutex::new(results.into_iter().collect()),
            streaming: false,
            repeat_last: false,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Load scripted rounds from a JSON file:
    /// `[{"content": "...", "tool_calls": [{"id", "name", "input"}]?}, ...]`.
    ///
    /// This backs the `mock` provider so full lifecycles can run without
    /// network access.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading mock responses {}", path.display()))?;
        let entries: Vec<serde_json::Value> =
            serde_json::from_str(&text).context("parsing mock responses")?;
        let rounds = entries
            .into_iter()
            .map(|e| {
                let content = e["content"].as_str().unwrap_or("").to_string();
                let tool_calls = e["tool_calls"]
                    .as_array()
                    .map(|calls| {
                        calls
                            .iter()
                            .map(|c| crate::ToolInvocation {
                                id: c["id"].as_str().unwrap_or("call").to_string(),
                                name: c["name"].as_str().unwrap_or("").to_string(),
                                input: c["input"].clone(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                CompletionRound::scripted(content, tool_calls)
            })
            .collect();
        Ok(Self::new(rounds))
    }

    /// Convenience: a client that always answers with the same text.
    /// The script never runs out – the last response repeats.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let mut c = Self::new(vec![CompletionRound::scripted(reply, vec![])]);
        c.repeat_last = true;
        c
    }

    /// Enable scripted streaming: each round's content is surfaced as one
    /// text delta before the round resolves.
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    fn pop(&self) -> Result<CompletionRound, String> {
        let mut scripts = self.scripts.lock().unwrap();
        if self.repeat_last && scripts.len() == 1 {
            return scripts.front().cloned().unwrap();
        }
        scripts
            .pop_front()
            .unwrap_or_else(|| Ok(CompletionRound::scripted("[no more scripts]", vec![])))
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn complete_round(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> anyhow::Result<CompletionRound> {
        self.requests.lock().unwrap().push(RecordedRequest {
            messages: messages.to_vec(),
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
        });
        self.pop().map_err(|e| anyhow::anyhow!(e))
    }

    async fn stream_round(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> anyhow::Result<RoundStream> {
        let round = self.complete_round(messages, tools).await?;
        if !self.streaming {
            return Ok(RoundStream::from_round(round));
        }
        let mut chunks: Vec<anyhow::Result<RoundChunk>> = Vec::new();
        if !round.content.is_empty() {
            chunks.push(Ok(RoundChunk::Text(round.content.clone())));
        }
        chunks.push(Ok(RoundChunk::Round(round)));
        Ok(RoundStream::new(Box::pin(futures::stream::iter(chunks))))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
