// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::{
    stream::RoundStream, AgenticOutcome, ChatMessage, CompletionRound, ToolOperation, ToolResult,
    ToolSchema,
};

/// Ceiling for the internal tool loop of [`agentic_completion`].
pub const AGENTIC_MAX_ROUNDS: usize = 10;

/// Narrow model capability used by the session engine and the
/// implementation executor.
///
/// Three shapes are derived from it: a single round
/// ([`complete_round`](ModelClient::complete_round)), a streaming round
/// ([`stream_round`](ModelClient::stream_round)), and the bounded agentic
/// loop ([`agentic_completion`]).
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Provider name for diagnostics.
    fn name(&self) -> &str;

    /// One model round: text, declared tool calls, and a continuation
    /// handle for the follow-up prompt.
    async fn complete_round(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> anyhow::Result<CompletionRound>;

    /// One model round, streamed. The returned stream yields text deltas;
    /// the final round becomes observable only after the stream is
    /// exhausted.
    ///
    /// The default implementation completes non-streaming and returns a
    /// delta-less stream, which doubles as the transparent fallback for
    /// providers without streaming support.
    async fn stream_round(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> anyhow::Result<RoundStream> {
        let round = self.complete_round(messages, tools).await?;
        Ok(RoundStream::from_round(round))
    }

    /// Text-only completion: one round without tools.
    async fn complete_text(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        let round = self.complete_round(messages, &[]).await?;
        Ok(round.content)
    }
}

/// Completion with an internal tool-execution loop, bounded at
/// [`AGENTIC_MAX_ROUNDS`] rounds.
///
/// Used in discussion phases where the model may inspect files mid-turn.
/// The executor maps `(tool name, input)` to a result string; errors are
/// expected to be encoded in the string, never raised.
pub async fn agentic_completion(
    client: &dyn ModelClient,
    messages: &[ChatMessage],
    tools: &[ToolSchema],
    executor: &mut dyn FnMut(&str, &Value) -> String,
) -> anyhow::Result<AgenticOutcome> {
    let mut transcript = messages.to_vec();
    let mut operations: Vec<ToolOperation> = Vec::new();
    let mut last_text = String::new();

    for round_num in 0..AGENTIC_MAX_ROUNDS {
        let round = client.complete_round(&transcript, tools).await?;

        if round.tool_calls.is_empty() {
            return Ok(AgenticOutcome {
                content: round.content,
                operations,
            });
        }
        last_text = round.content.clone();

        let mut results = Vec::with_capacity(round.tool_calls.len());
        for tc in &round.tool_calls {
            debug!(round = round_num, tool = %tc.name, "executing tool call");
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

    // Round budget exhausted – return what we have.
    Ok(AgenticOutcome {
        content: last_text,
        operations,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
