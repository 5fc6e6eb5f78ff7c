// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{
    stream::{guard_pre_delta, RoundChunk, RoundStream},
    ChatMessage, CompletionRound, Continuation, ModelClient, Role, ToolInvocation, ToolSchema,
};

/// Text synthesized when a max-token stop leaves the round with no visible
/// content. Declared tool calls are discarded in that case because their
/// arguments may be truncated mid-JSON.
pub(crate) const TRUNCATION_NOTE: &str = "[Output was truncated due to length. \
     Try breaking large file writes into smaller pieces.]";

pub struct AnthropicClient {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            model: model.into(),
            api_key,
            base_url: base_url.into(),
            max_tokens: 4096,
            client: reqwest::Client::new(),
        }
    }

    /// Raise the output-token ceiling. Implementation agents write whole
    /// files in one round and need far more than the discussion default.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Split the transcript into the system text and the chat messages,
    /// then place cache breakpoints on the two stable prefixes: the system
    /// prompt and the penultimate chat message.
    fn build_body(&self, messages: &[ChatMessage], tools: &[ToolSchema], stream: bool) -> Value {
        let mut system: Option<String> = None;
        let mut chat: Vec<Value> = Vec::new();
        for msg in messages {
            if msg.role == Role::System {
                system = msg.as_text().map(str::to_string);
            } else if !msg.content.is_empty() {
                chat.push(json!({
                    "role": role_str(msg.role),
                    "content": msg.content.to_wire(),
                }));
            }
        }

        // Cache breakpoint on the second-to-last message; the last one
        // changes every round and would never hit.
        if chat.len() >= 2 {
            let idx = chat.len() - 2;
            if let Some(text) = chat[idx]["content"].as_str().filter(|t| !t.is_empty()) {
                let text = text.to_string();
                chat[idx]["content"] = json!([{
                    "type": "text",
                    "text": text,
                    "cache_control": {"type": "ephemeral"},
                }]);
            }
        }

        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": chat,
        });
        if let Some(system) = system {
            body["system"] = json!([{
                "type": "text",
                "text": system,
                "cache_control": {"type": "ephemeral"},
            }]);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", self.api_key.as_deref().unwrap_or(""))
            .header("anthropic-version", "2023-06-01")
            .json(body)
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "user",
    }
}

/// Parse a non-streaming response body into a round.
fn parse_response(data: &Value) -> CompletionRound {
    let content_blocks = data["content"].clone();
    let stop_reason = data["stop_reason"].as_str().unwrap_or("");

    if let Some(usage) = data.get("usage") {
        let created = usage["cache_creation_input_tokens"].as_u64().unwrap_or(0);
        let read = usage["cache_read_input_tokens"].as_u64().unwrap_or(0);
        if created > 0 || read > 0 {
            debug!(cache_created = created, cache_read = read, "prompt cache usage");
        }
    }

    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolInvocation> = Vec::new();
    // Truncated responses may carry half-written tool_use blocks.
    let include_tools = stop_reason != "max_tokens";

    for block in content_blocks.as_array().into_iter().flatten() {
        match block["type"].as_str().unwrap_or("") {
            "text" => {
                if let Some(t) = block["text"].as_str() {
                    text_parts.push(t.to_string());
                }
            }
            "tool_use" if include_tools => tool_calls.push(ToolInvocation {
                id: block["id"].as_str().unwrap_or("").to_string(),
                name: block["name"].as_str().unwrap_or("").to_string(),
                input: block["input"].clone(),
            }),
            _ => {}
        }
    }

    if stop_reason == "max_tokens" && text_parts.is_empty() {
        text_parts.push(TRUNCATION_NOTE.to_string());
    }

    CompletionRound::new(
        text_parts.join("\n\n"),
        tool_calls,
        Continuation::Anthropic { content_blocks },
    )
}

#[async_trait]
impl ModelClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete_round(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> anyhow::Result<CompletionRound> {
        let body = self.build_body(messages, tools, false);
        let resp = self
            .request(&body)
            .send()
            .await
            .context("Anthropic request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Anthropic error {status}: {text}");
        }
        let data: Value = resp.json().await.context("Anthropic response body")?;
        Ok(parse_response(&data))
    }

    async fn stream_round(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> anyhow::Result<RoundStream> {
        let body = self.build_body(messages, tools, true);
        let resp = match self.request(&body).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(status = %r.status(), "stream request rejected; falling back");
                return Ok(RoundStream::from_round(
                    self.complete_round(messages, tools).await?,
                ));
            }
            Err(e) => {
                warn!(error = %e, "stream connection failed; falling back");
                return Ok(RoundStream::from_round(
                    self.complete_round(messages, tools).await?,
                ));
            }
        };

        let (tx, rx) = tokio::sync::mpsc::channel::<anyhow::Result<RoundChunk>>(32);
        tokio::spawn(async move {
            let mut asm = SseAssembler::default();
            let mut bytes = resp.bytes_stream();
            let mut linebuf = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(anyhow::anyhow!(e))).await;
                        return;
                    }
                };
                linebuf.push_str(&String::from_utf8_lossy(&chunk));
                // SSE lines can be split across TCP chunks; only complete
                // lines are parsed, the remainder carries forward.
                while let Some(pos) = linebuf.find('\n') {
                    let line = linebuf[..pos].trim_end_matches('\r').to_string();
                    linebuf.drain(..=pos);
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let Ok(v) = serde_json::from_str::<Value>(data.trim()) else {
                        continue;
                    };
                    if let Some(delta) = asm.ingest(&v) {
                        if !delta.is_empty() && tx.send(Ok(RoundChunk::Text(delta))).await.is_err() {
                            return;
                        }
                    }
                }
            }
            let _ = tx.send(Ok(RoundChunk::Round(asm.finish()))).await;
        });

        let chunks = Box::pin(ReceiverStream::new(rx));
        guard_pre_delta(chunks, self.complete_round(messages, tools)).await
    }
}

// ─── SSE assembly ─────────────────────────────────────────────────────────────

/// Accumulates streamed content blocks so the final round carries the same
/// raw block array a non-streaming response would.
#[derive(Default)]
struct SseAssembler {
    blocks: Vec<BlockAcc>,
    stop_reason: Option<String>,
}

enum BlockAcc {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        partial_json: String,
    },
}

impl SseAssembler {
    /// Ingest one SSE event; returns a text delta to surface, if any.
    fn ingest(&mut self, v: &Value) -> Option<String> {
        match v["type"].as_str().unwrap_or("") {
            "content_block_start" => {
                let block = &v["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    self.blocks.push(BlockAcc::ToolUse {
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name: block["name"].as_str().unwrap_or("").to_string(),
                        partial_json: String::new(),
                    });
                } else {
                    self.blocks.push(BlockAcc::Text(String::new()));
                }
                None
            }
            "content_block_delta" => {
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or("");
                        if let Some(BlockAcc::Text(acc)) = self.blocks.last_mut() {
                            acc.push_str(text);
                        }
                        Some(text.to_string())
                    }
                    "input_json_delta" => {
                        if let Some(BlockAcc::ToolUse { partial_json, .. }) = self.blocks.last_mut()
                        {
                            partial_json.push_str(delta["partial_json"].as_str().unwrap_or(""));
                        }
                        None
                    }
                    _ => None,
                }
            }
            "message_delta" => {
                if let Some(sr) = v["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(sr.to_string());
                }
                None
            }
            _ => None,
        }
    }

    fn finish(self) -> CompletionRound {
        let mut content_blocks: Vec<Value> = Vec::new();
        let mut text_parts: Vec<String> = Vec::new();
        let mut tool_calls: Vec<ToolInvocation> = Vec::new();
        let truncated = self.stop_reason.as_deref() == Some("max_tokens");

        for block in self.blocks {
            match block {
                BlockAcc::Text(t) => {
                    if !t.is_empty() {
                        text_parts.push(t.clone());
                    }
                    content_blocks.push(json!({"type": "text", "text": t}));
                }
                BlockAcc::ToolUse {
                    id,
                    name,
                    partial_json,
                } => {
                    let input: Value = if partial_json.is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&partial_json).unwrap_or(Value::Null)
                    };
                    // A null input means the argument JSON never became
                    // parseable – drop the call rather than execute garbage.
                    if !truncated && !input.is_null() {
                        tool_calls.push(ToolInvocation {
                            id: id.clone(),
                            name: name.clone(),
                            input: input.clone(),
                        });
                    }
                    content_blocks.push(json!({
                        "type": "tool_use", "id": id, "name": name, "input": input,
                    }));
                }
            }
        }

        if truncated && text_parts.is_empty() {
            text_parts.push(TRUNCATION_NOTE.to_string());
        }

        CompletionRound::new(
            text_parts.join("\n\n"),
            tool_calls,
            Continuation::Anthropic {
                content_blocks: Value::Array(content_blocks),
            },
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AnthropicClient {
        AnthropicClient::new("https://api.anthropic.com", "claude-x", Some("sk-test".into()))
    }

    // ── Body construction ─────────────────────────────────────────────────────

    #[test]
    fn system_message_becomes_top_level_block() {
        let body = client().build_body(
            &[ChatMessage::system("be brief"), ChatMessage::user("hi")],
            &[],
            false,
        );
        assert_eq!(body["system"][0]["text"], "be brief");
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn penultimate_message_gets_cache_breakpoint() {
        let body = client().build_body(
            &[
                ChatMessage::user("first"),
                ChatMessage::assistant("second"),
                ChatMessage::user("third"),
            ],
            &[],
            false,
        );
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs[1]["content"][0]["cache_control"]["type"], "ephemeral");
        // Last message stays a plain string.
        assert!(msgs[2]["content"].is_string());
    }

    #[test]
    fn single_message_gets_no_breakpoint() {
        let body = client().build_body(&[ChatMessage::user("only")], &[], false);
        assert!(body["messages"][0]["content"].is_string());
    }

    #[test]
    fn empty_messages_are_dropped() {
        let body = client().build_body(
            &[ChatMessage::user(""), ChatMessage::user("real")],
            &[],
            false,
        );
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn stream_flag_set_when_streaming() {
        let body = client().build_body(&[ChatMessage::user("x")], &[], true);
        assert_eq!(body["stream"], json!(true));
    }

    // ── Response parsing ──────────────────────────────────────────────────────

    #[test]
    fn parse_text_and_tool_use() {
        let round = parse_response(&json!({
            "content": [
                {"type": "text", "text": "reading the file"},
                {"type": "tool_use", "id": "t1", "name": "file_read", "input": {"path": "src/m.py"}},
            ],
            "stop_reason": "tool_use",
        }));
        assert_eq!(round.content, "reading the file");
        assert_eq!(round.tool_calls.len(), 1);
        assert_eq!(round.tool_calls[0].name, "file_read");
        assert_eq!(round.tool_calls[0].input["path"], "src/m.py");
    }

    #[test]
    fn max_tokens_discards_tool_calls() {
        let round = parse_response(&json!({
            "content": [
                {"type": "text", "text": "partial"},
                {"type": "tool_use", "id": "t1", "name": "file_write", "input": {}},
            ],
            "stop_reason": "max_tokens",
        }));
        assert!(round.tool_calls.is_empty());
        assert_eq!(round.content, "partial");
    }

    #[test]
    fn max_tokens_with_no_text_synthesizes_note() {
        let round = parse_response(&json!({
            "content": [
                {"type": "tool_use", "id": "t1", "name": "file_write", "input": {}},
            ],
            "stop_reason": "max_tokens",
        }));
        assert!(round.content.starts_with("[Output was truncated"));
        assert!(round.tool_calls.is_empty());
    }

    #[test]
    fn multiple_text_blocks_join_with_blank_line() {
        let round = parse_response(&json!({
            "content": [
                {"type": "text", "text": "one"},
                {"type": "text", "text": "two"},
            ],
            "stop_reason": "end_turn",
        }));
        assert_eq!(round.content, "one\n\ntwo");
    }

    // ── SSE assembly ──────────────────────────────────────────────────────────

    #[test]
    fn assembler_accumulates_text() {
        let mut asm = SseAssembler::default();
        asm.ingest(&json!({"type": "content_block_start", "index": 0,
                           "content_block": {"type": "text"}}));
        let d1 = asm.ingest(&json!({"type": "content_block_delta", "index": 0,
                                    "delta": {"type": "text_delta", "text": "hel"}}));
        let d2 = asm.ingest(&json!({"type": "content_block_delta", "index": 0,
                                    "delta": {"type": "text_delta", "text": "lo"}}));
        assert_eq!(d1.as_deref(), Some("hel"));
        assert_eq!(d2.as_deref(), Some("lo"));
        let round = asm.finish();
        assert_eq!(round.content, "hello");
    }

    #[test]
    fn assembler_accumulates_tool_call_json() {
        let mut asm = SseAssembler::default();
        asm.ingest(&json!({"type": "content_block_start", "index": 0,
                           "content_block": {"type": "tool_use", "id": "t1", "name": "file_read"}}));
        asm.ingest(&json!({"type": "content_block_delta", "index": 0,
                           "delta": {"type": "input_json_delta", "partial_json": "{\"path\":"}}));
        asm.ingest(&json!({"type": "content_block_delta", "index": 0,
                           "delta": {"type": "input_json_delta", "partial_json": "\"a.py\"}"}}));
        let round = asm.finish();
        assert_eq!(round.tool_calls.len(), 1);
        assert_eq!(round.tool_calls[0].input["path"], "a.py");
    }

    #[test]
    fn assembler_drops_unparseable_tool_json() {
        let mut asm = SseAssembler::default();
        asm.ingest(&json!({"type": "content_block_start", "index": 0,
                           "content_block": {"type": "tool_use", "id": "t1", "name": "file_write"}}));
        asm.ingest(&json!({"type": "content_block_delta", "index": 0,
                           "delta": {"type": "input_json_delta", "partial_json": "{\"pa"}}));
        let round = asm.finish();
        assert!(round.tool_calls.is_empty());
    }

    #[test]
    fn assembler_max_tokens_discards_tools() {
        let mut asm = SseAssembler::default();
        asm.ingest(&json!({"type": "content_block_start", "index": 0,
                           "content_block": {"type": "tool_use", "id": "t1", "name": "file_write"}}));
        asm.ingest(&json!({"type": "content_block_delta", "index": 0,
                           "delta": {"type": "input_json_delta", "partial_json": "{}"}}));
        asm.ingest(&json!({"type": "message_delta", "delta": {"stop_reason": "max_tokens"}}));
        let round = asm.finish();
        assert!(round.tool_calls.is_empty());
        assert!(round.content.starts_with("[Output was truncated"));
    }

    #[test]
    fn assembler_continuation_carries_blocks() {
        let mut asm = SseAssembler::default();
        asm.ingest(&json!({"type": "content_block_start", "index": 0,
                           "content_block": {"type": "text"}}));
        asm.ingest(&json!({"type": "content_block_delta", "index": 0,
                           "delta": {"type": "text_delta", "text": "done"}}));
        let round = asm.finish();
        let msgs = round.build_continuation(&[]);
        assert_eq!(msgs[0].role, Role::Assistant);
        let blocks = msgs[0].content.to_wire();
        assert_eq!(blocks[0]["text"], "done");
    }
}
