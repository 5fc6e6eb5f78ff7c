// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::{
    anthropic::TRUNCATION_NOTE,
    stream::{guard_pre_delta, RoundChunk, RoundStream},
    ChatMessage, CompletionRound, Continuation, ModelClient, Role, ToolInvocation, ToolSchema,
};

/// Driver for the OpenAI chat-completions wire format.
///
/// Covers both the `openai` and `ollama` providers – ollama exposes the
/// same `/v1/chat/completions` surface.
pub struct OpenAiCompatClient {
    provider: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(
        provider: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            api_key,
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, messages: &[ChatMessage], tools: &[ToolSchema], stream: bool) -> Value {
        let wire_messages: Vec<Value> = messages.iter().map(wire_message).collect();
        let mut body = json!({
            "model": self.model,
            "messages": wire_messages,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(wire_tool).collect());
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    fn request(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!(
                "{}/v1/chat/completions",
                self.base_url.trim_end_matches('/')
            ))
            .json(body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        builder
    }
}

fn wire_message(msg: &ChatMessage) -> Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut m = Map::new();
    m.insert("role".into(), json!(role));
    m.insert("content".into(), msg.content.to_wire());
    if let Some(tc) = &msg.tool_calls {
        m.insert("tool_calls".into(), tc.clone());
    }
    if let Some(id) = &msg.tool_call_id {
        m.insert("tool_call_id".into(), json!(id));
    }
    Value::Object(m)
}

fn wire_tool(tool: &ToolSchema) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        },
    })
}

/// Parse a non-streaming chat completion into a round.
fn parse_response(data: &Value) -> anyhow::Result<CompletionRound> {
    let Some(message) = data["choices"][0].get("message").cloned() else {
        bail!("malformed completion response: no choices[0].message");
    };
    let finish_reason = data["choices"][0]["finish_reason"].as_str().unwrap_or("");
    let content = message["content"].as_str().unwrap_or("").to_string();

    // A length stop means tool-call arguments may be cut mid-JSON.
    let mut tool_calls = Vec::new();
    if finish_reason != "length" {
        for tc in message["tool_calls"].as_array().into_iter().flatten() {
            let args = tc["function"]["arguments"].as_str().unwrap_or("{}");
            let input: Value = match serde_json::from_str(args) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "dropping tool call with unparseable arguments");
                    continue;
                }
            };
            tool_calls.push(ToolInvocation {
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                input,
            });
        }
    }

    let content = if finish_reason == "length" && content.is_empty() {
        TRUNCATION_NOTE.to_string()
    } else {
        content
    };

    Ok(CompletionRound::new(
        content,
        tool_calls,
        Continuation::OpenAi { message },
    ))
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.provider
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
            .with_context(|| format!("{} request failed", self.provider))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.provider);
        }
        let data: Value = resp.json().await.context("completion response body")?;
        parse_response(&data)
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
            let mut asm = DeltaAssembler::default();
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
                while let Some(pos) = linebuf.find('\n') {
                    let line = linebuf[..pos].trim_end_matches('\r').to_string();
                    linebuf.drain(..=pos);
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        continue;
                    }
                    let Ok(v) = serde_json::from_str::<Value>(data) else {
                        continue;
                    };
                    if let Some(delta) = asm.ingest(&v) {
                        if !delta.is_empty() && tx.send(Ok(RoundChunk::Text(delta))).await.is_err() {
                            return;
                        }
                    }
                }
            }
            match asm.finish() {
                Ok(round) => {
                    let _ = tx.send(Ok(RoundChunk::Round(round))).await;
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        let chunks = Box::pin(ReceiverStream::new(rx));
        guard_pre_delta(chunks, self.complete_round(messages, tools)).await
    }
}

// ─── Delta assembly ───────────────────────────────────────────────────────────

/// Accumulates `choices[0].delta` chunks into the equivalent non-streaming
/// assistant message.
#[derive(Default)]
struct DeltaAssembler {
    content: String,
    // index → (id, name, arguments)
    tool_calls: Vec<(String, String, String)>,
    finish_reason: Option<String>,
}

impl DeltaAssembler {
    fn ingest(&mut self, v: &Value) -> Option<String> {
        let choice = &v["choices"][0];
        if let Some(fr) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(fr.to_string());
        }
        let delta = &choice["delta"];
        for tc in delta["tool_calls"].as_array().into_iter().flatten() {
            let index = tc["index"].as_u64().unwrap_or(0) as usize;
            while self.tool_calls.len() <= index {
                self.tool_calls
                    .push((String::new(), String::new(), String::new()));
            }
            let slot = &mut self.tool_calls[index];
            if let Some(id) = tc["id"].as_str() {
                slot.0.push_str(id);
            }
            if let Some(name) = tc["function"]["name"].as_str() {
                slot.1.push_str(name);
            }
            if let Some(args) = tc["function"]["arguments"].as_str() {
                slot.2.push_str(args);
            }
        }
        delta["content"].as_str().map(|text| {
            self.content.push_str(text);
            text.to_string()
        })
    }

    fn finish(self) -> anyhow::Result<CompletionRound> {
        let truncated = self.finish_reason.as_deref() == Some("length");

        let mut raw_calls = Vec::new();
        let mut tool_calls = Vec::new();
        for (id, name, args) in &self.tool_calls {
            raw_calls.push(json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": args},
            }));
            if truncated {
                continue;
            }
            match serde_json::from_str::<Value>(if args.is_empty() { "{}" } else { args }) {
                Ok(input) => tool_calls.push(ToolInvocation {
                    id: id.clone(),
                    name: name.clone(),
                    input,
                }),
                Err(e) => warn!(error = %e, tool = %name, "dropping streamed tool call with bad JSON"),
            }
        }

        let mut message = json!({"role": "assistant", "content": self.content});
        if !raw_calls.is_empty() {
            message["tool_calls"] = Value::Array(raw_calls);
        }

        let content = if truncated && self.content.is_empty() {
            TRUNCATION_NOTE.to_string()
        } else {
            self.content
        };

        Ok(CompletionRound::new(
            content,
            tool_calls,
            Continuation::OpenAi { message },
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
