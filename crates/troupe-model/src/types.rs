use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// OpenAI-style tool-result role. Anthropic transcripts never use it;
    /// tool results there are user-role content blocks.
    Tool,
}

/// Message content – either plain text or provider-shaped content blocks.
///
/// Blocks appear only in continuation messages replayed from a prior round
/// (Anthropic content blocks, OpenAI tool-result scaffolding). Prompt
/// reconstruction always produces `Text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Blocks(Value),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Text(String::new())
    }
}

impl Payload {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(t) => Some(t),
            Payload::Blocks(_) => None,
        }
    }

    /// The wire value for this payload: a JSON string or the block array.
    pub fn to_wire(&self) -> Value {
        match self {
            Payload::Text(t) => Value::String(t.clone()),
            Payload::Blocks(v) => v.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Text(t) => t.is_empty(),
            Payload::Blocks(v) => v.as_array().is_some_and(|blocks| blocks.is_empty()),
        }
    }
}

/// One entry in a model transcript.
///
/// `tool_calls` / `tool_call_id` are only populated on continuation
/// messages for OpenAI-compatible providers and are replayed verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Payload::Text(text.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        self.content.as_text()
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object
    pub input_schema: Value,
}

// ─── Rounds ───────────────────────────────────────────────────────────────────

/// A tool invocation declared by the model in one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Opaque identifier from the provider, echoed back in results.
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub input: Value,
}

/// Result of executing one declared tool call, keyed by its id.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub id: String,
    pub result: String,
}

/// One executed tool operation, as reported by the agentic loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOperation {
    pub name: String,
    pub input: Value,
    pub result: String,
}

/// Result of a single model round that may contain tool calls.
///
/// The continuation is a sealed, provider-specific value. Callers pass it
/// back through [`CompletionRound::build_continuation`] to form the next
/// prompt without re-serializing the assistant turn themselves.
#[derive(Debug, Clone)]
pub struct CompletionRound {
    pub content: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub(crate) continuation: Continuation,
}

#[derive(Debug, Clone)]
pub(crate) enum Continuation {
    /// Raw Anthropic `content` block array from the assistant turn.
    Anthropic { content_blocks: Value },
    /// Raw OpenAI assistant `message` object (including `tool_calls`).
    OpenAi { message: Value },
    /// Mock providers – plain text replay.
    Scripted,
}

impl CompletionRound {
    pub(crate) fn new(
        content: impl Into<String>,
        tool_calls: Vec<ToolInvocation>,
        continuation: Continuation,
    ) -> Self {
        Self {
            content: content.into(),
            tool_calls,
            continuation,
        }
    }

    /// Construct a round for tests and mock clients.
    pub fn scripted(content: impl Into<String>, tool_calls: Vec<ToolInvocation>) -> Self {
        Self::new(content, tool_calls, Continuation::Scripted)
    }

    /// Build the messages to append for the next round after executing this
    /// round's tool calls.
    pub fn build_continuation(&self, tool_results: &[ToolResult]) -> Vec<ChatMessage> {
        match &self.continuation {
            Continuation::Anthropic { content_blocks } => {
                let results: Vec<Value> = tool_results
                    .iter()
                    .map(|r| {
                        json!({
                            "type": "tool_result",
                            "tool_use_id": r.id,
                            "content": r.result,
                        })
                    })
                    .collect();
                vec![
                    ChatMessage {
                        role: Role::Assistant,
                        content: Payload::Blocks(content_blocks.clone()),
                        tool_calls: None,
                        tool_call_id: None,
                    },
                    ChatMessage {
                        role: Role::User,
                        content: Payload::Blocks(Value::Array(results)),
                        tool_calls: None,
                        tool_call_id: None,
                    },
                ]
            }
            Continuation::OpenAi { message } => {
                let content = message
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let mut msgs = vec![ChatMessage {
                    role: Role::Assistant,
                    content: Payload::Text(content),
                    tool_calls: message.get("tool_calls").cloned(),
                    tool_call_id: None,
                }];
                for r in tool_results {
                    msgs.push(ChatMessage {
                        role: Role::Tool,
                        content: Payload::Text(r.result.clone()),
                        tool_calls: None,
                        tool_call_id: Some(r.id.clone()),
                    });
                }
                msgs
            }
            Continuation::Scripted => {
                let mut msgs = Vec::new();
                if !self.content.is_empty() {
                    msgs.push(ChatMessage::assistant(&self.content));
                }
                for r in tool_results {
                    msgs.push(ChatMessage::user(format!("[tool {}] {}", r.id, r.result)));
                }
                msgs
            }
        }
    }
}

/// Cumulative result of an agentic (internal tool-loop) completion.
#[derive(Debug, Clone, Default)]
pub struct AgenticOutcome {
    pub content: String,
    pub operations: Vec<ToolOperation>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_constructors_set_roles() {
        assert_eq!(ChatMessage::system("s").role, Role::System);
        assert_eq!(ChatMessage::user("u").role, Role::User);
        assert_eq!(ChatMessage::assistant("a").role, Role::Assistant);
    }

    #[test]
    fn chat_message_text_round_trips() {
        let m = ChatMessage::user("hello");
        let jsoned = serde_json::to_string(&m).unwrap();
        let back: ChatMessage = serde_json::from_str(&jsoned).unwrap();
        assert_eq!(back.as_text(), Some("hello"));
        // No tool fields serialized for plain text messages.
        assert!(!jsoned.contains("tool_calls"));
    }

    #[test]
    fn payload_blocks_round_trips() {
        let m = ChatMessage {
            role: Role::Assistant,
            content: Payload::Blocks(json!([{"type": "text", "text": "hi"}])),
            tool_calls: None,
            tool_call_id: None,
        };
        let jsoned = serde_json::to_string(&m).unwrap();
        let back: ChatMessage = serde_json::from_str(&jsoned).unwrap();
        assert!(back.as_text().is_none());
        assert!(matches!(back.content, Payload::Blocks(_)));
    }

    #[test]
    fn anthropic_continuation_shape() {
        let round = CompletionRound::new(
            "text",
            vec![],
            Continuation::Anthropic {
                content_blocks: json!([{"type": "tool_use", "id": "t1", "name": "file_read", "input": {}}]),
            },
        );
        let msgs = round.build_continuation(&[ToolResult {
            id: "t1".into(),
            result: "ok".into(),
        }]);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::Assistant);
        assert_eq!(msgs[1].role, Role::User);
        let blocks = msgs[1].content.to_wire();
        assert_eq!(blocks[0]["tool_use_id"], "t1");
        assert_eq!(blocks[0]["content"], "ok");
    }

    #[test]
    fn openai_continuation_shape() {
        let round = CompletionRound::new(
            "",
            vec![],
            Continuation::OpenAi {
                message: json!({
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "c1", "function": {"name": "f", "arguments": "{}"}}],
                }),
            },
        );
        let msgs = round.build_continuation(&[ToolResult {
            id: "c1".into(),
            result: "done".into(),
        }]);
        assert_eq!(msgs.len(), 2);
        assert!(msgs[0].tool_calls.is_some());
        assert_eq!(msgs[1].role, Role::Tool);
        assert_eq!(msgs[1].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(msgs[1].as_text(), Some("done"));
    }

    #[test]
    fn scripted_continuation_keeps_results() {
        let round = CompletionRound::scripted("thinking", vec![]);
        let msgs = round.build_continuation(&[ToolResult {
            id: "x".into(),
            result: "r".into(),
        }]);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].as_text(), Some("thinking"));
    }
}
