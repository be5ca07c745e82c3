//! Canonical Anthropic Messages API request/response types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::unknown_fields::UnknownFields;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<MessageParam>,
    pub max_tokens: u32,
    /// Anthropic accepts either a plain string or a list of system blocks.
    #[serde(default)]
    pub system: Option<Value>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageParam {
    pub role: String,
    pub content: Value,
}

impl MessagesRequest {
    /// Whether any message contains a `tool_use` or `tool_result` content
    /// block, one of the Messages-dialect detection signals (spec §4.3).
    pub fn has_tool_content_blocks(&self) -> bool {
        self.messages.iter().any(|message| content_has_tool_block(&message.content))
    }
}

fn content_has_tool_block(content: &Value) -> bool {
    match content {
        Value::Array(parts) => parts.iter().any(|part| {
            matches!(
                part.get("type").and_then(Value::as_str),
                Some("tool_use") | Some("tool_result")
            )
        }),
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    pub usage: MessagesUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// One SSE event payload for a streaming Messages response. Anthropic
/// frames every chunk with an explicit `event:` line in addition to the
/// `data:` JSON body; `event_name` carries that framing value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesStreamEvent {
    pub event_name: String,
    pub data: Value,
}
