//! Canonical OpenAI Responses API request/response types (`/v1/responses`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::unknown_fields::UnknownFields;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    /// Either a plain string prompt or an array of input items
    /// (message/tool-output blocks); kept generic like `ChatMessage::content`.
    pub input: Value,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub previous_response_id: Option<String>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(flatten)]
    pub unknown: UnknownFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesResponse {
    pub id: String,
    pub object: String,
    pub status: String,
    pub model: String,
    pub output: Vec<Value>,
    pub usage: ResponsesUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_tier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub input_tokens_details: ResponsesInputTokensDetails,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesInputTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
}

/// One SSE `data:` payload for a streaming Responses reply. Every event
/// carries its own `type` field (`response.created`, `response.output_text.delta`,
/// `response.completed`, ...), which `stream::StreamRelay` inspects for
/// termination; the relay forwards the raw JSON through rather than
/// modeling every event shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesStreamEvent {
    pub r#type: String,
    #[serde(flatten)]
    pub body: Value,
}

impl ResponsesRequest {
    /// The request is ambiguous for auto-detection purposes when `input`
    /// is present alongside `messages` (spec §4.3 only reroutes when the
    /// signal is unambiguous).
    pub fn is_plain_string_input(&self) -> bool {
        self.input.is_string()
    }
}
