//! A provider-agnostic chat request/response shape every `Adaptor`
//! converts to and from. Kept deliberately lean (string content, JSON-value
//! tool calls) rather than a full multi-modal content-block AST: one-api's
//! job is routing, selection, and billing fidelity across vendors, not
//! exhaustively modeling every content type each vendor's SDK accepts. A
//! request whose content is richer than plain text (images, audio) keeps
//! its original JSON content array in `raw_content` so an adaptor that
//! knows how to forward it can, while everything upstream of adaptors only
//! ever reasons about the flattened text.

use serde_json::Value;

/// A chat request translated out of whichever dialect the client used.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub model: String,
    pub messages: Vec<NormalizedMessage>,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stream: bool,
    pub stop: Vec<String>,
    pub tools: Option<Vec<Value>>,
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub role: NormalizedRole,
    /// Flattened textual content. Non-text parts (images, tool results)
    /// are preserved verbatim in `raw_content` for adaptors that forward
    /// content as-is rather than reinterpreting it.
    pub text: String,
    pub raw_content: Option<Value>,
    pub tool_calls: Option<Value>,
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizedRole {
    System,
    User,
    Assistant,
    Tool,
}

impl NormalizedRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(role: &str) -> Self {
        match role {
            "system" => Self::System,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            _ => Self::User,
        }
    }
}

/// A completed (non-streaming) chat response, already billed.
#[derive(Debug, Clone)]
pub struct NormalizedResponse {
    pub id: String,
    pub model: String,
    pub text: String,
    pub tool_calls: Option<Value>,
    pub finish_reason: Option<String>,
    pub usage: crate::pricing::Usage,
    pub service_tier: Option<String>,
    pub system_fingerprint: Option<String>,
}

/// One delta of a streaming chat response.
#[derive(Debug, Clone, Default)]
pub struct NormalizedChunk {
    pub id: String,
    pub model: String,
    pub delta_text: Option<String>,
    pub delta_tool_calls: Option<Value>,
    pub finish_reason: Option<String>,
    pub usage: Option<crate::pricing::Usage>,
}

impl From<&crate::dialect::chat::ChatCompletionRequest> for NormalizedRequest {
    fn from(request: &crate::dialect::chat::ChatCompletionRequest) -> Self {
        let mut system = None;
        let mut messages = Vec::with_capacity(request.messages.len());

        for message in &request.messages {
            let role = NormalizedRole::parse(&message.role);
            let text = message.as_text().map(str::to_string).unwrap_or_default();

            if role == NormalizedRole::System && system.is_none() {
                system = Some(text.clone());
            }

            messages.push(NormalizedMessage {
                role,
                text,
                raw_content: message.content.clone(),
                tool_calls: message.tool_calls.clone(),
                tool_call_id: message.tool_call_id.clone(),
                name: message.name.clone(),
            });
        }

        Self {
            model: request.model.clone(),
            messages,
            system,
            max_tokens: request.max_completion_tokens.or(request.max_tokens),
            temperature: request.temperature,
            top_p: request.top_p,
            stream: request.stream,
            stop: stop_strings(request.stop.as_ref()),
            tools: request.tools.clone(),
            tool_choice: request.tool_choice.clone(),
        }
    }
}

fn stop_strings(stop: Option<&Value>) -> Vec<String> {
    match stop {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        _ => Vec::new(),
    }
}

impl From<&crate::dialect::messages::MessagesRequest> for NormalizedRequest {
    fn from(request: &crate::dialect::messages::MessagesRequest) -> Self {
        let system = request.system.as_ref().map(system_to_text);

        let messages = request
            .messages
            .iter()
            .map(|message| NormalizedMessage {
                role: NormalizedRole::parse(&message.role),
                text: content_to_text(&message.content),
                raw_content: Some(message.content.clone()),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            })
            .collect();

        Self {
            model: request.model.clone(),
            messages,
            system,
            max_tokens: Some(request.max_tokens),
            temperature: request.temperature,
            top_p: request.top_p,
            stream: request.stream,
            stop: request.stop_sequences.clone().unwrap_or_default(),
            tools: request.tools.clone(),
            tool_choice: request.tool_choice.clone(),
        }
    }
}

fn system_to_text(system: &Value) -> String {
    match system {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

impl From<&crate::dialect::responses::ResponsesRequest> for NormalizedRequest {
    fn from(request: &crate::dialect::responses::ResponsesRequest) -> Self {
        let text = content_to_text(&request.input);
        let messages = if text.is_empty() {
            Vec::new()
        } else {
            vec![NormalizedMessage {
                role: NormalizedRole::User,
                text: text.clone(),
                raw_content: Some(request.input.clone()),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            }]
        };

        Self {
            model: request.model.clone(),
            messages,
            system: request.instructions.clone(),
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stream: request.stream,
            stop: Vec::new(),
            tools: request.tools.clone(),
            tool_choice: request.tool_choice.clone(),
        }
    }
}
