//! Translate a `Normalized*` value back into one vendor-dialect's wire
//! shape. The mirror image of the `From<&Dialect*Request>` impls in
//! `normalized.rs`: those convert inbound bodies into the canonical shape,
//! these convert the canonical reply back out.

use serde_json::{Value, json};

use crate::dialect::chat::{
    ChatCompletionChoice, ChatCompletionChunk, ChatCompletionChunkChoice, ChatCompletionDelta, ChatCompletionResponse,
    CompletionTokensDetails, PromptTokensDetails, Usage as ChatUsage,
};
use crate::dialect::messages::{ContentBlock, MessagesResponse, MessagesUsage};
use crate::dialect::responses::{ResponsesInputTokensDetails, ResponsesResponse, ResponsesUsage};
use crate::normalized::{NormalizedChunk, NormalizedResponse};

fn chat_usage(response: &NormalizedResponse) -> ChatUsage {
    let usage = &response.usage;

    ChatUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.prompt_tokens + usage.completion_tokens,
        prompt_tokens_details: Some(PromptTokensDetails {
            cached_tokens: usage.cached_prompt_tokens,
            cache_write_5m_tokens: usage.cache_write_5m_tokens,
            cache_write_1h_tokens: usage.cache_write_1h_tokens,
        }),
        completion_tokens_details: Some(CompletionTokensDetails::default()),
    }
}

pub fn chat_response_from_normalized(response: NormalizedResponse, created: i64) -> ChatCompletionResponse {
    let usage = chat_usage(&response);

    ChatCompletionResponse {
        id: response.id,
        object: "chat.completion".to_string(),
        created,
        model: response.model,
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: crate::dialect::chat::ChatMessage {
                role: "assistant".to_string(),
                content: Some(Value::String(response.text)),
                name: None,
                tool_calls: response.tool_calls,
                tool_call_id: None,
            },
            finish_reason: response.finish_reason,
        }],
        usage,
        service_tier: response.service_tier,
        system_fingerprint: response.system_fingerprint,
    }
}

pub fn chat_chunk_from_normalized(chunk: NormalizedChunk, created: i64, first: bool) -> ChatCompletionChunk {
    let usage = chunk.usage.as_ref().map(|usage| ChatUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.prompt_tokens + usage.completion_tokens,
        prompt_tokens_details: Some(PromptTokensDetails {
            cached_tokens: usage.cached_prompt_tokens,
            cache_write_5m_tokens: usage.cache_write_5m_tokens,
            cache_write_1h_tokens: usage.cache_write_1h_tokens,
        }),
        completion_tokens_details: Some(CompletionTokensDetails::default()),
    });

    ChatCompletionChunk {
        id: chunk.id,
        object: "chat.completion.chunk".to_string(),
        created,
        model: chunk.model,
        choices: vec![ChatCompletionChunkChoice {
            index: 0,
            delta: ChatCompletionDelta {
                role: if first { Some("assistant".to_string()) } else { None },
                content: chunk.delta_text,
                tool_calls: chunk.delta_tool_calls,
            },
            finish_reason: chunk.finish_reason,
        }],
        usage,
    }
}

pub fn messages_response_from_normalized(response: NormalizedResponse) -> MessagesResponse {
    let mut content = Vec::new();

    if !response.text.is_empty() {
        content.push(ContentBlock::Text { text: response.text });
    }

    if let Some(Value::Array(calls)) = &response.tool_calls {
        for call in calls {
            let id = call.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            let name = call
                .get("function")
                .and_then(|f| f.get("name"))
                .or_else(|| call.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let input = call
                .get("function")
                .and_then(|f| f.get("arguments"))
                .or_else(|| call.get("input"))
                .cloned()
                .unwrap_or(Value::Null);

            content.push(ContentBlock::ToolUse { id, name, input });
        }
    }

    MessagesResponse {
        id: response.id,
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: response.model,
        content,
        stop_reason: response.finish_reason,
        stop_sequence: None,
        usage: MessagesUsage {
            input_tokens: response.usage.prompt_tokens,
            output_tokens: response.usage.completion_tokens,
            cache_creation_input_tokens: response.usage.cache_write_5m_tokens + response.usage.cache_write_1h_tokens,
            cache_read_input_tokens: response.usage.cached_prompt_tokens,
        },
    }
}

/// Anthropic frames a stream as `message_start` -> N * (`content_block_start`,
/// `content_block_delta`*, `content_block_stop`) -> `message_delta` ->
/// `message_stop`. `stream.rs`'s state machine calls this once per inbound
/// chunk and gets back the zero-or-more framed events that chunk implies.
pub fn messages_events_from_chunk(chunk: &NormalizedChunk, is_first: bool, is_last: bool) -> Vec<(String, Value)> {
    let mut events = Vec::new();

    if is_first {
        events.push((
            "message_start".to_string(),
            json!({
                "type": "message_start",
                "message": {
                    "id": chunk.id,
                    "type": "message",
                    "role": "assistant",
                    "model": chunk.model,
                    "content": [],
                    "stop_reason": Value::Null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                },
            }),
        ));
        events.push((
            "content_block_start".to_string(),
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "text", "text": ""},
            }),
        ));
    }

    if let Some(text) = &chunk.delta_text {
        events.push((
            "content_block_delta".to_string(),
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": text},
            }),
        ));
    }

    if is_last {
        events.push((
            "content_block_stop".to_string(),
            json!({"type": "content_block_stop", "index": 0}),
        ));
        events.push((
            "message_delta".to_string(),
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": chunk.finish_reason},
                "usage": chunk.usage.as_ref().map(|usage| json!({
                    "input_tokens": usage.prompt_tokens,
                    "output_tokens": usage.completion_tokens,
                })).unwrap_or(Value::Null),
            }),
        ));
        events.push(("message_stop".to_string(), json!({"type": "message_stop"})));
    }

    events
}

pub fn responses_response_from_normalized(response: NormalizedResponse) -> ResponsesResponse {
    let output = json!({
        "type": "message",
        "role": "assistant",
        "content": [{"type": "output_text", "text": response.text}],
    });

    ResponsesResponse {
        id: response.id,
        object: "response".to_string(),
        status: "completed".to_string(),
        model: response.model,
        output: vec![output],
        usage: ResponsesUsage {
            input_tokens: response.usage.prompt_tokens,
            output_tokens: response.usage.completion_tokens,
            total_tokens: response.usage.prompt_tokens + response.usage.completion_tokens,
            input_tokens_details: ResponsesInputTokensDetails {
                cached_tokens: response.usage.cached_prompt_tokens,
            },
        },
        service_tier: response.service_tier,
    }
}

/// The Responses API frames a stream as a flat sequence of typed events
/// (`response.created`, `response.output_text.delta`, `response.completed`,
/// ...), each its own SSE `data:` payload with no separate `event:` line.
pub fn responses_events_from_chunk(chunk: &NormalizedChunk, is_first: bool, is_last: bool) -> Vec<Value> {
    let mut events = Vec::new();

    if is_first {
        events.push(json!({
            "type": "response.created",
            "response": {"id": chunk.id, "object": "response", "status": "in_progress", "model": chunk.model},
        }));
    }

    if let Some(text) = &chunk.delta_text {
        events.push(json!({
            "type": "response.output_text.delta",
            "delta": text,
        }));
    }

    if is_last {
        events.push(json!({
            "type": "response.completed",
            "response": {
                "id": chunk.id,
                "object": "response",
                "status": "completed",
                "model": chunk.model,
                "usage": chunk.usage.as_ref().map(|usage| json!({
                    "input_tokens": usage.prompt_tokens,
                    "output_tokens": usage.completion_tokens,
                    "total_tokens": usage.prompt_tokens + usage.completion_tokens,
                })),
            },
        }));
    }

    events
}
