//! Anthropic Messages wire protocol (`x-api-key`/`anthropic-version`
//! headers, named SSE events rather than a `type` field alone).

use async_trait::async_trait;
use config::{ApiChannelConfig, ChannelConfig, ChannelType};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use secrecy::ExposeSecret;
use serde_json::{Value, json};

use crate::error::{RelayError, RelayResult};
use crate::normalized::{NormalizedChunk, NormalizedRequest, NormalizedResponse};
use crate::pricing::Usage;

use super::{Adaptor, ChunkStream};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdaptor;

impl AnthropicAdaptor {
    fn api_config<'a>(channel: &'a ChannelConfig) -> RelayResult<&'a ApiChannelConfig> {
        match channel {
            ChannelConfig::Anthropic(c) => Ok(c),
            _ => Err(RelayError::Internal(anyhow::anyhow!(
                "non-anthropic channel dispatched to the Anthropic adaptor"
            ))),
        }
    }

    fn convert_request(request: &NormalizedRequest, model: &str, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != crate::normalized::NormalizedRole::System)
            .map(|message| {
                json!({
                    "role": message.role.as_str(),
                    "content": message.raw_content.clone().unwrap_or(Value::String(message.text.clone())),
                })
            })
            .collect();

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(4096),
            "stream": stream,
        });

        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if !request.stop.is_empty() {
            body["stop_sequences"] = json!(request.stop);
        }
        if let Some(tools) = &request.tools {
            body["tools"] = json!(tools);
        }
        if let Some(tool_choice) = &request.tool_choice {
            body["tool_choice"] = tool_choice.clone();
        }

        body
    }

    fn parse_response(body: &Value, requested_model: &str) -> RelayResult<NormalizedResponse> {
        let content = body.get("content").and_then(Value::as_array).cloned().unwrap_or_default();

        let text = content
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("");

        let tool_calls = content
            .iter()
            .find(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
            .cloned();

        let usage = body.get("usage").map(parse_usage).unwrap_or_default();

        Ok(NormalizedResponse {
            id: body.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            model: body
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(requested_model)
                .to_string(),
            text,
            tool_calls,
            finish_reason: body.get("stop_reason").and_then(Value::as_str).map(str::to_string),
            usage,
            service_tier: None,
            system_fingerprint: None,
        })
    }
}

fn parse_usage(usage: &Value) -> Usage {
    Usage {
        prompt_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        completion_tokens: usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
        cached_prompt_tokens: usage.get("cache_read_input_tokens").and_then(Value::as_u64).unwrap_or(0),
        // Anthropic doesn't distinguish 5m/1h write buckets in the response usage block
        // the way the request's cache_control TTL implies; the 5m bucket is the default.
        cache_write_5m_tokens: usage.get("cache_creation_input_tokens").and_then(Value::as_u64).unwrap_or(0),
        cache_write_1h_tokens: 0,
    }
}

async fn raise_for_status(response: reqwest::Response) -> RelayResult<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    Err(match status.as_u16() {
        401 => RelayError::AuthenticationFailed(body),
        403 => RelayError::Forbidden(body),
        404 => RelayError::NotFound(body),
        429 => RelayError::RateLimitExceeded(body),
        400 => RelayError::InvalidRequest(body),
        _ => RelayError::upstream(body, "anthropic_error"),
    })
}

#[async_trait]
impl Adaptor for AnthropicAdaptor {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Anthropic
    }

    async fn send_chat(
        &self,
        client: &reqwest::Client,
        channel: &ChannelConfig,
        request: &NormalizedRequest,
        actual_model: &str,
    ) -> RelayResult<NormalizedResponse> {
        let api = Self::api_config(channel)?;
        let base = api.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let url = format!("{}/v1/messages", base.trim_end_matches('/'));
        let body = Self::convert_request(request, actual_model, false);

        let response = client
            .post(url)
            .header("x-api-key", api.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::upstream(e.to_string(), "anthropic_error"))?;

        let response = raise_for_status(response).await?;
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| RelayError::upstream(format!("invalid JSON response: {e}"), "anthropic_error"))?;

        Self::parse_response(&parsed, actual_model)
    }

    async fn send_chat_stream(
        &self,
        client: &reqwest::Client,
        channel: &ChannelConfig,
        request: &NormalizedRequest,
        actual_model: &str,
    ) -> RelayResult<ChunkStream> {
        let api = Self::api_config(channel)?;
        let base = api.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let url = format!("{}/v1/messages", base.trim_end_matches('/'));
        let body = Self::convert_request(request, actual_model, true);

        let response = client
            .post(url)
            .header("x-api-key", api.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::upstream(e.to_string(), "anthropic_error"))?;

        let response = raise_for_status(response).await?;
        let events = response.bytes_stream().eventsource();
        let model = actual_model.to_string();

        let stream = events.filter_map(move |event| {
            let model = model.clone();

            async move {
                let Ok(event) = event else {
                    return Some(Err(RelayError::upstream("malformed SSE frame", "anthropic_error")));
                };

                let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
                    return None;
                };

                Some(Ok(chunk_from_event(&event.event, &value, &model)))
            }
        });

        Ok(Box::pin(stream))
    }
}

/// Anthropic frames deltas as `content_block_delta` (text), `message_delta`
/// (stop_reason + usage), and `message_stop` (end of stream, no payload of
/// its own); this collapses all three into one `NormalizedChunk` shape.
fn chunk_from_event(event_name: &str, value: &Value, model: &str) -> NormalizedChunk {
    let delta_text = value
        .get("delta")
        .and_then(|d| d.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let finish_reason = value
        .get("delta")
        .and_then(|d| d.get("stop_reason"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let usage = value.get("usage").map(parse_usage);

    NormalizedChunk {
        id: value.get("message").and_then(|m| m.get("id")).and_then(Value::as_str).unwrap_or_default().to_string(),
        model: model.to_string(),
        delta_text,
        delta_tool_calls: None,
        finish_reason: finish_reason.or_else(|| (event_name == "message_stop").then(|| "stop".to_string())),
        usage,
    }
}
