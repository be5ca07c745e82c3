//! Google Gemini `generateContent`/`streamGenerateContent` wire protocol.
//! Authentication is a `key` query parameter rather than a header, and
//! roles are `user`/`model` instead of `user`/`assistant`.

use async_trait::async_trait;
use config::{ApiChannelConfig, ChannelConfig, ChannelType};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use secrecy::ExposeSecret;
use serde_json::{Value, json};

use crate::error::{RelayError, RelayResult};
use crate::normalized::{NormalizedChunk, NormalizedRequest, NormalizedResponse, NormalizedRole};
use crate::pricing::Usage;

use super::{Adaptor, ChunkStream};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GoogleAdaptor;

impl GoogleAdaptor {
    fn api_config<'a>(channel: &'a ChannelConfig) -> RelayResult<&'a ApiChannelConfig> {
        match channel {
            ChannelConfig::Google(c) => Ok(c),
            _ => Err(RelayError::Internal(anyhow::anyhow!(
                "non-google channel dispatched to the Google adaptor"
            ))),
        }
    }

    fn gemini_role(role: NormalizedRole) -> &'static str {
        match role {
            NormalizedRole::Assistant => "model",
            _ => "user",
        }
    }

    fn convert_request(request: &NormalizedRequest) -> Value {
        let contents: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != NormalizedRole::System)
            .map(|message| {
                json!({
                    "role": Self::gemini_role(message.role),
                    "parts": [{"text": message.text}],
                })
            })
            .collect();

        let mut body = json!({ "contents": contents });

        if let Some(system) = &request.system {
            body["systemInstruction"] = json!({ "parts": [{"text": system}] });
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(max_tokens) = request.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            generation_config.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            generation_config.insert("topP".to_string(), json!(top_p));
        }
        if !request.stop.is_empty() {
            generation_config.insert("stopSequences".to_string(), json!(request.stop));
        }

        if !generation_config.is_empty() {
            body["generationConfig"] = Value::Object(generation_config);
        }

        body
    }

    fn parse_response(body: &Value, requested_model: &str) -> RelayResult<NormalizedResponse> {
        let candidate = body
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .ok_or_else(|| RelayError::upstream("response carried no candidates", "gemini_error"))?;

        let text = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let usage = body.get("usageMetadata").map(parse_usage).unwrap_or_default();

        Ok(NormalizedResponse {
            id: String::new(),
            model: requested_model.to_string(),
            text,
            tool_calls: None,
            finish_reason: candidate.get("finishReason").and_then(Value::as_str).map(str::to_string),
            usage,
            service_tier: None,
            system_fingerprint: None,
        })
    }
}

fn parse_usage(usage: &Value) -> Usage {
    Usage {
        prompt_tokens: usage.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0),
        completion_tokens: usage.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0),
        cached_prompt_tokens: usage.get("cachedContentTokenCount").and_then(Value::as_u64).unwrap_or(0),
        cache_write_5m_tokens: 0,
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
        401 | 403 => RelayError::AuthenticationFailed(body),
        404 => RelayError::NotFound(body),
        429 => RelayError::RateLimitExceeded(body),
        400 => RelayError::InvalidRequest(body),
        _ => RelayError::upstream(body, "gemini_error"),
    })
}

#[async_trait]
impl Adaptor for GoogleAdaptor {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Google
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
        let url = format!(
            "{}/v1beta/models/{actual_model}:generateContent?key={}",
            base.trim_end_matches('/'),
            api.api_key.expose_secret()
        );

        let body = Self::convert_request(request);
        let response = client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::upstream(e.to_string(), "gemini_error"))?;

        let response = raise_for_status(response).await?;
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| RelayError::upstream(format!("invalid JSON response: {e}"), "gemini_error"))?;

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
        let url = format!(
            "{}/v1beta/models/{actual_model}:streamGenerateContent?alt=sse&key={}",
            base.trim_end_matches('/'),
            api.api_key.expose_secret()
        );

        let body = Self::convert_request(request);
        let response = client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::upstream(e.to_string(), "gemini_error"))?;

        let response = raise_for_status(response).await?;
        let events = response.bytes_stream().eventsource();
        let model = actual_model.to_string();

        let stream = events.filter_map(move |event| {
            let model = model.clone();

            async move {
                let Ok(event) = event else {
                    return Some(Err(RelayError::upstream("malformed SSE frame", "gemini_error")));
                };

                let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
                    return None;
                };

                let candidate = value.get("candidates").and_then(Value::as_array).and_then(|c| c.first());

                let delta_text = candidate
                    .and_then(|c| c.get("content"))
                    .and_then(|c| c.get("parts"))
                    .and_then(Value::as_array)
                    .and_then(|parts| parts.first())
                    .and_then(|part| part.get("text"))
                    .and_then(Value::as_str)
                    .map(str::to_string);

                let finish_reason = candidate
                    .and_then(|c| c.get("finishReason"))
                    .and_then(Value::as_str)
                    .map(str::to_string);

                Some(Ok(NormalizedChunk {
                    id: String::new(),
                    model: model.clone(),
                    delta_text,
                    delta_tool_calls: None,
                    finish_reason,
                    usage: value.get("usageMetadata").map(parse_usage),
                }))
            }
        });

        Ok(Box::pin(stream))
    }
}
