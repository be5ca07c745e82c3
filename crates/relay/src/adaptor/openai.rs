//! OpenAI ChatCompletions wire protocol, shared by the `openai`,
//! `azure-openai`, and `openai-compatible` channel types. Azure differs
//! only in its URL shape (`/openai/deployments/{id}/chat/completions`)
//! and its `api-key` header instead of `Authorization: Bearer`; the
//! generic compatible adaptor differs only in requiring an explicit
//! `base_url`. `Variant` parameterizes those two differences rather than
//! duplicating the request/response conversion three times.

use async_trait::async_trait;
use config::{ApiChannelConfig, ChannelConfig, ChannelType, ToolingConfig};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::{Value, json};

use crate::error::RelayError;
use crate::error::RelayResult;
use crate::normalized::{NormalizedChunk, NormalizedRequest, NormalizedResponse};
use crate::pricing::Usage;
use crate::wire_openai;

use super::{Adaptor, ChunkStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    Openai,
    Azure,
    Compatible,
}

pub struct OpenAiAdaptor {
    variant: Variant,
}

impl OpenAiAdaptor {
    pub fn openai() -> Self {
        Self { variant: Variant::Openai }
    }

    pub fn azure() -> Self {
        Self { variant: Variant::Azure }
    }

    pub fn compatible() -> Self {
        Self { variant: Variant::Compatible }
    }

    fn api_config<'a>(&self, channel: &'a ChannelConfig) -> RelayResult<&'a ApiChannelConfig> {
        match channel {
            ChannelConfig::Openai(c) if self.variant == Variant::Openai => Ok(c),
            ChannelConfig::AzureOpenai(c) if self.variant == Variant::Azure => Ok(c),
            ChannelConfig::OpenaiCompatible(c) if self.variant == Variant::Compatible => Ok(c),
            _ => Err(RelayError::Internal(anyhow::anyhow!(
                "channel type does not match the OpenAI adaptor variant it was dispatched to"
            ))),
        }
    }

    fn request_url(&self, api: &ApiChannelConfig, model: &str) -> RelayResult<String> {
        wire_openai::request_url(self.channel_type(), api, model, "chat/completions")
    }

    fn authorize(&self, api: &ApiChannelConfig, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        wire_openai::authorize(self.channel_type(), api, builder)
    }

    fn convert_request(&self, request: &NormalizedRequest, model: &str, stream: bool) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + request.system.is_some() as usize);

        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }

        for message in &request.messages {
            let mut entry = json!({
                "role": message.role.as_str(),
                "content": message.raw_content.clone().unwrap_or(Value::String(message.text.clone())),
            });

            if let Some(name) = &message.name {
                entry["name"] = json!(name);
            }

            if let Some(tool_calls) = &message.tool_calls {
                entry["tool_calls"] = tool_calls.clone();
            }

            if let Some(tool_call_id) = &message.tool_call_id {
                entry["tool_call_id"] = json!(tool_call_id);
            }

            messages.push(entry);
        }

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_completion_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if !request.stop.is_empty() {
            body["stop"] = json!(request.stop);
        }
        if let Some(tools) = &request.tools {
            body["tools"] = json!(tools);
        }
        if let Some(tool_choice) = &request.tool_choice {
            body["tool_choice"] = tool_choice.clone();
        }
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }

        body
    }

    fn parse_response(body: &Value, requested_model: &str) -> RelayResult<NormalizedResponse> {
        let choice = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .ok_or_else(|| RelayError::upstream("response carried no choices", "openai_error"))?;

        let message = choice.get("message").cloned().unwrap_or(Value::Null);
        let text = message.get("content").and_then(Value::as_str).unwrap_or_default().to_string();

        let usage = body.get("usage").map(parse_usage).unwrap_or_default();

        Ok(NormalizedResponse {
            id: body.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            model: body
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(requested_model)
                .to_string(),
            text,
            tool_calls: message.get("tool_calls").cloned(),
            finish_reason: choice.get("finish_reason").and_then(Value::as_str).map(str::to_string),
            usage,
            service_tier: body.get("service_tier").and_then(Value::as_str).map(str::to_string),
            system_fingerprint: body.get("system_fingerprint").and_then(Value::as_str).map(str::to_string),
        })
    }

    fn parse_chunk(body: &Value) -> NormalizedChunk {
        let choice = body.get("choices").and_then(Value::as_array).and_then(|c| c.first());
        let delta = choice.and_then(|c| c.get("delta"));

        NormalizedChunk {
            id: body.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            model: body.get("model").and_then(Value::as_str).unwrap_or_default().to_string(),
            delta_text: delta.and_then(|d| d.get("content")).and_then(Value::as_str).map(str::to_string),
            delta_tool_calls: delta.and_then(|d| d.get("tool_calls")).cloned(),
            finish_reason: choice.and_then(|c| c.get("finish_reason")).and_then(Value::as_str).map(str::to_string),
            usage: body.get("usage").map(parse_usage),
        }
    }
}

fn parse_usage(usage: &Value) -> Usage {
    Usage {
        prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        completion_tokens: usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
        cached_prompt_tokens: usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cache_write_5m_tokens: usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cache_write_5m_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cache_write_1h_tokens: usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cache_write_1h_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0),
    }
}

async fn raise_for_status(response: reqwest::Response) -> RelayResult<reqwest::Response> {
    wire_openai::raise_for_status(response, "openai_error").await
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn channel_type(&self) -> ChannelType {
        match self.variant {
            Variant::Openai => ChannelType::Openai,
            Variant::Azure => ChannelType::AzureOpenai,
            Variant::Compatible => ChannelType::OpenaiCompatible,
        }
    }

    async fn send_chat(
        &self,
        client: &reqwest::Client,
        channel: &ChannelConfig,
        request: &NormalizedRequest,
        actual_model: &str,
    ) -> RelayResult<NormalizedResponse> {
        let api = self.api_config(channel)?;
        let url = self.request_url(api, actual_model)?;
        let body = self.convert_request(request, actual_model, false);

        let builder = self.authorize(api, client.post(url));
        let response = raise_for_status(builder.json(&body).send().await.map_err(|e| RelayError::upstream(e.to_string(), "openai_error"))?).await?;

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| RelayError::upstream(format!("invalid JSON response: {e}"), "openai_error"))?;

        Self::parse_response(&parsed, actual_model)
    }

    async fn send_chat_stream(
        &self,
        client: &reqwest::Client,
        channel: &ChannelConfig,
        request: &NormalizedRequest,
        actual_model: &str,
    ) -> RelayResult<ChunkStream> {
        let api = self.api_config(channel)?;
        let url = self.request_url(api, actual_model)?;
        let body = self.convert_request(request, actual_model, true);

        let builder = self.authorize(api, client.post(url));
        let response = raise_for_status(builder.json(&body).send().await.map_err(|e| RelayError::upstream(e.to_string(), "openai_error"))?).await?;

        let events = response.bytes_stream().eventsource();

        let stream = events.filter_map(|event| async move {
            let Ok(event) = event else {
                return Some(Err(RelayError::upstream("malformed SSE frame", "openai_error")));
            };

            if event.data.trim() == "[DONE]" {
                return None;
            }

            match serde_json::from_str::<Value>(&event.data) {
                Ok(value) => Some(Ok(Self::parse_chunk(&value))),
                Err(_) => None,
            }
        });

        Ok(Box::pin(stream))
    }

    fn default_tooling_config(&self) -> ToolingConfig {
        ToolingConfig::default()
    }
}
