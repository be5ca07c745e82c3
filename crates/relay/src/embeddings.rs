//! `POST /v1/embeddings` (spec §6): OpenAI-wire dispatch only, buffered
//! (no streaming dialect exists for embeddings), billed on prompt tokens
//! alone — there is no completion side to an embedding call.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::bearer_token;
use crate::controller::RelayController;
use crate::error::{RelayError, RelayResult};
use crate::meta::{Meta, RelayMode};
use crate::pricing::{PriceResolver, QuotaLedger, Usage};
use crate::wire_openai;

pub fn router(controller: Arc<RelayController>) -> Router {
    Router::new().route("/v1/embeddings", post(create_embeddings)).with_state(controller)
}

#[derive(Debug, Deserialize)]
struct EmbeddingsRequest {
    model: String,
    input: EmbeddingsInput,
    #[serde(default)]
    encoding_format: Option<String>,
    #[serde(default)]
    dimensions: Option<u32>,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingsInput {
    Single(String),
    Many(Vec<String>),
}

impl EmbeddingsInput {
    fn texts(&self) -> Vec<&str> {
        match self {
            Self::Single(text) => vec![text.as_str()],
            Self::Many(texts) => texts.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingsResponse {
    object: &'static str,
    data: Vec<EmbeddingObject>,
    model: String,
    usage: EmbeddingsUsage,
}

#[derive(Debug, Serialize)]
struct EmbeddingObject {
    object: &'static str,
    index: usize,
    embedding: EmbeddingValue,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum EmbeddingValue {
    Float(Vec<f32>),
    Base64(String),
}

#[derive(Debug, Serialize)]
struct EmbeddingsUsage {
    prompt_tokens: u64,
    total_tokens: u64,
}

async fn create_embeddings(State(controller): State<Arc<RelayController>>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    match handle(&controller, &headers, &body).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn handle(controller: &RelayController, headers: &HeaderMap, body: &[u8]) -> RelayResult<EmbeddingsResponse> {
    let start = Instant::now();
    let request: EmbeddingsRequest = serde_json::from_slice(body).map_err(|e| RelayError::InvalidRequest(e.to_string()))?;

    let texts = request.input.texts();
    if texts.is_empty() || texts.iter().all(|t| t.is_empty()) {
        return Err(RelayError::InvalidRequest("input must not be empty".to_string()));
    }

    let token_key = bearer_token(headers)?.to_string();
    let (user, token) = controller.authenticate(&token_key).await?;

    if !token.allows_model(&request.model) {
        return Err(RelayError::Permission(format!("token is not allowed to use model '{}'", request.model)));
    }

    let group = token.effective_group(&user).to_string();
    let model = request.model.clone();

    let selected = controller
        .select_channel_for(&group, &model, |record| wire_openai::serves_openai_wire(record.config.channel_type()))
        .await?;

    let api = wire_openai::api_config(&selected.channel.config)?;
    let url = wire_openai::request_url(selected.channel.config.channel_type(), api, &selected.actual_model_name, "embeddings")?;

    let mut upstream_body = serde_json::json!({
        "model": selected.actual_model_name,
        "input": texts,
        "encoding_format": "float",
    });
    if let Some(dimensions) = request.dimensions {
        upstream_body["dimensions"] = serde_json::json!(dimensions);
    }
    if let Some(user_id) = &request.user {
        upstream_body["user"] = serde_json::json!(user_id);
    }

    let prompt_tokens_estimate: u64 = texts.iter().map(|t| controller.token_counter().count_text(&model, t)).sum();

    let resolver = PriceResolver::new(controller.config());
    let reservation = resolver.price_completion(
        &selected.channel.config,
        &selected.actual_model_name,
        &Usage {
            prompt_tokens: prompt_tokens_estimate,
            ..Usage::default()
        },
        &group,
    );

    let ledger = QuotaLedger::new(controller.repository().as_ref());
    ledger.reserve(&user.id, &token.key, reservation).await?;

    let meta = Meta {
        request_id: format!("req_{}", Uuid::new_v4().simple()),
        user_id: user.id.clone(),
        token_key: token.key.clone(),
        channel_id: selected.channel.id.clone(),
        channel_type: selected.channel.config.channel_type(),
        actual_model_name: selected.actual_model_name.clone(),
        original_model_name: model.clone(),
        group: group.clone(),
        mode: RelayMode::Embeddings,
        is_stream: false,
        prompt_tokens_estimate,
    };

    let result = dispatch(controller, &api.api_key, &url, selected.channel.config.channel_type(), &upstream_body).await;

    match result {
        Ok(parsed) => {
            controller.record_channel_outcome(&meta.channel_id, &Ok(())).await;

            let usage = parse_usage(&parsed);
            let actual = resolver.price_completion(&selected.channel.config, &selected.actual_model_name, &usage, &group);
            ledger.settle(&user.id, &token.key, reservation, actual).await?;

            let data = parse_embeddings(&parsed, request.encoding_format.as_deref())?;
            controller.log_request(&meta, &user, &token, &usage, actual, start).await;

            Ok(EmbeddingsResponse {
                object: "list",
                data,
                model: parsed
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or(&selected.actual_model_name)
                    .to_string(),
                usage: EmbeddingsUsage {
                    prompt_tokens: usage.prompt_tokens,
                    total_tokens: usage.prompt_tokens,
                },
            })
        }
        Err(err) => {
            controller.record_channel_outcome(&meta.channel_id, &Err(err.cheap_clone())).await;
            ledger.settle(&user.id, &token.key, reservation, 0).await?;
            Err(err)
        }
    }
}

async fn dispatch(controller: &RelayController, api: &config::ApiChannelConfig, url: &str, channel_type: config::ChannelType, body: &Value) -> RelayResult<Value> {
    let builder = wire_openai::authorize(channel_type, api, controller.http_client().post(url));

    let response = builder
        .json(body)
        .send()
        .await
        .map_err(|e| RelayError::upstream(e.to_string(), "openai_error"))?;

    let response = wire_openai::raise_for_status(response, "openai_error").await?;

    response
        .json::<Value>()
        .await
        .map_err(|e| RelayError::upstream(format!("invalid JSON response: {e}"), "openai_error"))
}

fn parse_usage(body: &Value) -> Usage {
    let prompt_tokens = body
        .get("usage")
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Usage {
        prompt_tokens,
        ..Usage::default()
    }
}

fn parse_embeddings(body: &Value, encoding_format: Option<&str>) -> RelayResult<Vec<EmbeddingObject>> {
    let data = body
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| RelayError::upstream("response carried no embedding data", "openai_error"))?;

    let base64_requested = encoding_format == Some("base64");

    data.iter()
        .enumerate()
        .map(|(fallback_index, entry)| {
            let index = entry.get("index").and_then(Value::as_u64).map(|i| i as usize).unwrap_or(fallback_index);

            let floats: Vec<f32> = entry
                .get("embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| RelayError::upstream("embedding entry carried no vector", "openai_error"))?
                .iter()
                .filter_map(Value::as_f64)
                .map(|v| v as f32)
                .collect();

            let embedding = if base64_requested {
                let mut bytes = Vec::with_capacity(floats.len() * 4);
                for value in &floats {
                    bytes.extend_from_slice(&value.to_le_bytes());
                }
                EmbeddingValue::Base64(base64::engine::general_purpose::STANDARD.encode(bytes))
            } else {
                EmbeddingValue::Float(floats)
            };

            Ok(EmbeddingObject {
                object: "embedding",
                index,
                embedding,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_input_normalizes_to_one_text() {
        let input = EmbeddingsInput::Single("hello".to_string());
        assert_eq!(input.texts(), vec!["hello"]);
    }

    #[test]
    fn base64_encoding_round_trips_float_bytes() {
        let body = serde_json::json!({"data": [{"index": 0, "embedding": [1.0, -2.5]}]});
        let parsed = parse_embeddings(&body, Some("base64")).unwrap();
        let EmbeddingValue::Base64(encoded) = &parsed[0].embedding else {
            panic!("expected base64 encoding");
        };
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded.len(), 8);
    }

    #[test]
    fn float_encoding_is_default() {
        let body = serde_json::json!({"data": [{"index": 0, "embedding": [1.0, 2.0]}]});
        let parsed = parse_embeddings(&body, None).unwrap();
        assert!(matches!(parsed[0].embedding, EmbeddingValue::Float(_)));
    }
}
