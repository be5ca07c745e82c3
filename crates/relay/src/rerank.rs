//! `POST /v1/rerank`, `POST /v2/rerank` (spec §6): Cohere-compatible
//! rerank. Strict validation (spec §9 "strict mode ... for rerank at
//! minimum") rejects unknown top-level keys via `deny_unknown_fields`
//! rather than the permissive backward-compatible parsing chat/completions
//! uses.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
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
    Router::new()
        .route("/v1/rerank", post(rerank))
        .route("/v2/rerank", post(rerank))
        .with_state(controller)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RerankRequest {
    model: String,
    query: String,
    documents: Vec<RerankDocument>,
    #[serde(default)]
    top_n: Option<u32>,
    #[serde(default)]
    max_tokens_per_doc: Option<u32>,
    #[serde(default)]
    priority: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RerankDocument {
    Text(String),
    Object { text: String },
}

impl RerankDocument {
    fn text(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Object { text } => text,
        }
    }
}

#[derive(Debug, Serialize)]
struct RerankResponse {
    id: String,
    results: Vec<RerankResult>,
    meta: RerankMeta,
}

#[derive(Debug, Serialize)]
struct RerankResult {
    index: usize,
    relevance_score: f64,
}

#[derive(Debug, Serialize)]
struct RerankMeta {
    api_version: RerankApiVersion,
    billed_units: RerankBilledUnits,
}

#[derive(Debug, Serialize)]
struct RerankApiVersion {
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct RerankBilledUnits {
    search_units: u64,
}

async fn rerank(State(controller): State<Arc<RelayController>>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    match handle(&controller, &headers, &body).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

fn validate(request: &RerankRequest) -> RelayResult<()> {
    if request.query.is_empty() {
        return Err(RelayError::InvalidRequest("query must not be empty".to_string()));
    }
    if request.documents.is_empty() {
        return Err(RelayError::InvalidRequest("documents must not be empty".to_string()));
    }
    if let Some(top_n) = request.top_n {
        if top_n == 0 {
            return Err(RelayError::InvalidRequest("top_n must be greater than zero".to_string()));
        }
    }
    if let Some(priority) = request.priority {
        if priority > 999 {
            return Err(RelayError::InvalidRequest("priority must be in [0, 999]".to_string()));
        }
    }
    Ok(())
}

async fn handle(controller: &RelayController, headers: &HeaderMap, body: &[u8]) -> RelayResult<RerankResponse> {
    let start = Instant::now();
    let request: RerankRequest = serde_json::from_slice(body).map_err(|e| RelayError::InvalidRequest(e.to_string()))?;
    validate(&request)?;

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
    let url = wire_openai::request_url(selected.channel.config.channel_type(), api, &selected.actual_model_name, "rerank")?;

    let documents: Vec<&str> = request.documents.iter().map(RerankDocument::text).collect();

    let mut upstream_body = serde_json::json!({
        "model": selected.actual_model_name,
        "query": request.query,
        "documents": documents,
    });
    if let Some(top_n) = request.top_n {
        upstream_body["top_n"] = serde_json::json!(top_n);
    }
    if let Some(max_tokens_per_doc) = request.max_tokens_per_doc {
        upstream_body["max_tokens_per_doc"] = serde_json::json!(max_tokens_per_doc);
    }

    let prompt_tokens_estimate = controller.token_counter().count_text(&model, &request.query)
        + documents.iter().map(|d| controller.token_counter().count_text(&model, d)).sum::<u64>();

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
        mode: RelayMode::Rerank,
        is_stream: false,
        prompt_tokens_estimate,
    };

    let builder = wire_openai::authorize(selected.channel.config.channel_type(), api, controller.http_client().post(&url));

    let dispatch_result = async {
        let response = builder
            .json(&upstream_body)
            .send()
            .await
            .map_err(|e| RelayError::upstream(e.to_string(), "openai_error"))?;
        let response = wire_openai::raise_for_status(response, "openai_error").await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| RelayError::upstream(format!("invalid JSON response: {e}"), "openai_error"))
    }
    .await;

    match dispatch_result {
        Ok(parsed) => {
            controller.record_channel_outcome(&meta.channel_id, &Ok(())).await;

            let usage = Usage {
                prompt_tokens: prompt_tokens_estimate,
                ..Usage::default()
            };
            let actual = resolver.price_completion(&selected.channel.config, &selected.actual_model_name, &usage, &group);
            ledger.settle(&user.id, &token.key, reservation, actual).await?;

            let results = parse_results(&parsed, documents.len())?;
            controller.log_request(&meta, &user, &token, &usage, actual, start).await;

            Ok(RerankResponse {
                id: format!("rerank_{}", Uuid::new_v4().simple()),
                results,
                meta: RerankMeta {
                    api_version: RerankApiVersion { version: "1" },
                    billed_units: RerankBilledUnits {
                        search_units: documents.len() as u64,
                    },
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

fn parse_results(body: &Value, document_count: usize) -> RelayResult<Vec<RerankResult>> {
    let raw = body
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| RelayError::upstream("response carried no results", "openai_error"))?;

    raw.iter()
        .enumerate()
        .map(|(fallback_index, entry)| {
            let index = entry.get("index").and_then(Value::as_u64).map(|i| i as usize).unwrap_or(fallback_index);
            if index >= document_count {
                return Err(RelayError::upstream("result index out of range", "openai_error"));
            }
            let relevance_score = entry
                .get("relevance_score")
                .or_else(|| entry.get("score"))
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            Ok(RerankResult { index, relevance_score })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_documents() {
        let request = RerankRequest {
            model: "rerank-v3".to_string(),
            query: "hello".to_string(),
            documents: Vec::new(),
            top_n: None,
            max_tokens_per_doc: None,
            priority: None,
        };
        assert!(validate(&request).is_err());
    }

    #[test]
    fn validate_rejects_priority_out_of_range() {
        let request = RerankRequest {
            model: "rerank-v3".to_string(),
            query: "hello".to_string(),
            documents: vec![RerankDocument::Text("doc".to_string())],
            top_n: None,
            max_tokens_per_doc: None,
            priority: Some(1000),
        };
        assert!(validate(&request).is_err());
    }

    #[test]
    fn rejects_unknown_top_level_keys() {
        let body = serde_json::json!({
            "model": "rerank-v3",
            "query": "hi",
            "documents": ["a"],
            "bogus_field": true,
        });
        let err = serde_json::from_value::<RerankRequest>(body).unwrap_err();
        assert!(err.to_string().contains("bogus_field") || err.to_string().contains("unknown field"));
    }

    #[test]
    fn parse_results_maps_relevance_scores() {
        let body = serde_json::json!({"results": [{"index": 1, "relevance_score": 0.9}, {"index": 0, "relevance_score": 0.2}]});
        let results = parse_results(&body, 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].index, 1);
    }
}
