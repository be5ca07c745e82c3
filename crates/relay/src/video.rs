//! `POST /v1/videos`, `GET /v1/videos/:task_id`, `DELETE /v1/videos/:task_id`
//! (spec §6, §4.6): video generation is long-running, so the creation call
//! only returns a `task_id`; retrieving or cancelling the job later must
//! land back on the channel that created it rather than going through
//! channel selection again, since the job only exists on that one upstream
//! account. `async_task::TaskBindingStore` is what makes that pinning
//! possible.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use crate::async_task::TaskBindingStore;
use crate::bearer_token;
use crate::controller::RelayController;
use crate::error::{RelayError, RelayResult};
use crate::meta::{Meta, RelayMode};
use crate::pricing::{PriceResolver, QuotaLedger, Usage};
use crate::repository::ChannelRecord;
use crate::wire_openai;

const DEFAULT_VIDEO_RESOLUTION: &str = "1280x720";
const DEFAULT_VIDEO_SECONDS: f64 = 5.0;
const TASK_TYPE: &str = "video";

pub fn router(controller: Arc<RelayController>) -> Router {
    Router::new()
        .route("/v1/videos", post(create_video))
        .route("/v1/videos/{task_id}", get(retrieve_video).delete(cancel_video))
        .with_state(controller)
}

#[derive(Debug, Deserialize)]
struct VideoGenerationRequest {
    model: String,
    prompt: String,
    #[serde(default)]
    resolution: Option<String>,
    #[serde(default)]
    seconds: Option<f64>,
    #[serde(default)]
    n: Option<u32>,
}

async fn create_video(State(controller): State<Arc<RelayController>>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    match handle_create(&controller, &headers, &body).await {
        Ok(value) => Json(value).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn handle_create(controller: &RelayController, headers: &HeaderMap, body: &[u8]) -> RelayResult<Value> {
    let start = Instant::now();
    let request: VideoGenerationRequest = serde_json::from_slice(body).map_err(|e| RelayError::InvalidRequest(e.to_string()))?;

    if request.prompt.is_empty() {
        return Err(RelayError::InvalidRequest("prompt must not be empty".to_string()));
    }

    let n = request.n.unwrap_or(1);
    if n == 0 {
        return Err(RelayError::InvalidRequest("n must be greater than zero".to_string()));
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

    let resolution = request.resolution.clone().unwrap_or_else(|| DEFAULT_VIDEO_RESOLUTION.to_string());
    let seconds = request.seconds.unwrap_or(DEFAULT_VIDEO_SECONDS);
    if seconds <= 0.0 {
        return Err(RelayError::InvalidRequest("seconds must be greater than zero".to_string()));
    }

    let resolver = PriceResolver::new(controller.config());
    let per_job = resolver.price_video(&selected.channel.config, &selected.actual_model_name, &resolution, seconds, &group);
    let charge = per_job.saturating_mul(n as u64);

    let ledger = QuotaLedger::new(controller.repository().as_ref());
    ledger.reserve(&user.id, &token.key, charge).await?;

    let meta = Meta {
        request_id: format!("req_{}", uuid::Uuid::new_v4().simple()),
        user_id: user.id.clone(),
        token_key: token.key.clone(),
        channel_id: selected.channel.id.clone(),
        channel_type: selected.channel.config.channel_type(),
        actual_model_name: selected.actual_model_name.clone(),
        original_model_name: model.clone(),
        group: group.clone(),
        mode: RelayMode::Video,
        is_stream: false,
        prompt_tokens_estimate: 0,
    };

    let api = wire_openai::api_config(&selected.channel.config)?;
    let url = wire_openai::request_url(selected.channel.config.channel_type(), api, &selected.actual_model_name, "videos")?;

    let upstream_body = serde_json::json!({
        "model": selected.actual_model_name,
        "prompt": request.prompt,
        "resolution": resolution,
        "seconds": seconds,
        "n": n,
    });

    let builder = wire_openai::authorize(selected.channel.config.channel_type(), api, controller.http_client().post(&url));

    let result = async {
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

    match result {
        Ok(parsed) => {
            controller.record_channel_outcome(&meta.channel_id, &Ok(())).await;
            ledger.settle(&user.id, &token.key, charge, charge).await?;

            let usage = Usage::default();
            controller.log_request(&meta, &user, &token, &usage, charge, start).await;

            if let Some(task_id) = parsed.get("id").and_then(Value::as_str) {
                let store = TaskBindingStore::new(controller.repository().as_ref());
                store
                    .bind(
                        task_id,
                        selected.channel.id.clone(),
                        model.clone(),
                        selected.actual_model_name.clone(),
                        TASK_TYPE,
                        crate::now_unix(),
                    )
                    .await?;
            }

            Ok(parsed)
        }
        Err(err) => {
            controller.record_channel_outcome(&meta.channel_id, &Err(err.cheap_clone())).await;
            ledger.settle(&user.id, &token.key, charge, 0).await?;
            Err(err)
        }
    }
}

/// Resolve a task_id to the channel that created it. A binding miss has
/// no group/model to fall back to a fresh selection with (spec §4.6
/// describes the miss path for the normal chat-shaped case, where the
/// request carries its own group/model; a bare task_id poll doesn't), so
/// it surfaces as `not_found_error` instead.
async fn pinned_channel(controller: &RelayController, task_id: &str) -> RelayResult<(ChannelRecord, String)> {
    let store = TaskBindingStore::new(controller.repository().as_ref());
    let binding = store.lookup(task_id).await?;
    store.touch(task_id, crate::now_unix()).await?;

    let channel = controller
        .repository()
        .get_channel(&binding.channel_id)
        .await
        .map_err(|_| RelayError::NotFound(format!("channel '{}' bound to task '{task_id}' no longer exists", binding.channel_id)))?;

    Ok((channel, binding.actual_model))
}

async fn retrieve_video(State(controller): State<Arc<RelayController>>, headers: HeaderMap, Path(task_id): Path<String>) -> Response {
    match handle_retrieve(&controller, &headers, &task_id).await {
        Ok(value) => Json(value).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn handle_retrieve(controller: &RelayController, headers: &HeaderMap, task_id: &str) -> RelayResult<Value> {
    let token_key = bearer_token(headers)?.to_string();
    controller.authenticate(&token_key).await?;

    let (channel, actual_model) = pinned_channel(controller, task_id).await?;

    let api = wire_openai::api_config(&channel.config)?;
    let url = wire_openai::request_url(channel.config.channel_type(), api, &actual_model, &format!("videos/{task_id}"))?;
    let builder = wire_openai::authorize(channel.config.channel_type(), api, controller.http_client().get(&url));

    let response = builder.send().await.map_err(|e| RelayError::upstream(e.to_string(), "openai_error"))?;
    let response = wire_openai::raise_for_status(response, "openai_error").await?;

    response
        .json::<Value>()
        .await
        .map_err(|e| RelayError::upstream(format!("invalid JSON response: {e}"), "openai_error"))
}

async fn cancel_video(State(controller): State<Arc<RelayController>>, headers: HeaderMap, Path(task_id): Path<String>) -> Response {
    match handle_cancel(&controller, &headers, &task_id).await {
        Ok(value) => Json(value).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn handle_cancel(controller: &RelayController, headers: &HeaderMap, task_id: &str) -> RelayResult<Value> {
    let token_key = bearer_token(headers)?.to_string();
    controller.authenticate(&token_key).await?;

    let (channel, actual_model) = pinned_channel(controller, task_id).await?;

    let api = wire_openai::api_config(&channel.config)?;
    let url = wire_openai::request_url(channel.config.channel_type(), api, &actual_model, &format!("videos/{task_id}"))?;
    let builder = wire_openai::authorize(channel.config.channel_type(), api, controller.http_client().delete(&url));

    let response = builder.send().await.map_err(|e| RelayError::upstream(e.to_string(), "openai_error"))?;
    let response = wire_openai::raise_for_status(response, "openai_error").await?;

    let store = TaskBindingStore::new(controller.repository().as_ref());
    store.release(task_id).await?;

    response
        .json::<Value>()
        .await
        .map_err(|e| RelayError::upstream(format!("invalid JSON response: {e}"), "openai_error"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_video_resolution_and_duration_are_sane() {
        assert_eq!(DEFAULT_VIDEO_RESOLUTION, "1280x720");
        assert!(DEFAULT_VIDEO_SECONDS > 0.0);
    }
}
