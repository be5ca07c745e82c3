//! The relay crate: wire dialects, the vendor adaptor layer, channel
//! selection/health, pricing/billing, and the controller pipeline that ties
//! them together, plus the axum router that exposes it all as
//! ChatCompletions/Responses/Messages HTTP endpoints (spec §4).

pub mod adaptor;
pub mod async_task;
pub mod channel;
pub mod controller;
pub mod dialect;
pub mod embeddings;
pub mod encode;
pub mod error;
pub mod http_client;
pub mod media;
pub mod meta;
pub mod normalized;
pub mod pricing;
pub mod repository;
pub mod rerank;
mod sse;
pub mod stream;
pub mod token_counter;
pub mod video;
pub mod wire_openai;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response, Sse};
use axum::routing::post;
use axum::{Json, Router};
use config::Config;
use serde_json::Value;

pub use error::{AnthropicResult, RelayError, RelayResult};

use crate::controller::{ChatCall, RelayController, RelayOutcome};
use crate::dialect::{Dialect, Reroute, reroute_for};
use crate::error::AnthropicErrorResponse;
use crate::meta::{Meta, RelayMode};
use crate::normalized::NormalizedRequest;
use crate::repository::Repository;
use crate::sse::{DialectStream, StreamDialect};

struct AppState {
    controller: Arc<RelayController>,
}

/// Build the axum router for the chat-shaped surface (spec §4): format
/// auto-detection is handled per-handler rather than as middleware, since
/// rerouting changes which response *encoder* a request uses, not just
/// which internal handler runs.
///
/// Constructs its own `RelayController`. Callers that also need to mount
/// the admin surface (which shares channel health/cooldown state with the
/// chat pipeline) should build a `RelayController` themselves and use
/// [`router_with_controller`] instead.
pub async fn router(config: Arc<Config>, repo: Arc<dyn Repository>) -> anyhow::Result<Router> {
    let controller = RelayController::new(config, repo)?;
    Ok(router_with_controller(Arc::new(controller)))
}

/// Build the chat-shaped router from a `RelayController` the caller
/// already owns, so it can be shared with other routers (e.g. the admin
/// surface) mounted on the same process.
pub fn router_with_controller(controller: Arc<RelayController>) -> Router {
    let state = Arc::new(AppState { controller: controller.clone() });

    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(responses))
        .route("/v1/messages", post(messages))
        .with_state(state)
        .merge(crate::embeddings::router(controller.clone()))
        .merge(crate::rerank::router(controller.clone()))
        .merge(crate::media::router(controller.clone()))
        .merge(crate::video::router(controller))
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> RelayResult<&str> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| RelayError::AuthenticationFailed("missing Authorization header".to_string()))?;

    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| RelayError::AuthenticationFailed("Authorization header must be 'Bearer <token>'".to_string()))
}

pub(crate) fn now_unix() -> i64 {
    jiff::Timestamp::now().as_second()
}

/// Which dialect error shape and streaming frame shape `effective_dialect`
/// implies, independent of which endpoint the request physically arrived
/// at (spec §4.3: a transparently-rerouted request is answered in the
/// dialect it was actually shaped as, not the one it was posted to).
fn relay_mode_for(dialect: Dialect) -> RelayMode {
    match dialect {
        Dialect::ChatCompletions => RelayMode::Chat,
        Dialect::Responses => RelayMode::Responses,
        Dialect::Messages => RelayMode::Messages,
    }
}

/// Parse the raw body as JSON and, when auto-detection is enabled, decide
/// whether to answer it as `arrived`'s dialect, transparently reroute it
/// to the dialect it actually looks like, or tell the client to resubmit
/// at the canonical path.
fn resolve_dialect(state: &AppState, arrived: Dialect, body: &Value) -> Reroute {
    if !state.controller.config().server.auto_detect_api_format {
        return Reroute::None;
    }

    reroute_for(arrived, body, state.controller.config().server.auto_detect_api_format_action)
}

async fn chat_completions(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    dispatch(&state, &headers, Dialect::ChatCompletions, &body).await
}

async fn responses(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    dispatch(&state, &headers, Dialect::Responses, &body).await
}

async fn messages(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    dispatch(&state, &headers, Dialect::Messages, &body).await
}

/// Shared entry point for all three chat-shaped endpoints: parse, resolve
/// auto-detection, authenticate, run the controller pipeline, and encode
/// the result in whichever dialect the request actually is.
async fn dispatch(state: &AppState, headers: &HeaderMap, arrived: Dialect, raw: &Bytes) -> Response {
    let value: Value = match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(err) => return dialect_error(arrived, RelayError::InvalidRequest(format!("invalid JSON body: {err}"))),
    };

    let effective = match resolve_dialect(state, arrived, &value) {
        Reroute::None => arrived,
        Reroute::Transparent { dialect } => dialect,
        Reroute::Redirect { dialect } => {
            return Redirect::temporary(dialect.canonical_path()).into_response();
        }
    };

    let request = match parse_normalized(effective, &value) {
        Ok(request) => request,
        Err(err) => return dialect_error(effective, err),
    };

    let token_key = match bearer_token(headers) {
        Ok(key) => key.to_string(),
        Err(err) => return dialect_error(effective, err),
    };

    let (user, token) = match state.controller.authenticate(&token_key).await {
        Ok(pair) => pair,
        Err(err) => return dialect_error(effective, err),
    };

    let call = ChatCall {
        token_key: &token_key,
        request,
        mode: relay_mode_for(effective),
    };

    match state.controller.relay_chat(&user, &token, call).await {
        Ok((meta, outcome)) => encode_outcome(effective, meta, outcome),
        Err(err) => dialect_error(effective, err),
    }
}

fn parse_normalized(dialect: Dialect, value: &Value) -> RelayResult<NormalizedRequest> {
    match dialect {
        Dialect::ChatCompletions => {
            let request: crate::dialect::chat::ChatCompletionRequest =
                serde_json::from_value(value.clone()).map_err(|err| RelayError::InvalidRequest(err.to_string()))?;
            Ok(NormalizedRequest::from(&request))
        }
        Dialect::Responses => {
            let request: crate::dialect::responses::ResponsesRequest =
                serde_json::from_value(value.clone()).map_err(|err| RelayError::InvalidRequest(err.to_string()))?;
            Ok(NormalizedRequest::from(&request))
        }
        Dialect::Messages => {
            let request: crate::dialect::messages::MessagesRequest =
                serde_json::from_value(value.clone()).map_err(|err| RelayError::InvalidRequest(err.to_string()))?;
            Ok(NormalizedRequest::from(&request))
        }
    }
}

fn encode_outcome(dialect: Dialect, _meta: Meta, outcome: RelayOutcome) -> Response {
    let created = now_unix();

    match outcome {
        RelayOutcome::Buffered(response) => match dialect {
            Dialect::ChatCompletions => Json(crate::encode::chat_response_from_normalized(response, created)).into_response(),
            Dialect::Responses => Json(crate::encode::responses_response_from_normalized(response)).into_response(),
            Dialect::Messages => Json(crate::encode::messages_response_from_normalized(response)).into_response(),
        },
        RelayOutcome::Streaming(stream) => {
            let stream_dialect = match dialect {
                Dialect::ChatCompletions => StreamDialect::Chat,
                Dialect::Responses => StreamDialect::Responses,
                Dialect::Messages => StreamDialect::Messages,
            };

            Sse::new(DialectStream::new(stream, stream_dialect, created)).into_response()
        }
    }
}

fn dialect_error(dialect: Dialect, err: RelayError) -> Response {
    match dialect {
        Dialect::Messages => AnthropicErrorResponse::from(err).into_response(),
        Dialect::ChatCompletions | Dialect::Responses => err.into_response(),
    }
}

/// A minimal health-check handler, mirroring the teacher's own
/// liveness endpoint conventions.
pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}
