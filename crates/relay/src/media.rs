//! `POST /v1/images/generations`, `POST /v1/audio/transcriptions`,
//! `POST /v1/audio/translations`, `POST /v1/audio/speech` (spec §6): the
//! remaining OpenAI-wire endpoints that don't fit the chat-shaped pipeline.
//! Transcription/translation forward the uploaded file straight through as
//! multipart; duration for billing is probed from the upload itself, so no
//! response parsing is needed to settle. Speech synthesis bills on the
//! returned audio's probed duration instead, since there is no input
//! duration to probe.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Multipart, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use crate::bearer_token;
use crate::controller::RelayController;
use crate::error::{RelayError, RelayResult};
use crate::meta::{Meta, RelayMode};
use crate::pricing::{PriceResolver, QuotaLedger, Usage};
use crate::wire_openai;

const DEFAULT_IMAGE_SIZE: &str = "1024x1024";
const DEFAULT_IMAGE_QUALITY: &str = "standard";
/// Rough English speaking rate, used only to pre-reserve quota for a
/// speech-synthesis request before the real output duration is known.
const ASSUMED_CHARACTERS_PER_SECOND: f64 = 15.0;

pub fn router(controller: Arc<RelayController>) -> Router {
    Router::new()
        .route("/v1/images/generations", post(generate_image))
        .route("/v1/audio/transcriptions", post(transcribe))
        .route("/v1/audio/translations", post(translate))
        .route("/v1/audio/speech", post(synthesize_speech))
        .with_state(controller)
}

#[derive(Debug, Deserialize)]
struct ImageGenerationRequest {
    model: String,
    prompt: String,
    #[serde(default)]
    n: Option<u32>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    quality: Option<String>,
    #[serde(default)]
    response_format: Option<String>,
    #[serde(default)]
    user: Option<String>,
}

async fn generate_image(State(controller): State<Arc<RelayController>>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    match handle_image(&controller, &headers, &body).await {
        Ok(value) => Json(value).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn handle_image(controller: &RelayController, headers: &HeaderMap, body: &[u8]) -> RelayResult<Value> {
    let start = Instant::now();
    let request: ImageGenerationRequest = serde_json::from_slice(body).map_err(|e| RelayError::InvalidRequest(e.to_string()))?;

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

    let resolver = PriceResolver::new(controller.config());
    let (min_images, max_images) = resolver.image_count_bounds(&selected.channel.config, &selected.actual_model_name);
    if min_images > 0 && n < min_images {
        return Err(RelayError::InvalidRequest(format!("n must be at least {min_images} for this model")));
    }
    if max_images > 0 && n > max_images {
        return Err(RelayError::InvalidRequest(format!("n must be at most {max_images} for this model")));
    }

    let size = request.size.clone().unwrap_or_else(|| DEFAULT_IMAGE_SIZE.to_string());
    let quality = request.quality.clone().unwrap_or_else(|| DEFAULT_IMAGE_QUALITY.to_string());

    let api = wire_openai::api_config(&selected.channel.config)?;
    let url = wire_openai::request_url(selected.channel.config.channel_type(), api, &selected.actual_model_name, "images/generations")?;

    let mut upstream_body = serde_json::json!({
        "model": selected.actual_model_name,
        "prompt": request.prompt,
        "n": n,
        "size": size,
        "quality": quality,
    });
    if let Some(response_format) = &request.response_format {
        upstream_body["response_format"] = serde_json::json!(response_format);
    }
    if let Some(user_id) = &request.user {
        upstream_body["user"] = serde_json::json!(user_id);
    }

    let prompt_tokens_estimate = controller.token_counter().count_text(&model, &request.prompt);
    let charge = resolver.price_image(&selected.channel.config, &selected.actual_model_name, &size, &quality, n, prompt_tokens_estimate, &group);

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
        mode: RelayMode::Image,
        is_stream: false,
        prompt_tokens_estimate,
    };

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

            let usage = Usage {
                prompt_tokens: prompt_tokens_estimate,
                ..Usage::default()
            };
            controller.log_request(&meta, &user, &token, &usage, charge, start).await;

            Ok(parsed)
        }
        Err(err) => {
            controller.record_channel_outcome(&meta.channel_id, &Err(err.cheap_clone())).await;
            ledger.settle(&user.id, &token.key, charge, 0).await?;
            Err(err)
        }
    }
}

struct UploadedFile {
    bytes: Vec<u8>,
    content_type: Option<String>,
}

struct TranscriptionForm {
    model: String,
    file: UploadedFile,
    language: Option<String>,
    prompt: Option<String>,
    response_format: Option<String>,
    temperature: Option<String>,
}

async fn read_transcription_form(multipart: &mut Multipart) -> RelayResult<TranscriptionForm> {
    let mut model = None;
    let mut file = None;
    let mut language = None;
    let mut prompt = None;
    let mut response_format = None;
    let mut temperature = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RelayError::InvalidRequest(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| RelayError::InvalidRequest(format!("failed to read uploaded file: {e}")))?;
                file = Some(UploadedFile { bytes: bytes.to_vec(), content_type });
            }
            "model" => model = Some(field_text(field).await?),
            "language" => language = Some(field_text(field).await?),
            "prompt" => prompt = Some(field_text(field).await?),
            "response_format" => response_format = Some(field_text(field).await?),
            "temperature" => temperature = Some(field_text(field).await?),
            _ => {}
        }
    }

    Ok(TranscriptionForm {
        model: model.ok_or_else(|| RelayError::InvalidRequest("model field is required".to_string()))?,
        file: file.ok_or_else(|| RelayError::InvalidRequest("file field is required".to_string()))?,
        language,
        prompt,
        response_format,
        temperature,
    })
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> RelayResult<String> {
    field.text().await.map_err(|e| RelayError::InvalidRequest(format!("malformed form field: {e}")))
}

async fn transcribe(State(controller): State<Arc<RelayController>>, headers: HeaderMap, multipart: Multipart) -> Response {
    match handle_audio_upload(&controller, &headers, multipart, "audio/transcriptions", RelayMode::Audio).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn translate(State(controller): State<Arc<RelayController>>, headers: HeaderMap, multipart: Multipart) -> Response {
    match handle_audio_upload(&controller, &headers, multipart, "audio/translations", RelayMode::Audio).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_audio_upload(
    controller: &RelayController,
    headers: &HeaderMap,
    mut multipart: Multipart,
    upstream_path: &'static str,
    mode: RelayMode,
) -> RelayResult<Response> {
    let start = Instant::now();
    let form = read_transcription_form(&mut multipart).await?;

    if form.file.bytes.is_empty() {
        return Err(RelayError::InvalidRequest("uploaded file must not be empty".to_string()));
    }

    let token_key = bearer_token(headers)?.to_string();
    let (user, token) = controller.authenticate(&token_key).await?;

    if !token.allows_model(&form.model) {
        return Err(RelayError::Permission(format!("token is not allowed to use model '{}'", form.model)));
    }

    let group = token.effective_group(&user).to_string();
    let model = form.model.clone();

    let selected = controller
        .select_channel_for(&group, &model, |record| wire_openai::serves_openai_wire(record.config.channel_type()))
        .await?;

    let duration_seconds = controller.duration_prober().probe_seconds(&form.file.bytes, form.file.content_type.as_deref());

    let resolver = PriceResolver::new(controller.config());
    let charge = resolver.price_audio(&selected.channel.config, &selected.actual_model_name, duration_seconds, &group);

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
        mode,
        is_stream: false,
        prompt_tokens_estimate: 0,
    };

    let api = wire_openai::api_config(&selected.channel.config)?;
    let url = wire_openai::request_url(selected.channel.config.channel_type(), api, &selected.actual_model_name, upstream_path)?;

    let mut upstream_form = reqwest::multipart::Form::new()
        .text("model", selected.actual_model_name.clone())
        .part(
            "file",
            reqwest::multipart::Part::bytes(form.file.bytes)
                .mime_str(form.file.content_type.as_deref().unwrap_or("application/octet-stream"))
                .map_err(|e| RelayError::InvalidRequest(format!("invalid file content type: {e}")))?,
        );
    if let Some(language) = form.language {
        upstream_form = upstream_form.text("language", language);
    }
    if let Some(prompt) = form.prompt {
        upstream_form = upstream_form.text("prompt", prompt);
    }
    if let Some(response_format) = form.response_format {
        upstream_form = upstream_form.text("response_format", response_format);
    }
    if let Some(temperature) = form.temperature {
        upstream_form = upstream_form.text("temperature", temperature);
    }

    let builder = wire_openai::authorize(selected.channel.config.channel_type(), api, controller.http_client().post(&url));

    let result = async {
        let response = builder
            .multipart(upstream_form)
            .send()
            .await
            .map_err(|e| RelayError::upstream(e.to_string(), "openai_error"))?;
        let response = wire_openai::raise_for_status(response, "openai_error").await?;
        let content_type = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RelayError::upstream(format!("failed to read upstream response: {e}"), "openai_error"))?;
        Ok::<_, RelayError>((content_type, bytes))
    }
    .await;

    match result {
        Ok((content_type, bytes)) => {
            controller.record_channel_outcome(&meta.channel_id, &Ok(())).await;
            ledger.settle(&user.id, &token.key, charge, charge).await?;

            let usage = Usage::default();
            controller.log_request(&meta, &user, &token, &usage, charge, start).await;

            Ok(([(axum::http::header::CONTENT_TYPE, content_type)], bytes).into_response())
        }
        Err(err) => {
            controller.record_channel_outcome(&meta.channel_id, &Err(err.cheap_clone())).await;
            ledger.settle(&user.id, &token.key, charge, 0).await?;
            Err(err)
        }
    }
}

#[derive(Debug, Deserialize)]
struct SpeechRequest {
    model: String,
    input: String,
    voice: String,
    #[serde(default)]
    response_format: Option<String>,
    #[serde(default)]
    speed: Option<f64>,
}

async fn synthesize_speech(State(controller): State<Arc<RelayController>>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    match handle_speech(&controller, &headers, &body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_speech(controller: &RelayController, headers: &HeaderMap, body: &[u8]) -> RelayResult<Response> {
    let start = Instant::now();
    let request: SpeechRequest = serde_json::from_slice(body).map_err(|e| RelayError::InvalidRequest(e.to_string()))?;

    if request.input.is_empty() {
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

    let resolver = PriceResolver::new(controller.config());
    let estimated_seconds = request.input.chars().count() as f64 / ASSUMED_CHARACTERS_PER_SECOND;
    let reservation = resolver.price_audio(&selected.channel.config, &selected.actual_model_name, estimated_seconds, &group);

    let ledger = QuotaLedger::new(controller.repository().as_ref());
    ledger.reserve(&user.id, &token.key, reservation).await?;

    let meta = Meta {
        request_id: format!("req_{}", uuid::Uuid::new_v4().simple()),
        user_id: user.id.clone(),
        token_key: token.key.clone(),
        channel_id: selected.channel.id.clone(),
        channel_type: selected.channel.config.channel_type(),
        actual_model_name: selected.actual_model_name.clone(),
        original_model_name: model.clone(),
        group: group.clone(),
        mode: RelayMode::Audio,
        is_stream: false,
        prompt_tokens_estimate: 0,
    };

    let api = wire_openai::api_config(&selected.channel.config)?;
    let url = wire_openai::request_url(selected.channel.config.channel_type(), api, &selected.actual_model_name, "audio/speech")?;

    let mut upstream_body = serde_json::json!({
        "model": selected.actual_model_name,
        "input": request.input,
        "voice": request.voice,
    });
    if let Some(response_format) = &request.response_format {
        upstream_body["response_format"] = serde_json::json!(response_format);
    }
    if let Some(speed) = request.speed {
        upstream_body["speed"] = serde_json::json!(speed);
    }

    let builder = wire_openai::authorize(selected.channel.config.channel_type(), api, controller.http_client().post(&url));

    let result = async {
        let response = builder
            .json(&upstream_body)
            .send()
            .await
            .map_err(|e| RelayError::upstream(e.to_string(), "openai_error"))?;
        let response = wire_openai::raise_for_status(response, "openai_error").await?;
        let content_type = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RelayError::upstream(format!("failed to read upstream response: {e}"), "openai_error"))?;
        Ok::<_, RelayError>((content_type, bytes))
    }
    .await;

    match result {
        Ok((content_type, bytes)) => {
            controller.record_channel_outcome(&meta.channel_id, &Ok(())).await;

            let actual_seconds = controller.duration_prober().probe_seconds(&bytes, Some(&content_type));
            let actual = resolver.price_audio(&selected.channel.config, &selected.actual_model_name, actual_seconds, &group);
            ledger.settle(&user.id, &token.key, reservation, actual).await?;

            let usage = Usage::default();
            controller.log_request(&meta, &user, &token, &usage, actual, start).await;

            Ok(([(axum::http::header::CONTENT_TYPE, content_type)], bytes).into_response())
        }
        Err(err) => {
            controller.record_channel_outcome(&meta.channel_id, &Err(err.cheap_clone())).await;
            ledger.settle(&user.id, &token.key, reservation, 0).await?;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_image_size_and_quality_are_sane() {
        assert_eq!(DEFAULT_IMAGE_SIZE, "1024x1024");
        assert_eq!(DEFAULT_IMAGE_QUALITY, "standard");
    }

    #[test]
    fn speech_duration_estimate_scales_with_input_length() {
        let short = "hi".chars().count() as f64 / ASSUMED_CHARACTERS_PER_SECOND;
        let long = "hi".repeat(100).chars().count() as f64 / ASSUMED_CHARACTERS_PER_SECOND;
        assert!(long > short);
    }
}
