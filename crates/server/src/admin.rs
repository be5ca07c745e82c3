//! The admin HTTP surface (spec §6): a thin, repository-backed CRUD API
//! consumed by the out-of-scope dashboard. Every handler here is a
//! read-through or direct-write over `relay::repository::Repository`
//! plus the channel health tracker the chat pipeline already maintains;
//! none of it reasons about dialects, adaptors, or streaming.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use config::ModelConfig;
use relay::controller::RelayController;
use relay::pricing::{QuotaLedger, adaptor_default_catalog};
use relay::repository::{RequestLogType, UserRole};
use serde::{Deserialize, Serialize};

pub fn router(controller: Arc<RelayController>) -> axum::Router {
    axum::Router::new()
        .route("/api/channel/pricing/{id}", axum::routing::get(get_channel_pricing).put(put_channel_pricing))
        .route("/api/channel/default-pricing", axum::routing::get(get_default_pricing))
        .route("/api/user/{id}", axum::routing::get(get_user))
        .route("/api/token/{id}", axum::routing::get(get_token))
        .route("/api/token/consume", axum::routing::post(consume_token))
        .route("/api/cost/request/{id}", axum::routing::get(get_request_cost))
        .route("/api/debug/channel/{id}/debug", axum::routing::post(debug_channel))
        .route("/api/status/channel", axum::routing::get(list_channel_status))
        .with_state(controller)
}

#[derive(Debug, thiserror::Error)]
enum AdminError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

fn map_repo_err(err: relay::repository::RepositoryError) -> AdminError {
    use relay::repository::RepositoryError;

    match err {
        RepositoryError::NotFound { kind, id } => AdminError::NotFound(format!("{kind} '{id}'")),
        RepositoryError::Conflict { kind, id } => AdminError::BadRequest(format!("conflicting update for {kind} '{id}'")),
        RepositoryError::Backend(err) => AdminError::Internal(err),
    }
}

async fn get_channel_pricing(
    State(controller): State<Arc<RelayController>>,
    Path(id): Path<String>,
) -> Result<Json<BTreeMap<String, ModelConfig>>, AdminError> {
    let channel = controller.repository().get_channel(&id).await.map_err(map_repo_err)?;
    Ok(Json(channel.config.common().model_configs.clone()))
}

#[derive(Debug, Deserialize)]
struct PutChannelPricing {
    model: String,
    pricing: ModelConfig,
}

async fn put_channel_pricing(
    State(controller): State<Arc<RelayController>>,
    Path(id): Path<String>,
    Json(body): Json<PutChannelPricing>,
) -> Result<StatusCode, AdminError> {
    controller
        .repository()
        .set_channel_model_pricing(&id, &body.model, body.pricing)
        .await
        .map_err(map_repo_err)?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct DefaultPricingQuery {
    #[serde(rename = "type")]
    channel_type: u8,
}

fn channel_type_from_u8(n: u8) -> Result<config::ChannelType, AdminError> {
    use config::ChannelType::*;

    match n {
        0 => Ok(Openai),
        1 => Ok(AzureOpenai),
        2 => Ok(Anthropic),
        3 => Ok(Google),
        4 => Ok(Bedrock),
        5 => Ok(OpenaiCompatible),
        other => Err(AdminError::BadRequest(format!("unknown channel type {other}"))),
    }
}

async fn get_default_pricing(
    Query(query): Query<DefaultPricingQuery>,
) -> Result<Json<BTreeMap<String, ModelConfig>>, AdminError> {
    let channel_type = channel_type_from_u8(query.channel_type)?;
    Ok(Json(adaptor_default_catalog(channel_type)))
}

#[derive(Debug, Serialize)]
struct UserView {
    id: String,
    role: &'static str,
    quota: i64,
    used_quota: i64,
    group: String,
}

async fn get_user(State(controller): State<Arc<RelayController>>, Path(id): Path<String>) -> Result<Json<UserView>, AdminError> {
    let user = controller.repository().get_user(&id).await.map_err(map_repo_err)?;

    Ok(Json(UserView {
        id: user.id,
        role: match user.role {
            UserRole::Common => "common",
            UserRole::Admin => "admin",
            UserRole::Root => "root",
        },
        quota: user.quota,
        used_quota: user.used_quota,
        group: user.group,
    }))
}

#[derive(Debug, Serialize)]
struct TokenView {
    key: String,
    user_id: String,
    name: String,
    status: &'static str,
    unlimited: bool,
    remain_quota: Option<i64>,
    models: Vec<String>,
    group_override: Option<String>,
}

async fn get_token(State(controller): State<Arc<RelayController>>, Path(id): Path<String>) -> Result<Json<TokenView>, AdminError> {
    let token = controller.repository().get_token(&id).await.map_err(map_repo_err)?;

    let (unlimited, remain_quota) = match token.quota {
        relay::repository::TokenQuota::Limited(n) => (false, Some(n)),
        relay::repository::TokenQuota::Unlimited => (true, None),
    };

    Ok(Json(TokenView {
        key: token.key,
        user_id: token.user_id,
        name: token.name,
        status: match token.status {
            relay::repository::TokenStatus::Enabled => "enabled",
            relay::repository::TokenStatus::Disabled => "disabled",
            relay::repository::TokenStatus::Expired => "expired",
            relay::repository::TokenStatus::Exhausted => "exhausted",
        },
        unlimited,
        remain_quota,
        models: token.models,
        group_override: token.group_override,
    }))
}

#[derive(Debug, Deserialize)]
struct ConsumeRequest {
    user_id: String,
    token_key: String,
    quota: i64,
    reason: String,
}

/// `POST /api/token/consume`: an external system (e.g. a redemption-code
/// top-up reversal, or a feature billed outside the relay pipeline)
/// charges quota directly, bypassing channel selection and adaptors
/// entirely. Recorded as a `RequestLogType::Manage` entry rather than
/// `Consume` since no upstream call backs it.
async fn consume_token(
    State(controller): State<Arc<RelayController>>,
    Json(body): Json<ConsumeRequest>,
) -> Result<StatusCode, AdminError> {
    if body.quota < 0 {
        return Err(AdminError::BadRequest("quota must be non-negative".to_string()));
    }

    let ledger = QuotaLedger::new(controller.repository().as_ref());
    ledger
        .reserve(&body.user_id, &body.token_key, body.quota as u64)
        .await
        .map_err(|err| AdminError::BadRequest(err.to_string()))?;
    ledger
        .settle(&body.user_id, &body.token_key, body.quota as u64, body.quota as u64)
        .await
        .map_err(|err| AdminError::Internal(anyhow::anyhow!(err.to_string())))?;

    let log = relay::repository::RequestLog {
        timestamp: jiff::Timestamp::now().as_second(),
        user_id: body.user_id,
        username: String::new(),
        token_id: body.token_key,
        token_name: String::new(),
        channel_id: String::new(),
        model_name: String::new(),
        log_type: RequestLogType::Manage,
        prompt_tokens: 0,
        completion_tokens: 0,
        cached_prompt_tokens: 0,
        cached_completion_tokens: 0,
        metadata: serde_json::json!({}),
        quota: body.quota,
        elapsed_time_ms: 0,
        request_id: format!("manage_{}", uuid::Uuid::new_v4().simple()),
        trace_id: String::new(),
        is_stream: false,
        content: body.reason,
    };

    controller.repository().insert_log(log).await.map_err(map_repo_err)?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct RequestCostView {
    request_id: String,
    model_name: String,
    channel_id: String,
    prompt_tokens: u64,
    completion_tokens: u64,
    quota: i64,
    elapsed_time_ms: u64,
    is_stream: bool,
}

async fn get_request_cost(
    State(controller): State<Arc<RelayController>>,
    Path(request_id): Path<String>,
) -> Result<Json<RequestCostView>, AdminError> {
    let log = controller.repository().get_log(&request_id).await.map_err(map_repo_err)?;

    Ok(Json(RequestCostView {
        request_id: log.request_id,
        model_name: log.model_name,
        channel_id: log.channel_id,
        prompt_tokens: log.prompt_tokens,
        completion_tokens: log.completion_tokens,
        quota: log.quota,
        elapsed_time_ms: log.elapsed_time_ms,
        is_stream: log.is_stream,
    }))
}

#[derive(Debug, Serialize)]
struct DebugChannelView {
    channel_id: String,
    enabled: bool,
    auto_disabled: bool,
    health: relay::channel::health::ChannelDebug,
}

/// `POST /api/debug/channel/<id>/debug`: a probe the admin console can
/// issue without affecting channel cooldown (spec §4.1: "the admin
/// console may issue test requests that do not cool down channels").
/// Reports the channel's current eligibility and cooldown snapshot
/// without dispatching anything upstream.
async fn debug_channel(
    State(controller): State<Arc<RelayController>>,
    Path(id): Path<String>,
) -> Result<Json<DebugChannelView>, AdminError> {
    let channel = controller.repository().get_channel(&id).await.map_err(map_repo_err)?;

    Ok(Json(DebugChannelView {
        channel_id: channel.id.clone(),
        enabled: channel.is_enabled(),
        auto_disabled: channel.auto_disabled,
        health: controller.health().debug(&channel.id),
    }))
}

#[derive(Debug, Deserialize)]
struct ChannelStatusQuery {
    #[serde(default = "default_page")]
    p: usize,
    #[serde(default = "default_size")]
    size: usize,
}

fn default_page() -> usize {
    0
}

fn default_size() -> usize {
    20
}

#[derive(Debug, Serialize)]
struct ChannelStatusView {
    id: String,
    enabled: bool,
    auto_disabled: bool,
    balance: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ChannelStatusPage {
    page: usize,
    size: usize,
    total: usize,
    items: Vec<ChannelStatusView>,
}

async fn list_channel_status(
    State(controller): State<Arc<RelayController>>,
    Query(query): Query<ChannelStatusQuery>,
) -> Result<Json<ChannelStatusPage>, AdminError> {
    let mut channels = controller.repository().list_channels().await.map_err(map_repo_err)?;
    channels.sort_by(|a, b| a.id.cmp(&b.id));

    let total = channels.len();
    let start = (query.p * query.size).min(total);
    let end = (start + query.size).min(total);

    let items = channels[start..end]
        .iter()
        .map(|channel| ChannelStatusView {
            id: channel.id.clone(),
            enabled: channel.is_enabled(),
            auto_disabled: channel.auto_disabled,
            balance: channel.balance,
        })
        .collect();

    Ok(Json(ChannelStatusPage {
        page: query.p,
        size: query.size,
        total,
        items,
    }))
}

#[cfg(test)]
mod tests {
    use config::{ApiChannelConfig, ChannelCommon, ChannelConfig};
    use secrecy::SecretString;

    use relay::repository::{InMemoryRepository, Token, TokenQuota, TokenStatus, User};

    use super::*;

    fn controller() -> Arc<RelayController> {
        let repo = Arc::new(InMemoryRepository::new());

        repo.insert_user(User {
            id: "user-1".to_string(),
            role: UserRole::Common,
            quota: 10_000,
            used_quota: 0,
            group: "default".to_string(),
        });

        repo.insert_token(Token {
            key: "token-1".to_string(),
            user_id: "user-1".to_string(),
            name: "default".to_string(),
            status: TokenStatus::Enabled,
            quota: TokenQuota::Limited(10_000),
            models: Vec::new(),
            group_override: None,
        });

        repo.insert_channel(
            "chan-1",
            ChannelConfig::Openai(ApiChannelConfig {
                common: ChannelCommon::default(),
                api_key: SecretString::from("sk-test".to_string()),
                base_url: None,
                deployment_id: None,
                api_version: None,
            }),
        );

        Arc::new(RelayController::new(Arc::new(config::Config::default()), repo).unwrap())
    }

    #[tokio::test]
    async fn get_user_returns_seeded_user() {
        let controller = controller();
        let Json(view) = get_user(State(controller), Path("user-1".to_string())).await.unwrap();
        assert_eq!(view.quota, 10_000);
    }

    #[tokio::test]
    async fn consume_token_charges_quota_and_logs_manage_entry() {
        let controller = controller();

        consume_token(
            State(controller.clone()),
            Json(ConsumeRequest {
                user_id: "user-1".to_string(),
                token_key: "token-1".to_string(),
                quota: 500,
                reason: "redemption code reversal".to_string(),
            }),
        )
        .await
        .unwrap();

        let user = controller.repository().get_user("user-1").await.unwrap();
        assert_eq!(user.quota, 9_500);
    }

    #[tokio::test]
    async fn debug_channel_never_flips_auto_disabled() {
        let controller = controller();
        let Json(view) = debug_channel(State(controller), Path("chan-1".to_string())).await.unwrap();
        assert!(!view.auto_disabled);
    }

    #[tokio::test]
    async fn channel_status_paginates() {
        let controller = controller();
        let Json(page) = list_channel_status(
            State(controller),
            Query(ChannelStatusQuery { p: 0, size: 1 }),
        )
        .await
        .unwrap();

        assert_eq!(page.total, 1);
        assert_eq!(page.items.len(), 1);
    }
}
