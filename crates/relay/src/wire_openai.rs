//! Shared OpenAI-wire-dialect request building. `adaptor::openai` uses
//! this for chat; the embeddings, rerank, image, and audio endpoints
//! (spec §6) reuse the same URL/auth rules since they're served by the
//! same vendor family regardless of which concrete endpoint path is hit.
//! Anthropic/Google/Bedrock have their own native wire shapes and never
//! dispatch through here.

use config::{ApiChannelConfig, ChannelConfig, ChannelType};
use secrecy::ExposeSecret;

use crate::error::{RelayError, RelayResult};

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_AZURE_API_VERSION: &str = "2024-08-01-preview";

/// Whether `channel_type` serves the OpenAI wire dialect. Embeddings,
/// rerank, image, and audio are only ever dispatched to one of these.
pub fn serves_openai_wire(channel_type: ChannelType) -> bool {
    matches!(channel_type, ChannelType::Openai | ChannelType::AzureOpenai | ChannelType::OpenaiCompatible)
}

pub fn api_config(channel: &ChannelConfig) -> RelayResult<&ApiChannelConfig> {
    match channel {
        ChannelConfig::Openai(c) | ChannelConfig::AzureOpenai(c) | ChannelConfig::OpenaiCompatible(c) => Ok(c),
        _ => Err(RelayError::Internal(anyhow::anyhow!(
            "channel does not speak the OpenAI wire dialect"
        ))),
    }
}

/// Build the request URL for `path` (e.g. `"chat/completions"`,
/// `"embeddings"`, `"images/generations"`) against this channel, honoring
/// Azure's deployment-style URL and `api-version` query parameter.
pub fn request_url(channel_type: ChannelType, api: &ApiChannelConfig, model: &str, path: &str) -> RelayResult<String> {
    match channel_type {
        ChannelType::Openai => {
            let base = api.base_url.as_deref().unwrap_or(DEFAULT_OPENAI_BASE_URL);
            Ok(format!("{base}/{path}"))
        }
        ChannelType::OpenaiCompatible => {
            let base = api
                .base_url
                .as_deref()
                .ok_or_else(|| RelayError::OneApi("openai-compatible channel requires base_url".to_string()))?;
            Ok(format!("{}/{path}", base.trim_end_matches('/')))
        }
        ChannelType::AzureOpenai => {
            let base = api
                .base_url
                .as_deref()
                .ok_or_else(|| RelayError::OneApi("azure-openai channel requires base_url".to_string()))?;
            let deployment = api.deployment_id.as_deref().unwrap_or(model);
            let api_version = api.api_version.as_deref().unwrap_or(DEFAULT_AZURE_API_VERSION);

            Ok(format!(
                "{}/openai/deployments/{deployment}/{path}?api-version={api_version}",
                base.trim_end_matches('/')
            ))
        }
        _ => Err(RelayError::Internal(anyhow::anyhow!("channel does not speak the OpenAI wire dialect"))),
    }
}

pub fn authorize(channel_type: ChannelType, api: &ApiChannelConfig, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match channel_type {
        ChannelType::AzureOpenai => builder.header("api-key", api.api_key.expose_secret()),
        _ => builder.bearer_auth(api.api_key.expose_secret()),
    }
}

/// Map a non-2xx HTTP response to a `RelayError`, same status-code rules
/// as the chat adaptor uses (spec §7).
pub async fn raise_for_status(response: reqwest::Response, vendor_tag: &'static str) -> RelayResult<reqwest::Response> {
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
        _ => RelayError::upstream(body, vendor_tag),
    })
}
