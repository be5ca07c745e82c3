//! The error taxonomy (spec §7) as a `thiserror` enum, mapped to HTTP
//! status/type and rendered in the caller's dialect.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type RelayResult<T> = std::result::Result<T, RelayError>;

/// The one-api error taxonomy. Variants name what is signaled, matching
/// spec §7 one-to-one; HTTP status and the client-facing `type` string are
/// derived from the variant, never hand-picked at the call site.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed body, missing required field, out-of-range parameter, or
    /// an unknown JSON key under strict validation.
    #[error("{0}")]
    InvalidRequest(String),

    /// Missing or invalid bearer token.
    #[error("{0}")]
    AuthenticationFailed(String),

    /// Token lacks the capability for this request (e.g. model not in its
    /// allowlist).
    #[error("{0}")]
    Permission(String),

    /// Quota pre-reservation or a mid-stream quota check failed.
    #[error("{0}")]
    InsufficientQuota(String),

    /// Per-channel or per-token rate limit exceeded.
    #[error("{0}")]
    RateLimitExceeded(String),

    /// Upstream content-policy rejection.
    #[error("{0}")]
    Forbidden(String),

    /// A referenced resource (task id, request id, channel) doesn't exist.
    #[error("{0}")]
    NotFound(String),

    /// The upstream provider returned an unexpected payload, or a 5xx
    /// judged non-retryable. `vendor_tag` preserves provenance
    /// (`ali_error`, `gemini_error`, ...) when known.
    #[error("{message}")]
    Upstream { message: String, vendor_tag: Option<String> },

    /// Validation that fails inside one-api before any upstream contact,
    /// e.g. "no enabled channel available".
    #[error("{0}")]
    OneApi(String),

    /// A bug in one-api itself. The message is never shown to clients.
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl RelayError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            Self::Permission(_) | Self::Forbidden(_) | Self::InsufficientQuota(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::OneApi(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The `type` string the client sees in the error envelope.
    pub fn error_type(&self) -> &str {
        match self {
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::AuthenticationFailed(_) => "authentication_error",
            Self::Permission(_) => "permission_error",
            Self::InsufficientQuota(_) => "insufficient_quota",
            Self::RateLimitExceeded(_) => "rate_limit_error",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found_error",
            Self::Upstream { vendor_tag, .. } => vendor_tag.as_deref().unwrap_or("upstream_error"),
            Self::OneApi(_) => "one_api_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Message safe to expose to API consumers: never leaks `Internal`'s
    /// source error.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// Construct an upstream error tagged with a vendor-scoped error type,
    /// e.g. `ali_error`, `gemini_error`.
    pub fn upstream(message: impl Into<String>, vendor_tag: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
            vendor_tag: Some(vendor_tag.into()),
        }
    }

    /// A best-effort clone, for call sites that need to both return an
    /// error and report it elsewhere (e.g. `record_channel_outcome`) and
    /// so can't move the original. `Internal` wraps a non-`Clone`
    /// `anyhow::Error`; its source is never shown to clients anyway, so
    /// reconstructing it as a generic internal error loses nothing
    /// observable.
    pub(crate) fn cheap_clone(&self) -> Self {
        match self {
            Self::InvalidRequest(m) => Self::InvalidRequest(m.clone()),
            Self::AuthenticationFailed(m) => Self::AuthenticationFailed(m.clone()),
            Self::Permission(m) => Self::Permission(m.clone()),
            Self::InsufficientQuota(m) => Self::InsufficientQuota(m.clone()),
            Self::RateLimitExceeded(m) => Self::RateLimitExceeded(m.clone()),
            Self::Forbidden(m) => Self::Forbidden(m.clone()),
            Self::NotFound(m) => Self::NotFound(m.clone()),
            Self::Upstream { message, vendor_tag } => Self::Upstream {
                message: message.clone(),
                vendor_tag: vendor_tag.clone(),
            },
            Self::OneApi(m) => Self::OneApi(m.clone()),
            Self::Internal(_) => Self::Internal(anyhow::anyhow!("internal error")),
        }
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

/// OpenAI-shaped error envelope, used for ChatCompletions, Responses,
/// embeddings, and rerank.
#[derive(Debug, Serialize)]
struct OpenAiErrorResponse {
    error: OpenAiErrorDetails,
}

#[derive(Debug, Serialize)]
struct OpenAiErrorDetails {
    message: String,
    r#type: String,
    code: u16,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = OpenAiErrorResponse {
            error: OpenAiErrorDetails {
                message: self.client_message(),
                r#type: self.error_type().to_string(),
                code: status.as_u16(),
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Anthropic-shaped error envelope, used for `/v1/messages`.
#[derive(Debug, Serialize)]
pub struct AnthropicErrorResponse {
    #[serde(skip)]
    status: StatusCode,
    r#type: &'static str,
    error: AnthropicErrorBody,
}

#[derive(Debug, Serialize)]
struct AnthropicErrorBody {
    r#type: String,
    message: String,
}

impl From<RelayError> for AnthropicErrorResponse {
    fn from(error: RelayError) -> Self {
        Self {
            status: error.status_code(),
            r#type: "error",
            error: AnthropicErrorBody {
                r#type: error.error_type().to_string(),
                message: error.client_message(),
            },
        }
    }
}

impl IntoResponse for AnthropicErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

pub type AnthropicResult<T> = std::result::Result<T, AnthropicErrorResponse>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_quota_maps_to_403() {
        let err = RelayError::InsufficientQuota("not enough quota".to_string());
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.error_type(), "insufficient_quota");
    }

    #[test]
    fn vendor_tagged_upstream_error_preserves_tag() {
        let err = RelayError::upstream("bad gateway", "gemini_error");
        assert_eq!(err.error_type(), "gemini_error");
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn internal_error_never_leaks_source_message() {
        let err = RelayError::Internal(anyhow::anyhow!("leaked secret path /etc/shadow"));
        assert_eq!(err.client_message(), "internal server error");
    }
}
