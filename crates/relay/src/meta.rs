//! Per-request envelope (spec §3 "Meta"): the bag of routing/billing
//! context a request accumulates as it moves through auth, channel
//! selection, and the adaptor, carried alongside rather than threaded as
//! a dozen separate parameters.

use std::time::Instant;

/// Which client-facing surface originated this request. Mirrors the
/// `mode` field spec §3 assigns to `Meta`; embeddings/rerank/image/audio/
/// video modes are handled by their own lightweight controllers rather
/// than `RelayController::relay_chat`, but share this enum for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Chat,
    Responses,
    Messages,
    Embeddings,
    Rerank,
    Image,
    Audio,
    Video,
}

impl RelayMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Responses => "responses",
            Self::Messages => "messages",
            Self::Embeddings => "embeddings",
            Self::Rerank => "rerank",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// The envelope carried through one request's pipeline, from auth through
/// quota finalization.
#[derive(Debug, Clone)]
pub struct Meta {
    pub request_id: String,
    pub user_id: String,
    pub token_key: String,
    pub channel_id: String,
    pub channel_type: config::ChannelType,
    pub actual_model_name: String,
    pub original_model_name: String,
    pub group: String,
    pub mode: RelayMode,
    pub is_stream: bool,
    pub prompt_tokens_estimate: u64,
}

impl Meta {
    /// Elapsed time since a `start` captured at the top of the request,
    /// in whole milliseconds, for `RequestLog::elapsed_time_ms`.
    pub fn elapsed_ms(start: Instant) -> u64 {
        start.elapsed().as_millis() as u64
    }
}
