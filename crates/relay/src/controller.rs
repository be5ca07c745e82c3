//! The relay controller (spec §4.4): the per-request pipeline shared by
//! every chat-shaped endpoint (ChatCompletions, Responses, Messages).
//! Validates the request, resolves a channel, pre-reserves quota, calls
//! the adaptor, and finalizes billing from the real `Usage` the adaptor
//! reports. Dialect-specific wire encoding stays in `crates/server`; this
//! module only ever reasons in terms of `NormalizedRequest`/`Normalized*`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use config::Config;
use futures::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::adaptor::{self, ChunkStream};
use crate::channel::{self, ChannelHealth, FailureKind};
use crate::error::{RelayError, RelayResult};
use crate::http_client::http_client;
use crate::meta::{Meta, RelayMode};
use crate::normalized::{NormalizedRequest, NormalizedResponse};
use crate::pricing::{PriceResolver, QuotaLedger, Usage};
use crate::repository::{Repository, RepositoryError, RequestLog, RequestLogType, Token, User};
use crate::token_counter::{DurationProber, HeuristicDurationProber, TiktokenCounter, TokenCounter};

const MAX_TOKENS_CEILING: u64 = (i32::MAX / 2) as u64;
/// Cost ceiling assumed per tool call when pre-reserving quota, for
/// channels whose `tooling.pricing` doesn't name the specific tool the
/// client might invoke (pre-reservation only needs to be an upper bound).
const TOOL_RESERVATION_CEILING_QUOTA: u64 = 50_000;
/// Bound on how long a streamed chunk's billing-relevant fields can grow
/// before the lifecycle tracker gives up and truncates, per `stream.rs`.
const MAX_STREAM_FRAME_BYTES: usize = 1 << 20;

/// The outcome of a chat-shaped relay call: either the adaptor already
/// buffered and billed the whole response, or it's an in-flight stream
/// the caller re-encodes into its own dialect as deltas arrive.
pub enum RelayOutcome {
    Buffered(NormalizedResponse),
    Streaming(ChunkStream),
}

/// Everything `RelayController::relay_chat` needs besides the request
/// body itself.
pub struct ChatCall<'a> {
    pub token_key: &'a str,
    pub request: NormalizedRequest,
    pub mode: RelayMode,
}

/// Owns the shared, long-lived pieces of the relay pipeline: config
/// snapshot, repository handle, channel health/cooldown tracker, and the
/// pooled HTTP client every adaptor dispatches through.
pub struct RelayController {
    config: Arc<Config>,
    repo: Arc<dyn Repository>,
    health: Arc<ChannelHealth>,
    rate_limiter: Arc<rate_limit::ChannelRateLimiter>,
    http_client: reqwest::Client,
    token_counter: Arc<dyn TokenCounter>,
    duration_prober: Arc<dyn DurationProber>,
}

impl RelayController {
    pub fn new(config: Arc<Config>, repo: Arc<dyn Repository>) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            repo,
            health: Arc::new(ChannelHealth::new()),
            rate_limiter: Arc::new(rate_limit::ChannelRateLimiter::new()),
            http_client: http_client(),
            token_counter: Arc::new(TiktokenCounter::new()?),
            duration_prober: Arc::new(HeuristicDurationProber),
        })
    }

    /// The config snapshot this controller was built from, for callers
    /// that need server-level settings (e.g. format auto-detection).
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The repository backing this controller, for callers outside the
    /// chat-shaped pipeline (the admin surface) that need direct access
    /// to users, tokens, channels, and logs.
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// The channel cooldown tracker, for the admin debug endpoint.
    pub fn health(&self) -> &ChannelHealth {
        &self.health
    }

    /// The pooled HTTP client, for the non-chat endpoints that dispatch
    /// directly over `wire_openai` rather than through an `Adaptor`.
    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// The token counter, for the non-chat endpoints that need their own
    /// prompt-token estimate for pricing/reservation.
    pub(crate) fn token_counter(&self) -> &dyn TokenCounter {
        self.token_counter.as_ref()
    }

    /// The audio-duration prober, for the audio transcription/translation/
    /// speech endpoints.
    pub(crate) fn duration_prober(&self) -> &dyn DurationProber {
        self.duration_prober.as_ref()
    }

    /// List enabled channels and select one for `group`/`model`, retrying
    /// among eligible candidates per the usual rate-limit/health rules,
    /// restricted to channels `capable` accepts.
    pub(crate) async fn select_channel_for(
        &self,
        group: &str,
        model: &str,
        capable: impl Fn(&crate::repository::ChannelRecord) -> bool,
    ) -> RelayResult<channel::SelectedChannel> {
        let channels = self.repo.list_channels().await.map_err(map_repository_error)?;
        self.select_channel_filtered(group, model, &channels, capable)
    }

    /// Record a dispatch failure/success against a channel's cooldown
    /// tracker, for the non-chat endpoints that don't go through
    /// `relay_chat`.
    pub(crate) async fn record_channel_outcome(&self, channel_id: &str, result: &RelayResult<()>) {
        match result {
            Ok(()) => self.health.record_success(channel_id),
            Err(err) => self.record_dispatch_failure(channel_id, err).await,
        }
    }

    /// Reserve then settle quota for a non-chat endpoint that doesn't
    /// stream and whose cost is known up front (spec §4.5's
    /// reserve-then-reconcile discipline applied to a single round trip).
    pub(crate) async fn charge_quota(&self, user_id: &str, token_key: &str, reserved: u64, actual: u64) -> RelayResult<()> {
        let ledger = QuotaLedger::new(self.repo.as_ref());
        ledger.reserve(user_id, token_key, reserved).await?;
        match ledger.settle(user_id, token_key, reserved, actual).await {
            Ok(()) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Append a `RequestLog` for a non-chat endpoint.
    pub(crate) async fn log_request(
        &self,
        meta: &Meta,
        user: &User,
        token: &Token,
        usage: &Usage,
        quota: u64,
        start: Instant,
    ) {
        self.insert_log(meta, user, token, usage, quota, start, false, String::new()).await;
    }

    /// Look up and validate the bearer token, returning its owning user
    /// alongside it. Maps repository misses and disabled/exhausted
    /// tokens onto `authentication_error`/`forbidden` per spec §7.
    pub async fn authenticate(&self, token_key: &str) -> RelayResult<(User, Token)> {
        let token = self
            .repo
            .get_token(token_key)
            .await
            .map_err(|_| RelayError::AuthenticationFailed("invalid API token".to_string()))?;

        match token.status {
            crate::repository::TokenStatus::Enabled => {}
            crate::repository::TokenStatus::Disabled => {
                return Err(RelayError::AuthenticationFailed("token is disabled".to_string()));
            }
            crate::repository::TokenStatus::Expired => {
                return Err(RelayError::AuthenticationFailed("token has expired".to_string()));
            }
            crate::repository::TokenStatus::Exhausted => {
                return Err(RelayError::InsufficientQuota("token quota exhausted".to_string()));
            }
        }

        let user = self
            .repo
            .get_user(&token.user_id)
            .await
            .map_err(|_| RelayError::Internal(anyhow::anyhow!("token '{token_key}' references a missing user")))?;

        Ok((user, token))
    }

    /// Run the full chat-shaped pipeline (spec §4.4 steps 1-8, minus
    /// step 8's non-streaming log flush which the caller performs once
    /// it knows the final `Usage`, since streaming defers it).
    pub async fn relay_chat(&self, user: &User, token: &Token, call: ChatCall<'_>) -> RelayResult<(Meta, RelayOutcome)> {
        let start = Instant::now();
        self.validate_request(&call.request)?;

        let group = token.effective_group(user).to_string();
        let model = call.request.model.clone();

        if !token.allows_model(&model) {
            return Err(RelayError::Permission(format!("token is not allowed to use model '{model}'")));
        }

        let channels = self.repo.list_channels().await.map_err(map_repository_error)?;
        let selected = self.select_channel(&group, &model, &channels)?;

        let resolver = PriceResolver::new(&self.config);
        resolver.enforce_max_tokens(&selected.channel.config, &selected.actual_model_name, call.request.max_tokens.map(u64::from))?;

        let prompt_tokens_estimate = self.estimate_prompt_tokens(&call.request);
        let reservation = self.estimate_reservation(&resolver, &selected.channel.config, &selected.actual_model_name, prompt_tokens_estimate, call.request.max_tokens, &group);

        let ledger = QuotaLedger::new(self.repo.as_ref());
        ledger.reserve(&user.id, &token.key, reservation).await?;

        let meta = Meta {
            request_id: format!("req_{}", Uuid::new_v4().simple()),
            user_id: user.id.clone(),
            token_key: token.key.clone(),
            channel_id: selected.channel.id.clone(),
            channel_type: selected.channel.config.channel_type(),
            actual_model_name: selected.actual_model_name.clone(),
            original_model_name: model.clone(),
            group,
            mode: call.mode,
            is_stream: call.request.stream,
            prompt_tokens_estimate,
        };

        let adaptor = adaptor::for_channel(&selected.channel.config);

        if call.request.stream {
            match adaptor
                .send_chat_stream(&self.http_client, &selected.channel.config, &call.request, &meta.actual_model_name)
                .await
            {
                Ok(stream) => {
                    self.health.record_success(&meta.channel_id);
                    let billed = self.bill_stream(meta.clone(), reservation, start, stream);
                    Ok((meta, RelayOutcome::Streaming(billed)))
                }
                Err(err) => {
                    self.record_dispatch_failure(&meta.channel_id, &err).await;
                    ledger.settle(&user.id, &token.key, reservation, 0).await?;
                    Err(err)
                }
            }
        } else {
            match adaptor
                .send_chat(&self.http_client, &selected.channel.config, &call.request, &meta.actual_model_name)
                .await
            {
                Ok(response) => {
                    self.health.record_success(&meta.channel_id);
                    let actual = resolver.price_completion(&selected.channel.config, &meta.actual_model_name, &response.usage, &meta.group);
                    let tool_quota = self.price_tool_calls(&resolver, &selected.channel.config, response.tool_calls.as_ref());
                    let total = actual.saturating_add(tool_quota);

                    ledger.settle(&user.id, &token.key, reservation, total).await?;
                    self.insert_log(&meta, user, token, &response.usage, total, start, false, String::new()).await;

                    Ok((meta, RelayOutcome::Buffered(response)))
                }
                Err(err) => {
                    self.record_dispatch_failure(&meta.channel_id, &err).await;
                    ledger.settle(&user.id, &token.key, reservation, 0).await?;
                    Err(err)
                }
            }
        }
    }

    fn validate_request(&self, request: &NormalizedRequest) -> RelayResult<()> {
        if request.messages.is_empty() {
            return Err(RelayError::InvalidRequest("messages must not be empty".to_string()));
        }

        if let Some(max_tokens) = request.max_tokens {
            if max_tokens as u64 > MAX_TOKENS_CEILING {
                return Err(RelayError::InvalidRequest(format!(
                    "max_tokens {max_tokens} exceeds the maximum of {MAX_TOKENS_CEILING}"
                )));
            }
        }

        Ok(())
    }

    /// Select a channel, retrying among the remaining eligible candidates
    /// when the first pick is over its requests/minute cap (spec §4.1:
    /// "the selector declines ... and tries the next candidate").
    fn select_channel(
        &self,
        group: &str,
        model: &str,
        channels: &[crate::repository::ChannelRecord],
    ) -> RelayResult<channel::SelectedChannel> {
        self.select_channel_filtered(group, model, channels, |_| true)
    }

    /// Same retry discipline as [`Self::select_channel`], plus a
    /// `capable` predicate a non-chat endpoint uses to skip channels that
    /// don't serve its wire dialect (e.g. embeddings/rerank only
    /// dispatch to `wire_openai::serves_openai_wire` channels).
    pub(crate) fn select_channel_filtered(
        &self,
        group: &str,
        model: &str,
        channels: &[crate::repository::ChannelRecord],
        capable: impl Fn(&crate::repository::ChannelRecord) -> bool,
    ) -> RelayResult<channel::SelectedChannel> {
        let mut remaining = channels.to_vec();

        loop {
            let selected = channel::select(group, model, &remaining, &self.health)?;

            if !capable(&selected.channel) {
                remaining.retain(|candidate| candidate.id != selected.channel.id);

                if remaining.is_empty() {
                    return Err(RelayError::OneApi(format!(
                        "no channel for group '{group}' and model '{model}' supports this endpoint"
                    )));
                }
                continue;
            }

            let rate_limit = selected.channel.config.common().rate_limit;

            if self.rate_limiter.check(&selected.channel.id, rate_limit) {
                return Ok(selected);
            }

            remaining.retain(|candidate| candidate.id != selected.channel.id);

            if remaining.is_empty() {
                return Err(RelayError::OneApi(format!(
                    "no enabled channel available for group '{group}' and model '{model}'"
                )));
            }
        }
    }

    fn estimate_prompt_tokens(&self, request: &NormalizedRequest) -> u64 {
        let mut total = request.system.as_deref().map(|s| self.token_counter.count_text(&request.model, s)).unwrap_or(0);

        for message in &request.messages {
            total += self.token_counter.count_text(&request.model, &message.text);
        }

        total
    }

    /// Compute the pre-reservation upper bound: estimated prompt cost
    /// plus worst-case completion cost (`max_tokens`, or a fixed
    /// multiple of the prompt estimate when the client didn't cap it)
    /// plus a flat tool-call ceiling (spec §4.5).
    fn estimate_reservation(
        &self,
        resolver: &PriceResolver<'_>,
        channel: &config::ChannelConfig,
        model: &str,
        prompt_tokens: u64,
        max_tokens: Option<u32>,
        group: &str,
    ) -> u64 {
        let assumed_completion = max_tokens.map(u64::from).unwrap_or(prompt_tokens.max(256));

        let usage = Usage {
            prompt_tokens,
            completion_tokens: assumed_completion,
            ..Usage::default()
        };

        resolver.price_completion(channel, model, &usage, group).saturating_add(TOOL_RESERVATION_CEILING_QUOTA)
    }

    fn price_tool_calls(&self, resolver: &PriceResolver<'_>, channel: &config::ChannelConfig, tool_calls: Option<&Value>) -> u64 {
        count_tool_invocations(tool_calls)
            .into_iter()
            .map(|(tool, count)| resolver.price_tool_call(channel, &tool).unwrap_or(0).saturating_mul(count))
            .sum()
    }

    /// Record a dispatch failure against a channel. Credential/quota
    /// failures also persist `auto_disabled` (spec §3/§4.1: "auto-disable
    /// is persisted and surfaced in admin UI"), distinct from the
    /// self-expiring cooldown both this and transient 5xx failures get.
    /// A bad API key shouldn't come back into rotation on its own once
    /// the backoff window lapses.
    async fn record_dispatch_failure(&self, channel_id: &str, err: &RelayError) {
        let kind = match err {
            RelayError::AuthenticationFailed(_) | RelayError::Forbidden(_) | RelayError::InsufficientQuota(_) => {
                FailureKind::CredentialOrQuota
            }
            RelayError::Upstream { .. } => FailureKind::Transient,
            RelayError::InvalidRequest(_) | RelayError::Permission(_) => FailureKind::CapabilityMismatch,
            _ => return,
        };

        if kind == FailureKind::CredentialOrQuota {
            if let Err(err) = self.repo.set_channel_auto_disabled(channel_id, true).await {
                log::warn!("failed to persist auto_disabled for channel '{channel_id}': {err}");
            }
        }

        self.health.record_failure(channel_id, kind);
    }

    /// Wrap an adaptor's chunk stream so that, once it ends (cleanly or
    /// on error), the quota reservation is settled against the final
    /// `Usage` the stream reported and a `RequestLog` is written. Spec
    /// §4.4: "Billing is flushed every STREAMING_BILLING_INTERVAL ... to
    /// avoid losing cost accounting on long streams."
    fn bill_stream(&self, meta: Meta, reserved: u64, start: Instant, inner: ChunkStream) -> ChunkStream {
        let config = self.config.clone();
        let repo = self.repo.clone();
        let interval = Duration::from_secs(self.config.server.streaming_billing_interval_secs.max(1));

        let mut lifecycle = crate::stream::StreamRelay::new(MAX_STREAM_FRAME_BYTES);
        lifecycle.on_headers_received();

        let state = StreamBillingState {
            inner,
            meta,
            reserved,
            start,
            last_flush: Instant::now(),
            last_usage: Usage::default(),
            settled: false,
            interval,
            lifecycle,
        };

        Box::pin(futures::stream::unfold(state, move |mut state| {
            let config = config.clone();
            let repo = repo.clone();

            async move {
                match state.inner.next().await {
                    Some(Ok(chunk)) => {
                        if let Some(usage) = chunk.usage.clone() {
                            state.last_usage = usage;
                        }

                        let terminal_marker = chunk
                            .finish_reason
                            .as_deref()
                            .map(|reason| format!(r#"{{"type":"done","finish_reason":"{reason}"}}"#))
                            .unwrap_or_else(|| "{}".to_string());
                        state.lifecycle.observe_event(None, &terminal_marker);

                        if state.last_flush.elapsed() >= state.interval {
                            state.last_flush = Instant::now();

                            if let Some(abort) = flush_partial(&config, &repo, &mut state).await {
                                let outcome = state.lifecycle.finish(false);
                                finalize_stream(&config, &repo, &mut state, outcome, abort.to_string()).await;
                                return Some((Err(abort), state));
                            }
                        }

                        Some((Ok(chunk), state))
                    }
                    Some(Err(err)) => {
                        let outcome = state.lifecycle.finish(false);
                        finalize_stream(&config, &repo, &mut state, outcome, err.to_string()).await;
                        Some((Err(err), state))
                    }
                    None => {
                        let outcome = state.lifecycle.finish(true);
                        finalize_stream(&config, &repo, &mut state, outcome, String::new()).await;
                        None
                    }
                }
            }
        }))
    }

    async fn insert_log(
        &self,
        meta: &Meta,
        user: &User,
        token: &Token,
        usage: &Usage,
        quota: u64,
        start: Instant,
        is_stream: bool,
        content: String,
    ) {
        let log = RequestLog {
            timestamp: jiff_timestamp(),
            user_id: user.id.clone(),
            username: user.id.clone(),
            token_id: token.key.clone(),
            token_name: token.name.clone(),
            channel_id: meta.channel_id.clone(),
            model_name: meta.actual_model_name.clone(),
            log_type: RequestLogType::Consume,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cached_prompt_tokens: usage.cached_prompt_tokens,
            cached_completion_tokens: 0,
            metadata: serde_json::json!({}),
            quota: quota as i64,
            elapsed_time_ms: Meta::elapsed_ms(start),
            request_id: meta.request_id.clone(),
            trace_id: meta.request_id.clone(),
            is_stream,
            content,
        };

        if let Err(err) = self.repo.insert_log(log).await {
            log::warn!("failed to persist request log for {}: {err}", meta.request_id);
        }
    }
}

struct StreamBillingState {
    inner: ChunkStream,
    meta: Meta,
    reserved: u64,
    start: Instant,
    last_flush: Instant,
    last_usage: Usage,
    settled: bool,
    interval: Duration,
    lifecycle: crate::stream::StreamRelay,
}

/// Mid-stream partial reconciliation (spec §4.4/§4.5): re-price the usage
/// seen so far and, if it has outgrown the original reservation, try to
/// extend the reservation by the shortfall. When the (user, token) pair
/// doesn't have enough remaining quota to cover it, returns the error the
/// caller should abort the stream with; the caller settles the running
/// cost against whatever was actually reserved before tearing down. Uses
/// the same conditional-update reservation path as the initial
/// pre-reservation (spec §5: "no read-modify-write race") rather than
/// reading quota and comparing, since that's the only place live
/// remaining quota is observable.
async fn flush_partial(config: &Arc<Config>, repo: &Arc<dyn Repository>, state: &mut StreamBillingState) -> Option<RelayError> {
    let channel = match repo.get_channel(&state.meta.channel_id).await {
        Ok(channel) => channel,
        Err(_) => {
            log::warn!("channel '{}' vanished during streaming billing flush for {}", state.meta.channel_id, state.meta.request_id);
            return None;
        }
    };

    let resolver = PriceResolver::new(config);
    let running_cost = resolver.price_completion(&channel.config, &state.meta.actual_model_name, &state.last_usage, &state.meta.group);

    log::debug!(
        "streaming billing flush for {}: {} prompt / {} completion tokens seen so far, running cost {} (reserved {})",
        state.meta.request_id,
        state.last_usage.prompt_tokens,
        state.last_usage.completion_tokens,
        running_cost,
        state.reserved
    );

    if running_cost <= state.reserved {
        return None;
    }

    let shortfall = running_cost - state.reserved;
    let ledger = QuotaLedger::new(repo.as_ref());

    match ledger.reserve(&state.meta.user_id, &state.meta.token_key, shortfall).await {
        Ok(()) => {
            state.reserved += shortfall;
            None
        }
        Err(_) => Some(RelayError::InsufficientQuota(format!(
            "streaming cost {running_cost} for request '{}' exceeds the reservation of {} and remaining quota can't cover the {shortfall} shortfall",
            state.meta.request_id, state.reserved
        ))),
    }
}

/// Settle the reservation against the last `Usage` the stream reported
/// and persist a `RequestLog`, exactly once per stream regardless of how
/// many times `finalize_stream` is invoked (a terminal error followed by
/// stream exhaustion would otherwise double-settle). `outcome` records why
/// the stream ended (spec §8: a mid-stream disconnect still bills through
/// the last flush checkpoint, with no refund beyond it, same as a clean
/// completion; only the logged `content` differs).
async fn finalize_stream(
    config: &Arc<Config>,
    repo: &Arc<dyn Repository>,
    state: &mut StreamBillingState,
    outcome: crate::stream::StreamOutcome,
    error: String,
) {
    if state.settled {
        return;
    }
    state.settled = true;

    let clean = matches!(outcome, crate::stream::StreamOutcome::CompletedNormally);
    let content = if clean { String::new() } else { format!("{outcome:?}: {error}") };

    let channel = match repo.get_channel(&state.meta.channel_id).await {
        Ok(channel) => channel,
        Err(_) => {
            log::warn!("channel '{}' vanished before stream settlement for {}", state.meta.channel_id, state.meta.request_id);
            return;
        }
    };

    let resolver = PriceResolver::new(config);
    let actual = resolver.price_completion(&channel.config, &state.meta.actual_model_name, &state.last_usage, &state.meta.group);

    let ledger = QuotaLedger::new(repo.as_ref());
    if let Err(err) = ledger.settle(&state.meta.user_id, &state.meta.token_key, state.reserved, actual).await {
        log::warn!("failed to settle streaming quota for {}: {err}", state.meta.request_id);
    }

    let log = RequestLog {
        timestamp: jiff_timestamp(),
        user_id: state.meta.user_id.clone(),
        username: state.meta.user_id.clone(),
        token_id: state.meta.token_key.clone(),
        token_name: state.meta.token_key.clone(),
        channel_id: state.meta.channel_id.clone(),
        model_name: state.meta.actual_model_name.clone(),
        log_type: RequestLogType::Consume,
        prompt_tokens: state.last_usage.prompt_tokens,
        completion_tokens: state.last_usage.completion_tokens,
        cached_prompt_tokens: state.last_usage.cached_prompt_tokens,
        cached_completion_tokens: 0,
        metadata: serde_json::json!({}),
        quota: actual as i64,
        elapsed_time_ms: Meta::elapsed_ms(state.start),
        request_id: state.meta.request_id.clone(),
        trace_id: state.meta.request_id.clone(),
        is_stream: true,
        content,
    };

    if let Err(err) = repo.insert_log(log).await {
        log::warn!("failed to persist streaming request log for {}: {err}", state.meta.request_id);
    }
}

/// Count tool invocations by name from an upstream response's raw
/// `tool_calls` payload. Handles both the OpenAI shape
/// (`[{type:"function", function:{name, ...}}]`) and a flattened
/// `{name: ...}` shape (Anthropic `tool_use` blocks, once normalized),
/// since `NormalizedResponse::tool_calls` carries the vendor's own JSON
/// through unmodified rather than a canonical AST (see `normalized.rs`).
fn count_tool_invocations(tool_calls: Option<&Value>) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();

    let Some(Value::Array(calls)) = tool_calls else {
        return counts;
    };

    for call in calls {
        let name = call
            .get("function")
            .and_then(|f| f.get("name"))
            .or_else(|| call.get("name"))
            .and_then(Value::as_str);

        if let Some(name) = name {
            *counts.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    counts
}

fn map_repository_error(err: RepositoryError) -> RelayError {
    match err {
        RepositoryError::NotFound { kind, id } => RelayError::Internal(anyhow::anyhow!("{kind} '{id}' not found")),
        RepositoryError::Conflict { kind, id } => RelayError::Internal(anyhow::anyhow!("conflicting update for {kind} '{id}'")),
        RepositoryError::Backend(err) => RelayError::Internal(err),
    }
}

fn jiff_timestamp() -> i64 {
    jiff::Timestamp::now().as_second()
}

#[cfg(test)]
mod tests {
    use config::{ApiChannelConfig, ChannelCommon, ChannelConfig, ChannelType, ModelConfig};
    use indexmap::IndexSet;
    use secrecy::SecretString;

    use crate::repository::{InMemoryRepository, TokenQuota, TokenStatus, UserRole};

    use super::*;

    fn test_channel(rate_limit: u32) -> ChannelConfig {
        ChannelConfig::Openai(ApiChannelConfig {
            common: ChannelCommon {
                groups: IndexSet::from(["default".to_string()]),
                rate_limit,
                model_configs: {
                    let mut map = std::collections::BTreeMap::new();
                    map.insert(
                        "gpt-4o".to_string(),
                        ModelConfig {
                            ratio: 2.5e-6,
                            completion_ratio: 4.0,
                            ..ModelConfig::default()
                        },
                    );
                    map
                },
                ..ChannelCommon::default()
            },
            api_key: SecretString::from("sk-test".to_string()),
            base_url: None,
            deployment_id: None,
            api_version: None,
        })
    }

    fn seeded_controller() -> (RelayController, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());

        repo.insert_user(User {
            id: "user-1".to_string(),
            role: UserRole::Common,
            quota: 10_000_000,
            used_quota: 0,
            group: "default".to_string(),
        });

        repo.insert_token(Token {
            key: "token-1".to_string(),
            user_id: "user-1".to_string(),
            name: "default".to_string(),
            status: TokenStatus::Enabled,
            quota: TokenQuota::Limited(10_000_000),
            models: Vec::new(),
            group_override: None,
        });

        repo.insert_channel("chan-1", test_channel(0));

        let controller = RelayController::new(Arc::new(Config::default()), repo.clone()).unwrap();
        (controller, repo)
    }

    #[tokio::test]
    async fn authenticate_rejects_unknown_token() {
        let (controller, _repo) = seeded_controller();
        let err = controller.authenticate("nope").await.unwrap_err();
        assert!(matches!(err, RelayError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn authenticate_succeeds_for_seeded_token() {
        let (controller, _repo) = seeded_controller();
        let (user, token) = controller.authenticate("token-1").await.unwrap();
        assert_eq!(user.id, "user-1");
        assert_eq!(token.key, "token-1");
    }

    #[test]
    fn count_tool_invocations_handles_openai_shape() {
        let calls = serde_json::json!([
            {"type": "function", "function": {"name": "web_search", "arguments": "{}"}},
            {"type": "function", "function": {"name": "web_search", "arguments": "{}"}},
        ]);

        let counts = count_tool_invocations(Some(&calls));
        assert_eq!(counts.get("web_search"), Some(&2));
    }

    #[test]
    fn validate_request_rejects_empty_messages() {
        let (controller, _repo) = seeded_controller();
        let request = NormalizedRequest {
            model: "gpt-4o".to_string(),
            messages: Vec::new(),
            system: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stream: false,
            stop: Vec::new(),
            tools: None,
            tool_choice: None,
        };

        assert!(controller.validate_request(&request).is_err());
    }

    fn streaming_meta(user_id: &str, token_key: &str) -> Meta {
        Meta {
            request_id: "req-stream".to_string(),
            user_id: user_id.to_string(),
            token_key: token_key.to_string(),
            channel_id: "chan-1".to_string(),
            channel_type: ChannelType::Openai,
            actual_model_name: "gpt-4o".to_string(),
            original_model_name: "gpt-4o".to_string(),
            group: "default".to_string(),
            mode: RelayMode::Chat,
            is_stream: true,
            prompt_tokens_estimate: 0,
        }
    }

    fn billing_state(meta: Meta, reserved: u64, prompt_tokens: u64) -> StreamBillingState {
        StreamBillingState {
            inner: Box::pin(futures::stream::empty()),
            meta,
            reserved,
            start: Instant::now(),
            last_flush: Instant::now(),
            last_usage: Usage {
                prompt_tokens,
                ..Usage::default()
            },
            settled: false,
            interval: Duration::from_secs(1),
            lifecycle: crate::stream::StreamRelay::new(MAX_STREAM_FRAME_BYTES),
        }
    }

    #[tokio::test]
    async fn flush_partial_extends_the_reservation_when_quota_allows() {
        let (_controller, repo) = seeded_controller();
        let config = Arc::new(Config::default());

        // gpt-4o is priced at 2.5e-6 USD/token; 1M prompt tokens cost far
        // more than the tiny initial reservation, but the seeded user has
        // plenty of quota to cover the shortfall.
        let mut state = billing_state(streaming_meta("user-1", "token-1"), 1, 1_000_000);

        let abort = flush_partial(&config, &repo, &mut state).await;
        assert!(abort.is_none());
        assert!(state.reserved > 1);
    }

    #[tokio::test]
    async fn flush_partial_aborts_when_remaining_quota_cannot_cover_the_shortfall() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.insert_user(User {
            id: "user-1".to_string(),
            role: UserRole::Common,
            quota: 1,
            used_quota: 0,
            group: "default".to_string(),
        });
        repo.insert_token(Token {
            key: "token-1".to_string(),
            user_id: "user-1".to_string(),
            name: "default".to_string(),
            status: TokenStatus::Enabled,
            quota: TokenQuota::Limited(1),
            models: Vec::new(),
            group_override: None,
        });
        repo.insert_channel("chan-1", test_channel(0));

        let config = Arc::new(Config::default());
        let mut state = billing_state(streaming_meta("user-1", "token-1"), 1, 1_000_000);

        let abort = flush_partial(&config, &repo, &mut state).await;
        assert!(matches!(abort, Some(RelayError::InsufficientQuota(_))));
        // A failed reservation attempt never partially extends it.
        assert_eq!(state.reserved, 1);
    }

    #[tokio::test]
    async fn record_dispatch_failure_persists_auto_disable_for_credential_errors() {
        let (controller, repo) = seeded_controller();

        controller
            .record_dispatch_failure("chan-1", &RelayError::AuthenticationFailed("bad key".to_string()))
            .await;

        assert!(controller.health.is_cooling_down("chan-1"));
        assert!(repo.get_channel("chan-1").await.unwrap().auto_disabled);
    }

    #[tokio::test]
    async fn record_dispatch_failure_does_not_auto_disable_for_transient_errors() {
        let (controller, repo) = seeded_controller();

        controller
            .record_dispatch_failure("chan-1", &RelayError::upstream("server blew up", "openai_error"))
            .await;

        assert!(!repo.get_channel("chan-1").await.unwrap().auto_disabled);
    }
}
