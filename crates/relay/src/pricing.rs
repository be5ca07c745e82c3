//! The billing engine (spec §4.5): four-layer price resolution, tiered
//! pricing, multimedia pricing, tool-call billing, and quota-unit
//! conversion. `QuotaLedger` wraps the repository's reserve/settle
//! primitives so controllers never touch `RepositoryError` directly.

use std::collections::BTreeMap;

use config::{ChannelConfig, Config, FALLBACK_COMPLETION_RATIO, FALLBACK_RATIO_USD_PER_TOKEN, ModelConfig, QUOTA_UNITS_PER_USD};

use crate::error::{RelayError, RelayResult};
use crate::repository::{Repository, RepositoryError};

/// The token/media usage a single request incurred, as reported by the
/// adaptor's `DoResponse` step.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Subset of `prompt_tokens` served from a cache hit.
    pub cached_prompt_tokens: u64,
    /// Subset of `prompt_tokens` that wrote a new 5-minute-TTL cache entry.
    pub cache_write_5m_tokens: u64,
    /// Subset of `prompt_tokens` that wrote a new 1-hour-TTL cache entry.
    pub cache_write_1h_tokens: u64,
}

/// The effective per-token rates after tier selection, still USD-denominated.
#[derive(Debug, Clone, Copy)]
struct EffectiveRates {
    ratio: f64,
    completion_ratio: f64,
    cached_input_ratio: f64,
    cache_write_5m_ratio: f64,
    cache_write_1h_ratio: f64,
}

impl EffectiveRates {
    fn base(model: &ModelConfig) -> Self {
        Self {
            ratio: model.ratio,
            completion_ratio: model.completion_ratio,
            cached_input_ratio: model.cached_input_ratio.unwrap_or(model.ratio),
            cache_write_5m_ratio: model.cache_write_5m_ratio.unwrap_or(model.ratio),
            cache_write_1h_ratio: model.cache_write_1h_ratio.unwrap_or(model.ratio),
        }
    }

    fn fallback() -> Self {
        Self {
            ratio: FALLBACK_RATIO_USD_PER_TOKEN,
            completion_ratio: FALLBACK_COMPLETION_RATIO,
            cached_input_ratio: FALLBACK_RATIO_USD_PER_TOKEN,
            cache_write_5m_ratio: FALLBACK_RATIO_USD_PER_TOKEN,
            cache_write_1h_ratio: FALLBACK_RATIO_USD_PER_TOKEN,
        }
    }

    /// Pick the tier whose `input_token_threshold` is the highest one at
    /// or below `prompt_tokens`, scanning tiers in ascending order as
    /// configured. Falls back to the model's own base fields (tier 0)
    /// when no tier qualifies.
    fn tiered(model: &ModelConfig, prompt_tokens: u64) -> Self {
        let mut effective = Self::base(model);

        for tier in &model.tiers {
            if tier.input_token_threshold <= prompt_tokens {
                effective = Self {
                    ratio: tier.ratio,
                    completion_ratio: tier.completion_ratio,
                    cached_input_ratio: non_zero_or(tier.cached_input_ratio, tier.ratio),
                    cache_write_5m_ratio: non_zero_or(tier.cache_write_5m_ratio, tier.ratio),
                    cache_write_1h_ratio: non_zero_or(tier.cache_write_1h_ratio, tier.ratio),
                };
            }
        }

        effective
    }
}

fn non_zero_or(value: f64, fallback: f64) -> f64 {
    if value == 0.0 { fallback } else { value }
}

/// Resolves per-model pricing through the four layers spec §4.5 defines,
/// and converts USD costs to the gateway's quota units.
pub struct PriceResolver<'a> {
    config: &'a Config,
}

impl<'a> PriceResolver<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Resolve the `ModelConfig` to price with, in priority order:
    /// channel override, adaptor default catalog, global registry,
    /// hardcoded fallback (constructed on the fly, never stored).
    fn resolve_model_config(&self, channel: &ChannelConfig, model: &str) -> ModelConfig {
        if let Some(overridden) = channel.common().model_configs.get(model) {
            return overridden.clone();
        }

        if let Some(default) = adaptor_default_pricing(channel.channel_type(), model) {
            return default;
        }

        if let Some(registry) = self.config.pricing.models.get(model) {
            return registry.clone();
        }

        ModelConfig::default()
    }

    /// Price a text completion's usage against `channel`/`model`, applying
    /// the group multiplier last. Returns the charge in quota units.
    pub fn price_completion(&self, channel: &ChannelConfig, model: &str, usage: &Usage, group: &str) -> u64 {
        let model_config = self.resolve_model_config(channel, model);
        let has_pricing = model_config.ratio != 0.0 || !model_config.tiers.is_empty();
        let rates = if has_pricing {
            EffectiveRates::tiered(&model_config, usage.prompt_tokens)
        } else {
            EffectiveRates::fallback()
        };

        let billed_regular_prompt_tokens = usage
            .prompt_tokens
            .saturating_sub(usage.cached_prompt_tokens)
            .saturating_sub(usage.cache_write_5m_tokens)
            .saturating_sub(usage.cache_write_1h_tokens);

        // A negative cached/cache-write ratio means "free" (spec §4.5): it
        // must zero out only its own bucket, not flip the request's total
        // cost negative and mask the other buckets' charges.
        let usd = billed_regular_prompt_tokens as f64 * rates.ratio
            + usage.cached_prompt_tokens as f64 * rates.cached_input_ratio.max(0.0)
            + usage.cache_write_5m_tokens as f64 * rates.cache_write_5m_ratio.max(0.0)
            + usage.cache_write_1h_tokens as f64 * rates.cache_write_1h_ratio.max(0.0)
            + usage.completion_tokens as f64 * rates.ratio * rates.completion_ratio;

        usd_to_quota(usd * self.config.group_multiplier(group))
    }

    /// Reject a request whose requested `max_tokens` exceeds the model's
    /// configured cap. A cap of zero means unlimited.
    pub fn enforce_max_tokens(&self, channel: &ChannelConfig, model: &str, requested: Option<u64>) -> RelayResult<()> {
        let cap = self.resolve_model_config(channel, model).max_tokens;

        match requested {
            Some(requested) if cap != 0 && requested > cap => Err(RelayError::InvalidRequest(format!(
                "requested max_tokens {requested} exceeds the configured cap of {cap} for model '{model}'"
            ))),
            _ => Ok(()),
        }
    }

    /// Price `n` image generations, plus (when the model's `ratio` is
    /// positive) an additional per-token prompt cost clamped to
    /// `prompt_token_limit` (spec §4.5 "If ratio > 0, additional
    /// per-token prompt cost applies with prompt_token_limit clamp").
    pub fn price_image(&self, channel: &ChannelConfig, model: &str, size: &str, quality: &str, n: u32, prompt_tokens: u64, group: &str) -> u64 {
        let model_config = self.resolve_model_config(channel, model);

        let Some(image) = model_config.image else {
            return usd_to_quota(0.0);
        };

        let multiplier = image
            .quality_size_multipliers
            .get(quality)
            .and_then(|by_size| by_size.get(size))
            .copied()
            .unwrap_or_else(|| {
                let size_mult = image.size_multipliers.get(size).copied().unwrap_or(1.0);
                let quality_mult = image.quality_multipliers.get(quality).copied().unwrap_or(1.0);
                size_mult * quality_mult
            });

        let per_image_usd = image.price_per_image_usd * multiplier;

        let prompt_usd = if image.ratio > 0.0 {
            let billable_tokens = if image.prompt_token_limit > 0 { prompt_tokens.min(image.prompt_token_limit) } else { prompt_tokens };
            billable_tokens as f64 * image.ratio
        } else {
            0.0
        };

        usd_to_quota((per_image_usd * n as f64 + prompt_usd) * self.config.group_multiplier(group))
    }

    /// Image count bounds configured for `model`, if any (spec §4.5
    /// "min_images ≤ n ≤ max_images enforced"). `(0, 0)` means
    /// unconfigured — callers should treat that as "no bound".
    pub fn image_count_bounds(&self, channel: &ChannelConfig, model: &str) -> (u32, u32) {
        self.resolve_model_config(channel, model).image.map(|image| (image.min_images, image.max_images)).unwrap_or((0, 0))
    }

    /// Price video generation, normalizing the resolution key so that
    /// orientation-swapped strings collapse onto the same multiplier.
    pub fn price_video(&self, channel: &ChannelConfig, model: &str, resolution: &str, seconds: f64, group: &str) -> u64 {
        let model_config = self.resolve_model_config(channel, model);

        let Some(video) = model_config.video else {
            return usd_to_quota(0.0);
        };

        let normalized = normalize_resolution(resolution);
        let multiplier = video
            .resolution_multipliers
            .get(&normalized)
            .copied()
            .unwrap_or(1.0);

        usd_to_quota(video.per_second_usd * multiplier * seconds * self.config.group_multiplier(group))
    }

    /// Price audio transcription/synthesis, either per-second or via the
    /// token-equivalent rate through the regular text formula.
    pub fn price_audio(&self, channel: &ChannelConfig, model: &str, duration_seconds: f64, group: &str) -> u64 {
        let model_config = self.resolve_model_config(channel, model);

        let Some(audio) = model_config.audio else {
            return usd_to_quota(0.0);
        };

        let usd = if let Some(usd_per_second) = audio.usd_per_second {
            usd_per_second * duration_seconds
        } else if let Some(tokens_per_second) = audio.prompt_tokens_per_second {
            let tokens = crate::token_counter::estimate_audio_tokens(duration_seconds, tokens_per_second);
            tokens as f64 * model_config.ratio
        } else {
            0.0
        };

        usd_to_quota(usd * self.config.group_multiplier(group))
    }

    /// Price one tool invocation under `channel`'s tooling policy. Returns
    /// `None` if the tool isn't allowed (the caller should reject the
    /// request before billing, not silently charge zero).
    pub fn price_tool_call(&self, channel: &ChannelConfig, tool: &str) -> Option<u64> {
        let tooling = &channel.common().tooling;

        if !tooling.allows(tool) {
            return None;
        }

        tooling.pricing.get(tool).map(|price| price.quota_per_call())
    }
}

/// USD -> quota units, rounding to the nearest unit.
pub fn usd_to_quota(usd: f64) -> u64 {
    (usd * QUOTA_UNITS_PER_USD).round().max(0.0) as u64
}

/// Collapse orientation-swapped resolution strings (`"720x1280"` and
/// `"1280x720"`) onto one canonical key: larger dimension first.
fn normalize_resolution(resolution: &str) -> String {
    let Some((w, h)) = resolution.split_once('x') else {
        return resolution.to_string();
    };

    let (Ok(w), Ok(h)) = (w.parse::<u32>(), h.parse::<u32>()) else {
        return resolution.to_string();
    };

    if w >= h { format!("{w}x{h}") } else { format!("{h}x{w}") }
}

/// Layer 2: hardcoded defaults for a handful of well-known models per
/// vendor, so an operator who never configures `pricing.models` or a
/// channel override still gets sane billing for mainstream models. Not
/// exhaustive; anything else falls through to the global registry or the
/// final hardcoded fallback.
fn adaptor_default_pricing(channel_type: config::ChannelType, model: &str) -> Option<ModelConfig> {
    adaptor_default_table(channel_type)
        .iter()
        .find(|(name, ..)| *name == model)
        .map(|(_, ratio, completion_ratio)| ModelConfig {
            ratio: *ratio,
            completion_ratio: *completion_ratio,
            ..ModelConfig::default()
        })
}

/// The raw `(model, ratio, completion_ratio)` table backing
/// [`adaptor_default_pricing`], exposed for the admin surface's
/// `GET /api/channel/default-pricing?type=<n>` listing (spec §6).
fn adaptor_default_table(channel_type: config::ChannelType) -> &'static [(&'static str, f64, f64)] {
    use config::ChannelType::*;

    match channel_type {
        Openai | AzureOpenai | OpenaiCompatible => &[
            ("gpt-4o", 2.5e-6, 4.0),
            ("gpt-4o-mini", 1.5e-7, 4.0),
            ("gpt-4-turbo", 1.0e-5, 3.0),
            ("o1", 1.5e-5, 4.0),
        ],
        Anthropic => &[
            ("claude-3-5-sonnet-20241022", 3.0e-6, 5.0),
            ("claude-3-5-haiku-20241022", 8.0e-7, 4.0),
            ("claude-3-opus-20240229", 1.5e-5, 5.0),
        ],
        Google => &[("gemini-1.5-pro", 1.25e-6, 4.0), ("gemini-1.5-flash", 7.5e-8, 4.0)],
        Bedrock => &[("anthropic.claude-3-5-sonnet-20241022-v2:0", 3.0e-6, 5.0)],
    }
}

/// Every built-in default `ModelConfig` for `channel_type`, keyed by model
/// name. Used by the admin surface to show an operator what a channel
/// would be priced at before they add an override.
pub fn adaptor_default_catalog(channel_type: config::ChannelType) -> BTreeMap<String, ModelConfig> {
    adaptor_default_table(channel_type)
        .iter()
        .map(|(name, ratio, completion_ratio)| {
            (
                name.to_string(),
                ModelConfig {
                    ratio: *ratio,
                    completion_ratio: *completion_ratio,
                    ..ModelConfig::default()
                },
            )
        })
        .collect()
}

/// Wraps `Repository::reserve_quota`/`settle_quota`, translating backend
/// errors into the relay's error taxonomy so controllers never match on
/// `RepositoryError` directly.
pub struct QuotaLedger<'a> {
    repo: &'a dyn Repository,
}

impl<'a> QuotaLedger<'a> {
    pub fn new(repo: &'a dyn Repository) -> Self {
        Self { repo }
    }

    /// Reserve `amount` quota units ahead of dispatching a request.
    pub async fn reserve(&self, user_id: &str, token_key: &str, amount: u64) -> RelayResult<()> {
        self.repo
            .reserve_quota(user_id, token_key, amount as i64)
            .await
            .map_err(map_repository_error)
    }

    /// Release the reservation and charge the actual amount instead, once
    /// the real usage is known.
    pub async fn settle(&self, user_id: &str, token_key: &str, reserved: u64, actual: u64) -> RelayResult<()> {
        self.repo
            .settle_quota(user_id, token_key, reserved as i64, actual as i64)
            .await
            .map_err(map_repository_error)
    }
}

fn map_repository_error(err: RepositoryError) -> RelayError {
    match err {
        RepositoryError::Conflict { .. } => RelayError::InsufficientQuota("insufficient quota remaining".to_string()),
        RepositoryError::NotFound { kind, id } => RelayError::NotFound(format!("{kind} '{id}' not found")),
        RepositoryError::Backend(err) => RelayError::Internal(err),
    }
}

#[cfg(test)]
mod tests {
    use config::{ApiChannelConfig, ChannelCommon, PricingTier};
    use secrecy::SecretString;

    use super::*;

    fn openai_channel(model_configs: BTreeMap<String, ModelConfig>) -> ChannelConfig {
        ChannelConfig::Openai(ApiChannelConfig {
            common: ChannelCommon {
                model_configs,
                ..ChannelCommon::default()
            },
            api_key: SecretString::from("sk-test".to_string()),
            base_url: None,
            deployment_id: None,
            api_version: None,
        })
    }

    #[test]
    fn falls_back_to_hardcoded_rate_when_nothing_configured() {
        let config = Config::default();
        let channel = openai_channel(BTreeMap::new());
        let resolver = PriceResolver::new(&config);

        let usage = Usage {
            prompt_tokens: 1_000,
            completion_tokens: 1_000,
            ..Usage::default()
        };

        let quota = resolver.price_completion(&channel, "some-unknown-model", &usage, "default");
        assert!(quota > 0);
    }

    #[test]
    fn channel_override_beats_adaptor_default() {
        let config = Config::default();
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "gpt-4o".to_string(),
            ModelConfig {
                ratio: 1.0e-6,
                completion_ratio: 1.0,
                ..ModelConfig::default()
            },
        );
        let channel = openai_channel(overrides);
        let resolver = PriceResolver::new(&config);

        let usage = Usage {
            prompt_tokens: 1_000_000,
            completion_tokens: 0,
            ..Usage::default()
        };

        // 1_000_000 tokens * 1e-6 USD/token = 1 USD = QUOTA_UNITS_PER_USD quota.
        let quota = resolver.price_completion(&channel, "gpt-4o", &usage, "default");
        assert_eq!(quota, QUOTA_UNITS_PER_USD as u64);
    }

    #[test]
    fn tier_with_highest_qualifying_threshold_wins() {
        let config = Config::default();
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "tiered-model".to_string(),
            ModelConfig {
                ratio: 1.0e-6,
                completion_ratio: 1.0,
                tiers: vec![
                    PricingTier {
                        input_token_threshold: 0,
                        ratio: 1.0e-6,
                        completion_ratio: 1.0,
                        ..PricingTier::default()
                    },
                    PricingTier {
                        input_token_threshold: 100_000,
                        ratio: 5.0e-7,
                        completion_ratio: 1.0,
                        ..PricingTier::default()
                    },
                ],
                ..ModelConfig::default()
            },
        );
        let channel = openai_channel(overrides);
        let resolver = PriceResolver::new(&config);

        let usage = Usage {
            prompt_tokens: 200_000,
            completion_tokens: 0,
            ..Usage::default()
        };

        // 200_000 tokens at the 100k+ tier's 5e-7 ratio = 0.1 USD.
        let quota = resolver.price_completion(&channel, "tiered-model", &usage, "default");
        assert_eq!(quota, (0.1 * QUOTA_UNITS_PER_USD).round() as u64);
    }

    #[test]
    fn group_multiplier_applies_last() {
        let mut config = Config::default();
        config.groups.insert(
            "enterprise".to_string(),
            config::GroupConfig { multiplier: 2.0 },
        );

        let mut overrides = BTreeMap::new();
        overrides.insert(
            "gpt-4o".to_string(),
            ModelConfig {
                ratio: 1.0e-6,
                completion_ratio: 1.0,
                ..ModelConfig::default()
            },
        );
        let channel = openai_channel(overrides);
        let resolver = PriceResolver::new(&config);

        let usage = Usage {
            prompt_tokens: 1_000_000,
            completion_tokens: 0,
            ..Usage::default()
        };

        let quota = resolver.price_completion(&channel, "gpt-4o", &usage, "enterprise");
        assert_eq!(quota, (2.0 * QUOTA_UNITS_PER_USD) as u64);
    }

    #[test]
    fn negative_cached_ratio_zeroes_its_bucket_without_discounting_the_rest() {
        let config = Config::default();
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "free-cache".to_string(),
            ModelConfig {
                ratio: 1.0e-6,
                completion_ratio: 1.0,
                cached_input_ratio: Some(-1.0),
                ..ModelConfig::default()
            },
        );
        let channel = openai_channel(overrides);
        let resolver = PriceResolver::new(&config);

        let usage = Usage {
            prompt_tokens: 1_000,
            cached_prompt_tokens: 1_000,
            completion_tokens: 0,
            ..Usage::default()
        };

        // Every prompt token is a cache hit priced at a negative (free)
        // ratio; the bucket must contribute 0, not a negative charge that
        // would offset other billing.
        let quota = resolver.price_completion(&channel, "free-cache", &usage, "default");
        assert_eq!(quota, 0);
    }

    #[test]
    fn resolution_normalization_collapses_orientation() {
        assert_eq!(normalize_resolution("720x1280"), normalize_resolution("1280x720"));
    }

    #[test]
    fn max_tokens_cap_rejects_oversized_requests() {
        let config = Config::default();
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "capped".to_string(),
            ModelConfig {
                max_tokens: 4_096,
                ..ModelConfig::default()
            },
        );
        let channel = openai_channel(overrides);
        let resolver = PriceResolver::new(&config);

        assert!(resolver.enforce_max_tokens(&channel, "capped", Some(8_192)).is_err());
        assert!(resolver.enforce_max_tokens(&channel, "capped", Some(2_048)).is_ok());
    }
}
