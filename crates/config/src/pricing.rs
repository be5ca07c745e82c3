//! Pricing configuration: per-model ratios, tiers, and multimedia billing.

use std::collections::BTreeMap;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// One ascending-threshold pricing tier. Fields left at zero inherit the
/// base (tier 0) value defined on the owning [`ModelConfig`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PricingTier {
    /// Prompt-token count at or above which this tier becomes active.
    pub input_token_threshold: u64,
    pub ratio: f64,
    pub completion_ratio: f64,
    pub cached_input_ratio: f64,
    pub cache_write_5m_ratio: f64,
    pub cache_write_1h_ratio: f64,
}

/// Per-model pricing, attached to a channel, an adaptor default catalog, or
/// the global registry (see the four-layer resolution in `relay::pricing`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// USD per input token, e.g. `2.5e-6` for $2.50 / million tokens.
    pub ratio: f64,
    /// Output-to-input price multiplier.
    pub completion_ratio: f64,
    /// Override for cache-hit input tokens. Negative means free. `None`
    /// falls back to `ratio`.
    pub cached_input_ratio: Option<f64>,
    /// Override for 5-minute-TTL cache-write tokens. `None` falls back to `ratio`.
    pub cache_write_5m_ratio: Option<f64>,
    /// Override for 1-hour-TTL cache-write tokens. `None` falls back to `ratio`.
    pub cache_write_1h_ratio: Option<f64>,
    /// Hard cap on completion tokens. Zero means unlimited.
    pub max_tokens: u64,
    /// Ascending-threshold tiers; tier 0 is this struct's own base fields.
    pub tiers: Vec<PricingTier>,
    /// Video generation pricing, if this model produces video.
    pub video: Option<VideoPricing>,
    /// Audio transcription/synthesis pricing, if applicable.
    pub audio: Option<AudioPricing>,
    /// Image generation pricing, if applicable.
    pub image: Option<ImagePricing>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            ratio: 0.0,
            completion_ratio: 1.0,
            cached_input_ratio: None,
            cache_write_5m_ratio: None,
            cache_write_1h_ratio: None,
            max_tokens: 0,
            tiers: Vec::new(),
            video: None,
            audio: None,
            image: None,
        }
    }
}

/// The hardcoded final fallback (layer 4): never blocks a request, only
/// prices it defensively. 2.5 USD / million tokens, 1:1 completion ratio.
pub const FALLBACK_RATIO_USD_PER_TOKEN: f64 = 2.5e-6;
pub const FALLBACK_COMPLETION_RATIO: f64 = 1.0;

/// 1 USD == this many quota units.
pub const QUOTA_UNITS_PER_USD: f64 = 500_000.0;

/// Video generation pricing. Resolution keys are normalized so that
/// orientation-swapped strings (`"720x1280"` / `"1280x720"`) collapse onto
/// the same multiplier (larger dimension first).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct VideoPricing {
    pub per_second_usd: f64,
    pub resolution_multipliers: BTreeMap<String, f64>,
}

/// Audio pricing: either a direct per-second rate, or a token-equivalent
/// rate billed through the regular text formula.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AudioPricing {
    pub prompt_tokens_per_second: Option<f64>,
    pub usd_per_second: Option<f64>,
}

/// Image generation pricing.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImagePricing {
    pub price_per_image_usd: f64,
    pub size_multipliers: BTreeMap<String, f64>,
    pub quality_multipliers: BTreeMap<String, f64>,
    /// Combined multiplier keyed by quality, then size; takes precedence
    /// over the separate `size_multipliers`/`quality_multipliers` maps.
    pub quality_size_multipliers: BTreeMap<String, BTreeMap<String, f64>>,
    pub min_images: u32,
    pub max_images: u32,
    /// Additional per-token prompt cost; zero disables it.
    pub ratio: f64,
    pub prompt_token_limit: u64,
}

/// Per-call price for one built-in tool.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPrice {
    UsdPerCall(f64),
    QuotaPerCall(u64),
}

impl ToolPrice {
    /// Resolve this price to a quota charge for a single invocation.
    pub fn quota_per_call(&self) -> u64 {
        match *self {
            ToolPrice::UsdPerCall(usd) => (usd * QUOTA_UNITS_PER_USD).round() as u64,
            ToolPrice::QuotaPerCall(quota) => quota,
        }
    }
}

/// Built-in tool policy for a channel.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolingConfig {
    /// Allowed tool names. Empty or absent means all priced tools are allowed.
    pub whitelist: Option<IndexSet<String>>,
    /// Per-tool pricing. A tool is usable only if it is in the effective
    /// whitelist AND has a non-zero price here.
    pub pricing: BTreeMap<String, ToolPrice>,
}

impl ToolingConfig {
    /// Whether `tool` may be invoked on this channel.
    pub fn allows(&self, tool: &str) -> bool {
        let whitelisted = match &self.whitelist {
            Some(set) if set.is_empty() => true,
            Some(set) => set.contains(tool),
            None => true,
        };

        whitelisted && self.pricing.contains_key(tool)
    }
}

/// The global pricing catalog (layer 3 of the four-layer resolution):
/// model pricing merged across vendors so that OpenAI-compatible channels
/// pointed at proxies still price well-known models correctly.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PricingRegistryConfig {
    pub models: BTreeMap<String, ModelConfig>,
}

/// Per-group billing multiplier, applied last after all other pricing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GroupConfig {
    pub multiplier: f64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self { multiplier: 1.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_price_quota_conversion() {
        assert_eq!(ToolPrice::UsdPerCall(0.01).quota_per_call(), 5_000);
        assert_eq!(ToolPrice::QuotaPerCall(42).quota_per_call(), 42);
    }

    #[test]
    fn tooling_empty_whitelist_allows_any_priced_tool() {
        let mut tooling = ToolingConfig::default();
        tooling.pricing.insert("web_search".to_string(), ToolPrice::UsdPerCall(0.01));

        assert!(tooling.allows("web_search"));
        assert!(!tooling.allows("code_interpreter"));
    }

    #[test]
    fn tooling_whitelist_restricts() {
        let mut tooling = ToolingConfig::default();
        tooling.pricing.insert("web_search".to_string(), ToolPrice::UsdPerCall(0.01));
        tooling.pricing.insert("code_interpreter".to_string(), ToolPrice::UsdPerCall(0.02));
        tooling.whitelist = Some(IndexSet::from(["web_search".to_string()]));

        assert!(tooling.allows("web_search"));
        assert!(!tooling.allows("code_interpreter"));
    }
}
