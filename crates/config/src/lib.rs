//! Typed configuration for one-api: the TOML file an operator supplies,
//! validated and deserialized into the shapes the rest of the workspace
//! consumes.

#![warn(missing_docs)]

mod channel;
mod dynamic_string;
mod error;
mod loader;
mod pricing;
mod server;

use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;

pub use channel::{ApiChannelConfig, BedrockChannelConfig, ChannelCommon, ChannelConfig, ChannelStatus, ChannelType};
pub use error::Error;
pub use pricing::{
    AudioPricing, FALLBACK_COMPLETION_RATIO, FALLBACK_RATIO_USD_PER_TOKEN, GroupConfig, ImagePricing, ModelConfig,
    PricingRegistryConfig, PricingTier, QUOTA_UNITS_PER_USD, ToolPrice, ToolingConfig, VideoPricing,
};
pub use server::{AutoDetectFormatAction, LogRotationInterval, ServerConfig};

/// Root configuration structure for the one-api gateway.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server and ambient runtime settings.
    pub server: ServerConfig,
    /// Upstream channels, keyed by a stable operator-chosen id.
    pub channels: IndexMap<String, ChannelConfig>,
    /// The global pricing catalog (layer 3 of the four-layer price
    /// resolution).
    pub pricing: PricingRegistryConfig,
    /// Per-group billing multiplier overrides, keyed by group name.
    pub groups: IndexMap<String, GroupConfig>,
}

impl Config {
    /// Load configuration from a file path, expanding `${VAR}` /
    /// `{{ env.VAR }}` references against the process environment first.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validate cross-field invariants the type system can't express: at
    /// least one channel configured, and every channel belongs to a group.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate_has_channels(self)?;
        loader::validate_channel_groups(self)?;

        Ok(())
    }

    /// The billing multiplier for `group`, defaulting to 1.0 when
    /// unconfigured.
    pub fn group_multiplier(&self, group: &str) -> f64 {
        self.groups.get(group).map(|g| g.multiplier).unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_debug_snapshot;

    use crate::Config;

    #[test]
    fn defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_debug_snapshot!(&config, @r#"
        Config {
            server: ServerConfig {
                listen_address: None,
                debug: false,
                log_dir: "./logs",
                log_retention_days: 7,
                log_rotation_interval: Daily,
                only_one_log_file: false,
                batch_update_enabled: false,
                batch_update_interval_secs: 5,
                streaming_billing_interval_secs: 3,
                auto_detect_api_format: true,
                auto_detect_api_format_action: Transparent,
                async_task_binding_ttl_secs: 86400,
            },
            channels: {},
            pricing: PricingRegistryConfig {
                models: {},
            },
            groups: {},
        }
        "#);
    }

    #[test]
    fn unconfigured_group_defaults_to_unit_multiplier() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.group_multiplier("default"), 1.0);
    }
}
