//! Channel configuration: upstream vendor credentials, routing, and pricing
//! overrides. Channels are seeded from the TOML file into the repository's
//! in-memory reference implementation (the spec's data model treats
//! channels as DB rows; persistence itself is out of scope here).

use std::collections::BTreeMap;

use indexmap::{IndexMap, IndexSet};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::pricing::{ModelConfig, ToolingConfig};

/// Vendor adaptor a channel dispatches through.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelType {
    Openai,
    AzureOpenai,
    Anthropic,
    Google,
    Bedrock,
    /// Generic OpenAI-wire-dialect vendor (Aliyun, Baidu, Zhipu, DeepL,
    /// Replicate, Ollama, or any OpenAI-compatible proxy), parameterized by
    /// `base_url`.
    OpenaiCompatible,
}

/// Operational status of a channel.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

/// Fields shared by every channel regardless of vendor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelCommon {
    pub name: String,
    pub status: ChannelStatus,
    /// Higher is preferred; channels are partitioned by priority before
    /// weighted selection within the top non-empty partition.
    pub priority: i32,
    /// Legacy relative weight used to pick among equal-priority channels.
    /// When every candidate has weight zero, selection is uniform.
    pub weight: u32,
    /// Requests/minute cap. Zero means unlimited.
    pub rate_limit: u32,
    /// Groups this channel serves; must contain at least one entry.
    pub groups: IndexSet<String>,
    /// Allowlisted client model names. Empty means "all models the adaptor
    /// supports".
    pub models: IndexSet<String>,
    /// Client-requested model name to upstream model name rewrite.
    pub model_mapping: IndexMap<String, String>,
    /// Per-model pricing overrides (layer 1 of the four-layer resolution).
    pub model_configs: BTreeMap<String, ModelConfig>,
    pub tooling: ToolingConfig,
    pub system_prompt: Option<String>,
}

impl Default for ChannelCommon {
    fn default() -> Self {
        Self {
            name: String::new(),
            status: ChannelStatus::default(),
            priority: 0,
            weight: 0,
            rate_limit: 0,
            groups: IndexSet::from(["default".to_string()]),
            models: IndexSet::new(),
            model_mapping: IndexMap::new(),
            model_configs: BTreeMap::new(),
            tooling: ToolingConfig::default(),
            system_prompt: None,
        }
    }
}

/// Configuration for API-key vendors: OpenAI, Azure OpenAI, Anthropic, Google,
/// and the generic OpenAI-compatible adaptor.
#[derive(Debug, Clone)]
pub struct ApiChannelConfig {
    pub common: ChannelCommon,
    pub api_key: SecretString,
    pub base_url: Option<String>,
    /// Azure deployment/resource id, or the Coze bot id. Unused by other
    /// vendors.
    pub deployment_id: Option<String>,
    /// API version string, e.g. Azure's `api-version` query parameter.
    pub api_version: Option<String>,
}

impl<'de> Deserialize<'de> for ApiChannelConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(default)]
        struct Shadow {
            #[serde(flatten)]
            common: ChannelCommon,
            api_key: String,
            base_url: Option<String>,
            deployment_id: Option<String>,
            api_version: Option<String>,
        }

        impl Default for Shadow {
            fn default() -> Self {
                Self {
                    common: ChannelCommon::default(),
                    api_key: String::new(),
                    base_url: None,
                    deployment_id: None,
                    api_version: None,
                }
            }
        }

        let raw = Shadow::deserialize(deserializer)?;

        Ok(Self {
            common: raw.common,
            api_key: SecretString::from(raw.api_key),
            base_url: raw.base_url,
            deployment_id: raw.deployment_id,
            api_version: raw.api_version,
        })
    }
}

/// Configuration specific to AWS Bedrock, authenticated via SigV4 rather
/// than a bearer token.
#[derive(Debug, Clone)]
pub struct BedrockChannelConfig {
    pub common: ChannelCommon,
    pub access_key_id: Option<SecretString>,
    pub secret_access_key: Option<SecretString>,
    pub session_token: Option<SecretString>,
    pub profile: Option<String>,
    pub region: String,
    pub base_url: Option<String>,
}

impl<'de> Deserialize<'de> for BedrockChannelConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Shadow {
            #[serde(flatten)]
            common: ChannelCommon,
            access_key_id: Option<SecretString>,
            secret_access_key: Option<SecretString>,
            session_token: Option<SecretString>,
            profile: Option<String>,
            region: String,
            base_url: Option<String>,
        }

        let raw = Shadow::deserialize(deserializer)?;

        Ok(Self {
            common: raw.common,
            access_key_id: raw.access_key_id,
            secret_access_key: raw.secret_access_key,
            session_token: raw.session_token,
            profile: raw.profile,
            region: raw.region,
            base_url: raw.base_url,
        })
    }
}

/// Complete channel configuration, tagged by vendor.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum ChannelConfig {
    Openai(ApiChannelConfig),
    AzureOpenai(ApiChannelConfig),
    Anthropic(ApiChannelConfig),
    Google(ApiChannelConfig),
    Bedrock(BedrockChannelConfig),
    OpenaiCompatible(ApiChannelConfig),
}

impl ChannelConfig {
    pub fn channel_type(&self) -> ChannelType {
        match self {
            Self::Openai(_) => ChannelType::Openai,
            Self::AzureOpenai(_) => ChannelType::AzureOpenai,
            Self::Anthropic(_) => ChannelType::Anthropic,
            Self::Google(_) => ChannelType::Google,
            Self::Bedrock(_) => ChannelType::Bedrock,
            Self::OpenaiCompatible(_) => ChannelType::OpenaiCompatible,
        }
    }

    pub fn common(&self) -> &ChannelCommon {
        match self {
            Self::Openai(c) | Self::AzureOpenai(c) | Self::Anthropic(c) | Self::Google(c) | Self::OpenaiCompatible(c) => {
                &c.common
            }
            Self::Bedrock(c) => &c.common,
        }
    }

    /// Mutable access to the shared fields, for the admin surface's
    /// per-channel pricing override endpoint (spec §6).
    pub fn common_mut(&mut self) -> &mut ChannelCommon {
        match self {
            Self::Openai(c) | Self::AzureOpenai(c) | Self::Anthropic(c) | Self::Google(c) | Self::OpenaiCompatible(c) => {
                &mut c.common
            }
            Self::Bedrock(c) => &mut c.common,
        }
    }

    pub fn base_url(&self) -> Option<&str> {
        match self {
            Self::Openai(c) | Self::AzureOpenai(c) | Self::Anthropic(c) | Self::Google(c) | Self::OpenaiCompatible(c) => {
                c.base_url.as_deref()
            }
            Self::Bedrock(c) => c.base_url.as_deref(),
        }
    }

    /// Whether this channel is eligible for selection right now (ignoring
    /// cooldown state, which the relay crate tracks separately).
    pub fn is_enabled(&self) -> bool {
        self.common().status == ChannelStatus::Enabled
    }

    /// Whether `model` may be routed to this channel per its allowlist.
    pub fn allows_model(&self, model: &str) -> bool {
        let models = &self.common().models;
        models.is_empty() || models.contains(model)
    }

    /// Resolve the upstream model name for a client-requested model,
    /// applying `model_mapping` if present.
    pub fn actual_model_name<'a>(&'a self, requested: &'a str) -> &'a str {
        self.common()
            .model_mapping
            .get(requested)
            .map(String::as_str)
            .unwrap_or(requested)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use insta::assert_debug_snapshot;

    use super::*;

    #[test]
    fn parses_openai_channel() {
        let toml = indoc! {r#"
            type = "openai"
            name = "openai-primary"
            api_key = "sk-test"
            priority = 10
            groups = ["default", "pro"]
        "#};

        let channel: ChannelConfig = toml::from_str(toml).unwrap();

        assert_eq!(channel.channel_type(), ChannelType::Openai);
        assert_eq!(channel.common().name, "openai-primary");
        assert_eq!(channel.common().priority, 10);
        assert!(channel.is_enabled());
    }

    #[test]
    fn applies_model_mapping() {
        let toml = indoc! {r#"
            type = "openai-compatible"
            name = "aliyun"
            api_key = "sk-test"
            base_url = "https://dashscope.aliyuncs.com/compatible-mode/v1"

            [model_mapping]
            "gpt-4o" = "qwen-max"
        "#};

        let channel: ChannelConfig = toml::from_str(toml).unwrap();

        assert_eq!(channel.actual_model_name("gpt-4o"), "qwen-max");
        assert_eq!(channel.actual_model_name("other"), "other");
    }

    #[test]
    fn bedrock_requires_region() {
        let toml = indoc! {r#"
            type = "bedrock"
            name = "bedrock-us"
            region = "us-east-1"
        "#};

        let channel: ChannelConfig = toml::from_str(toml).unwrap();

        assert_debug_snapshot!(channel.channel_type(), @"Bedrock");
    }
}
