//! AWS Bedrock Converse API. Authentication is SigV4, handled entirely by
//! the AWS SDK rather than a header the adaptor sets itself, so this is
//! the one adaptor that doesn't go through `reqwest` at all.

use async_trait::async_trait;
use aws_config::Region;
use aws_credential_types::Credentials;
use aws_sdk_bedrockruntime::Client as BedrockRuntimeClient;
use aws_sdk_bedrockruntime::types::{
    ContentBlock as BedrockContentBlock, ConversationRole, ConverseStreamOutput, InferenceConfiguration,
    Message as BedrockMessage, SystemContentBlock,
};
use config::{BedrockChannelConfig, ChannelConfig, ChannelType};
use futures::stream;
use secrecy::ExposeSecret;

use crate::error::{RelayError, RelayResult};
use crate::normalized::{NormalizedChunk, NormalizedRequest, NormalizedResponse, NormalizedRole};
use crate::pricing::Usage;

use super::{Adaptor, ChunkStream};

pub struct BedrockAdaptor;

impl BedrockAdaptor {
    fn bedrock_config(channel: &ChannelConfig) -> RelayResult<&BedrockChannelConfig> {
        match channel {
            ChannelConfig::Bedrock(c) => Ok(c),
            _ => Err(RelayError::Internal(anyhow::anyhow!(
                "non-bedrock channel dispatched to the Bedrock adaptor"
            ))),
        }
    }

    async fn client(config: &BedrockChannelConfig) -> BedrockRuntimeClient {
        let mut loader = aws_config::from_env().region(Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key.expose_secret(),
                secret_key.expose_secret(),
                config.session_token.as_ref().map(|t| t.expose_secret().to_string()),
                None,
                "one-api-bedrock",
            ));
        }

        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }

        let mut sdk_config = loader.load().await;

        if let Some(base_url) = &config.base_url {
            sdk_config = sdk_config.into_builder().endpoint_url(base_url).build();
        }

        BedrockRuntimeClient::new(&sdk_config)
    }

    fn convert_messages(request: &NormalizedRequest) -> (Option<Vec<SystemContentBlock>>, Vec<BedrockMessage>) {
        let system = request
            .system
            .as_ref()
            .map(|text| vec![SystemContentBlock::Text(text.clone())]);

        let messages = request
            .messages
            .iter()
            .filter(|m| m.role != NormalizedRole::System)
            .filter_map(|message| {
                let role = match message.role {
                    NormalizedRole::Assistant => ConversationRole::Assistant,
                    _ => ConversationRole::User,
                };

                BedrockMessage::builder()
                    .role(role)
                    .content(BedrockContentBlock::Text(message.text.clone()))
                    .build()
                    .ok()
            })
            .collect();

        (system, messages)
    }

    fn inference_config(request: &NormalizedRequest) -> InferenceConfiguration {
        InferenceConfiguration::builder()
            .set_max_tokens(request.max_tokens.map(|v| v as i32))
            .set_temperature(request.temperature)
            .set_top_p(request.top_p)
            .set_stop_sequences((!request.stop.is_empty()).then(|| request.stop.clone()))
            .build()
    }

    fn map_sdk_error(err: impl std::fmt::Debug, vendor_tag: &str) -> RelayError {
        RelayError::upstream(format!("{err:?}"), vendor_tag.to_string())
    }
}

#[async_trait]
impl Adaptor for BedrockAdaptor {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Bedrock
    }

    async fn send_chat(
        &self,
        _client: &reqwest::Client,
        channel: &ChannelConfig,
        request: &NormalizedRequest,
        actual_model: &str,
    ) -> RelayResult<NormalizedResponse> {
        let config = Self::bedrock_config(channel)?;
        let client = Self::client(config).await;

        let (system, messages) = Self::convert_messages(request);
        let inference_config = Self::inference_config(request);

        let output = client
            .converse()
            .model_id(actual_model)
            .set_messages(Some(messages))
            .set_system(system)
            .inference_config(inference_config)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "bedrock_error"))?;

        let text = output
            .output()
            .and_then(|o| o.as_message().ok())
            .and_then(|message| message.content().first())
            .and_then(|block| block.as_text().ok())
            .cloned()
            .unwrap_or_default();

        // The Converse API's TokenUsage exposes input/output counts; prompt
        // caching is reported per-model through CloudWatch rather than this
        // struct as of this SDK version, so cache buckets stay at zero here.
        let usage = output
            .usage()
            .map(|usage| Usage {
                prompt_tokens: usage.input_tokens().max(0) as u64,
                completion_tokens: usage.output_tokens().max(0) as u64,
                cached_prompt_tokens: 0,
                cache_write_5m_tokens: 0,
                cache_write_1h_tokens: 0,
            })
            .unwrap_or_default();

        Ok(NormalizedResponse {
            id: String::new(),
            model: actual_model.to_string(),
            text,
            tool_calls: None,
            finish_reason: Some(output.stop_reason().as_str().to_string()),
            usage,
            service_tier: None,
            system_fingerprint: None,
        })
    }

    async fn send_chat_stream(
        &self,
        _client: &reqwest::Client,
        channel: &ChannelConfig,
        request: &NormalizedRequest,
        actual_model: &str,
    ) -> RelayResult<ChunkStream> {
        let config = Self::bedrock_config(channel)?;
        let client = Self::client(config).await;

        let (system, messages) = Self::convert_messages(request);
        let inference_config = Self::inference_config(request);

        let output = client
            .converse_stream()
            .model_id(actual_model)
            .set_messages(Some(messages))
            .set_system(system)
            .inference_config(inference_config)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, "bedrock_error"))?;

        let model = actual_model.to_string();

        let chunk_stream = stream::unfold((output.stream, model), move |(mut events, model)| async move {
            loop {
                match events.recv().await {
                    Ok(Some(event)) => {
                        let chunk = chunk_from_event(&event, &model);
                        return Some((Ok(chunk), (events, model)));
                    }
                    Ok(None) => return None,
                    Err(e) => return Some((Err(BedrockAdaptor::map_sdk_error(e, "bedrock_error")), (events, model))),
                }
            }
        });

        Ok(Box::pin(chunk_stream))
    }
}

fn chunk_from_event(event: &ConverseStreamOutput, model: &str) -> NormalizedChunk {
    match event {
        ConverseStreamOutput::ContentBlockDelta(delta) => {
            let text = delta.delta().and_then(|d| d.as_text().ok()).cloned();

            NormalizedChunk {
                id: String::new(),
                model: model.to_string(),
                delta_text: text,
                delta_tool_calls: None,
                finish_reason: None,
                usage: None,
            }
        }
        ConverseStreamOutput::MessageStop(stop) => NormalizedChunk {
            id: String::new(),
            model: model.to_string(),
            delta_text: None,
            delta_tool_calls: None,
            finish_reason: Some(stop.stop_reason().as_str().to_string()),
            usage: None,
        },
        ConverseStreamOutput::Metadata(metadata) => {
            let usage = metadata.usage().map(|usage| Usage {
                prompt_tokens: usage.input_tokens().max(0) as u64,
                completion_tokens: usage.output_tokens().max(0) as u64,
                cached_prompt_tokens: 0,
                cache_write_5m_tokens: 0,
                cache_write_1h_tokens: 0,
            });

            NormalizedChunk {
                id: String::new(),
                model: model.to_string(),
                delta_text: None,
                delta_tool_calls: None,
                finish_reason: None,
                usage,
            }
        }
        _ => NormalizedChunk {
            id: String::new(),
            model: model.to_string(),
            ..NormalizedChunk::default()
        },
    }
}
