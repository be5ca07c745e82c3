//! The `Repository` trait the relay core consumes for users, tokens,
//! channels, request logs, and async-task bindings, plus an in-memory
//! reference implementation. A relational store is explicitly out of
//! scope (spec §1); this implementation is what the in-memory deployment
//! and the crate's own tests run against.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use config::ChannelConfig;

/// Errors a `Repository` implementation can report. The relay maps these
/// onto the error taxonomy in `error.rs` (`NotFound` -> `not_found_error`,
/// everything else -> `internal_error`/`upstream_error` as appropriate).
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
    #[error("conflicting update for {kind} '{id}'")]
    Conflict { kind: &'static str, id: String },
    #[error("repository backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// A token's outstanding quota: either a hard integer limit or unlimited.
#[derive(Debug, Clone, Copy)]
pub enum TokenQuota {
    Limited(i64),
    Unlimited,
}

/// API credential status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

/// A user record.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub role: UserRole,
    pub quota: i64,
    pub used_quota: i64,
    pub group: String,
}

/// A user's privilege level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UserRole {
    Common = 1,
    Admin = 10,
    Root = 100,
}

/// An API credential owned by a user.
#[derive(Debug, Clone)]
pub struct Token {
    pub key: String,
    pub user_id: String,
    pub name: String,
    pub status: TokenStatus,
    pub quota: TokenQuota,
    /// Optional model allowlist; empty means "inherit the user's access".
    pub models: Vec<String>,
    pub group_override: Option<String>,
}

impl Token {
    /// The group a request authenticated with this token should be billed
    /// and routed under.
    pub fn effective_group<'a>(&'a self, user: &'a User) -> &'a str {
        self.group_override.as_deref().unwrap_or(&user.group)
    }

    /// Whether `model` is permitted for this token.
    pub fn allows_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }
}

/// Runtime channel state layered over its static configuration: the
/// config's declared `status` is the default, but the selector can flip a
/// channel to auto-disabled at runtime after repeated failures.
#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub id: String,
    pub config: ChannelConfig,
    pub auto_disabled: bool,
    pub balance: Option<f64>,
    pub balance_updated_at: Option<i64>,
}

impl ChannelRecord {
    pub fn is_enabled(&self) -> bool {
        !self.auto_disabled && self.config.is_enabled()
    }
}

/// One record per completed billable request.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub timestamp: i64,
    pub user_id: String,
    pub username: String,
    pub token_id: String,
    pub token_name: String,
    pub channel_id: String,
    pub model_name: String,
    pub log_type: RequestLogType,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cached_prompt_tokens: u64,
    pub cached_completion_tokens: u64,
    pub metadata: Value,
    pub quota: i64,
    pub elapsed_time_ms: u64,
    pub request_id: String,
    pub trace_id: String,
    pub is_stream: bool,
    pub content: String,
}

/// The kind of ledger entry a `RequestLog` represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestLogType {
    Consume = 2,
    Topup,
    Manage,
    System,
    Test,
}

/// A task_id -> channel binding for async video/image jobs.
#[derive(Debug, Clone)]
pub struct AsyncTaskBinding {
    pub task_id: String,
    pub channel_id: String,
    pub origin_model: String,
    pub actual_model: String,
    pub task_type: String,
    pub created_at: i64,
    pub last_access_at: i64,
}

/// Users, tokens, channels, request logs, and async-task bindings, behind
/// one trait so the relay core never depends on a storage technology.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<User, RepositoryError>;
    async fn get_token(&self, key: &str) -> Result<Token, RepositoryError>;
    async fn get_channel(&self, channel_id: &str) -> Result<ChannelRecord, RepositoryError>;
    async fn list_channels(&self) -> Result<Vec<ChannelRecord>, RepositoryError>;
    async fn set_channel_auto_disabled(&self, channel_id: &str, auto_disabled: bool) -> Result<(), RepositoryError>;

    /// Conditionally reserve `amount` quota against both the user and
    /// token. Fails with `Conflict` if either has insufficient remaining
    /// quota (unlimited tokens always succeed).
    async fn reserve_quota(&self, user_id: &str, token_key: &str, amount: i64) -> Result<(), RepositoryError>;

    /// Release `reserved` and charge `actual` instead, for the same
    /// (user, token) pair a prior `reserve_quota` call touched.
    async fn settle_quota(
        &self,
        user_id: &str,
        token_key: &str,
        reserved: i64,
        actual: i64,
    ) -> Result<(), RepositoryError>;

    async fn insert_log(&self, log: RequestLog) -> Result<(), RepositoryError>;
    async fn get_log(&self, request_id: &str) -> Result<RequestLog, RepositoryError>;

    /// Install a per-model pricing override on a channel (spec §6's
    /// `PUT /api/channel/pricing/<id>`), replacing any prior override for
    /// that model name.
    async fn set_channel_model_pricing(
        &self,
        channel_id: &str,
        model: &str,
        pricing: config::ModelConfig,
    ) -> Result<(), RepositoryError>;

    async fn get_task_binding(&self, task_id: &str) -> Result<Option<AsyncTaskBinding>, RepositoryError>;
    async fn put_task_binding(&self, binding: AsyncTaskBinding) -> Result<(), RepositoryError>;
    async fn delete_task_binding(&self, task_id: &str) -> Result<(), RepositoryError>;
    /// Bindings whose `last_access_at` is older than `older_than` (unix
    /// seconds), for garbage collection.
    async fn gc_task_bindings(&self, older_than: i64) -> Result<u64, RepositoryError>;
}

struct UserState {
    user: User,
    quota: AtomicI64,
}

struct TokenState {
    token: Token,
    remaining: AtomicI64,
}

/// An in-memory `Repository`, seeded from configuration. Suitable for
/// tests and for small deployments that don't need a relational store.
#[derive(Default)]
pub struct InMemoryRepository {
    users: DashMap<String, UserState>,
    tokens: DashMap<String, TokenState>,
    channels: DashMap<String, ChannelRecord>,
    logs: DashMap<String, RequestLog>,
    task_bindings: DashMap<String, AsyncTaskBinding>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user, returning its id for convenience.
    pub fn insert_user(&self, user: User) {
        let quota = AtomicI64::new(user.quota);
        self.users.insert(user.id.clone(), UserState { user, quota });
    }

    /// Seed a token.
    pub fn insert_token(&self, token: Token) {
        let remaining = match token.quota {
            TokenQuota::Limited(n) => AtomicI64::new(n),
            TokenQuota::Unlimited => AtomicI64::new(i64::MAX),
        };

        self.tokens.insert(token.key.clone(), TokenState { token, remaining });
    }

    /// Seed a channel from its static configuration.
    pub fn insert_channel(&self, id: impl Into<String>, config: ChannelConfig) {
        let id = id.into();

        self.channels.insert(
            id.clone(),
            ChannelRecord {
                id,
                config,
                auto_disabled: false,
                balance: None,
                balance_updated_at: None,
            },
        );
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_user(&self, user_id: &str) -> Result<User, RepositoryError> {
        self.users
            .get(user_id)
            .map(|entry| entry.user.clone())
            .ok_or_else(|| RepositoryError::NotFound {
                kind: "user",
                id: user_id.to_string(),
            })
    }

    async fn get_token(&self, key: &str) -> Result<Token, RepositoryError> {
        self.tokens
            .get(key)
            .map(|entry| entry.token.clone())
            .ok_or_else(|| RepositoryError::NotFound {
                kind: "token",
                id: key.to_string(),
            })
    }

    async fn get_channel(&self, channel_id: &str) -> Result<ChannelRecord, RepositoryError> {
        self.channels
            .get(channel_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| RepositoryError::NotFound {
                kind: "channel",
                id: channel_id.to_string(),
            })
    }

    async fn list_channels(&self) -> Result<Vec<ChannelRecord>, RepositoryError> {
        Ok(self.channels.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn set_channel_auto_disabled(&self, channel_id: &str, auto_disabled: bool) -> Result<(), RepositoryError> {
        let mut entry = self
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| RepositoryError::NotFound {
                kind: "channel",
                id: channel_id.to_string(),
            })?;

        entry.auto_disabled = auto_disabled;
        Ok(())
    }

    async fn reserve_quota(&self, user_id: &str, token_key: &str, amount: i64) -> Result<(), RepositoryError> {
        let user = self.users.get(user_id).ok_or_else(|| RepositoryError::NotFound {
            kind: "user",
            id: user_id.to_string(),
        })?;

        let token = self.tokens.get(token_key).ok_or_else(|| RepositoryError::NotFound {
            kind: "token",
            id: token_key.to_string(),
        })?;

        if matches!(token.token.quota, TokenQuota::Unlimited) {
            return Ok(());
        }

        // Conditional update: "set remain = remain - amount where remain >= amount".
        let user_remaining = user.quota.load(Ordering::SeqCst);
        let token_remaining = token.remaining.load(Ordering::SeqCst);

        if user_remaining < amount || token_remaining < amount {
            return Err(RepositoryError::Conflict {
                kind: "quota",
                id: token_key.to_string(),
            });
        }

        user.quota.fetch_sub(amount, Ordering::SeqCst);
        token.remaining.fetch_sub(amount, Ordering::SeqCst);

        Ok(())
    }

    async fn settle_quota(
        &self,
        user_id: &str,
        token_key: &str,
        reserved: i64,
        actual: i64,
    ) -> Result<(), RepositoryError> {
        let user = self.users.get(user_id).ok_or_else(|| RepositoryError::NotFound {
            kind: "user",
            id: user_id.to_string(),
        })?;

        let token = self.tokens.get(token_key).ok_or_else(|| RepositoryError::NotFound {
            kind: "token",
            id: token_key.to_string(),
        })?;

        if matches!(token.token.quota, TokenQuota::Unlimited) {
            return Ok(());
        }

        let delta = reserved - actual;
        user.quota.fetch_add(delta, Ordering::SeqCst);
        token.remaining.fetch_add(delta, Ordering::SeqCst);

        Ok(())
    }

    async fn insert_log(&self, log: RequestLog) -> Result<(), RepositoryError> {
        self.logs.insert(log.request_id.clone(), log);
        Ok(())
    }

    async fn get_log(&self, request_id: &str) -> Result<RequestLog, RepositoryError> {
        self.logs
            .get(request_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| RepositoryError::NotFound {
                kind: "request log",
                id: request_id.to_string(),
            })
    }

    async fn set_channel_model_pricing(
        &self,
        channel_id: &str,
        model: &str,
        pricing: config::ModelConfig,
    ) -> Result<(), RepositoryError> {
        let mut entry = self
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| RepositoryError::NotFound {
                kind: "channel",
                id: channel_id.to_string(),
            })?;

        entry.config.common_mut().model_configs.insert(model.to_string(), pricing);
        Ok(())
    }

    async fn get_task_binding(&self, task_id: &str) -> Result<Option<AsyncTaskBinding>, RepositoryError> {
        Ok(self.task_bindings.get(task_id).map(|entry| entry.clone()))
    }

    async fn put_task_binding(&self, binding: AsyncTaskBinding) -> Result<(), RepositoryError> {
        self.task_bindings.insert(binding.task_id.clone(), binding);
        Ok(())
    }

    async fn delete_task_binding(&self, task_id: &str) -> Result<(), RepositoryError> {
        self.task_bindings.remove(task_id);
        Ok(())
    }

    async fn gc_task_bindings(&self, older_than: i64) -> Result<u64, RepositoryError> {
        let stale: Vec<String> = self
            .task_bindings
            .iter()
            .filter(|entry| entry.last_access_at < older_than)
            .map(|entry| entry.key().clone())
            .collect();

        let count = stale.len() as u64;

        for task_id in stale {
            self.task_bindings.remove(&task_id);
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> InMemoryRepository {
        let repo = InMemoryRepository::new();

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

        repo
    }

    #[tokio::test]
    async fn reserve_then_settle_refunds_unused_quota() {
        let repo = seed();

        repo.reserve_quota("user-1", "token-1", 1_000).await.unwrap();
        repo.settle_quota("user-1", "token-1", 1_000, 400).await.unwrap();

        assert_eq!(repo.users.get("user-1").unwrap().quota.load(Ordering::SeqCst), 9_600);
    }

    #[tokio::test]
    async fn reserve_fails_when_quota_insufficient() {
        let repo = seed();

        let err = repo.reserve_quota("user-1", "token-1", 20_000).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict { .. }));
    }

    #[tokio::test]
    async fn set_channel_model_pricing_overrides_and_is_visible_via_get_channel() {
        let repo = seed();
        repo.insert_channel(
            "chan-1",
            ChannelConfig::Openai(config::ApiChannelConfig {
                common: config::ChannelCommon::default(),
                api_key: secrecy::SecretString::from("sk-test".to_string()),
                base_url: None,
                deployment_id: None,
                api_version: None,
            }),
        );

        repo.set_channel_model_pricing(
            "chan-1",
            "gpt-4o",
            config::ModelConfig {
                ratio: 5e-6,
                ..config::ModelConfig::default()
            },
        )
        .await
        .unwrap();

        let channel = repo.get_channel("chan-1").await.unwrap();
        let overridden = channel.config.common().model_configs.get("gpt-4o").unwrap();
        assert_eq!(overridden.ratio, 5e-6);
    }

    #[tokio::test]
    async fn get_log_returns_not_found_before_insertion() {
        let repo = seed();
        let err = repo.get_log("req_nonexistent").await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn task_binding_round_trips() {
        let repo = seed();

        repo.put_task_binding(AsyncTaskBinding {
            task_id: "vid_abc".to_string(),
            channel_id: "42".to_string(),
            origin_model: "sora-2".to_string(),
            actual_model: "sora-2".to_string(),
            task_type: "video".to_string(),
            created_at: 0,
            last_access_at: 0,
        })
        .await
        .unwrap();

        let found = repo.get_task_binding("vid_abc").await.unwrap();
        assert_eq!(found.unwrap().channel_id, "42");

        repo.delete_task_binding("vid_abc").await.unwrap();
        assert!(repo.get_task_binding("vid_abc").await.unwrap().is_none());
    }
}
