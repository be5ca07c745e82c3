//! HTTP server configuration settings.

use std::net::SocketAddr;

use serde::Deserialize;

/// Log rotation cadence for the (currently stderr-only) logger.
///
/// The fields below are carried through configuration and validated so that
/// an operator's existing settings round-trip, but file rotation itself is
/// out of scope here: only a stderr logger ships.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogRotationInterval {
    Hourly,
    Daily,
    Weekly,
}

impl Default for LogRotationInterval {
    fn default() -> Self {
        Self::Daily
    }
}

/// What to do when the format auto-detector finds a body that doesn't match
/// the endpoint it was posted to.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutoDetectFormatAction {
    /// Rewrite the request to the canonical endpoint and re-dispatch.
    Transparent,
    /// Return a 302 redirect to the canonical endpoint.
    Redirect,
}

impl Default for AutoDetectFormatAction {
    fn default() -> Self {
        Self::Transparent
    }
}

/// HTTP server configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// The socket address the server should listen on.
    pub listen_address: Option<SocketAddr>,

    /// Enables verbose debug logging regardless of the `--log-filter` CLI flag.
    pub debug: bool,

    /// Directory log files would be written to, if file logging were enabled.
    pub log_dir: String,

    /// Days to retain rotated log files.
    pub log_retention_days: u32,

    /// Rotation cadence for log files.
    pub log_rotation_interval: LogRotationInterval,

    /// When true, all output goes to a single file instead of one per rotation.
    pub only_one_log_file: bool,

    /// Whether quota/usage counters are flushed to the repository in batches
    /// rather than on every request.
    pub batch_update_enabled: bool,

    /// Batch flush interval, in seconds.
    pub batch_update_interval_secs: u64,

    /// How often, in seconds, an in-flight streaming response re-checks and
    /// flushes its running cost against quota.
    pub streaming_billing_interval_secs: u64,

    /// Whether the format auto-detector middleware is active.
    pub auto_detect_api_format: bool,

    /// What the auto-detector does when it finds a mismatched body.
    pub auto_detect_api_format_action: AutoDetectFormatAction,

    /// Time-to-live, in seconds, for async-task-to-channel bindings before
    /// they become eligible for garbage collection.
    pub async_task_binding_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            debug: false,
            log_dir: "./logs".to_string(),
            log_retention_days: 7,
            log_rotation_interval: LogRotationInterval::default(),
            only_one_log_file: false,
            batch_update_enabled: false,
            batch_update_interval_secs: 5,
            streaming_billing_interval_secs: 3,
            auto_detect_api_format: true,
            auto_detect_api_format_action: AutoDetectFormatAction::default(),
            async_task_binding_ttl_secs: 24 * 60 * 60,
        }
    }
}
