//! one-api server wiring: builds the in-memory repository from
//! configuration, mounts the chat-shaped relay router
//! (ChatCompletions/Responses/Messages) alongside the thin admin CRUD
//! surface (spec §6), and serves both with graceful shutdown.
//!
//! Grounded on the teacher's `crates/server/src/lib.rs` `serve` entry
//! point shape (build routers, merge, bind, `tokio::select!` against a
//! `CancellationToken`); TLS termination, CORS/CSRF, OAuth, MCP, and
//! OTLP export are all out of scope here (spec §1) so the layer stack
//! the teacher builds around its router is not carried forward.

mod admin;
pub mod error;
pub mod logger;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use config::Config;
use relay::controller::RelayController;
use relay::repository::{InMemoryRepository, Repository};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use error::Error;

/// Configuration for serving one-api.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to.
    pub listen_address: SocketAddr,
    /// The validated one-api configuration.
    pub config: Config,
    /// Cancellation token for graceful shutdown.
    pub shutdown_signal: CancellationToken,
}

/// Build an in-memory `Repository` seeded with the channels from
/// configuration. Users, tokens, and request logs are populated by the
/// (out-of-scope) database layer in a production deployment; this
/// reference implementation starts empty of those and relies on the
/// admin surface / an operator-provided seed to populate them.
fn build_repository(config: &Config) -> Arc<dyn Repository> {
    let repo = InMemoryRepository::new();

    for (id, channel) in &config.channels {
        repo.insert_channel(id.clone(), channel.clone());
    }

    Arc::new(repo)
}

/// Starts and runs the one-api server with the provided configuration.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        shutdown_signal,
    }: ServeConfig,
) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let repo = build_repository(&config);

    let controller = Arc::new(RelayController::new(config.clone(), repo)?);

    let app = Router::new()
        .merge(relay::router_with_controller(controller.clone()))
        .merge(admin::router(controller))
        .route("/healthz", get(relay::healthz));

    let listener = TcpListener::bind(listen_address).await.map_err(Error::Bind)?;

    log::info!("one-api listening on http://{listen_address}");

    tokio::select! {
        result = axum::serve(listener, app.into_make_service()) => {
            result.map_err(Error::Server)?;
        }
        () = shutdown_signal.cancelled() => {
            log::info!("received shutdown signal, shutting down gracefully...");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_repository_seeds_configured_channels() {
        let mut config = Config::default();
        config.channels.insert(
            "chan-1".to_string(),
            config::ChannelConfig::Openai(config::ApiChannelConfig {
                common: config::ChannelCommon::default(),
                api_key: secrecy::SecretString::from("sk-test".to_string()),
                base_url: None,
                deployment_id: None,
                api_version: None,
            }),
        );

        let repo = build_repository(&config);
        assert!(repo.get_channel("chan-1").await.is_ok());
    }
}
