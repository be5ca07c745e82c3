use std::path::PathBuf;

use clap::Parser;

/// one-api: a multi-tenant gateway that brokers chat, completion, embedding,
/// rerank, image, audio and video requests across heterogeneous AI vendors.
#[derive(Debug, Parser)]
#[command(name = "one-api", version)]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "ONE_API_CONFIG", default_value = "one-api.toml")]
    pub config: PathBuf,

    /// Socket address to listen on, overriding the configuration file.
    #[arg(long, env = "ONE_API_LISTEN_ADDRESS")]
    pub listen_address: Option<std::net::SocketAddr>,

    /// Log filter, e.g. "info" or "relay=debug,server=debug".
    #[arg(long, env = "ONE_API_LOG", default_value = "info")]
    pub log_filter: String,
}
