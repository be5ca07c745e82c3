use args::Args;
use clap::Parser;
use tokio_util::sync::CancellationToken;

mod args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    server::logger::init(&args.log_filter);

    log::info!("one-api {}", env!("CARGO_PKG_VERSION"));

    let mut config = config::Config::load(&args.config)?;

    if let Some(listen_address) = args.listen_address {
        config.server.listen_address = Some(listen_address);
    }

    config.validate()?;

    let shutdown_signal = CancellationToken::new();
    let shutdown = shutdown_signal.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received ctrl-c, shutting down gracefully...");
            shutdown.cancel();
        }
    });

    let listen_address = config
        .server
        .listen_address
        .unwrap_or_else(|| "127.0.0.1:8080".parse().expect("valid default address"));

    server::serve(server::ServeConfig {
        listen_address,
        config,
        shutdown_signal,
    })
    .await
}
