use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use hookrelay::config::Config;
use hookrelay::event::NoStateResolver;
use hookrelay::server;

#[derive(Parser)]
#[command(name = "hookrelay", version, about = "Source-control webhook gateway")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env before anything else reads env vars
    if let Err(e) = dotenvy::dotenv() {
        // Not an error, .env is optional
        warn!("no .env file loaded: {e}");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hookrelay=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    info!(
        port = config.server.port,
        github = config.providers.github.enabled,
        gitlab = config.providers.gitlab.enabled,
        bitbucket = config.providers.bitbucket.enabled,
        rules = config.rules.len(),
        "starting hookrelay"
    );

    let (router, shared) = server::build(&config, Arc::new(NoStateResolver)).await?;

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = shared.publisher.close().await {
        warn!(error = %e, "publisher close reported errors");
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
