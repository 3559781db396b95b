use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{self, net::TcpListener};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use ultraflux_core::{FluxLoader, ImageService, ServiceConfig};

mod routes;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "UltraFlux image generation server")]
struct Args {
    #[command(flatten)]
    service: ServiceConfig,

    /// Host address to bind the server to
    #[arg(long, env = "ULTRAFLUX_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "ULTRAFLUX_PORT", default_value_t = 8000)]
    port: u16,
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let service = Arc::new(ImageService::new(FluxLoader, args.service)?);

    // --- Load the pipeline in the background, /healthz reports progress ---
    let warm = service.clone();
    tokio::spawn(async move {
        if let Err(err) = warm.warm_up().await {
            error!("pipeline warm-up failed, retrying on first request: {err:#}");
        }
    });

    let app = routes::router(service);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
