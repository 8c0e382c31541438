//! Palaver chat server entry point.
//!
//! Loads configuration, wires storage, queue, balancer and inference
//! gateway, then serves the HTTP surface until SIGINT or SIGTERM.
//!
//! # Environment variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `PALAVER_CONFIG` | Optional YAML / TOML / JSON configuration file |
//! | `PALAVER__<SECTION>__<KEY>` | Overrides one setting, e.g. `PALAVER__SERVER__PORT=9000` |
//! | `RUST_LOG` | Overrides `logging.filter` |

mod config;
mod error;
mod server;
mod wiring;

use anyhow::Context;
use config::{AppConfig, LoggingConfig};
use server::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("load configuration")?;
    init_tracing(&config.logging);

    let components = wiring::build(&config).await?;
    let state = AppState {
        orchestrator: components.orchestrator.clone(),
        metrics: Some(components.metrics.clone()),
        max_page_size: config.server.max_page_size,
    };

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %addr, "palaver server listening");

    let orchestrator = components.orchestrator.clone();
    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open SSE responses would otherwise hold the server open.
            orchestrator.cancel_streams();
        })
        .await
        .context("http server")?;

    info!("http server stopped, draining background work");
    components.shutdown(config.chat.cleanup_timeout).await;
    info!("palaver server stopped");
    Ok(())
}
