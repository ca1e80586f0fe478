//! WxCallback Web Server - WeCom callback receiver.
//!
//! This binary serves the callback URL configured in the WeCom admin console:
//! - Answers URL verification challenges
//! - Decrypts inbound messages and returns encrypted replies
//! - Exposes a health endpoint
//!
//! It starts even when credentials are missing so health checks keep working;
//! callback requests will then fail signature or key validation.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wxcallback::web::router;
use wxcallback::{AppState, Config, WxBizMsgCrypt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        host = %config.host,
        port = config.port,
        corp_id = %config.credentials.corp_id,
        max_body_bytes = config.max_body_bytes,
        request_timeout_ms = config.request_timeout_ms,
        crypto_timeout_ms = config.crypto_timeout_ms,
        "config_loaded"
    );

    for env_var in config.credentials.missing_fields() {
        warn!(env_var, "credential_not_configured");
    }

    // Create the crypto collaborator and application state
    let crypt = Arc::new(WxBizMsgCrypt::new(config.credentials.clone()));
    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config, crypt);

    // Build the router
    let app = router(state);

    // Bind to address
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("web_server_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("web_server_shutting_down");
}
