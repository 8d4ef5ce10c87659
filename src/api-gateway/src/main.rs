//! Nexus Integration Gateway
//!
//! Sits between untrusted callers and the internal service fleet: caller
//! identification, quota enforcement, pattern-based routing with load
//! balancing, payload re-shaping, resilient proxying, and per-request
//! outcome events.

use std::net::SocketAddr;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nexus_api_gateway::{build_router, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting Nexus Integration Gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    config.validate()?;
    info!(environment = %config.environment, "Configuration loaded");

    let state = match AppState::new(config.clone()).await {
        Ok(state) => state,
        Err(e) => {
            warn!(error = %e, "Full startup failed, entering degraded mode");
            AppState::new_degraded(config.clone()).await?
        }
    };

    if let Err(e) = state.event_bus.start().await {
        warn!(error = %e, "Event bus failed to start; outcome events degraded");
    }

    let app = build_router(state.clone());
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Gateway listening on {}", addr);
    info!("Health endpoint: http://{}/health", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Err(e) = state.event_bus.stop().await {
        warn!(error = %e, "Event bus shutdown reported an error");
    }
    info!("Gateway shutdown complete");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nexus_api_gateway=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("Received Ctrl+C, shutting down"),
        _ = terminate => warn!("Received SIGTERM, shutting down"),
    }
}
