use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{self, AppState};
use crate::registry::RunRegistry;

/// Configuration for the API server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allow cross-origin requests from any dashboard
    pub permissive_cors: bool,
    /// How long live runs get to reach a stage boundary on shutdown
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            permissive_cors: false,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

pub fn build_router(state: Arc<AppState>, permissive_cors: bool) -> Router {
    let app = api::api_router().with_state(state);
    if permissive_cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Serve the API until Ctrl+C, then stop every live run.
pub async fn start_server(config: ServerConfig, registry: RunRegistry) -> Result<()> {
    let state = Arc::new(AppState { registry });
    let app = build_router(Arc::clone(&state), config.permissive_cors);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, "server listening");
    println!("flagforge API running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.registry.shutdown(config.shutdown_grace).await;
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
