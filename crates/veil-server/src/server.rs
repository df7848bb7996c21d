//! Control API server: router construction and startup.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use veil_core::StateProvider;

use crate::hub::BroadcastHub;
use crate::sse;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Port to bind on localhost. 0 picks a free port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 4050 }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub provider: Arc<dyn StateProvider>,
    pub started_at: Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/events/state", get(sse::state_events))
        .route("/healthcheck", get(healthcheck))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind the control API on localhost and start serving. The returned handle
/// keeps the server task alive.
pub async fn start(
    config: ServerConfig,
    hub: Arc<BroadcastHub>,
    provider: Arc<dyn StateProvider>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState {
        hub,
        provider,
        started_at: Instant::now(),
    };
    let router = build_router(state);

    let addr = format!("127.0.0.1:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "control API listening");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
    })
}

/// Handle returned by [`start`] — keeps the server task alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}

async fn healthcheck(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "uptime": format!("{}s", state.started_at.elapsed().as_secs()),
        "process": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
