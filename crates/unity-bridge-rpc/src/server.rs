//! HTTP server implementation using Axum.

use crate::handler::{handle_health, handle_rpc};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use unity_bridge::Bridge;

/// Upper bound on RPC calls served at once. Each one may hold an admission
/// slot while it waits for the editor.
const MAX_CONCURRENT_CALLS: usize = 256;

/// Application state shared across handlers.
pub struct AppState {
    pub bridge: Arc<Bridge>,
}

/// Build the router for `state`.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/rpc", post(handle_rpc))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_CALLS))
                .layer(cors),
        )
        .with_state(state)
}

/// Start the JSON-RPC HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(
    bridge: Arc<Bridge>,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let app = router(Arc::new(AppState { bridge }));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("RPC server listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("RPC server error: {}", e);
        }
    });

    Ok(actual_addr)
}
