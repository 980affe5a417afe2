//! Coordinator wiring: one axum router serving both the submission API and
//! the agent WebSocket endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::gateway::{ws_handler, Gateway};

pub fn build_router(api_state: ApiState, gateway: Arc<Gateway>, ws_path: &str) -> Router {
    let ws_routes = Router::new()
        .route(ws_path, get(ws_handler))
        .with_state(gateway);
    api::router(api_state).merge(ws_routes)
}

/// Serves until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "coordinator listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
