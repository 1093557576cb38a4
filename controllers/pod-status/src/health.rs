//! Liveness, readiness and metrics endpoints.

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use pod_relay::{ControllerState, PodController};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Routes `/healthz`, `/readyz` and `/metrics` for `controller`.
pub fn router(controller: Arc<PodController>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(controller)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Ready only while workers are draining the queue.
async fn readyz(State(controller): State<Arc<PodController>>) -> (StatusCode, String) {
    match controller.state() {
        ControllerState::Running => (StatusCode::OK, "ready".to_string()),
        state => (StatusCode::SERVICE_UNAVAILABLE, state.to_string()),
    }
}

async fn metrics(State(controller): State<Arc<PodController>>) -> Response {
    match controller.metrics().render() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Serves the probe routes on `listener` until `shutdown` fires.
pub async fn serve(
    controller: Arc<PodController>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "probe server listening");
    axum::serve(listener, router(controller))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
