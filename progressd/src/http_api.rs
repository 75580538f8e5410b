//! HTTP surface of the daemon.
//!
//! Provides:
//! - `/` - `"<total>/<passing>"` as plain text
//! - `/metrics` - Prometheus metrics export
//! - `/health` - daemon health and last refresh times
//! - `/<source>-webhook` - one POST route per configured webhook source

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use progress_common::TestSet;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::metrics::ProgressMetrics;
use crate::reconcile::Reconciler;
use crate::webhook::WebhookDispatcher;

/// Push payloads can be large for big merges.
const WEBHOOK_BODY_LIMIT: usize = 25 * 1024 * 1024;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub reconciler: Arc<Reconciler>,
    pub dispatcher: WebhookDispatcher,
    pub metrics: ProgressMetrics,
    /// Daemon version.
    pub version: &'static str,
    /// Daemon start time.
    pub started_at: Instant,
}

/// Create the router, with a webhook route for every configured source.
pub fn create_router(state: HttpState) -> Router {
    let mut router: Router<Arc<HttpState>> = Router::new()
        .route("/", get(progress_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler));

    for source in state.dispatcher.sources() {
        let name = source.name.clone();
        router = router.route(
            &source.route(),
            post(
                move |State(state): State<Arc<HttpState>>, headers: HeaderMap, body: Bytes| {
                    let name = name.clone();
                    async move { webhook_handler(&state, &name, &headers, &body) }
                },
            )
            .layer(DefaultBodyLimit::max(WEBHOOK_BODY_LIMIT)),
        );
    }

    router.with_state(Arc::new(state))
}

/// Handler for `/` - stored counts as `total/passing`.
///
/// Returns 503 until some refresh has ever been stored.
async fn progress_handler(State(state): State<Arc<HttpState>>) -> Response {
    match state.reconciler.store().published_counts_blocking().await {
        Ok(Some(counts)) => counts.to_string().into_response(),
        Ok(None) => (StatusCode::SERVICE_UNAVAILABLE, "No data yet").into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to read test counts");
            (StatusCode::SERVICE_UNAVAILABLE, "Store unavailable").into_response()
        }
    }
}

/// Handler for `/metrics` - Prometheus metrics export.
async fn metrics_handler(State(state): State<Arc<HttpState>>) -> Response {
    match state.metrics.encode() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            output,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

/// Handler for `/health` - basic daemon health check.
async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let last_refresh = |set| {
        state
            .reconciler
            .last_success(set)
            .map(|at| at.to_rfc3339())
    };

    Json(json!({
        "status": "healthy",
        "version": state.version,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "last_refresh": {
            "total": last_refresh(TestSet::Total),
            "passing": last_refresh(TestSet::Passing),
        },
    }))
}

fn webhook_handler(state: &HttpState, source: &str, headers: &HeaderMap, body: &[u8]) -> Response {
    match state.dispatcher.handle(source, body, headers) {
        Ok(outcome) => outcome.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Serve `router` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
