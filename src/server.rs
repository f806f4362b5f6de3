//! Operator endpoints
//!
//! `GET /metrics` serves the Prometheus text exposition, `GET /stats` a JSON
//! snapshot of the emitter and metric backends.

use crate::error::{Result, TelemetryError};
use crate::metrics::prometheus::CONTENT_TYPE;
use crate::telemetry::{ComplianceTelemetry, TelemetryStatus};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the scrape router
pub fn router(telemetry: Arc<ComplianceTelemetry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(telemetry)
}

async fn metrics(State(telemetry): State<Arc<ComplianceTelemetry>>) -> Response {
    match telemetry.metrics().exposition() {
        Some(Ok(body)) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        Some(Err(e)) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Prometheus backend not enabled",
        )
            .into_response(),
    }
}

async fn stats(State(telemetry): State<Arc<ComplianceTelemetry>>) -> Json<TelemetryStatus> {
    Json(telemetry.status())
}

/// Serve the scrape endpoints on `metrics_addr` until `shutdown` resolves
pub async fn serve(
    telemetry: Arc<ComplianceTelemetry>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let bind_addr = telemetry.config().metrics_addr.clone();
    let app = router(telemetry);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| TelemetryError::Server(format!("Failed to bind to {bind_addr}: {e}")))?;

    tracing::info!("Metrics server listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
