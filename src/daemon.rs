use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::json;
use tracing::info;

use crate::telemetry::MonitorTelemetry;

pub fn router(telemetry: Arc<MonitorTelemetry>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(telemetry)
}

/// Start the health check HTTP server.
pub async fn start_health_server(
    bind: &str,
    port: u16,
    telemetry: Arc<MonitorTelemetry>,
) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("Health server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(telemetry)).await?;

    Ok(())
}

/// 200 while every cycle's latest run succeeded, 503 otherwise.
async fn health_handler(
    State(telemetry): State<Arc<MonitorTelemetry>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let failing = telemetry.failing_cycles();
    if failing.is_empty() {
        (StatusCode::OK, Json(json!({"status": "ok"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded", "failing_cycles": failing})),
        )
    }
}

async fn metrics_handler(State(telemetry): State<Arc<MonitorTelemetry>>) -> Json<serde_json::Value> {
    Json(json!({
        "counters": telemetry.snapshot(),
        "cycles": telemetry.cycles(),
    }))
}
