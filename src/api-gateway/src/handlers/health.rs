//! Health, metrics, and OpenAPI control handlers

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
};
use serde::Serialize;

use crate::services::health::{CheckResult, HealthReport, HealthStatus};
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: HealthStatus,
    timestamp: chrono::DateTime<chrono::Utc>,
    checks: Vec<CheckResult>,
}

fn render(report: HealthReport) -> Response {
    let status_code = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = HealthResponse {
        status: report.status,
        timestamp: chrono::Utc::now(),
        checks: report.checks,
    };
    (status_code, Json(body)).into_response()
}

/// `GET /health`: every configured check
pub async fn health(State(state): State<AppState>) -> Response {
    render(state.health.check_all().await)
}

/// `GET /health/ready`: infrastructure checks only
pub async fn ready(State(state): State<AppState>) -> Response {
    render(state.health.check_ready().await)
}

/// `GET /health/live`: process liveness, no dependencies
pub async fn live() -> Response {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now(),
    }))
    .into_response()
}

/// `GET /metrics`: Prometheus exposition
pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(text) => text.into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("# metrics unavailable: {}\n", e),
        )
            .into_response(),
    }
}

/// `GET /swagger`: minimal OpenAPI UI shell
pub async fn swagger() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
  <head><title>Nexus Integration Gateway</title></head>
  <body>
    <h1>Nexus Integration Gateway</h1>
    <p>Proxied APIs are mounted under their configured route patterns.</p>
    <ul>
      <li><a href="/">service descriptor</a></li>
      <li><a href="/health">health</a></li>
      <li><a href="/metrics">metrics</a></li>
    </ul>
  </body>
</html>"#,
    )
}
