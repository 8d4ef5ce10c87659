//! Root service descriptor

use axum::{extract::State, response::Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /`: name, version, and the control-endpoint map
pub async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "name": "nexus-api-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "API gateway for the Nexus integration platform",
        "environment": state.config.environment,
        "timestamp": chrono::Utc::now(),
        "endpoints": {
            "health": "/health",
            "readiness": "/health/ready",
            "liveness": "/health/live",
            "metrics": "/metrics",
            "openapi": "/swagger",
        },
    }))
}
