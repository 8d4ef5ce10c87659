//! Control endpoints that bypass the proxy pipeline

use axum::{routing::get, Router};

use crate::{handlers, state::AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(handlers::info::root))
        .route("/health", get(handlers::health::health))
        .route("/health/ready", get(handlers::health::ready))
        .route("/health/live", get(handlers::health::live))
        .route("/metrics", get(handlers::health::metrics))
        .route("/swagger", get(handlers::health::swagger))
}
