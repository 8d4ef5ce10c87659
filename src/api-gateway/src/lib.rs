//! Nexus Integration Gateway library
//!
//! Request pipeline and supporting services: route resolution, rate
//! limiting, payload transformation, credential validation, and outcome
//! events.

pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware_layer;
pub mod routes;
pub mod services;
pub mod state;

pub use config::Config;
pub use error::{GatewayError, Result};
pub use state::AppState;

use axum::{http::HeaderValue, middleware, Router};
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

/// Build the application router: control endpoints as explicit routes, the
/// proxy pipeline as the fallback for everything else.
pub fn build_router(state: AppState) -> Router {
    let pipeline = Router::new()
        .fallback(services::proxy::process)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            middleware_layer::auth::auth_middleware,
        ));

    routes::public::router()
        .merge(pipeline)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(cors_layer(&state))
                .layer(middleware::from_fn(
                    middleware_layer::correlation::correlation_middleware,
                )),
        )
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins = &state.config.cors.allowed_origins;
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new().allow_origin(AllowOrigin::list(parsed))
}
