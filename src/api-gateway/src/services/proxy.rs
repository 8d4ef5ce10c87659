//! The request-processing pipeline
//!
//! Installed as the router's fallback handler, so everything that is not a
//! control endpoint lands here: rate-limit check, route resolution, scope
//! enforcement, optional payload transforms, resilient dispatch to the
//! backend, and a fire-and-forget outcome event.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use nexus_shared::{IntegrationEvent, Principal};

use crate::error::{GatewayError, Result};
use crate::middleware_layer::auth::API_KEY_HEADER;
use crate::middleware_layer::correlation::{CorrelationId, CORRELATION_HEADER};
use crate::services::router::RouteMatch;
use crate::state::AppState;

/// Largest request body the pipeline will buffer
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Request-side mapping pair
const REQUEST_MAPPING: (&str, &str) = ("gateway.incoming", "service.request");
/// Response-side mapping pair
const RESPONSE_MAPPING: (&str, &str) = ("service.response", "gateway.outgoing");

/// Paths served by control endpoints, never proxied
const CONTROL_PREFIXES: [&str; 3] = ["/health", "/metrics", "/swagger"];

/// Pipeline entry point
pub async fn process(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();
    state.metrics.requests_in_flight.inc();

    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .map(|c| c.0.clone())
        .unwrap_or_default();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let result = run(&state, request, &correlation_id).await;
    state.metrics.requests_in_flight.dec();

    match result {
        Ok(outcome) => {
            let duration_ms = started.elapsed().as_millis() as u64;
            state
                .metrics
                .requests_total
                .with_label_values(&[
                    method.as_str(),
                    outcome.service_name.as_str(),
                    outcome.status.as_str(),
                ])
                .inc();
            state
                .metrics
                .request_duration_seconds
                .with_label_values(&[method.as_str(), outcome.service_name.as_str()])
                .observe(started.elapsed().as_secs_f64());

            let mut event = IntegrationEvent::api_request_processed(
                correlation_id,
                &outcome.service_name,
                outcome.status.as_u16(),
                duration_ms,
                outcome.subject.as_deref(),
                &path,
                method.as_str(),
            );
            if outcome.rate_limiter_degraded {
                event
                    .payload
                    .insert("rateLimiterDegraded".into(), Value::Bool(true));
            }
            publish_outcome(&state, event);
            outcome.response
        }
        Err(error) => {
            if matches!(error, GatewayError::RateLimited { .. }) {
                state
                    .metrics
                    .rate_limit_rejections_total
                    .with_label_values(&[rate_limit_policy(&error)])
                    .inc();
            }
            let event = IntegrationEvent::gateway_error_occurred(
                correlation_id,
                error.code(),
                &error.to_string(),
                &path,
                method.as_str(),
            );
            publish_outcome(&state, event);
            error.into_response()
        }
    }
}

struct PipelineOutcome {
    response: Response,
    service_name: String,
    status: StatusCode,
    subject: Option<String>,
    rate_limiter_degraded: bool,
}

async fn run(
    state: &AppState,
    request: Request,
    correlation_id: &str,
) -> Result<PipelineOutcome> {
    let path = request.uri().path().to_string();
    if CONTROL_PREFIXES.iter().any(|p| path.starts_with(p)) {
        // Control endpoints own these prefixes; an unmatched path here is a miss
        return Err(GatewayError::not_found(path));
    }

    let method = request.method().clone();
    let query = request.uri().query().map(str::to_string);
    let principal = request.extensions().get::<Principal>().cloned();
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string());
    let headers = request.headers().clone();

    // Admission
    let client_id = derive_client_id(principal.as_ref(), &headers, remote_addr.as_deref());
    let mut rate_limiter_degraded = false;
    if state.config.rate_limiting.enabled {
        let admission = state.rate_limiter.check(&client_id, &path).await?;
        if !admission.allowed {
            return Err(GatewayError::RateLimited {
                policy: admission.policy,
                limit: admission.limit,
                remaining: admission.remaining,
                retry_after_secs: admission
                    .retry_after
                    .map(|d| d.as_secs().max(1))
                    .unwrap_or(1),
            });
        }
        rate_limiter_degraded = admission.degraded;
    }

    // Route resolution
    let route = state
        .resolver
        .resolve(method.as_str(), &path, query.as_deref())
        .ok_or_else(|| GatewayError::RouteNotFound {
            method: method.to_string(),
            path: path.clone(),
        })?;
    debug!(route = %route.route_id, target = %route.target_uri, "Route resolved");

    // Scope enforcement happens here: the scope set lives on the route
    if !route.required_scopes.is_empty() {
        let authorized = principal
            .as_ref()
            .map(|p| p.has_all_scopes(&route.required_scopes))
            .unwrap_or(false);
        if !authorized {
            return Err(GatewayError::forbidden(format!(
                "route '{}' requires scopes {:?}",
                route.route_id, route.required_scopes
            )));
        }
    }

    // Request-side transform
    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::internal(format!("failed to read request body: {}", e)))?;
    let (body, request_transformed) = transform_body(
        state,
        body,
        &headers,
        REQUEST_MAPPING.0,
        REQUEST_MAPPING.1,
        false,
    )
    .await?;

    // Dispatch with retry and circuit breaking
    let backend_response = dispatch(
        state,
        &route,
        &method,
        &headers,
        body,
        request_transformed,
        correlation_id,
    )
    .await?;

    let status = backend_response.status();
    let backend_headers = backend_response.headers().clone();
    let backend_body = backend_response
        .bytes()
        .await
        .map_err(|e| GatewayError::bad_gateway(format!("failed to read backend body: {}", e)))?;

    // Response-side transform
    let (final_body, response_transformed) = transform_body(
        state,
        backend_body,
        &backend_headers,
        RESPONSE_MAPPING.0,
        RESPONSE_MAPPING.1,
        true,
    )
    .await?;

    let response = build_response(status, &backend_headers, final_body, response_transformed)?;

    Ok(PipelineOutcome {
        response,
        service_name: route.service_name,
        status,
        subject: principal.map(|p| p.subject),
        rate_limiter_degraded,
    })
}

/// First non-empty of: subject claim, client-id claim, API key, remote
/// address, `"anonymous"`.
fn derive_client_id(
    principal: Option<&Principal>,
    headers: &HeaderMap,
    remote_addr: Option<&str>,
) -> String {
    if let Some(principal) = principal {
        if !principal.subject.is_empty() {
            return principal.subject.clone();
        }
        if let Some(client_id) = principal.claim("client_id") {
            return client_id.to_string();
        }
    }
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        if !key.is_empty() {
            return key.to_string();
        }
    }
    if let Some(addr) = remote_addr {
        return addr.to_string();
    }
    "anonymous".to_string()
}

/// Apply the `(source → target)` mapping when the body is JSON and a
/// mapping is registered. Returns the (possibly new) bytes and whether a
/// transform ran.
async fn transform_body(
    state: &AppState,
    body: Bytes,
    headers: &HeaderMap,
    source: &str,
    target: &str,
    response_side: bool,
) -> Result<(Bytes, bool)> {
    if body.is_empty() || !is_json(headers) || !state.transformer.has_mapping(source, target) {
        return Ok((body, false));
    }
    let Ok(document) = serde_json::from_slice::<Value>(&body) else {
        // Declared JSON but unparseable; forward untouched
        return Ok((body, false));
    };
    let transformed = if response_side {
        state
            .transformer
            .transform_response(&document, source, target)
            .await?
    } else {
        state
            .transformer
            .transform_request(&document, source, target)
            .await?
    };
    Ok((Bytes::from(serde_json::to_vec(&transformed)?), true))
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false)
}

async fn dispatch(
    state: &AppState,
    route: &RouteMatch,
    method: &Method,
    inbound_headers: &HeaderMap,
    body: Bytes,
    body_transformed: bool,
    correlation_id: &str,
) -> Result<reqwest::Response> {
    if !state.circuit_breaker.can_execute(&route.service_name) {
        state
            .metrics
            .circuit_open_total
            .with_label_values(&[&route.service_name])
            .inc();
        return Err(GatewayError::CircuitOpen {
            service: route.service_name.clone(),
        });
    }

    let builder = build_outbound(
        state,
        route,
        method,
        inbound_headers,
        body,
        body_transformed,
        correlation_id,
    )?;

    let result = tokio::time::timeout(
        route.timeout,
        send_with_retries(builder, route.retry.retries, route.retry.backoff_base_secs),
    )
    .await;

    match result {
        Ok(Ok(response)) => {
            state.circuit_breaker.record_success(&route.service_name);
            Ok(response)
        }
        Ok(Err(error)) => {
            state.circuit_breaker.record_failure(&route.service_name);
            Err(error)
        }
        Err(_elapsed) => {
            state.circuit_breaker.record_failure(&route.service_name);
            Err(GatewayError::gateway_timeout(format!(
                "no response from '{}' within {:?}",
                route.service_name, route.timeout
            )))
        }
    }
}

fn build_outbound(
    state: &AppState,
    route: &RouteMatch,
    method: &Method,
    inbound_headers: &HeaderMap,
    body: Bytes,
    body_transformed: bool,
    correlation_id: &str,
) -> Result<reqwest::RequestBuilder> {
    let mut builder = state
        .http_client
        .request(method.clone(), &route.target_uri)
        .timeout(route.timeout);

    for (name, value) in inbound_headers {
        let skip = name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::CONTENT_TYPE
            || name == header::TRANSFER_ENCODING
            || name.as_str().starts_with("content-");
        if !skip {
            builder = builder.header(name, value);
        }
    }

    // Route overrides win over forwarded headers
    for (name, value) in &route.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = builder.header(CORRELATION_HEADER, correlation_id);

    if !body.is_empty() {
        let content_type = if body_transformed {
            Some(HeaderValue::from_static("application/json"))
        } else {
            inbound_headers.get(header::CONTENT_TYPE).cloned()
        };
        if let Some(content_type) = content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        builder = builder.body(body);
    }

    Ok(builder)
}

/// Retry transient failures (502/503/504 and network errors) with
/// exponential backoff; other statuses pass through to the caller.
/// `retries` counts attempts after the first.
async fn send_with_retries(
    builder: reqwest::RequestBuilder,
    retries: u32,
    backoff_base_secs: u64,
) -> Result<reqwest::Response> {
    let mut last_error: Option<GatewayError> = None;

    for attempt in 0..=retries {
        if attempt > 0 {
            let delay = backoff_base_secs << (attempt - 1);
            debug!(attempt, delay_secs = delay, "Retrying backend dispatch");
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }

        let request = builder
            .try_clone()
            .ok_or_else(|| GatewayError::internal("request body is not replayable"))?;

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if is_transient_status(status) {
                    last_error = Some(GatewayError::bad_gateway(format!(
                        "backend returned {}",
                        status
                    )));
                    continue;
                }
                return Ok(response);
            }
            Err(error) => {
                last_error = Some(if error.is_timeout() {
                    GatewayError::gateway_timeout(error.to_string())
                } else {
                    GatewayError::bad_gateway(error.to_string())
                });
            }
        }
    }

    Err(last_error.unwrap_or_else(|| GatewayError::bad_gateway("backend unreachable")))
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Rebuild the caller-facing response; hop-by-hop and length headers are
/// recomputed for the buffered body.
fn build_response(
    status: StatusCode,
    backend_headers: &HeaderMap,
    body: Bytes,
    body_modified: bool,
) -> Result<Response> {
    let mut response = Response::builder().status(status);
    for (name, value) in backend_headers {
        let skip = name == header::CONTENT_LENGTH
            || name == header::TRANSFER_ENCODING
            || name == header::CONNECTION
            || (body_modified && name == header::CONTENT_TYPE);
        if !skip {
            response = response.header(name, value);
        }
    }
    if body_modified {
        response = response.header(header::CONTENT_TYPE, "application/json");
    }
    response
        .body(Body::from(body))
        .map_err(|e| GatewayError::internal(e.to_string()))
}

/// Events never block the response; failures are logged and swallowed
fn publish_outcome(state: &AppState, event: IntegrationEvent) {
    let bus = state.event_bus.clone();
    let metrics = state.metrics.clone();
    tokio::spawn(async move {
        let event_type = event.event_type.clone();
        match bus.publish(&event).await {
            Ok(()) => {
                metrics
                    .events_published_total
                    .with_label_values(&[&event_type, "ok"])
                    .inc();
            }
            Err(e) => {
                metrics
                    .events_published_total
                    .with_label_values(&[&event_type, "error"])
                    .inc();
                warn!(error = %e, event_type = %event_type, "Outcome event publish failed");
            }
        }
    });
}

fn rate_limit_policy(error: &GatewayError) -> &str {
    match error {
        GatewayError::RateLimited { policy, .. } => policy,
        _ => "unknown",
    }
}
