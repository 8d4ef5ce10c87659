//! End-to-end pipeline tests against an in-process backend
//!
//! The gateway runs with the in-memory counter store and a disabled event
//! bus, so no external infrastructure is required.

use axum::{
    body::Body,
    extract::Path,
    http::{HeaderMap, Request, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

use nexus_api_gateway::config::Config;
use nexus_api_gateway::services::rate_limiter::RateLimitPolicy;
use nexus_api_gateway::services::router::{RetryPolicy, RouteDefinition};
use nexus_api_gateway::services::transformer::{FieldMapping, OperatorKind, SchemaMapping};
use nexus_api_gateway::{build_router, AppState};
use nexus_shared::TokenClaims;

const JWT_SECRET: &str = "integration-test-secret-key-with-length";

/// Backend fixture: echoes enough request detail to assert forwarding
async fn spawn_backend() -> SocketAddr {
    // Fails twice, then serves; exercises the retry loop
    let flaky_calls = Arc::new(AtomicU32::new(0));

    let app = Router::new()
        .route(
            "/api/customers/:id",
            get(|Path(id): Path<String>, headers: HeaderMap| async move {
                Json(json!({
                    "id": id,
                    "correlation": headers
                        .get("x-correlation-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default(),
                }))
            }),
        )
        .route(
            "/api/projects",
            post(|Json(body): Json<Value>| async move { Json(body) }),
        )
        .route(
            "/api/unstable",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
        )
        .route(
            "/api/flaky",
            get(move || {
                let flaky_calls = Arc::clone(&flaky_calls);
                async move {
                    if flaky_calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        (StatusCode::SERVICE_UNAVAILABLE, "warming up").into_response()
                    } else {
                        Json(json!({ "ok": true })).into_response()
                    }
                }
            }),
        )
        .route("/health", get(|| async { "ok" }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn route_to(
    id: &str,
    pattern: &str,
    base_url: &str,
    template: Option<&str>,
    scopes: &[&str],
) -> RouteDefinition {
    RouteDefinition {
        id: id.to_string(),
        pattern: pattern.to_string(),
        service_name: "erp".to_string(),
        base_url: base_url.to_string(),
        target_path_template: template.map(str::to_string),
        methods: Vec::new(),
        required_scopes: scopes.iter().map(|s| s.to_string()).collect(),
        priority: 10,
        timeout_secs: 5,
        retry: RetryPolicy {
            retries: 0,
            backoff_base_secs: 1,
        },
        active: true,
        headers: HashMap::new(),
    }
}

fn base_config() -> Config {
    let mut config = Config::default();
    config.jwt.secret = JWT_SECRET.to_string();
    config
}

async fn gateway(config: Config) -> Router {
    let state = AppState::new_degraded(config).await.unwrap();
    build_router(state)
}

fn bearer(scopes: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = TokenClaims {
        sub: "user-1".to_string(),
        iss: "nexus-platform".to_string(),
        aud: "nexus-gateway".to_string(),
        exp: now + 3600,
        iat: now,
        jti: None,
        name: None,
        tenant_id: None,
        client_id: None,
        roles: Vec::new(),
        scope: Some(scopes.to_string()),
        permissions: Vec::new(),
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    format!("Bearer {}", token)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_admit_then_proxy_with_path_template() {
    let backend = spawn_backend().await;
    let mut config = base_config();
    config.routing.routes = vec![route_to(
        "erp",
        "/api/erp/{*path}",
        &format!("http://{}", backend),
        Some("/api/{path}"),
        &[],
    )];

    let app = gateway(config).await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/erp/customers/42")
                .header("X-Correlation-Id", "corr-e2e-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-correlation-id"], "corr-e2e-1");
    let body = body_json(response).await;
    assert_eq!(body["id"], "42");
    // The backend saw the same correlation id the caller sent
    assert_eq!(body["correlation"], "corr-e2e-1");
}

#[tokio::test]
async fn test_route_miss_returns_not_found_envelope() {
    let app = gateway(base_config()).await;
    let response = app
        .oneshot(Request::builder().uri("/api/nowhere").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert!(body["error"]["timestamp"].is_string());
}

#[tokio::test]
async fn test_rate_limit_cap_with_headers() {
    let backend = spawn_backend().await;
    let mut config = base_config();
    config.routing.routes = vec![route_to(
        "erp",
        "/api/erp/{*path}",
        &format!("http://{}", backend),
        Some("/api/{path}"),
        &[],
    )];
    config.rate_limiting.default_policy = RateLimitPolicy {
        name: "tight".to_string(),
        requests_per_window: 3,
        window_secs: 60,
        ..RateLimitPolicy::default()
    };

    let app = gateway(config).await;
    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/erp/customers/1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/erp/customers/1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    assert_eq!(response.headers()["x-ratelimit-limit"], "3");
    let retry_after: u64 = response.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn test_request_transform_reshapes_payload() {
    let backend = spawn_backend().await;
    let mut config = base_config();
    config.routing.routes = vec![route_to(
        "erp",
        "/api/erp/{*path}",
        &format!("http://{}", backend),
        Some("/api/{path}"),
        &[],
    )];
    config.transform.mappings = vec![SchemaMapping {
        source_schema: "gateway.incoming".to_string(),
        target_schema: "service.request".to_string(),
        active: true,
        fields: vec![
            FieldMapping {
                name: "name".to_string(),
                source_path: "$.projectNumber".to_string(),
                target_path: "$.name".to_string(),
                operator: OperatorKind::Direct,
                argument: None,
                default_value: None,
                required: true,
            },
            FieldMapping {
                name: "statuscode".to_string(),
                source_path: "$.status".to_string(),
                target_path: "$.statuscode".to_string(),
                operator: OperatorKind::Map,
                argument: Some(json!({ "Active": "1" })),
                default_value: None,
                required: false,
            },
        ],
    }];

    let app = gateway(config).await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/erp/projects")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "projectNumber": "P-1", "status": "Active" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    // The echo backend returns what it received: the transformed document
    let body = body_json(response).await;
    assert_eq!(body, json!({ "name": "P-1", "statuscode": "1" }));
}

#[tokio::test]
async fn test_scope_enforcement() {
    let backend = spawn_backend().await;
    let mut config = base_config();
    config.routing.routes = vec![route_to(
        "erp",
        "/api/erp/{*path}",
        &format!("http://{}", backend),
        Some("/api/{path}"),
        &["erp.read"],
    )];

    let app = gateway(config).await;

    // No credential → forbidden
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/erp/customers/1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Credential without the scope → forbidden
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/erp/customers/1")
                .header("Authorization", bearer("other.scope"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Credential with the scope → proxied
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/erp/customers/1")
                .header("Authorization", bearer("erp.read erp.write"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Garbage credential → unauthorized before the pipeline
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/erp/customers/1")
                .header("Authorization", "Bearer junk")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_circuit_opens_after_consecutive_failures() {
    // Nothing listens on this address: every dispatch is a connection error
    let mut config = base_config();
    config.routing.routes = vec![route_to(
        "erp",
        "/api/erp/{*path}",
        "http://127.0.0.1:9",
        None,
        &[],
    )];
    config.routing.circuit_failure_threshold = 3;

    let app = gateway(config).await;
    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/erp/x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "BAD_GATEWAY");
    }

    // Breaker is open: 502 without ever dispatching
    let started = std::time::Instant::now();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/erp/x")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(started.elapsed() < std::time::Duration::from_millis(500));
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "BAD_GATEWAY");
    // The short-circuit message names the open circuit, not a dispatch error
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Circuit open"));
}

#[tokio::test]
async fn test_backend_unavailable_maps_to_bad_gateway() {
    let backend = spawn_backend().await;
    let mut config = base_config();
    config.routing.routes = vec![route_to(
        "erp",
        "/api/erp/{*path}",
        &format!("http://{}", backend),
        Some("/api/{path}"),
        &[],
    )];

    let app = gateway(config).await;
    // The backend answers 503; one attempt, then BAD_GATEWAY
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/erp/unstable")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "BAD_GATEWAY");
}

#[tokio::test]
async fn test_transient_503s_are_retried_until_success() {
    let backend = spawn_backend().await;
    let mut config = base_config();
    let mut route = route_to(
        "erp",
        "/api/erp/{*path}",
        &format!("http://{}", backend),
        Some("/api/{path}"),
        &[],
    );
    // Two retries after the initial call; the backend heals on the third hit
    route.retry = RetryPolicy {
        retries: 2,
        backoff_base_secs: 0,
    };
    config.routing.routes = vec![route];

    let app = gateway(config).await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/erp/flaky")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn test_control_endpoints_bypass_pipeline() {
    let app = gateway(base_config()).await;

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["name"], "nexus-api-gateway");
    assert!(body["endpoints"]["health"].is_string());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health/live")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
