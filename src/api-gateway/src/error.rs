//! Error handling for the gateway
//!
//! Every gateway-originated failure renders as the standard envelope:
//!
//! ```json
//! { "error": { "code": "<CODE>", "message": "<text>", "timestamp": "<ISO-8601>" } }
//! ```

use axum::{
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use nexus_shared::AuthError;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Counter store error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Event bus error: {0}")]
    EventBus(#[from] nexus_event_bus::EventBusError),

    #[error("{0}")]
    Auth(#[from] AuthError),

    #[error("Access denied: {message}")]
    Forbidden { message: String },

    #[error("No route matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Rate limit exceeded for {policy}")]
    RateLimited {
        policy: String,
        limit: u32,
        remaining: u32,
        retry_after_secs: u64,
    },

    #[error("Bad gateway: {message}")]
    BadGateway { message: String },

    #[error("Gateway timeout: {message}")]
    GatewayTimeout { message: String },

    #[error("Circuit open for service: {service}")]
    CircuitOpen { service: String },

    #[error("Transform failed at {path}: {message}")]
    Transform { path: String, message: String },

    #[error("Pattern failed to compile: {pattern}: {message}")]
    PatternCompile { pattern: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Wire shape of the error envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl GatewayError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::BadGateway {
            message: message.into(),
        }
    }

    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::GatewayTimeout {
            message: message.into(),
        }
    }

    pub fn transform(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transform {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn pattern_compile(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PatternCompile {
            pattern: pattern.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden { .. } => StatusCode::FORBIDDEN,
            GatewayError::RouteNotFound { .. } | GatewayError::NotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BadGateway { .. } | GatewayError::CircuitOpen { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code carried in the envelope
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Auth(e) => e.code.as_str(),
            GatewayError::Forbidden { .. } => "FORBIDDEN",
            GatewayError::RouteNotFound { .. } | GatewayError::NotFound { .. } => "NOT_FOUND",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::BadGateway { .. } | GatewayError::CircuitOpen { .. } => "BAD_GATEWAY",
            GatewayError::GatewayTimeout { .. } => "GATEWAY_TIMEOUT",
            _ => "INTERNAL_ERROR",
        }
    }

    fn should_log(&self) -> bool {
        // Client-attributable outcomes stay out of the error log
        !matches!(
            self,
            GatewayError::Auth(_)
                | GatewayError::Forbidden { .. }
                | GatewayError::RouteNotFound { .. }
                | GatewayError::NotFound { .. }
                | GatewayError::RateLimited { .. }
        )
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        if self.should_log() {
            error!(error = %self, status = %status, code, "Gateway error");
        }

        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: code.to_string(),
                message: self.to_string(),
                timestamp: chrono::Utc::now(),
            },
        };

        let mut response = (status, Json(envelope)).into_response();

        if let GatewayError::RateLimited {
            limit,
            remaining,
            retry_after_secs,
            ..
        } = &self
        {
            let headers = response.headers_mut();
            if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                headers.insert(header::RETRY_AFTER, v);
            }
            if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
                headers.insert(HeaderName::from_static("x-ratelimit-limit"), v);
            }
            if let Ok(v) = HeaderValue::from_str(&remaining.to_string()) {
                headers.insert(HeaderName::from_static("x-ratelimit-remaining"), v);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_shared::AuthErrorCode;

    #[test]
    fn test_status_and_code_mapping() {
        assert_eq!(
            GatewayError::not_found("route").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(GatewayError::not_found("route").code(), "NOT_FOUND");

        let limited = GatewayError::RateLimited {
            policy: "default".to_string(),
            limit: 100,
            remaining: 0,
            retry_after_secs: 30,
        };
        assert_eq!(limited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limited.code(), "RATE_LIMITED");

        assert_eq!(
            GatewayError::bad_gateway("refused").status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::gateway_timeout("deadline").code(),
            "GATEWAY_TIMEOUT"
        );
        // An open breaker short-circuits with the same surface as a
        // backend-connection failure
        let open = GatewayError::CircuitOpen {
            service: "erp".to_string(),
        };
        assert_eq!(open.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(open.code(), "BAD_GATEWAY");
    }

    #[test]
    fn test_auth_error_code_passthrough() {
        let err = GatewayError::Auth(AuthError::new(AuthErrorCode::TokenRevoked, "revoked"));
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.code(), "TOKEN_REVOKED");
    }

    #[test]
    fn test_rate_limited_response_headers() {
        let response = GatewayError::RateLimited {
            policy: "ai".to_string(),
            limit: 100,
            remaining: 0,
            retry_after_secs: 42,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "42");
        assert_eq!(response.headers()["x-ratelimit-limit"], "100");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: "NOT_FOUND".to_string(),
                message: "no route".to_string(),
                timestamp: chrono::Utc::now(),
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json["error"]["code"].is_string());
        assert!(json["error"]["timestamp"].is_string());
    }
}
