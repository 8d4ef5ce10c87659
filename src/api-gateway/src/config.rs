//! Gateway configuration
//!
//! Layered sources: `config/default.yaml`, then
//! `config/environments/{env}.yaml`, then environment variables with the
//! `NEXUS` prefix and `__` separator (`NEXUS__SERVER__PORT=8080`).

use serde::Deserialize;
use std::collections::HashMap;

use nexus_event_bus::EventBusConfig;

use crate::services::rate_limiter::RateLimitPolicy;
use crate::services::registry::ServiceInstance;
use crate::services::router::RouteDefinition;
use crate::services::transformer::SchemaMapping;

/// Main configuration for the gateway
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

fn default_environment() -> String {
    "development".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: num_cpus::get(),
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connection_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: "nexus-platform".to_string(),
            audience: "nexus-gateway".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitingConfig {
    pub enabled: bool,
    /// Admit when the counter store is unreachable
    pub fail_open: bool,
    #[serde(default)]
    pub default_policy: RateLimitPolicy,
    /// Endpoint → policy attachments applied at startup
    #[serde(default)]
    pub policies: HashMap<String, RateLimitPolicy>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_open: true,
            default_policy: RateLimitPolicy::default(),
            policies: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RoutingConfig {
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
    #[serde(default)]
    pub services: Vec<ServiceInstance>,
    /// Circuit breaker: consecutive failures before opening
    #[serde(default = "default_failure_threshold")]
    pub circuit_failure_threshold: u32,
    /// Circuit breaker: seconds before the half-open probe
    #[serde(default = "default_circuit_cooldown")]
    pub circuit_cooldown_seconds: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_circuit_cooldown() -> u64 {
    30
}

/// Schemas, lookup tables, and mappings registered at startup
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TransformConfig {
    #[serde(default)]
    pub schemas: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub lookup_tables: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub mappings: Vec<SchemaMapping>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            server: ServerConfig::default(),
            redis: RedisConfig::default(),
            jwt: JwtConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
            routing: RoutingConfig::default(),
            transform: TransformConfig::default(),
            event_bus: EventBusConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

impl Config {
    /// Load from config files and `NEXUS__*` environment overrides
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let environment =
            std::env::var("NEXUS_ENVIRONMENT").unwrap_or_else(|_| default_environment());

        config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::File::with_name(&format!("config/environments/{}", environment))
                    .required(false),
            )
            .add_source(config::Environment::with_prefix("NEXUS").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.jwt.secret.len() < 32 {
            return Err(anyhow::anyhow!(
                "JWT secret must be at least 32 characters long"
            ));
        }
        for route in &self.routing.routes {
            if route.base_url.is_empty() {
                return Err(anyhow::anyhow!("route '{}' has no base URL", route.id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert!(config.rate_limiting.enabled);
        assert_eq!(config.rate_limiting.default_policy.requests_per_window, 100);
        assert_eq!(config.rate_limiting.default_policy.window_secs, 60);
        assert_eq!(config.routing.circuit_failure_threshold, 5);
        assert_eq!(config.routing.circuit_cooldown_seconds, 30);
    }

    #[test]
    fn test_validate_rejects_short_secret() {
        let mut config = Config::default();
        config.jwt.secret = "short".to_string();
        assert!(config.validate().is_err());

        config.jwt.secret = "a-sufficiently-long-jwt-secret-value".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_routing_section_deserializes() {
        let yaml = serde_json::json!({
            "routes": [{
                "id": "erp",
                "pattern": "/api/erp/{*path}",
                "service_name": "erp",
                "base_url": "http://erp:5001",
                "target_path_template": "/api/{path}",
                "methods": ["GET", "POST"],
                "priority": 10
            }],
            "services": [{
                "id": "erp-1",
                "service_name": "erp",
                "base_url": "http://erp:5001"
            }]
        });
        let routing: RoutingConfig = serde_json::from_value(yaml).unwrap();
        assert_eq!(routing.routes.len(), 1);
        assert_eq!(routing.services.len(), 1);
        assert!(routing.services[0].healthy);
    }
}
