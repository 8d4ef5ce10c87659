//! Application state: every service the pipeline touches, wired once at
//! startup
//!
//! When the counter store or broker is unreachable the gateway still
//! starts, degraded: an in-memory store takes over and event publishes are
//! dropped.

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use nexus_event_bus::{EventBus, HandlerRegistry};

use crate::cache::{CounterStore, MemoryCounterStore, RedisCounterStore};
use crate::config::Config;
use crate::error::Result;
use crate::services::{
    circuit_breaker::CircuitBreakerService,
    credentials::{CredentialValidator, JwtSettings},
    health::HealthService,
    metrics::MetricsService,
    rate_limiter::RateLimiter,
    registry::ServiceRegistry,
    router::RouteResolver,
    schema_mapper::SchemaMapper,
    transformer::PayloadTransformer,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn CounterStore>,
    pub http_client: Client,
    pub registry: Arc<ServiceRegistry>,
    pub resolver: Arc<RouteResolver>,
    pub rate_limiter: Arc<RateLimiter>,
    pub circuit_breaker: Arc<CircuitBreakerService>,
    pub schema_mapper: Arc<SchemaMapper>,
    pub transformer: Arc<PayloadTransformer>,
    pub credentials: Arc<CredentialValidator>,
    pub health: Arc<HealthService>,
    pub metrics: Arc<MetricsService>,
    pub event_bus: Arc<EventBus>,
    pub degraded: bool,
}

impl AppState {
    /// Full startup: Redis-backed store and a live broker
    pub async fn new(config: Config) -> Result<Self> {
        let store: Arc<dyn CounterStore> =
            Arc::new(RedisCounterStore::connect(&config.redis.url).await?);
        info!("Counter store connected");

        let event_bus = EventBus::from_config(
            config.event_bus.clone(),
            Arc::new(HandlerRegistry::new()),
        )
        .await?;

        Self::build(config, store, Arc::new(event_bus), false).await
    }

    /// Degraded startup: in-memory counters, publishes dropped
    pub async fn new_degraded(config: Config) -> Result<Self> {
        warn!("Starting degraded: in-memory counter store, event bus disabled");
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new());
        Self::build(config, store, Arc::new(EventBus::disabled()), true).await
    }

    async fn build(
        config: Config,
        store: Arc<dyn CounterStore>,
        event_bus: Arc<EventBus>,
        degraded: bool,
    ) -> Result<Self> {
        let http_client = build_http_client(&config)?;

        let registry = Arc::new(ServiceRegistry::new());
        for instance in config.routing.services.clone() {
            registry.register(instance);
        }
        registry.set_route_definitions(config.routing.routes.clone());

        let resolver = Arc::new(RouteResolver::new(Arc::clone(&registry), http_client.clone()));
        resolver.reload()?;

        let rate_limiter = Arc::new(
            RateLimiter::new(Arc::clone(&store), config.rate_limiting.fail_open)
                .with_default_policy(config.rate_limiting.default_policy.clone()),
        );
        for (endpoint, policy) in config.rate_limiting.policies.clone() {
            rate_limiter.configure(endpoint, policy);
        }

        let circuit_breaker = Arc::new(CircuitBreakerService::new(
            config.routing.circuit_failure_threshold,
            Duration::from_secs(config.routing.circuit_cooldown_seconds),
        ));

        let schema_mapper = Arc::new(SchemaMapper::new(Arc::clone(&store)));
        for (name, schema) in config.transform.schemas.clone() {
            schema_mapper.register_schema(name, schema);
        }
        for (name, table) in config.transform.lookup_tables.clone() {
            schema_mapper.register_lookup_table(name, table).await?;
        }

        let transformer = Arc::new(PayloadTransformer::new(Arc::clone(&schema_mapper)));
        for mapping in config.transform.mappings.clone() {
            transformer.register_mapping(mapping)?;
        }

        let credentials = Arc::new(CredentialValidator::new(
            JwtSettings {
                secret: config.jwt.secret.clone(),
                issuer: config.jwt.issuer.clone(),
                audience: config.jwt.audience.clone(),
                ..JwtSettings::default()
            },
            Arc::clone(&store),
        ));

        let health = Arc::new(HealthService::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&resolver),
        ));

        let metrics = Arc::new(MetricsService::new()?);

        info!(
            routes = config.routing.routes.len(),
            services = config.routing.services.len(),
            mappings = config.transform.mappings.len(),
            "Application state initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            http_client,
            registry,
            resolver,
            rate_limiter,
            circuit_breaker,
            schema_mapper,
            transformer,
            credentials,
            health,
            metrics,
            event_bus,
            degraded,
        })
    }
}

fn build_http_client(config: &Config) -> Result<Client> {
    let client = Client::builder()
        .timeout(Duration::from_secs(config.server.timeout_seconds))
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .user_agent(format!("nexus-gateway/{}", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_degraded_state_wires_everything() {
        let mut config = Config::default();
        config.jwt.secret = "a-sufficiently-long-jwt-secret-value".to_string();

        let state = AppState::new_degraded(config).await.unwrap();
        assert!(state.degraded);
        assert!(state.resolver.list().is_empty());
        assert!(state.store.ping().await.is_ok());
    }
}
