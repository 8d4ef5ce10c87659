//! Route resolver: pattern compiler, registry, and cached health view
//!
//! Patterns are literal segments, `{name}` placeholders (one non-`/`
//! segment), and `{*name}` catch-alls (the remainder, possibly empty).
//! They compile to anchored regexes at registration; a pattern that fails
//! to compile is a registration error, never a resolve-time surprise.
//! Matching walks active routes in ascending priority (registration order
//! breaks ties) and the first pattern+method hit wins.

use dashmap::DashMap;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::services::registry::ServiceRegistry;

/// Cached health entries go stale after this
const HEALTH_CACHE_TTL: Duration = Duration::from_secs(30);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Retry behavior attached to a route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial call
    pub retries: u32,
    /// First backoff delay; doubles per retry (2 s, 4 s, 8 s)
    pub backoff_base_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_base_secs: 2,
        }
    }
}

/// Immutable route registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub id: String,
    pub pattern: String,
    pub service_name: String,
    /// Fallback target when the registry has no instance for the service
    pub base_url: String,
    #[serde(default)]
    pub target_path_template: Option<String>,
    /// Allowed methods; empty allows every method
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    /// Lower wins
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Extra headers injected on the outbound request
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_active() -> bool {
    true
}

/// Result of resolving a request against the route table
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route_id: String,
    pub service_name: String,
    /// Fully composed target URI including the original query string
    pub target_uri: String,
    pub params: HashMap<String, String>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub headers: HashMap<String, String>,
    pub required_scopes: Vec<String>,
}

/// Cached health verdict for a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

struct CompiledRoute {
    definition: RouteDefinition,
    regex: Regex,
    /// Name of the catch-all capture, when the pattern has one
    catch_all: Option<String>,
    order: u64,
}

/// Pattern-matching route table with per-service health cache
pub struct RouteResolver {
    routes: RwLock<Vec<Arc<CompiledRoute>>>,
    registry: Arc<ServiceRegistry>,
    http_client: Client,
    health_cache: DashMap<String, (ServiceHealth, Instant)>,
    registration_counter: AtomicU64,
}

impl RouteResolver {
    pub fn new(registry: Arc<ServiceRegistry>, http_client: Client) -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            registry,
            http_client,
            health_cache: DashMap::new(),
            registration_counter: AtomicU64::new(0),
        }
    }

    /// Compile and insert a route; a second registration with the same id
    /// replaces the first.
    pub fn register(&self, definition: RouteDefinition) -> Result<()> {
        let (regex, catch_all) = compile_pattern(&definition.pattern)?;
        let order = self.registration_counter.fetch_add(1, Ordering::Relaxed);
        let compiled = Arc::new(CompiledRoute {
            definition,
            regex,
            catch_all,
            order,
        });

        let mut routes = self.routes.write().expect("route table lock");
        routes.retain(|r| r.definition.id != compiled.definition.id);
        debug!(
            route = %compiled.definition.id,
            pattern = %compiled.definition.pattern,
            priority = compiled.definition.priority,
            "Route registered"
        );
        routes.push(compiled);
        routes.sort_by_key(|r| (r.definition.priority, r.order));
        Ok(())
    }

    pub fn unregister(&self, route_id: &str) -> bool {
        let mut routes = self.routes.write().expect("route table lock");
        let before = routes.len();
        routes.retain(|r| r.definition.id != route_id);
        routes.len() != before
    }

    pub fn list(&self) -> Vec<RouteDefinition> {
        self.routes
            .read()
            .expect("route table lock")
            .iter()
            .map(|r| r.definition.clone())
            .collect()
    }

    /// Rebuild the table from the registry's configured definitions
    pub fn reload(&self) -> Result<()> {
        let definitions = self.registry.route_definitions();
        {
            let mut routes = self.routes.write().expect("route table lock");
            routes.clear();
        }
        let count = definitions.len();
        for definition in definitions {
            self.register(definition)?;
        }
        info!(routes = count, "Route table reloaded");
        Ok(())
    }

    /// Match a request and compose the concrete target URI
    pub fn resolve(&self, method: &str, path: &str, query: Option<&str>) -> Option<RouteMatch> {
        let routes = self.routes.read().expect("route table lock");
        let method = method.to_uppercase();

        for route in routes.iter() {
            let def = &route.definition;
            if !def.active {
                continue;
            }
            if !def.methods.is_empty() && !def.methods.iter().any(|m| m.eq_ignore_ascii_case(&method))
            {
                continue;
            }
            let Some(captures) = route.regex.captures(path) else {
                continue;
            };

            let mut params = HashMap::new();
            for name in route.regex.capture_names().flatten() {
                let value = captures
                    .name(name)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                params.insert(name.to_string(), value);
            }

            let target_path = target_path(def, route.catch_all.as_deref(), &params, path);
            let base_url = self
                .registry
                .url_for(&def.service_name)
                .unwrap_or_else(|| def.base_url.clone());
            let mut target_uri =
                format!("{}{}", base_url.trim_end_matches('/'), target_path);
            if let Some(query) = query {
                if !query.is_empty() {
                    target_uri.push('?');
                    target_uri.push_str(query);
                }
            }

            return Some(RouteMatch {
                route_id: def.id.clone(),
                service_name: def.service_name.clone(),
                target_uri,
                params,
                timeout: Duration::from_secs(def.timeout_secs),
                retry: def.retry.clone(),
                headers: def.headers.clone(),
                required_scopes: def.required_scopes.clone(),
            });
        }
        None
    }

    /// Health of a service, cached for up to 30 seconds
    pub async fn service_health(&self, service_name: &str) -> ServiceHealth {
        if let Some(entry) = self.health_cache.get(service_name) {
            let (health, checked_at) = *entry.value();
            if checked_at.elapsed() < HEALTH_CACHE_TTL {
                return health;
            }
        }

        let health = match self.registry.url_for(service_name) {
            Some(base_url) => {
                let url = format!("{}/health", base_url.trim_end_matches('/'));
                match self
                    .http_client
                    .get(&url)
                    .timeout(HEALTH_PROBE_TIMEOUT)
                    .send()
                    .await
                {
                    Ok(response) if response.status().is_success() => ServiceHealth::Healthy,
                    Ok(response) => {
                        warn!(service = service_name, status = %response.status(), "Health probe degraded");
                        ServiceHealth::Degraded
                    }
                    Err(e) => {
                        warn!(service = service_name, error = %e, "Health probe failed");
                        ServiceHealth::Unhealthy
                    }
                }
            }
            None => ServiceHealth::Unknown,
        };

        self.health_cache
            .insert(service_name.to_string(), (health, Instant::now()));
        health
    }
}

/// Build the target path per the route's template and captures
fn target_path(
    def: &RouteDefinition,
    catch_all: Option<&str>,
    params: &HashMap<String, String>,
    original_path: &str,
) -> String {
    if let Some(template) = &def.target_path_template {
        let mut path = template.clone();
        for (name, value) in params {
            path = path.replace(&format!("{{{}}}", name), value);
        }
        return path;
    }
    if let Some(name) = catch_all {
        let captured = params.get(name).map(String::as_str).unwrap_or("");
        return format!("/{}", captured);
    }
    original_path.to_string()
}

/// Compile the pattern language to an anchored regex with named captures
fn compile_pattern(pattern: &str) -> Result<(Regex, Option<String>)> {
    if !pattern.starts_with('/') {
        return Err(GatewayError::pattern_compile(pattern, "must start with '/'"));
    }

    let mut regex = String::from("^");
    let mut catch_all = None;

    for (position, segment) in pattern.split('/').skip(1).enumerate() {
        if catch_all.is_some() {
            return Err(GatewayError::pattern_compile(
                pattern,
                "catch-all must be the final segment",
            ));
        }
        if let Some(inner) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            if let Some(name) = inner.strip_prefix('*') {
                validate_placeholder(pattern, name)?;
                // Optional group so zero trailing segments still match
                regex.push_str(&format!("(?:/(?P<{}>.*))?", name));
                catch_all = Some(name.to_string());
            } else {
                validate_placeholder(pattern, inner)?;
                regex.push_str(&format!("/(?P<{}>[^/]+)", inner));
            }
        } else if segment.contains(['{', '}']) {
            return Err(GatewayError::pattern_compile(
                pattern,
                format!("malformed placeholder in segment '{}'", segment),
            ));
        } else {
            if position == 0 && segment.is_empty() {
                // Root pattern "/"
                regex.push('/');
                continue;
            }
            regex.push('/');
            regex.push_str(&regex::escape(segment));
        }
    }
    regex.push('$');

    let compiled = Regex::new(&regex)
        .map_err(|e| GatewayError::pattern_compile(pattern, e.to_string()))?;
    Ok((compiled, catch_all))
}

fn validate_placeholder(pattern: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(GatewayError::pattern_compile(
            pattern,
            format!("invalid placeholder name '{}'", name),
        ))
    }
}
