//! Service registry: per-service instance lists with round-robin selection
//!
//! Healthy instances are preferred; when none are healthy the whole list
//! becomes the last-resort pool. Mutation serializes per service name,
//! reads stay lock-free on the shard map.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use tracing::{debug, info, warn};

use crate::services::router::RouteDefinition;

/// One registered backend instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub service_name: String,
    pub base_url: String,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_healthy() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

#[derive(Default)]
struct ServiceEntry {
    instances: Vec<ServiceInstance>,
    cursor: AtomicUsize,
}

/// Instance lists plus the route definitions loaded from configuration
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, ServiceEntry>,
    route_definitions: RwLock<Vec<RouteDefinition>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an instance (same id replaces in place)
    pub fn register(&self, instance: ServiceInstance) {
        let mut entry = self
            .services
            .entry(instance.service_name.clone())
            .or_default();
        match entry.instances.iter_mut().find(|i| i.id == instance.id) {
            Some(existing) => *existing = instance,
            None => {
                info!(
                    service = %instance.service_name,
                    instance = %instance.id,
                    url = %instance.base_url,
                    "Instance registered"
                );
                entry.instances.push(instance);
            }
        }
    }

    pub fn deregister(&self, instance_id: &str) -> bool {
        for mut entry in self.services.iter_mut() {
            let before = entry.instances.len();
            entry.instances.retain(|i| i.id != instance_id);
            if entry.instances.len() != before {
                debug!(instance = instance_id, "Instance deregistered");
                return true;
            }
        }
        false
    }

    pub fn instances_of(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.services
            .get(service_name)
            .map(|e| e.instances.clone())
            .unwrap_or_default()
    }

    pub fn update_health(&self, instance_id: &str, healthy: bool) -> bool {
        for mut entry in self.services.iter_mut() {
            if let Some(instance) = entry.instances.iter_mut().find(|i| i.id == instance_id) {
                if instance.healthy != healthy {
                    warn!(instance = instance_id, healthy, "Instance health changed");
                }
                instance.healthy = healthy;
                return true;
            }
        }
        false
    }

    /// Round-robin over healthy instances; the full list is the fallback
    /// pool when nothing is healthy.
    pub fn select(&self, service_name: &str) -> Option<ServiceInstance> {
        let entry = self.services.get(service_name)?;
        if entry.instances.is_empty() {
            return None;
        }

        let healthy: Vec<&ServiceInstance> =
            entry.instances.iter().filter(|i| i.healthy).collect();
        let pool: Vec<&ServiceInstance> = if healthy.is_empty() {
            entry.instances.iter().collect()
        } else {
            healthy
        };

        let index = entry.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
        Some(pool[index].clone())
    }

    /// Base URL of the next instance for a service
    pub fn url_for(&self, service_name: &str) -> Option<String> {
        self.select(service_name).map(|i| i.base_url)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Replace the configured route definitions (used by `reload`)
    pub fn set_route_definitions(&self, definitions: Vec<RouteDefinition>) {
        *self.route_definitions.write().expect("route definitions lock") = definitions;
    }

    pub fn route_definitions(&self) -> Vec<RouteDefinition> {
        self.route_definitions
            .read()
            .expect("route definitions lock")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, service: &str, url: &str, healthy: bool) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            service_name: service.to_string(),
            base_url: url.to_string(),
            healthy,
            registered_at: Utc::now(),
            weight: 1,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_round_robin_cycles_healthy_instances() {
        let registry = ServiceRegistry::new();
        registry.register(instance("a", "erp", "http://erp-a:5001", true));
        registry.register(instance("b", "erp", "http://erp-b:5001", true));

        let picks: Vec<String> = (0..4).map(|_| registry.url_for("erp").unwrap()).collect();
        assert_eq!(picks[0], picks[2]);
        assert_eq!(picks[1], picks[3]);
        assert_ne!(picks[0], picks[1]);
    }

    #[test]
    fn test_unhealthy_instances_are_skipped() {
        let registry = ServiceRegistry::new();
        registry.register(instance("a", "erp", "http://erp-a:5001", false));
        registry.register(instance("b", "erp", "http://erp-b:5001", true));

        for _ in 0..5 {
            assert_eq!(registry.url_for("erp").unwrap(), "http://erp-b:5001");
        }
    }

    #[test]
    fn test_all_unhealthy_falls_back_to_full_pool() {
        let registry = ServiceRegistry::new();
        registry.register(instance("a", "erp", "http://erp-a:5001", false));
        registry.register(instance("b", "erp", "http://erp-b:5001", false));

        // Still returns a URL rather than nothing
        assert!(registry.url_for("erp").is_some());
    }

    #[test]
    fn test_register_same_id_replaces() {
        let registry = ServiceRegistry::new();
        registry.register(instance("a", "erp", "http://old:5001", true));
        registry.register(instance("a", "erp", "http://new:5001", true));

        let instances = registry.instances_of("erp");
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].base_url, "http://new:5001");
    }

    #[test]
    fn test_update_health_and_deregister() {
        let registry = ServiceRegistry::new();
        registry.register(instance("a", "erp", "http://erp-a:5001", true));

        assert!(registry.update_health("a", false));
        assert!(!registry.instances_of("erp")[0].healthy);
        assert!(!registry.update_health("ghost", false));

        assert!(registry.deregister("a"));
        assert!(registry.url_for("erp").is_none());
    }
}
