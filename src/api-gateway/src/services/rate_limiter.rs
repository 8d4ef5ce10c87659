//! Sliding-window rate limiter backed by the distributed counter store
//!
//! Each `(client, endpoint)` key owns a sorted set of admission timestamps;
//! a check prunes entries older than the window, counts what remains, and
//! either admits (recording the admission) or rejects with a retry-after
//! derived from the oldest in-window admission. The stored TTL always
//! exceeds the window by a safety margin. Counter-store outages honour the
//! `fail_open` flag.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::CounterStore;
use crate::error::Result;

/// TTL margin past the window
const TTL_MARGIN: Duration = Duration::from_secs(60);

/// Admission algorithm; sliding window is the only required kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    #[default]
    SlidingWindow,
}

/// Named admission policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub name: String,
    pub requests_per_window: u32,
    pub window_secs: u64,
    #[serde(default)]
    pub algorithm: AlgorithmKind,
    /// Endpoint patterns under shell-style `*` suffix matching
    #[serde(default)]
    pub applies_to: Vec<String>,
    /// Per-client keys when true, one global key otherwise
    #[serde(default = "default_per_client")]
    pub per_client: bool,
}

fn default_per_client() -> bool {
    true
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            requests_per_window: 100,
            window_secs: 60,
            algorithm: AlgorithmKind::SlidingWindow,
            applies_to: Vec::new(),
            per_client: true,
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
    pub retry_after: Option<Duration>,
    pub policy: String,
    /// Set when the counter store was down and the check failed open
    pub degraded: bool,
}

impl RateLimitResult {
    fn admitted(policy: &RateLimitPolicy, remaining: u32, reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining,
            limit: policy.requests_per_window,
            reset_at,
            retry_after: None,
            policy: policy.name.clone(),
            degraded: false,
        }
    }

    fn unlimited(policy_name: &str) -> Self {
        Self {
            allowed: true,
            remaining: u32::MAX,
            limit: u32::MAX,
            reset_at: Utc::now(),
            retry_after: None,
            policy: policy_name.to_string(),
            degraded: false,
        }
    }
}

/// Per-client/per-endpoint sliding-window admission
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    /// Exact-endpoint policies set via `configure`
    policies: DashMap<String, RateLimitPolicy>,
    /// Whitelisted clients and their optional expiry
    whitelist: DashMap<String, Option<DateTime<Utc>>>,
    default_policy: RateLimitPolicy,
    fail_open: bool,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, fail_open: bool) -> Self {
        Self {
            store,
            policies: DashMap::new(),
            whitelist: DashMap::new(),
            default_policy: RateLimitPolicy::default(),
            fail_open,
        }
    }

    pub fn with_default_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Attach a policy to an endpoint (exact key; `applies_to` patterns
    /// extend it to whole prefixes)
    pub fn configure(&self, endpoint: impl Into<String>, policy: RateLimitPolicy) {
        self.policies.insert(endpoint.into(), policy);
    }

    /// Admission check; admits record their own timestamp
    pub async fn check(&self, client_id: &str, endpoint: &str) -> Result<RateLimitResult> {
        if self.is_whitelisted(client_id) {
            debug!(client = client_id, "Whitelisted, bypassing rate limit");
            return Ok(RateLimitResult::unlimited("whitelist"));
        }

        let policy = self.policy_for(endpoint);
        let key = counter_key(&policy, client_id, endpoint);

        match self.decide(&policy, &key, true).await {
            Ok(result) => Ok(result),
            Err(e) if self.fail_open => {
                warn!(error = %e, key = %key, "Counter store down, failing open");
                let mut result =
                    RateLimitResult::admitted(&policy, policy.requests_per_window, Utc::now());
                result.degraded = true;
                Ok(result)
            }
            Err(e) => Err(e),
        }
    }

    /// Record an admission without an admission decision
    pub async fn record(&self, client_id: &str, endpoint: &str) -> Result<()> {
        let policy = self.policy_for(endpoint);
        let key = counter_key(&policy, client_id, endpoint);
        let now = Utc::now().timestamp_millis();
        let ttl = Duration::from_secs(policy.window_secs) + TTL_MARGIN;
        self.store
            .window_add(&key, now, &Uuid::new_v4().to_string(), ttl)
            .await
    }

    /// Current usage without consuming an admission
    pub async fn status(&self, client_id: &str, endpoint: &str) -> Result<RateLimitResult> {
        if self.is_whitelisted(client_id) {
            return Ok(RateLimitResult::unlimited("whitelist"));
        }
        let policy = self.policy_for(endpoint);
        let key = counter_key(&policy, client_id, endpoint);
        self.decide(&policy, &key, false).await
    }

    /// Drop every counter a client owns
    pub async fn reset(&self, client_id: &str) -> Result<()> {
        let removed = self
            .store
            .delete_prefix(&format!("ratelimit:{}:", client_id))
            .await?;
        debug!(client = client_id, removed, "Rate-limit counters reset");
        Ok(())
    }

    /// Bypass admission for a client; `duration` of `None` never expires
    pub fn whitelist(&self, client_id: impl Into<String>, duration: Option<Duration>) {
        let expires_at = duration.map(|d| {
            Utc::now() + chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
        });
        self.whitelist.insert(client_id.into(), expires_at);
    }

    pub fn remove_whitelist(&self, client_id: &str) -> bool {
        self.whitelist.remove(client_id).is_some()
    }

    /// Expired entries evict lazily on lookup
    fn is_whitelisted(&self, client_id: &str) -> bool {
        let Some(entry) = self.whitelist.get(client_id) else {
            return false;
        };
        match *entry.value() {
            None => true,
            Some(expires_at) if Utc::now() < expires_at => true,
            Some(_) => {
                drop(entry);
                self.whitelist.remove(client_id);
                false
            }
        }
    }

    /// Exact endpoint match first, then `applies_to` pattern scan, then the
    /// default policy.
    fn policy_for(&self, endpoint: &str) -> RateLimitPolicy {
        if let Some(policy) = self.policies.get(endpoint) {
            return policy.value().clone();
        }
        for entry in self.policies.iter() {
            if entry
                .applies_to
                .iter()
                .any(|pattern| pattern_matches(pattern, endpoint))
            {
                return entry.value().clone();
            }
        }
        self.default_policy.clone()
    }

    async fn decide(
        &self,
        policy: &RateLimitPolicy,
        key: &str,
        admit: bool,
    ) -> Result<RateLimitResult> {
        let window = Duration::from_secs(policy.window_secs);
        let now_ms = Utc::now().timestamp_millis();
        let window_start = now_ms - window.as_millis() as i64;

        self.store.window_prune(key, window_start).await?;
        let used = self.store.window_count(key).await? as u32;

        if used >= policy.requests_per_window {
            let oldest = self.store.window_oldest(key).await?.unwrap_or(now_ms);
            let retry_ms = (oldest + window.as_millis() as i64 - now_ms).max(0) as u64;
            debug!(key, used, limit = policy.requests_per_window, "Rate limit exceeded");
            return Ok(RateLimitResult {
                allowed: false,
                remaining: 0,
                limit: policy.requests_per_window,
                reset_at: Utc::now() + chrono::Duration::milliseconds(retry_ms as i64),
                retry_after: Some(Duration::from_millis(retry_ms)),
                policy: policy.name.clone(),
                degraded: false,
            });
        }

        if admit {
            self.store
                .window_add(key, now_ms, &Uuid::new_v4().to_string(), window + TTL_MARGIN)
                .await?;
        }

        let remaining = policy.requests_per_window - used - u32::from(admit);
        let reset_at =
            Utc::now() + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        Ok(RateLimitResult::admitted(policy, remaining, reset_at))
    }
}

fn counter_key(policy: &RateLimitPolicy, client_id: &str, endpoint: &str) -> String {
    let owner = if policy.per_client { client_id } else { "global" };
    format!("ratelimit:{}:{}", owner, endpoint)
}

/// Shell-style matching: a trailing `*` matches any suffix
fn pattern_matches(pattern: &str, endpoint: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => endpoint.starts_with(prefix),
        None => pattern == endpoint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCounterStore;
    use crate::error::GatewayError;
    use async_trait::async_trait;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryCounterStore::new()), false)
    }

    fn policy(name: &str, limit: u32, window_secs: u64) -> RateLimitPolicy {
        RateLimitPolicy {
            name: name.to_string(),
            requests_per_window: limit,
            window_secs,
            ..RateLimitPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_admissions_bounded_by_window() {
        let limiter = limiter().with_default_policy(policy("tight", 3, 60));

        for expected_remaining in [2u32, 1, 0] {
            let result = limiter.check("c1", "/api/x").await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, expected_remaining);
        }

        // Exactly at the limit: the next admission rejects
        let rejected = limiter.check("c1", "/api/x").await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert!(rejected.retry_after.unwrap() <= Duration::from_secs(60));

        // A different client is unaffected
        assert!(limiter.check("c2", "/api/x").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_window_elapses_and_usage_drops_to_zero() {
        let limiter = limiter().with_default_policy(policy("second", 2, 1));

        limiter.check("c1", "/api/x").await.unwrap();
        limiter.check("c1", "/api/x").await.unwrap();
        assert!(!limiter.check("c1", "/api/x").await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let status = limiter.status("c1", "/api/x").await.unwrap();
        assert_eq!(status.remaining, status.limit);
        assert!(limiter.check("c1", "/api/x").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_whitelist_bypasses_until_removed() {
        let limiter = limiter().with_default_policy(policy("one", 1, 60));
        limiter.whitelist("vip", None);

        for _ in 0..10 {
            let result = limiter.check("vip", "/api/x").await.unwrap();
            assert!(result.allowed);
            assert_eq!(result.remaining, u32::MAX);
        }

        assert!(limiter.remove_whitelist("vip"));
        limiter.check("vip", "/api/x").await.unwrap();
        assert!(!limiter.check("vip", "/api/x").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_whitelist_expiry_is_lazy() {
        let limiter = limiter().with_default_policy(policy("one", 1, 60));
        limiter.whitelist("temp", Some(Duration::from_millis(20)));
        assert!(limiter.check("temp", "/api/x").await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(40)).await;
        // Entry evicts on this lookup; normal limiting applies again
        limiter.check("temp", "/api/x").await.unwrap();
        assert!(!limiter.check("temp", "/api/x").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_policy_selection_exact_then_pattern_then_default() {
        let limiter = limiter();
        limiter.configure(
            "/api/exact",
            policy("exact", 5, 60),
        );
        let mut ai = policy("ai", 7, 60);
        ai.applies_to = vec!["/api/ai/*".to_string()];
        limiter.configure("/api/ai", ai);

        assert_eq!(limiter.check("c", "/api/exact").await.unwrap().limit, 5);
        assert_eq!(limiter.check("c", "/api/ai/completions").await.unwrap().limit, 7);
        assert_eq!(limiter.check("c", "/api/other").await.unwrap().limit, 100);
    }

    #[tokio::test]
    async fn test_global_policy_shares_one_key() {
        let limiter = limiter();
        let mut global = policy("global", 2, 60);
        global.per_client = false;
        limiter.configure("/api/batch", global);

        assert!(limiter.check("alice", "/api/batch").await.unwrap().allowed);
        assert!(limiter.check("bob", "/api/batch").await.unwrap().allowed);
        // Third admission rejects regardless of client
        assert!(!limiter.check("carol", "/api/batch").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reset_clears_client_counters() {
        let limiter = limiter().with_default_policy(policy("one", 1, 60));
        limiter.check("c1", "/api/x").await.unwrap();
        assert!(!limiter.check("c1", "/api/x").await.unwrap().allowed);

        limiter.reset("c1").await.unwrap();
        assert!(limiter.check("c1", "/api/x").await.unwrap().allowed);
    }

    /// Counter store that always errors
    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn get(&self, _: &str) -> crate::error::Result<Option<String>> {
            Err(GatewayError::internal("store down"))
        }
        async fn set(&self, _: &str, _: &str, _: Duration) -> crate::error::Result<()> {
            Err(GatewayError::internal("store down"))
        }
        async fn increment(&self, _: &str, _: Duration) -> crate::error::Result<i64> {
            Err(GatewayError::internal("store down"))
        }
        async fn delete(&self, _: &str) -> crate::error::Result<()> {
            Err(GatewayError::internal("store down"))
        }
        async fn delete_prefix(&self, _: &str) -> crate::error::Result<u64> {
            Err(GatewayError::internal("store down"))
        }
        async fn window_add(
            &self,
            _: &str,
            _: i64,
            _: &str,
            _: Duration,
        ) -> crate::error::Result<()> {
            Err(GatewayError::internal("store down"))
        }
        async fn window_prune(&self, _: &str, _: i64) -> crate::error::Result<()> {
            Err(GatewayError::internal("store down"))
        }
        async fn window_count(&self, _: &str) -> crate::error::Result<u64> {
            Err(GatewayError::internal("store down"))
        }
        async fn window_oldest(&self, _: &str) -> crate::error::Result<Option<i64>> {
            Err(GatewayError::internal("store down"))
        }
        async fn ping(&self) -> crate::error::Result<()> {
            Err(GatewayError::internal("store down"))
        }
    }

    #[tokio::test]
    async fn test_fail_open_admits_with_annotation() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), true);
        let result = limiter.check("c1", "/api/x").await.unwrap();
        assert!(result.allowed);
        assert!(result.degraded);
        assert_eq!(result.remaining, result.limit);
    }

    #[tokio::test]
    async fn test_fail_closed_propagates_store_error() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), false);
        assert!(limiter.check("c1", "/api/x").await.is_err());
    }
}
