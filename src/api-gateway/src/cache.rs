//! Distributed counter store seam
//!
//! The rate limiter, credential validator, and schema mapper all lean on an
//! external atomic key/value store. [`CounterStore`] is that seam: a Redis
//! implementation for production and an in-memory implementation for tests
//! and degraded startup. Sliding-window state uses the sorted-set shaped
//! `window_*` primitives.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::Result;

/// Atomic get/set/increment with TTL plus sorted-set window operations
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Remove every key starting with `prefix`
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Add a member scored by `timestamp_ms` and refresh the key's TTL
    async fn window_add(
        &self,
        key: &str,
        timestamp_ms: i64,
        member: &str,
        ttl: Duration,
    ) -> Result<()>;
    /// Drop members scored strictly below `min_timestamp_ms`
    async fn window_prune(&self, key: &str, min_timestamp_ms: i64) -> Result<()>;
    async fn window_count(&self, key: &str) -> Result<u64>;
    /// Smallest score still present, if any
    async fn window_oldest(&self, key: &str) -> Result<Option<i64>>;

    async fn ping(&self) -> Result<()>;
}

/// Redis-backed store used in production
#[derive(Clone)]
pub struct RedisCounterStore {
    manager: ConnectionManager,
}

impl RedisCounterStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        debug!(url, "Counter store connected");
        Ok(Self { manager })
    }

    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.manager.clone();
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, ttl.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0;
        let pattern = format!("{}*", prefix);
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let deleted: i64 = conn.del(&keys).await?;
                removed += deleted as u64;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(removed)
    }

    async fn window_add(
        &self,
        key: &str,
        timestamp_ms: i64,
        member: &str,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .zadd(key, member, timestamp_ms)
            .ignore()
            .expire(key, ttl.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn window_prune(&self, key: &str, min_timestamp_ms: i64) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .zrembyscore(key, "-inf", min_timestamp_ms - 1)
            .await?;
        Ok(())
    }

    async fn window_count(&self, key: &str) -> Result<u64> {
        let mut conn = self.manager.clone();
        let count: u64 = conn.zcard(key).await?;
        Ok(count)
    }

    async fn window_oldest(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.manager.clone();
        let entries: Vec<(String, i64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(entries.first().map(|(_, score)| *score))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// In-memory store for tests and broker-less startup
#[derive(Default)]
pub struct MemoryCounterStore {
    values: DashMap<String, (String, Instant)>,
    windows: DashMap<String, Vec<(i64, String)>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let entry = self.values.get(key)?;
        let (value, expires_at) = entry.value();
        if Instant::now() >= *expires_at {
            drop(entry);
            self.values.remove(key);
            return None;
        }
        Some(value.clone())
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.values
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64> {
        let next = self
            .live_value(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
            + 1;
        self.values
            .insert(key.to_string(), (next.to_string(), Instant::now() + ttl));
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        self.windows.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut matching: Vec<String> = self
            .values
            .iter()
            .map(|e| e.key().clone())
            .chain(self.windows.iter().map(|e| e.key().clone()))
            .filter(|k| k.starts_with(prefix))
            .collect();
        matching.sort();
        matching.dedup();
        for key in &matching {
            self.values.remove(key);
            self.windows.remove(key);
        }
        Ok(matching.len() as u64)
    }

    async fn window_add(
        &self,
        key: &str,
        timestamp_ms: i64,
        member: &str,
        _ttl: Duration,
    ) -> Result<()> {
        self.windows
            .entry(key.to_string())
            .or_default()
            .push((timestamp_ms, member.to_string()));
        Ok(())
    }

    async fn window_prune(&self, key: &str, min_timestamp_ms: i64) -> Result<()> {
        if let Some(mut window) = self.windows.get_mut(key) {
            window.retain(|(ts, _)| *ts >= min_timestamp_ms);
        }
        Ok(())
    }

    async fn window_count(&self, key: &str) -> Result<u64> {
        Ok(self.windows.get(key).map(|w| w.len() as u64).unwrap_or(0))
    }

    async fn window_oldest(&self, key: &str) -> Result<Option<i64>> {
        Ok(self
            .windows
            .get(key)
            .and_then(|w| w.iter().map(|(ts, _)| *ts).min()))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
