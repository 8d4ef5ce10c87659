//! Managed-bus backend (Redis Streams)
//!
//! One stream per event type, one consumer group per subscription. Entry
//! fields carry the application properties (event id, correlation id, type,
//! source, ISO-8601 timestamp) next to the JSON body. Successful handling
//! acknowledges with `XACK`; failed entries stay pending and are reclaimed
//! once idle, with the native delivery count deciding when an entry moves
//! to the dead-letter stream. Scheduled delivery parks entries in a
//! due-time sorted set drained by the scheduler loop.

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Value};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use nexus_shared::IntegrationEvent;

use crate::config::EventBusConfig;
use crate::dispatch::{verdict_for, DeliveryVerdict};
use crate::error::{EventBusError, Result};
use crate::registry::{DispatchOutcome, EventContext, HandlerRegistry};

/// Largest body accepted for a single entry
const MAX_ENTRY_BYTES: usize = 1_000_000;

const FIELD_EVENT_ID: &str = "eventId";
const FIELD_CORRELATION_ID: &str = "correlationId";
const FIELD_EVENT_TYPE: &str = "eventType";
const FIELD_SOURCE: &str = "source";
const FIELD_TIMESTAMP: &str = "timestamp";
const FIELD_CONTENT_TYPE: &str = "contentType";
const FIELD_BODY: &str = "body";

pub struct RedisStreamsEventBus {
    config: Arc<EventBusConfig>,
    manager: ConnectionManager,
    registry: Arc<HandlerRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisStreamsEventBus {
    pub async fn new(config: Arc<EventBusConfig>, registry: Arc<HandlerRegistry>) -> Result<Self> {
        let client = redis::Client::open(config.streams.url.clone())?;
        let manager = ConnectionManager::new(client).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(url = %config.streams.url, "Redis Streams event bus initialized");
        Ok(Self {
            config,
            manager,
            registry,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Append one event to its stream
    pub async fn publish(&self, event: &IntegrationEvent) -> Result<()> {
        let stream = self.config.topic_for(&event.event_type);
        let fields = entry_fields(event)?;
        let mut conn = self.manager.clone();

        let wait = Duration::from_secs(self.config.publish_timeout_secs);
        let id: String = tokio::time::timeout(wait, async {
            let id: String = conn
                .xadd(&stream, "*", &fields)
                .await?;
            let _: i64 = redis::cmd("XTRIM")
                .arg(&stream)
                .arg("MAXLEN")
                .arg("~")
                .arg(self.config.streams.max_stream_len)
                .query_async(&mut conn)
                .await?;
            Ok::<_, EventBusError>(id)
        })
        .await
        .map_err(|_| EventBusError::PublishTimeout {
            event_type: event.event_type.clone(),
            timeout_secs: self.config.publish_timeout_secs,
        })??;

        debug!(event_id = %event.event_id, stream = %stream, entry = %id, "Event published");
        Ok(())
    }

    /// Append a batch of events in one pipelined round trip
    pub async fn publish_batch(&self, events: &[IntegrationEvent]) -> Result<()> {
        let mut pipe = redis::pipe();
        for event in events {
            let stream = self.config.topic_for(&event.event_type);
            let fields = entry_fields(event)?;
            pipe.cmd("XADD").arg(&stream).arg("*").arg(&fields).ignore();
        }

        let mut conn = self.manager.clone();
        let wait = Duration::from_secs(self.config.batch_publish_timeout_secs);
        tokio::time::timeout(wait, pipe.query_async::<()>(&mut conn))
            .await
            .map_err(|_| EventBusError::PublishTimeout {
                event_type: "batch".to_string(),
                timeout_secs: self.config.batch_publish_timeout_secs,
            })??;
        Ok(())
    }

    /// Append a raw command document to a named queue stream
    pub async fn send_command(&self, queue: &str, command: &serde_json::Value) -> Result<()> {
        let stream = format!("{}{}", self.config.topic_prefix, queue.to_lowercase());
        let body = serde_json::to_string(command)?;
        let mut conn = self.manager.clone();
        let _: String = conn
            .xadd(&stream, "*", &[(FIELD_BODY, body.as_str())])
            .await?;
        Ok(())
    }

    /// Park an event in the due-time set until its delivery time
    pub async fn schedule(
        &self,
        event: &IntegrationEvent,
        delivery_time: DateTime<Utc>,
    ) -> Result<()> {
        let entry = json!({
            "stream": self.config.topic_for(&event.event_type),
            "event": event,
        });
        let member = serde_json::to_string(&entry)?;
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .zadd(self.scheduled_key(), member, delivery_time.timestamp_millis())
            .await?;
        debug!(event_id = %event.event_id, %delivery_time, "Event scheduled");
        Ok(())
    }

    /// Start a consumer loop for one `(event_type, subscription)` pair
    pub async fn start_consumer(&self, event_type: &str, subscription: &str) -> Result<()> {
        let stream = self.config.topic_for(event_type);
        let group = self.config.group_for(subscription, event_type);
        let consumer_name = format!("{}-0", group);

        let mut conn = self.manager.clone();
        // Idempotent group creation; BUSYGROUP means it already exists
        let created: std::result::Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&stream)
            .arg(&group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        if let Err(e) = created {
            if !e.to_string().contains("BUSYGROUP") {
                return Err(e.into());
            }
        }

        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);
        let manager = self.manager.clone();
        let event_type = event_type.to_string();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            info!(stream = %stream, group = %group, "Consumer started");
            let mut conn = manager;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = consume_once(
                        &mut conn,
                        &registry,
                        &config,
                        &event_type,
                        &stream,
                        &group,
                        &consumer_name,
                    ) => {}
                }
            }
            info!(stream = %stream, group = %group, "Consumer stopped");
        });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    /// Spawn the scheduler loop draining the due-time set
    pub async fn start(&self) -> Result<()> {
        let manager = self.manager.clone();
        let key = self.scheduled_key();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut conn = manager;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {
                        if let Err(e) = release_due(&mut conn, &key).await {
                            error!(error = %e, "Scheduled delivery failed");
                        }
                    }
                }
            }
        });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        for handle in self.tasks.lock().await.drain(..) {
            let _ = handle.await;
        }
        info!("Redis Streams event bus stopped");
        Ok(())
    }

    fn scheduled_key(&self) -> String {
        format!("{}scheduled", self.config.topic_prefix)
    }
}

/// One poll cycle: fresh deliveries, then reclaim of idle pending entries
async fn consume_once(
    conn: &mut ConnectionManager,
    registry: &HandlerRegistry,
    config: &EventBusConfig,
    event_type: &str,
    stream: &str,
    group: &str,
    consumer_name: &str,
) {
    let options = StreamReadOptions::default()
        .group(group, consumer_name)
        .count(config.prefetch as usize)
        .block(config.streams.block_ms as usize);

    let reply: StreamReadReply = match conn.xread_options(&[stream], &[">"], &options).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, stream, "Stream read failed");
            tokio::time::sleep(Duration::from_secs(1)).await;
            return;
        }
    };

    for key in reply.keys {
        for entry in key.ids {
            process_entry(conn, registry, config, event_type, stream, group, &entry, 1).await;
        }
    }

    reclaim_idle(conn, registry, config, event_type, stream, group, consumer_name).await;
}

/// Redeliver pending entries that have sat idle past the reclaim window
async fn reclaim_idle(
    conn: &mut ConnectionManager,
    registry: &HandlerRegistry,
    config: &EventBusConfig,
    event_type: &str,
    stream: &str,
    group: &str,
    consumer_name: &str,
) {
    let pending: redis::streams::StreamPendingCountReply = match conn
        .xpending_count(stream, group, "-", "+", config.prefetch as usize)
        .await
    {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, stream, "Pending lookup failed");
            return;
        }
    };

    for info in pending.ids {
        if info.last_delivered_ms < config.streams.reclaim_idle_ms as usize {
            continue;
        }
        let delivery_count = info.times_delivered as u32;

        let claimed: StreamClaimReply = match conn
            .xclaim(
                stream,
                group,
                consumer_name,
                config.streams.reclaim_idle_ms as usize,
                &[&info.id],
            )
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, entry = %info.id, "Claim failed");
                continue;
            }
        };

        for entry in claimed.ids {
            process_entry(
                conn,
                registry,
                config,
                event_type,
                stream,
                group,
                &entry,
                // XCLAIM itself counts as a delivery
                delivery_count + 1,
            )
            .await;
        }
    }
}

/// Dispatch one entry and apply the resulting transport action
#[allow(clippy::too_many_arguments)]
async fn process_entry(
    conn: &mut ConnectionManager,
    registry: &HandlerRegistry,
    config: &EventBusConfig,
    event_type: &str,
    stream: &str,
    group: &str,
    entry: &StreamId,
    delivery_count: u32,
) {
    let message_id = field_string(entry, FIELD_EVENT_ID).unwrap_or_else(|| entry.id.clone());
    let correlation_id = field_string(entry, FIELD_CORRELATION_ID).unwrap_or_default();
    let body = field_string(entry, FIELD_BODY).unwrap_or_default();

    let ctx = EventContext {
        event_type: event_type.to_string(),
        message_id: message_id.clone(),
        correlation_id,
    };

    let handler_window = Duration::from_secs(config.handler_timeout_secs);
    let outcome = match tokio::time::timeout(
        handler_window,
        registry.dispatch(event_type, body.as_bytes(), ctx),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => DispatchOutcome::HandlerFailed(EventBusError::handler(
            event_type,
            format!("handler exceeded {}s", config.handler_timeout_secs),
        )),
    };

    match verdict_for(
        &outcome,
        event_type,
        &message_id,
        delivery_count,
        config.max_delivery_count,
    ) {
        DeliveryVerdict::Ack | DeliveryVerdict::Abandon => {
            ack(conn, stream, group, &entry.id).await;
        }
        DeliveryVerdict::Requeue => {
            // Stays pending; the reclaim pass redelivers after the idle window
        }
        DeliveryVerdict::DeadLetter { reason } => {
            let dead = [
                (FIELD_EVENT_ID, message_id.as_str()),
                (FIELD_EVENT_TYPE, event_type),
                (FIELD_BODY, body.as_str()),
                ("failureReason", reason.as_str()),
                ("originalStream", stream),
            ];
            let result: std::result::Result<String, redis::RedisError> =
                conn.xadd(config.dead_letter_topic(), "*", &dead).await;
            match result {
                Ok(_) => info!(message_id = %message_id, "Entry dead-lettered"),
                Err(e) => error!(error = %e, "Dead-letter append failed"),
            }
            ack(conn, stream, group, &entry.id).await;
        }
    }
}

async fn ack(conn: &mut ConnectionManager, stream: &str, group: &str, entry_id: &str) {
    let result: std::result::Result<i64, redis::RedisError> =
        conn.xack(stream, group, &[entry_id]).await;
    if let Err(e) = result {
        warn!(error = %e, entry = %entry_id, "Ack failed");
    }
}

/// Move due members of the scheduled set onto their target streams
async fn release_due(conn: &mut ConnectionManager, key: &str) -> Result<()> {
    let now = Utc::now().timestamp_millis();
    let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
        .arg(key)
        .arg("-inf")
        .arg(now)
        .arg("LIMIT")
        .arg(0)
        .arg(32)
        .query_async(conn)
        .await?;

    for member in due {
        let parsed: serde_json::Value = serde_json::from_str(&member)?;
        let stream = parsed["stream"].as_str().unwrap_or_default().to_string();
        let event: IntegrationEvent = serde_json::from_value(parsed["event"].clone())?;
        let fields = entry_fields(&event)?;
        let _: String = conn.xadd(&stream, "*", &fields).await?;
        let _: i64 = conn.zrem(key, &member).await?;
        debug!(event_id = %event.event_id, stream = %stream, "Scheduled event released");
    }
    Ok(())
}

fn entry_fields(event: &IntegrationEvent) -> Result<Vec<(String, String)>> {
    let body = serde_json::to_string(event)?;
    if body.len() > MAX_ENTRY_BYTES {
        return Err(EventBusError::MessageTooLarge { size: body.len() });
    }
    Ok(vec![
        (FIELD_EVENT_ID.to_string(), event.event_id.to_string()),
        (FIELD_CORRELATION_ID.to_string(), event.correlation_id.clone()),
        (FIELD_EVENT_TYPE.to_string(), event.event_type.clone()),
        (FIELD_SOURCE.to_string(), event.source.clone()),
        (FIELD_TIMESTAMP.to_string(), event.timestamp.to_rfc3339()),
        (FIELD_CONTENT_TYPE.to_string(), "application/json".to_string()),
        (FIELD_BODY.to_string(), body),
    ])
}

fn field_string(entry: &StreamId, name: &str) -> Option<String> {
    entry.map.get(name).and_then(|value| match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    })
}
