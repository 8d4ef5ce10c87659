//! Classic-broker backend (Kafka)
//!
//! One durable topic per event type (`prefix + type.lowercase()`), one
//! consumer group per subscription (`prefix + subscription + "." + type`).
//! Publishes wait for the broker delivery report inside a bounded window;
//! failed deliveries requeue until the delivery budget is spent, then the
//! message is copied to the shared dead-letter topic and the offset is
//! committed. Scheduled delivery parks records in a delay topic drained by
//! a scheduler loop.

use chrono::{DateTime, Utc};
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::{Header, Headers, Message, OwnedHeaders},
    producer::{FutureProducer, FutureRecord, Producer},
    util::Timeout,
    Offset,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use nexus_shared::IntegrationEvent;

use crate::config::EventBusConfig;
use crate::dispatch::{verdict_for, DeliveryTracker, DeliveryVerdict};
use crate::error::{EventBusError, Result};
use crate::registry::{DispatchOutcome, EventContext, HandlerRegistry};

/// Largest payload accepted for a single record
const MAX_MESSAGE_BYTES: usize = 1_000_000;

const HEADER_EVENT_ID: &str = "eventId";
const HEADER_CORRELATION_ID: &str = "correlationId";
const HEADER_EVENT_TYPE: &str = "eventType";
const HEADER_SOURCE: &str = "source";
const HEADER_TIMESTAMP: &str = "timestamp";
const HEADER_TARGET_TOPIC: &str = "targetTopic";
const HEADER_NOT_BEFORE: &str = "notBefore";

pub struct KafkaEventBus {
    config: Arc<EventBusConfig>,
    producer: FutureProducer,
    registry: Arc<HandlerRegistry>,
    tracker: Arc<DeliveryTracker>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl KafkaEventBus {
    pub fn new(config: Arc<EventBusConfig>, registry: Arc<HandlerRegistry>) -> Result<Self> {
        let kafka = &config.kafka;
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &kafka.brokers)
            .set("client.id", &kafka.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("max.in.flight.requests.per.connection", "5")
            .set("compression.type", "zstd")
            .set("linger.ms", "10")
            .set(
                "request.timeout.ms",
                (config.publish_timeout_secs * 1000).to_string(),
            )
            .set(
                "delivery.timeout.ms",
                (config.batch_publish_timeout_secs * 1000).to_string(),
            )
            .create()
            .map_err(|e| EventBusError::kafka(format!("Failed to create producer: {}", e)))?;

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(brokers = %kafka.brokers, "Kafka event bus initialized");
        Ok(Self {
            config,
            producer,
            registry,
            tracker: Arc::new(DeliveryTracker::new()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Publish one event and wait for the broker delivery report
    pub async fn publish(&self, event: &IntegrationEvent) -> Result<()> {
        let topic = self.config.topic_for(&event.event_type);
        let wait = Duration::from_secs(self.config.publish_timeout_secs);
        self.publish_to(&topic, event, wait).await
    }

    /// Publish a batch; the whole batch must confirm inside the batch window
    pub async fn publish_batch(&self, events: &[IntegrationEvent]) -> Result<()> {
        let deadline = Duration::from_secs(self.config.batch_publish_timeout_secs);
        let all = async {
            for event in events {
                let topic = self.config.topic_for(&event.event_type);
                self.publish_to(&topic, event, deadline).await?;
            }
            Ok::<_, EventBusError>(())
        };
        tokio::time::timeout(deadline, all)
            .await
            .map_err(|_| EventBusError::PublishTimeout {
                event_type: "batch".to_string(),
                timeout_secs: self.config.batch_publish_timeout_secs,
            })?
    }

    /// Publish a raw command document to a named queue topic
    pub async fn send_command(&self, queue: &str, command: &serde_json::Value) -> Result<()> {
        let topic = format!("{}{}", self.config.topic_prefix, queue.to_lowercase());
        let payload = serde_json::to_vec(command)?;
        let key = uuid::Uuid::new_v4().to_string();
        let wait = Duration::from_secs(self.config.publish_timeout_secs);

        let record = FutureRecord::to(&topic).key(&key).payload(&payload);
        self.send_record(record, &topic, wait).await
    }

    /// Park an event in the delay topic until its delivery time
    pub async fn schedule(
        &self,
        event: &IntegrationEvent,
        delivery_time: DateTime<Utc>,
    ) -> Result<()> {
        let target = self.config.topic_for(&event.event_type);
        let payload = serde_json::to_vec(event)?;
        let key = event.event_id.to_string();
        let topic = self.config.scheduled_topic();
        let wait = Duration::from_secs(self.config.publish_timeout_secs);

        let headers = event_headers(event)
            .insert(Header {
                key: HEADER_TARGET_TOPIC,
                value: Some(target.as_str()),
            })
            .insert(Header {
                key: HEADER_NOT_BEFORE,
                value: Some(delivery_time.to_rfc3339().as_str()),
            });

        let record = FutureRecord::to(&topic)
            .key(&key)
            .payload(&payload)
            .headers(headers);
        self.send_record(record, &topic, wait).await?;
        debug!(event_id = %event.event_id, %delivery_time, "Event scheduled");
        Ok(())
    }

    /// Start a consumer loop for one `(event_type, subscription)` pair
    pub async fn start_consumer(&self, event_type: &str, subscription: &str) -> Result<()> {
        let topic = self.config.topic_for(event_type);
        let group = self.config.group_for(subscription, event_type);
        let consumer = self.create_consumer(&group)?;
        consumer
            .subscribe(&[topic.as_str()])
            .map_err(|e| EventBusError::kafka(format!("Failed to subscribe to {}: {}", topic, e)))?;

        let registry = Arc::clone(&self.registry);
        let tracker = Arc::clone(&self.tracker);
        let config = Arc::clone(&self.config);
        let producer = self.producer.clone();
        let event_type = event_type.to_string();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            info!(topic = %topic, group = %group, "Consumer started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    received = consumer.recv() => match received {
                        Ok(msg) => {
                            deliver(
                                &consumer,
                                &producer,
                                &registry,
                                &tracker,
                                &config,
                                &event_type,
                                &msg,
                            )
                            .await;
                        }
                        Err(e) => {
                            warn!(error = %e, topic = %topic, "Consumer receive error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
            info!(topic = %topic, group = %group, "Consumer stopped");
        });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    /// Spawn the scheduler loop draining the delay topic
    pub async fn start(&self) -> Result<()> {
        let topic = self.config.scheduled_topic();
        let group = format!("{}scheduler", self.config.topic_prefix);
        let consumer = self.create_consumer(&group)?;
        consumer
            .subscribe(&[topic.as_str()])
            .map_err(|e| EventBusError::kafka(format!("Failed to subscribe to {}: {}", topic, e)))?;

        let producer = self.producer.clone();
        let publish_wait = Duration::from_secs(self.config.publish_timeout_secs);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut hold_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    received = consumer.recv() => match received {
                        Ok(msg) => {
                            if let Err(e) =
                                release_when_due(&consumer, &producer, &msg, publish_wait, &mut hold_rx).await
                            {
                                error!(error = %e, "Scheduled delivery failed");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Scheduler receive error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    /// Stop consumers and flush the producer
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        for handle in self.tasks.lock().await.drain(..) {
            let _ = handle.await;
        }
        self.producer
            .flush(Timeout::After(Duration::from_secs(5)))
            .map_err(|e| EventBusError::kafka(format!("Flush failed: {}", e)))?;
        info!("Kafka event bus stopped");
        Ok(())
    }

    async fn publish_to(
        &self,
        topic: &str,
        event: &IntegrationEvent,
        wait: Duration,
    ) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        if payload.len() > MAX_MESSAGE_BYTES {
            return Err(EventBusError::MessageTooLarge {
                size: payload.len(),
            });
        }
        let key = event.event_id.to_string();
        let record = FutureRecord::to(topic)
            .key(&key)
            .payload(&payload)
            .headers(event_headers(event));

        let send = self.producer.send(record, Timeout::After(wait));
        match tokio::time::timeout(wait, send).await {
            Ok(Ok((partition, offset))) => {
                debug!(
                    event_id = %event.event_id,
                    topic,
                    partition,
                    offset,
                    "Event published"
                );
                Ok(())
            }
            Ok(Err((e, _))) => Err(EventBusError::publish(&event.event_type, e.to_string())),
            Err(_) => Err(EventBusError::PublishTimeout {
                event_type: event.event_type.clone(),
                timeout_secs: wait.as_secs(),
            }),
        }
    }

    async fn send_record(
        &self,
        record: FutureRecord<'_, String, Vec<u8>>,
        topic: &str,
        wait: Duration,
    ) -> Result<()> {
        match tokio::time::timeout(wait, self.producer.send(record, Timeout::After(wait))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => Err(EventBusError::publish(topic, e.to_string())),
            Err(_) => Err(EventBusError::PublishTimeout {
                event_type: topic.to_string(),
                timeout_secs: wait.as_secs(),
            }),
        }
    }

    fn create_consumer(&self, group: &str) -> Result<StreamConsumer> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.config.kafka.brokers)
            .set("group.id", group)
            .set("client.id", format!("{}-{}", self.config.kafka.client_id, group))
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set(
                "session.timeout.ms",
                self.config.kafka.session_timeout_ms.to_string(),
            )
            .set("queued.min.messages", self.config.prefetch.to_string())
            .create()
            .map_err(|e| EventBusError::kafka(format!("Failed to create consumer: {}", e)))
    }
}

/// Process one delivery end to end: dispatch, verdict, transport action
async fn deliver(
    consumer: &StreamConsumer,
    producer: &FutureProducer,
    registry: &HandlerRegistry,
    tracker: &DeliveryTracker,
    config: &EventBusConfig,
    event_type: &str,
    msg: &rdkafka::message::BorrowedMessage<'_>,
) {
    let message_id = header_value(msg, HEADER_EVENT_ID)
        .or_else(|| msg.key().map(|k| String::from_utf8_lossy(k).to_string()))
        .unwrap_or_else(|| format!("{}:{}:{}", msg.topic(), msg.partition(), msg.offset()));
    let correlation_id = header_value(msg, HEADER_CORRELATION_ID).unwrap_or_default();
    let body = msg.payload().unwrap_or_default();

    let ctx = EventContext {
        event_type: event_type.to_string(),
        message_id: message_id.clone(),
        correlation_id,
    };

    let handler_window = Duration::from_secs(config.handler_timeout_secs);
    let outcome = match tokio::time::timeout(handler_window, registry.dispatch(event_type, body, ctx))
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => DispatchOutcome::HandlerFailed(EventBusError::handler(
            event_type,
            format!("handler exceeded {}s", config.handler_timeout_secs),
        )),
    };

    let delivery_count = match &outcome {
        DispatchOutcome::HandlerFailed(_) => tracker.record_failure(&message_id),
        _ => tracker.attempts(&message_id).max(1),
    };

    match verdict_for(
        &outcome,
        event_type,
        &message_id,
        delivery_count,
        config.max_delivery_count,
    ) {
        DeliveryVerdict::Ack => {
            tracker.clear(&message_id);
            commit(consumer, msg);
        }
        DeliveryVerdict::Abandon => {
            commit(consumer, msg);
        }
        DeliveryVerdict::Requeue => {
            // Rewind so the next poll redelivers; offset stays uncommitted.
            if let Err(e) = consumer.seek(
                msg.topic(),
                msg.partition(),
                Offset::Offset(msg.offset()),
                Timeout::After(Duration::from_secs(1)),
            ) {
                warn!(error = %e, "Seek for redelivery failed");
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        DeliveryVerdict::DeadLetter { reason } => {
            dead_letter(producer, config, msg, event_type, &message_id, delivery_count, &reason)
                .await;
            tracker.clear(&message_id);
            commit(consumer, msg);
        }
    }
}

/// Copy a poison message to the dead-letter topic
async fn dead_letter(
    producer: &FutureProducer,
    config: &EventBusConfig,
    msg: &rdkafka::message::BorrowedMessage<'_>,
    event_type: &str,
    message_id: &str,
    delivery_count: u32,
    reason: &str,
) {
    let body = msg.payload().unwrap_or_default();
    let original: serde_json::Value = serde_json::from_slice(body)
        .unwrap_or_else(|_| json!(String::from_utf8_lossy(body).to_string()));
    let entry = json!({
        "messageId": message_id,
        "eventType": event_type,
        "originalTopic": msg.topic(),
        "payload": original,
        "deliveryCount": delivery_count,
        "failureReason": reason,
        "deadLetteredAt": Utc::now().to_rfc3339(),
    });
    let payload = match serde_json::to_vec(&entry) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "Failed to serialize dead-letter entry");
            return;
        }
    };

    let topic = config.dead_letter_topic();
    let record = FutureRecord::to(&topic).key(message_id).payload(&payload);
    match producer
        .send(record, Timeout::After(Duration::from_secs(5)))
        .await
    {
        Ok(_) => info!(message_id, topic = %topic, "Message dead-lettered"),
        Err((e, _)) => error!(message_id, error = %e, "Dead-letter publish failed"),
    }
}

/// Hold a scheduled record until its not-before instant, then republish
async fn release_when_due(
    consumer: &StreamConsumer,
    producer: &FutureProducer,
    msg: &rdkafka::message::BorrowedMessage<'_>,
    publish_wait: Duration,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<()> {
    let target = header_value(msg, HEADER_TARGET_TOPIC)
        .ok_or_else(|| EventBusError::kafka("Scheduled record missing target topic"))?;
    let not_before = header_value(msg, HEADER_NOT_BEFORE)
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| EventBusError::kafka("Scheduled record missing delivery time"))?;

    let now = Utc::now();
    if not_before > now {
        let delay = (not_before - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = shutdown_rx.recv() => return Err(EventBusError::Shutdown),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let key = msg
        .key()
        .map(|k| String::from_utf8_lossy(k).to_string())
        .unwrap_or_default();
    let payload = msg.payload().unwrap_or_default().to_vec();
    let record = FutureRecord::to(&target).key(&key).payload(&payload);
    producer
        .send(record, Timeout::After(publish_wait))
        .await
        .map_err(|(e, _)| EventBusError::publish(&target, e.to_string()))?;
    commit(consumer, msg);
    debug!(target = %target, "Scheduled event released");
    Ok(())
}

fn commit(consumer: &StreamConsumer, msg: &rdkafka::message::BorrowedMessage<'_>) {
    if let Err(e) = consumer.commit_message(msg, CommitMode::Async) {
        warn!(error = %e, "Offset commit failed");
    }
}

fn header_value(msg: &rdkafka::message::BorrowedMessage<'_>, name: &str) -> Option<String> {
    let headers = msg.headers()?;
    headers.iter().find_map(|h| {
        if h.key == name {
            h.value.map(|v| String::from_utf8_lossy(v).to_string())
        } else {
            None
        }
    })
}

fn event_headers(event: &IntegrationEvent) -> OwnedHeaders {
    OwnedHeaders::new()
        .insert(Header {
            key: HEADER_EVENT_ID,
            value: Some(event.event_id.to_string().as_str()),
        })
        .insert(Header {
            key: HEADER_CORRELATION_ID,
            value: Some(event.correlation_id.as_str()),
        })
        .insert(Header {
            key: HEADER_EVENT_TYPE,
            value: Some(event.event_type.as_str()),
        })
        .insert(Header {
            key: HEADER_SOURCE,
            value: Some(event.source.as_str()),
        })
        .insert(Header {
            key: HEADER_TIMESTAMP,
            value: Some(event.timestamp.to_rfc3339().as_str()),
        })
}
