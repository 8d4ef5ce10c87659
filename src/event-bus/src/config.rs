//! Event-bus configuration
//!
//! Deserialized from the gateway's `event_bus` configuration section.

use serde::Deserialize;

/// Broker backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum BrokerType {
    /// Classic broker with durable topics and a dead-letter topic (Kafka)
    #[serde(rename = "classic-broker")]
    ClassicBroker,
    /// Managed topic bus with per-subscription consumer groups (Redis Streams)
    #[serde(rename = "managed-bus")]
    ManagedBus,
}

/// Top-level event-bus configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    pub broker_type: BrokerType,
    /// Prepended to every topic/stream/group name
    pub topic_prefix: String,
    /// Source string stamped on outgoing events
    pub source: String,
    /// Deliveries per message before dead-lettering
    pub max_delivery_count: u32,
    /// Bounded wait for a single publish confirmation
    pub publish_timeout_secs: u64,
    /// Bounded wait for a batch publish confirmation
    pub batch_publish_timeout_secs: u64,
    /// In-flight deliveries per consumer
    pub prefetch: u32,
    /// Upper bound on a single handler invocation
    pub handler_timeout_secs: u64,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub streams: StreamsConfig,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            broker_type: BrokerType::ClassicBroker,
            topic_prefix: "nexus.".to_string(),
            source: "api-gateway".to_string(),
            max_delivery_count: 3,
            publish_timeout_secs: 5,
            batch_publish_timeout_secs: 10,
            prefetch: 10,
            handler_timeout_secs: 30,
            kafka: KafkaConfig::default(),
            streams: StreamsConfig::default(),
        }
    }
}

/// Classic-broker (Kafka) connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
    pub client_id: String,
    /// Name of the delay topic used for scheduled delivery
    pub scheduled_topic: String,
    pub session_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "nexus-gateway".to_string(),
            scheduled_topic: "scheduled".to_string(),
            session_timeout_ms: 6000,
        }
    }
}

/// Managed-bus (Redis Streams) connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct StreamsConfig {
    pub url: String,
    /// Poll interval for blocked reads, milliseconds
    pub block_ms: u64,
    /// Idle time before a pending entry is reclaimed for redelivery
    pub reclaim_idle_ms: u64,
    /// Approximate per-stream retention
    pub max_stream_len: i64,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            block_ms: 1000,
            reclaim_idle_ms: 5000,
            max_stream_len: 100_000,
        }
    }
}

impl EventBusConfig {
    /// Topic/stream name for an event type
    pub fn topic_for(&self, event_type: &str) -> String {
        format!("{}{}", self.topic_prefix, event_type.to_lowercase())
    }

    /// Consumer group name for a subscription on an event type
    pub fn group_for(&self, subscription: &str, event_type: &str) -> String {
        format!(
            "{}{}.{}",
            self.topic_prefix,
            subscription,
            event_type.to_lowercase()
        )
    }

    /// Dead-letter topic/stream shared by all event types
    pub fn dead_letter_topic(&self) -> String {
        format!("{}dead-letter", self.topic_prefix)
    }

    /// Delay queue for scheduled delivery
    pub fn scheduled_topic(&self) -> String {
        format!("{}{}", self.topic_prefix, self.kafka.scheduled_topic)
    }
}
