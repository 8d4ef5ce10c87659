//! Backend-tagged event bus facade
//!
//! The backend is chosen once at startup from configuration; everything
//! downstream holds an [`EventBus`] and stays oblivious to the broker
//! behind it. A disabled variant swallows publishes for environments
//! without a broker (mirrors a disabled producer rather than an `Option`
//! at every call site).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use nexus_shared::IntegrationEvent;

use crate::config::{BrokerType, EventBusConfig};
use crate::error::Result;
use crate::kafka::KafkaEventBus;
use crate::registry::{EventContext, HandlerRegistry};
use crate::streams::RedisStreamsEventBus;

pub enum EventBus {
    Kafka(KafkaEventBus),
    Streams(RedisStreamsEventBus),
    /// No broker configured; publishes are dropped at debug level
    Disabled,
}

impl EventBus {
    /// Build the backend named by `config.broker_type`
    pub async fn from_config(
        config: EventBusConfig,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        match config.broker_type {
            BrokerType::ClassicBroker => {
                info!("Event bus backend: classic broker (Kafka)");
                Ok(EventBus::Kafka(KafkaEventBus::new(
                    Arc::clone(&config),
                    registry,
                )?))
            }
            BrokerType::ManagedBus => {
                info!("Event bus backend: managed bus (Redis Streams)");
                Ok(EventBus::Streams(
                    RedisStreamsEventBus::new(Arc::clone(&config), registry).await?,
                ))
            }
        }
    }

    pub fn disabled() -> Self {
        EventBus::Disabled
    }

    /// Publish one event to the topic derived from its type
    pub async fn publish(&self, event: &IntegrationEvent) -> Result<()> {
        match self {
            EventBus::Kafka(bus) => bus.publish(event).await,
            EventBus::Streams(bus) => bus.publish(event).await,
            EventBus::Disabled => {
                debug!(event_type = %event.event_type, "Event bus disabled, publish dropped");
                Ok(())
            }
        }
    }

    /// Publish several events under the batch confirmation window
    pub async fn publish_batch(&self, events: &[IntegrationEvent]) -> Result<()> {
        match self {
            EventBus::Kafka(bus) => bus.publish_batch(events).await,
            EventBus::Streams(bus) => bus.publish_batch(events).await,
            EventBus::Disabled => Ok(()),
        }
    }

    /// Register a typed handler and start a consumer for the subscription
    pub async fn subscribe<T, F, Fut>(
        &self,
        event_type: &str,
        subscription: &str,
        handler: F,
    ) -> Result<()>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(Arc<T>, EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        match self {
            EventBus::Kafka(bus) => {
                bus.registry().subscribe::<T, F, Fut>(event_type, handler);
                bus.start_consumer(event_type, subscription).await
            }
            EventBus::Streams(bus) => {
                bus.registry().subscribe::<T, F, Fut>(event_type, handler);
                bus.start_consumer(event_type, subscription).await
            }
            EventBus::Disabled => {
                warn!(event_type, "Event bus disabled, subscription ignored");
                Ok(())
            }
        }
    }

    /// Drop every handler for an event type
    pub fn unsubscribe(&self, event_type: &str) -> bool {
        match self {
            EventBus::Kafka(bus) => bus.registry().unsubscribe(event_type),
            EventBus::Streams(bus) => bus.registry().unsubscribe(event_type),
            EventBus::Disabled => false,
        }
    }

    /// Send a raw command document to a named queue
    pub async fn send_command(&self, queue: &str, command: &serde_json::Value) -> Result<()> {
        match self {
            EventBus::Kafka(bus) => bus.send_command(queue, command).await,
            EventBus::Streams(bus) => bus.send_command(queue, command).await,
            EventBus::Disabled => Ok(()),
        }
    }

    /// Hold an event until `delivery_time`, then publish it normally
    pub async fn schedule(
        &self,
        event: &IntegrationEvent,
        delivery_time: DateTime<Utc>,
    ) -> Result<()> {
        match self {
            EventBus::Kafka(bus) => bus.schedule(event, delivery_time).await,
            EventBus::Streams(bus) => bus.schedule(event, delivery_time).await,
            EventBus::Disabled => Ok(()),
        }
    }

    /// Cancellation of a scheduled event is not attempted; the delay queue
    /// owns the record until release.
    pub async fn cancel_scheduled(&self, _event_id: uuid::Uuid) -> Result<()> {
        Ok(())
    }

    /// Start background loops (scheduler, consumers)
    pub async fn start(&self) -> Result<()> {
        match self {
            EventBus::Kafka(bus) => bus.start().await,
            EventBus::Streams(bus) => bus.start().await,
            EventBus::Disabled => Ok(()),
        }
    }

    /// Stop background loops and flush outstanding publishes
    pub async fn stop(&self) -> Result<()> {
        match self {
            EventBus::Kafka(bus) => bus.stop().await,
            EventBus::Streams(bus) => bus.stop().await,
            EventBus::Disabled => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_bus_swallows_publishes() {
        let bus = EventBus::disabled();
        let event = IntegrationEvent::project_created("c", "P-1", "CUST001");
        assert!(bus.publish(&event).await.is_ok());
        assert!(bus.publish_batch(&[event]).await.is_ok());
        assert!(bus.cancel_scheduled(uuid::Uuid::new_v4()).await.is_ok());
        assert!(bus.start().await.is_ok());
        assert!(bus.stop().await.is_ok());
    }
}
