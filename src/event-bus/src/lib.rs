//! Message-bus adapter for the Nexus Integration Gateway
//!
//! One publish/subscribe/schedule contract over two broker backends: a
//! classic broker (Kafka) and a managed topic bus (Redis Streams). The
//! backend is a tagged variant chosen at startup from configuration;
//! downstream code depends only on [`EventBus`].

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod kafka;
pub mod registry;
pub mod streams;

pub use bus::EventBus;
pub use config::{BrokerType, EventBusConfig, KafkaConfig, StreamsConfig};
pub use dispatch::{DeliveryTracker, DeliveryVerdict};
pub use error::{EventBusError, Result};
pub use registry::{EventContext, HandlerRegistry};
