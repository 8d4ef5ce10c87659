//! Error types for the event-bus adapter

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EventBusError>;

/// Main error type for the event bus
#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Kafka error: {0}")]
    Kafka(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Publish not confirmed within {timeout_secs}s for event type {event_type}")]
    PublishTimeout {
        event_type: String,
        timeout_secs: u64,
    },

    #[error("Publish failed for event type {event_type}: {message}")]
    Publish {
        event_type: String,
        message: String,
    },

    #[error("Message too large for an empty batch: {size} bytes")]
    MessageTooLarge { size: usize },

    #[error("No decoder registered for event type: {0}")]
    UnknownEventType(String),

    #[error("Handler failed for event type {event_type}: {message}")]
    Handler {
        event_type: String,
        message: String,
    },

    #[error("Decoder type mismatch for event type {0}")]
    DecoderMismatch(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Bus is shut down")]
    Shutdown,
}

impl EventBusError {
    pub fn kafka(message: impl Into<String>) -> Self {
        Self::Kafka(message.into())
    }

    pub fn publish(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            event_type: event_type.into(),
            message: message.into(),
        }
    }

    pub fn handler(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            event_type: event_type.into(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EventBusError::PublishTimeout {
            event_type: "ApiRequestProcessed".to_string(),
            timeout_secs: 5,
        };
        assert!(err.to_string().contains("5s"));
        assert!(err.to_string().contains("ApiRequestProcessed"));
    }
}
