//! Handler registry: event-type string → typed decoder + handler closures
//!
//! Decoders and handlers are registered together at startup, so delivery
//! never needs a reflective type search. Each delivery is decoded once and
//! the decoded value is shared across the type's handlers.

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::{EventBusError, Result};

/// Transport metadata accompanying a delivery
#[derive(Debug, Clone)]
pub struct EventContext {
    pub event_type: String,
    /// Message id (equals the event id for bus-published events)
    pub message_id: String,
    pub correlation_id: String,
}

type DecodedPayload = Arc<dyn Any + Send + Sync>;
type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<DecodedPayload> + Send + Sync>;
type HandlerFn =
    Arc<dyn Fn(DecodedPayload, EventContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct TypeEntry {
    decode: DecodeFn,
    handlers: Vec<HandlerFn>,
}

/// Outcome of dispatching one delivery through the registry
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Every handler completed
    Handled,
    /// A decoder is registered but the handler list is empty
    NoHandlers,
    /// Nothing is registered for the type
    UnknownType,
    /// The payload failed to decode
    DecodeFailed(EventBusError),
    /// A handler returned an error; remaining handlers were not invoked
    HandlerFailed(EventBusError),
}

/// Per-event-type decoder and handler table
#[derive(Default)]
pub struct HandlerRegistry {
    entries: DashMap<String, TypeEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the decoder for an event type without any handler.
    ///
    /// The first registration for a type fixes its decoder; later
    /// `subscribe` calls for the same type must use the same payload type.
    pub fn register_event_type<T>(&self, event_type: &str)
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.entries
            .entry(event_type.to_string())
            .or_insert_with(|| TypeEntry {
                decode: Self::decoder::<T>(),
                handlers: Vec::new(),
            });
    }

    /// Register a typed handler closure for an event type
    pub fn subscribe<T, F, Fut>(&self, event_type: &str, handler: F)
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(Arc<T>, EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let event_type_owned = event_type.to_string();
        let handler = Arc::new(handler);
        let wrapped: HandlerFn = Arc::new(move |payload, ctx| {
            let handler = Arc::clone(&handler);
            let event_type = event_type_owned.clone();
            Box::pin(async move {
                let typed = payload
                    .downcast::<T>()
                    .map_err(|_| EventBusError::DecoderMismatch(event_type))?;
                handler(typed, ctx).await
            })
        });

        let mut entry = self
            .entries
            .entry(event_type.to_string())
            .or_insert_with(|| TypeEntry {
                decode: Self::decoder::<T>(),
                handlers: Vec::new(),
            });
        entry.handlers.push(wrapped);
        debug!(event_type, handlers = entry.handlers.len(), "Handler registered");
    }

    /// Drop every handler and the decoder for an event type
    pub fn unsubscribe(&self, event_type: &str) -> bool {
        self.entries.remove(event_type).is_some()
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.entries.contains_key(event_type)
    }

    /// Decode once, then run the type's handlers sequentially
    pub async fn dispatch(
        &self,
        event_type: &str,
        body: &[u8],
        ctx: EventContext,
    ) -> DispatchOutcome {
        // Clone out of the map before any await point
        let (decode, handlers) = match self.entries.get(event_type) {
            Some(entry) => (Arc::clone(&entry.decode), entry.handlers.clone()),
            None => return DispatchOutcome::UnknownType,
        };

        if handlers.is_empty() {
            return DispatchOutcome::NoHandlers;
        }

        let payload = match decode(body) {
            Ok(payload) => payload,
            Err(e) => return DispatchOutcome::DecodeFailed(e),
        };

        for handler in handlers {
            if let Err(e) = handler(Arc::clone(&payload), ctx.clone()).await {
                return DispatchOutcome::HandlerFailed(e);
            }
        }
        DispatchOutcome::Handled
    }

    fn decoder<T>() -> DecodeFn
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        Arc::new(|bytes| {
            let value: T = serde_json::from_slice(bytes)?;
            Ok(Arc::new(value) as DecodedPayload)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_shared::IntegrationEvent;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ctx(event_type: &str) -> EventContext {
        EventContext {
            event_type: event_type.to_string(),
            message_id: "m-1".to_string(),
            correlation_id: "c-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_decodes_once_and_runs_all_handlers() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            registry.subscribe::<IntegrationEvent, _, _>("ProjectCreated", move |event, _ctx| {
                let calls = Arc::clone(&calls);
                async move {
                    assert_eq!(event.event_type, "ProjectCreated");
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        let event = IntegrationEvent::project_created("c-1", "P-1", "CUST001");
        let body = serde_json::to_vec(&event).unwrap();
        let outcome = registry.dispatch("ProjectCreated", &body, ctx("ProjectCreated")).await;

        assert!(matches!(outcome, DispatchOutcome::Handled));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_type_and_empty_handler_list() {
        let registry = HandlerRegistry::new();
        let outcome = registry.dispatch("Nope", b"{}", ctx("Nope")).await;
        assert!(matches!(outcome, DispatchOutcome::UnknownType));

        registry.register_event_type::<IntegrationEvent>("KnownButIdle");
        let event = IntegrationEvent::project_created("c", "P", "C");
        let body = serde_json::to_vec(&event).unwrap();
        let outcome = registry.dispatch("KnownButIdle", &body, ctx("KnownButIdle")).await;
        assert!(matches!(outcome, DispatchOutcome::NoHandlers));
    }

    #[tokio::test]
    async fn test_handler_error_stops_remaining_handlers() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));

        registry.subscribe::<IntegrationEvent, _, _>("X", |_event, _ctx| async {
            Err(EventBusError::handler("X", "boom"))
        });
        {
            let calls = Arc::clone(&calls);
            registry.subscribe::<IntegrationEvent, _, _>("X", move |_event, _ctx| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        let event = IntegrationEvent::new("X", "test", "c", serde_json::Map::new());
        let body = serde_json::to_vec(&event).unwrap();
        let outcome = registry.dispatch("X", &body, ctx("X")).await;

        assert!(matches!(outcome, DispatchOutcome::HandlerFailed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_a_decode_failure() {
        let registry = HandlerRegistry::new();
        registry.subscribe::<IntegrationEvent, _, _>("X", |_e, _c| async { Ok(()) });
        let outcome = registry.dispatch("X", b"not json", ctx("X")).await;
        assert!(matches!(outcome, DispatchOutcome::DecodeFailed(_)));
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_type() {
        let registry = HandlerRegistry::new();
        registry.subscribe::<IntegrationEvent, _, _>("X", |_e, _c| async { Ok(()) });
        assert!(registry.is_registered("X"));
        assert!(registry.unsubscribe("X"));
        assert!(!registry.is_registered("X"));
    }
}
