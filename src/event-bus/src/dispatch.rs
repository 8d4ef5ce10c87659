//! Delivery bookkeeping shared by both backends
//!
//! Turns a dispatch outcome into the transport action to take: acknowledge,
//! redeliver, abandon, or dead-letter. Attempt counts are tracked per
//! message id; a consumer group pins a message to one consumer at a time,
//! so a process-local counter is sufficient for the classic-broker backend
//! (the managed bus reads the count natively from its pending list).

use dashmap::DashMap;
use tracing::{error, warn};

use crate::registry::DispatchOutcome;

/// Transport action for one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryVerdict {
    /// Acknowledge and move on
    Ack,
    /// Leave unacknowledged so the broker redelivers
    Requeue,
    /// Acknowledge without processing (no handler list)
    Abandon,
    /// Copy to the dead-letter destination, then acknowledge
    DeadLetter { reason: String },
}

/// Per-message delivery attempt counter
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    attempts: DashMap<String, u32>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt and return the total so far
    pub fn record_failure(&self, message_id: &str) -> u32 {
        let mut entry = self.attempts.entry(message_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn attempts(&self, message_id: &str) -> u32 {
        self.attempts.get(message_id).map(|e| *e).unwrap_or(0)
    }

    /// Forget a message once it is acknowledged or dead-lettered
    pub fn clear(&self, message_id: &str) {
        self.attempts.remove(message_id);
    }
}

/// Decide the transport action for a dispatch outcome.
///
/// `delivery_count` is the number of attempts including this one.
pub fn verdict_for(
    outcome: &DispatchOutcome,
    event_type: &str,
    message_id: &str,
    delivery_count: u32,
    max_delivery_count: u32,
) -> DeliveryVerdict {
    match outcome {
        DispatchOutcome::Handled => DeliveryVerdict::Ack,
        DispatchOutcome::NoHandlers => {
            warn!(event_type, message_id, "No handlers registered, abandoning delivery");
            DeliveryVerdict::Abandon
        }
        DispatchOutcome::UnknownType => {
            error!(event_type, message_id, "Unknown event type, dead-lettering");
            DeliveryVerdict::DeadLetter {
                reason: format!("unknown event type: {}", event_type),
            }
        }
        DispatchOutcome::DecodeFailed(e) => {
            error!(event_type, message_id, error = %e, "Payload failed to decode, dead-lettering");
            DeliveryVerdict::DeadLetter {
                reason: format!("decode failed: {}", e),
            }
        }
        DispatchOutcome::HandlerFailed(e) => {
            if delivery_count >= max_delivery_count {
                error!(
                    event_type,
                    message_id,
                    delivery_count,
                    max_delivery_count,
                    error = %e,
                    "Delivery budget exhausted, dead-lettering"
                );
                DeliveryVerdict::DeadLetter {
                    reason: format!("handler failed after {} deliveries: {}", delivery_count, e),
                }
            } else {
                warn!(
                    event_type,
                    message_id,
                    delivery_count,
                    max_delivery_count,
                    error = %e,
                    "Handler failed, requeueing"
                );
                DeliveryVerdict::Requeue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EventBusError;
    use crate::registry::{EventContext, HandlerRegistry};
    use nexus_shared::IntegrationEvent;

    fn failed() -> DispatchOutcome {
        DispatchOutcome::HandlerFailed(EventBusError::handler("X", "boom"))
    }

    #[test]
    fn test_poison_message_dead_letters_exactly_at_budget() {
        let tracker = DeliveryTracker::new();
        let max = 3;
        let mut verdicts = Vec::new();

        // Simulate the consumer loop delivering the same message until a
        // terminal verdict is reached.
        loop {
            let count = tracker.record_failure("m-1");
            let verdict = verdict_for(&failed(), "X", "m-1", count, max);
            let done = !matches!(verdict, DeliveryVerdict::Requeue);
            verdicts.push(verdict);
            if done {
                tracker.clear("m-1");
                break;
            }
        }

        assert_eq!(verdicts.len(), 3);
        assert_eq!(verdicts[0], DeliveryVerdict::Requeue);
        assert_eq!(verdicts[1], DeliveryVerdict::Requeue);
        assert!(matches!(verdicts[2], DeliveryVerdict::DeadLetter { .. }));
        // Tracker is clean: no further deliveries are owed
        assert_eq!(tracker.attempts("m-1"), 0);
    }

    #[test]
    fn test_success_acks_and_unknown_dead_letters() {
        assert_eq!(
            verdict_for(&DispatchOutcome::Handled, "X", "m", 1, 3),
            DeliveryVerdict::Ack
        );
        assert!(matches!(
            verdict_for(&DispatchOutcome::UnknownType, "X", "m", 1, 3),
            DeliveryVerdict::DeadLetter { .. }
        ));
        assert_eq!(
            verdict_for(&DispatchOutcome::NoHandlers, "X", "m", 1, 3),
            DeliveryVerdict::Abandon
        );
    }

    #[tokio::test]
    async fn test_end_to_end_verdicts_with_registry() {
        let registry = HandlerRegistry::new();
        registry.subscribe::<IntegrationEvent, _, _>("Poison", |_e, _c| async {
            Err(EventBusError::handler("Poison", "always fails"))
        });

        let event = IntegrationEvent::new("Poison", "test", "c-1", serde_json::Map::new());
        let body = serde_json::to_vec(&event).unwrap();
        let tracker = DeliveryTracker::new();
        let id = event.event_id.to_string();

        let mut dead_letters = 0;
        for _ in 0..5 {
            let ctx = EventContext {
                event_type: "Poison".to_string(),
                message_id: id.clone(),
                correlation_id: "c-1".to_string(),
            };
            let outcome = registry.dispatch("Poison", &body, ctx).await;
            let count = tracker.record_failure(&id);
            match verdict_for(&outcome, "Poison", &id, count, 3) {
                DeliveryVerdict::Requeue => continue,
                DeliveryVerdict::DeadLetter { .. } => {
                    dead_letters += 1;
                    tracker.clear(&id);
                    break;
                }
                other => panic!("unexpected verdict: {:?}", other),
            }
        }

        // Exactly one dead-letter copy, no further deliveries
        assert_eq!(dead_letters, 1);
        assert_eq!(tracker.attempts(&id), 0);
    }
}
