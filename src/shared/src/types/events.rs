//! Integration event envelope and well-known event constructors
//!
//! Every message published to the bus is an [`IntegrationEvent`]: a small
//! envelope (id, timestamp, correlation id, source, type) plus free-form
//! payload fields. The wire format is camel-cased JSON with the payload
//! flattened next to the envelope fields, so each message is self-describing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Fire-and-forget event published to a topic named after its type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationEvent {
    /// Unique per emission
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    /// Emitting component, e.g. `api-gateway`
    pub source: String,
    /// Topic/exchange stem, e.g. `ApiRequestProcessed`
    pub event_type: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl IntegrationEvent {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            correlation_id: correlation_id.into(),
            source: source.into(),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Topic stem the event publishes under
    pub fn topic_stem(&self) -> &str {
        &self.event_type
    }

    /// Outcome event for a proxied request
    #[allow(clippy::too_many_arguments)]
    pub fn api_request_processed(
        correlation_id: impl Into<String>,
        service_name: &str,
        status: u16,
        duration_ms: u64,
        subject: Option<&str>,
        endpoint: &str,
        method: &str,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("serviceName".into(), Value::from(service_name));
        payload.insert("statusCode".into(), Value::from(status));
        payload.insert("durationMs".into(), Value::from(duration_ms));
        payload.insert(
            "subject".into(),
            subject.map(Value::from).unwrap_or(Value::Null),
        );
        payload.insert("endpoint".into(), Value::from(endpoint));
        payload.insert("method".into(), Value::from(method));
        Self::new("ApiRequestProcessed", "api-gateway", correlation_id, payload)
    }

    /// Outcome event for a request the gateway failed to serve
    pub fn gateway_error_occurred(
        correlation_id: impl Into<String>,
        error_code: &str,
        message: &str,
        endpoint: &str,
        method: &str,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("errorCode".into(), Value::from(error_code));
        payload.insert("message".into(), Value::from(message));
        payload.insert("endpoint".into(), Value::from(endpoint));
        payload.insert("method".into(), Value::from(method));
        Self::new("GatewayErrorOccurred", "api-gateway", correlation_id, payload)
    }

    pub fn project_created(
        correlation_id: impl Into<String>,
        project_number: &str,
        customer_id: &str,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("projectNumber".into(), Value::from(project_number));
        payload.insert("customerId".into(), Value::from(customer_id));
        Self::new("ProjectCreated", "erp-service", correlation_id, payload)
    }

    pub fn work_order_completed(
        correlation_id: impl Into<String>,
        work_order_id: &str,
        completed_by: &str,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("workOrderId".into(), Value::from(work_order_id));
        payload.insert("completedBy".into(), Value::from(completed_by));
        Self::new("WorkOrderCompleted", "field-service", correlation_id, payload)
    }

    pub fn inventory_adjusted(
        correlation_id: impl Into<String>,
        item_number: &str,
        quantity_delta: i64,
        warehouse: &str,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("itemNumber".into(), Value::from(item_number));
        payload.insert("quantityDelta".into(), Value::from(quantity_delta));
        payload.insert("warehouse".into(), Value::from(warehouse));
        Self::new("InventoryAdjusted", "inventory-service", correlation_id, payload)
    }

    pub fn ai_prediction_completed(
        correlation_id: impl Into<String>,
        model: &str,
        prediction: Value,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("model".into(), Value::from(model));
        payload.insert("prediction".into(), prediction);
        Self::new("AiPredictionCompleted", "ai-service", correlation_id, payload)
    }

    pub fn workflow_completed(
        correlation_id: impl Into<String>,
        workflow_id: &str,
        outcome: &str,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("workflowId".into(), Value::from(workflow_id));
        payload.insert("outcome".into(), Value::from(outcome));
        Self::new("WorkflowCompleted", "workflow-service", correlation_id, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serializes_camel_case_with_flat_payload() {
        let event = IntegrationEvent::api_request_processed(
            "corr-1",
            "erp-service",
            200,
            42,
            Some("user-1"),
            "/api/erp/customers/42",
            "GET",
        );

        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("eventId").is_some());
        assert!(json.get("correlationId").is_some());
        assert_eq!(json["eventType"], "ApiRequestProcessed");
        assert_eq!(json["source"], "api-gateway");
        // Payload fields sit next to the envelope fields
        assert_eq!(json["serviceName"], "erp-service");
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["durationMs"], 42);
    }

    #[test]
    fn test_round_trip() {
        let event = IntegrationEvent::gateway_error_occurred(
            "corr-2",
            "BAD_GATEWAY",
            "connection refused",
            "/api/erp/items",
            "POST",
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: IntegrationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_event_ids_unique_per_emission() {
        let a = IntegrationEvent::project_created("c", "P-1", "CUST001");
        let b = IntegrationEvent::project_created("c", "P-1", "CUST001");
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn test_topic_stem_is_event_type() {
        let event = IntegrationEvent::work_order_completed("c", "WO-9", "tech-1");
        assert_eq!(event.topic_stem(), "WorkOrderCompleted");
    }
}
