//! Typed records exchanged over the event bus.
//!
//! Outbound messages flow from the orchestrator to the delivery workers keyed by client
//! id; status events flow back keyed by message id. Both carry a small set of
//! out-of-band headers mirroring the payload so brokers can route without decoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::bus::Record;
use crate::messages::models::{Message, MessageKind};

pub const HEADER_MESSAGE_ID: &str = "x-msg-id";
pub const HEADER_CLIENT_ID: &str = "x-client-id";
pub const HEADER_TYPE: &str = "x-type";
pub const HEADER_STATUS: &str = "x-status";
pub const HEADER_OPERATOR: &str = "x-operator";
pub const HEADER_TRACE_ID: &str = "x-trace-id";
pub const HEADER_WORKER: &str = "x-worker";

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("malformed event payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundMessage {
    pub message_id: Uuid,
    pub client_id: String,
    pub to: String,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub price: i64,
}

impl From<&Message> for OutboundMessage {
    fn from(message: &Message) -> Self {
        Self {
            message_id: message.id,
            client_id: message.client_id.clone(),
            to: message.to.clone(),
            body: message.body.clone(),
            kind: message.kind,
            price: message.price_minor,
        }
    }
}

impl OutboundMessage {
    pub fn to_record(&self) -> Result<Record, serde_json::Error> {
        let payload = serde_json::to_vec(self)?;
        Ok(Record::new(self.client_id.clone(), payload)
            .with_header(HEADER_MESSAGE_ID, self.message_id.to_string())
            .with_header(HEADER_CLIENT_ID, self.client_id.clone())
            .with_header(HEADER_TYPE, self.kind.as_str()))
    }

    pub fn from_record(record: &Record) -> Result<Self, EventDecodeError> {
        Ok(serde_json::from_slice(&record.payload)?)
    }
}

/// Delivery outcomes a worker may report. Anything else fails to decode.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Accepted,
    Delivered,
    Failed,
    Expired,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Accepted => "ACCEPTED",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Failed => "FAILED",
            DeliveryStatus::Expired => "EXPIRED",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEvent {
    pub message_id: Uuid,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub operator: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub worker: String,
}

impl StatusEvent {
    pub fn to_record(&self) -> Result<Record, serde_json::Error> {
        let payload = serde_json::to_vec(self)?;
        Ok(Record::new(self.message_id.to_string(), payload)
            .with_header(HEADER_MESSAGE_ID, self.message_id.to_string())
            .with_header(HEADER_STATUS, self.status.as_str())
            .with_header(HEADER_OPERATOR, self.operator.clone())
            .with_header(HEADER_TRACE_ID, self.trace_id.clone())
            .with_header(HEADER_WORKER, self.worker.clone()))
    }

    pub fn from_record(record: &Record) -> Result<Self, EventDecodeError> {
        Ok(serde_json::from_slice(&record.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_record_is_keyed_by_client() {
        let outbound = OutboundMessage {
            message_id: Uuid::nil(),
            client_id: "c1".into(),
            to: "+15550100".into(),
            body: "hello".into(),
            kind: MessageKind::Priority,
            price: 250,
        };
        let record = outbound.to_record().unwrap();
        assert_eq!(record.key, "c1");
        assert_eq!(record.header(HEADER_TYPE), Some("PRIORITY"));
        assert_eq!(record.header(HEADER_CLIENT_ID), Some("c1"));
        assert_eq!(
            record.header(HEADER_MESSAGE_ID),
            Some("00000000-0000-0000-0000-000000000000")
        );

        let wire: serde_json::Value = serde_json::from_slice(&record.payload).unwrap();
        assert_eq!(wire["type"], "PRIORITY");
        assert_eq!(wire["price"], 250);
        assert_eq!(OutboundMessage::from_record(&record).unwrap(), outbound);
    }

    #[test]
    fn status_record_is_keyed_by_message() {
        let event = StatusEvent {
            message_id: Uuid::new_v4(),
            status: DeliveryStatus::Failed,
            operator: "mock".into(),
            at: Utc::now(),
            trace_id: "trace-1".into(),
            worker: "w1".into(),
        };
        let record = event.to_record().unwrap();
        assert_eq!(record.key, event.message_id.to_string());
        assert_eq!(record.header(HEADER_STATUS), Some("FAILED"));
        assert_eq!(record.header(HEADER_WORKER), Some("w1"));
        assert_eq!(record.header(HEADER_TRACE_ID), Some("trace-1"));
    }

    #[test]
    fn unknown_status_values_are_rejected() {
        let payload = json!({
            "message_id": Uuid::new_v4(),
            "status": "BOUNCED",
            "operator": "mock",
            "at": "2024-06-01T00:00:00Z",
        });
        let record = Record::new("k", serde_json::to_vec(&payload).unwrap());
        assert!(StatusEvent::from_record(&record).is_err());
    }

    #[test]
    fn lowercase_status_values_are_rejected() {
        let payload = json!({
            "message_id": Uuid::new_v4(),
            "status": "delivered",
            "at": "2024-06-01T00:00:00Z",
        });
        let record = Record::new("k", serde_json::to_vec(&payload).unwrap());
        assert!(StatusEvent::from_record(&record).is_err());
    }

    #[test]
    fn optional_fields_default_to_empty() {
        let payload = json!({
            "message_id": Uuid::nil(),
            "status": "EXPIRED",
            "at": "2024-06-01T00:00:00Z",
        });
        let record = Record::new("k", serde_json::to_vec(&payload).unwrap());
        let event = StatusEvent::from_record(&record).unwrap();
        assert_eq!(event.status, DeliveryStatus::Expired);
        assert!(event.operator.is_empty());
        assert!(event.worker.is_empty());
    }
}
