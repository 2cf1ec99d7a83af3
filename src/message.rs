//! Wire message model.
//!
//! A `Message` is what crosses the process boundary: a header carrying
//! routing and correlation metadata plus an opaque body. Messages are
//! created by mappers, persisted in the outbox, and handed to producers.
//! Once written to the outbox a message is never mutated.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of payload a message carries; drives remote dispatch choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    /// Point-to-point command payload.
    Command,
    /// Fan-out event payload.
    Event,
    /// Reply or query-result payload.
    Document,
    /// No payload; channels use this to signal a receive timeout.
    None,
    /// Consumer shutdown signal.
    Quit,
}

/// Routing and correlation metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Message identity; equals the request id at mapping time.
    pub id: Uuid,
    /// Destination topic, an opaque string to the core.
    pub topic: String,
    /// Payload kind.
    pub message_type: MessageType,
    /// Creation instant.
    pub timestamp: DateTime<Utc>,
    /// Correlation id echoed by replies.
    pub correlation_id: Option<String>,
    /// Topic a remote handler should reply to.
    pub reply_to: Option<String>,
    /// Requested delivery delay in milliseconds; producers without delay
    /// support deliver immediately.
    pub delayed_ms: u64,
    /// Free-form header values propagated end to end.
    pub bag: HashMap<String, serde_json::Value>,
}

impl MessageHeader {
    /// Create a header with the mandatory routing fields.
    pub fn new(id: Uuid, topic: impl Into<String>, message_type: MessageType) -> Self {
        Self {
            id,
            topic: topic.into(),
            message_type,
            timestamp: Utc::now(),
            correlation_id: None,
            reply_to: None,
            delayed_ms: 0,
            bag: HashMap::new(),
        }
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the reply-to topic.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Set the requested delivery delay.
    pub fn with_delay_ms(mut self, delayed_ms: u64) -> Self {
        self.delayed_ms = delayed_ms;
        self
    }
}

/// Opaque message payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody(Vec<u8>);

impl MessageBody {
    /// Wrap raw bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Empty body, used by timeout-indicator messages.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Serialize a value as a JSON body.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    /// Deserialize a JSON body.
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    /// Raw payload bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the body carries no payload.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A wire message: header plus opaque body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Routing and correlation metadata.
    pub header: MessageHeader,
    /// Opaque payload.
    pub body: MessageBody,
}

impl Message {
    /// Create a message from its parts.
    pub fn new(header: MessageHeader, body: MessageBody) -> Self {
        Self { header, body }
    }

    /// Message identity.
    pub fn id(&self) -> Uuid {
        self.header.id
    }

    /// Destination topic.
    pub fn topic(&self) -> &str {
        &self.header.topic
    }

    /// Payload kind.
    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// NONE-typed message a channel returns when a receive times out.
    pub fn timeout_indicator(topic: impl Into<String>) -> Self {
        Self {
            header: MessageHeader::new(Uuid::new_v4(), topic, MessageType::None),
            body: MessageBody::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        amount: u32,
    }

    #[test]
    fn test_json_body_round_trip() {
        let body = MessageBody::json(&Payload { amount: 7 }).unwrap();
        let parsed: Payload = body.parse_json().unwrap();
        assert_eq!(parsed, Payload { amount: 7 });
    }

    #[test]
    fn test_header_builders() {
        let id = Uuid::new_v4();
        let header = MessageHeader::new(id, "orders", MessageType::Command)
            .with_correlation_id("corr-1")
            .with_reply_to("replies")
            .with_delay_ms(250);

        assert_eq!(header.id, id);
        assert_eq!(header.topic, "orders");
        assert_eq!(header.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(header.reply_to.as_deref(), Some("replies"));
        assert_eq!(header.delayed_ms, 250);
    }

    #[test]
    fn test_timeout_indicator_is_none_typed_and_empty() {
        let msg = Message::timeout_indicator("replies.abc");
        assert_eq!(msg.message_type(), MessageType::None);
        assert!(msg.body.is_empty());
        assert_eq!(msg.topic(), "replies.abc");
    }
}
