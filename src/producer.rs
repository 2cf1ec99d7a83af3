//! Broker-facing message producers.
//!
//! A producer sends a wire message to the broker. Blocking and
//! asynchronous variants are separate traits so drivers can offer either
//! or both; the external bus refuses an operation whose variant is
//! missing. `close` is invoked when the process-wide bus handle is reset.

use async_trait::async_trait;
use tracing::debug;

use crate::channel::InMemoryTransport;
use crate::error::DispatchError;
use crate::message::Message;
use std::sync::{Arc, Mutex};

/// Blocking broker producer.
pub trait MessageProducer: Send + Sync {
    /// Send a message to its topic.
    fn send(&self, message: &Message) -> Result<(), DispatchError>;

    /// Send after a broker-side delay. Drivers without native delay
    /// support deliver immediately.
    fn send_with_delay(&self, message: &Message, delay_ms: u64) -> Result<(), DispatchError> {
        let _ = delay_ms;
        self.send(message)
    }

    /// Release broker resources. Called on bus reset.
    fn close(&self) {}
}

/// Asynchronous broker producer.
#[async_trait]
pub trait AsyncMessageProducer: Send + Sync {
    /// Send a message to its topic.
    async fn send(&self, message: &Message) -> Result<(), DispatchError>;

    /// Send after a broker-side delay; defaults to an immediate send.
    async fn send_with_delay(&self, message: &Message, delay_ms: u64) -> Result<(), DispatchError> {
        let _ = delay_ms;
        self.send(message).await
    }

    /// Release broker resources. Called on bus reset.
    fn close(&self) {}
}

/// Producer that routes messages over the in-memory transport.
///
/// Messages for topics with no subscribed channel are dropped, which is
/// fine for publish-only scenarios. Every send is also recorded so tests
/// can assert on traffic.
pub struct InMemoryProducer {
    transport: Arc<InMemoryTransport>,
    sent: Mutex<Vec<Message>>,
}

impl InMemoryProducer {
    /// Producer over the given transport.
    pub fn new(transport: Arc<InMemoryTransport>) -> Self {
        Self {
            transport,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Messages sent so far, in order.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of sends observed for the given message id.
    pub fn sent_count(&self, id: uuid::Uuid) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.id() == id)
            .count()
    }

    fn record_and_route(&self, message: &Message) -> Result<(), DispatchError> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());
        let delivered = self.transport.deliver(message);
        debug!(
            message_id = %message.id(),
            topic = %message.topic(),
            delivered = delivered,
            "Produced message"
        );
        Ok(())
    }
}

impl MessageProducer for InMemoryProducer {
    fn send(&self, message: &Message) -> Result<(), DispatchError> {
        self.record_and_route(message)
    }
}

#[async_trait]
impl AsyncMessageProducer for InMemoryProducer {
    async fn send(&self, message: &Message) -> Result<(), DispatchError> {
        self.record_and_route(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageBody, MessageHeader, MessageType};
    use uuid::Uuid;

    fn message(topic: &str) -> Message {
        Message::new(
            MessageHeader::new(Uuid::new_v4(), topic, MessageType::Event),
            MessageBody::empty(),
        )
    }

    #[test]
    fn test_send_records_message() {
        let producer = InMemoryProducer::new(Arc::new(InMemoryTransport::new()));
        let msg = message("orders");

        MessageProducer::send(&producer, &msg).unwrap();

        assert_eq!(producer.sent().len(), 1);
        assert_eq!(producer.sent_count(msg.id()), 1);
    }

    #[test]
    fn test_send_without_subscriber_is_ok() {
        let producer = InMemoryProducer::new(Arc::new(InMemoryTransport::new()));
        assert!(MessageProducer::send(&producer, &message("nobody-listens")).is_ok());
    }

    #[test]
    fn test_default_delay_falls_back_to_send() {
        let producer = InMemoryProducer::new(Arc::new(InMemoryTransport::new()));
        let msg = message("orders");
        MessageProducer::send_with_delay(&producer, &msg, 5_000).unwrap();
        assert_eq!(producer.sent_count(msg.id()), 1);
    }
}
