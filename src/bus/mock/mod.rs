//! Mock producer and channel implementations for testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::channel::{Channel, ChannelFactory, ReplySubscription};
use crate::error::DispatchError;
use crate::message::Message;
use crate::producer::{AsyncMessageProducer, MessageProducer};

/// Mock producer recording every send.
///
/// `fail_times` makes the next N sends fail with a transport error, for
/// exercising the retry envelope.
#[derive(Default)]
pub struct MockProducer {
    sent: Mutex<Vec<Message>>,
    failures_remaining: AtomicUsize,
    closed: AtomicBool,
}

impl MockProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` sends with a transport error.
    pub fn fail_times(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Messages successfully sent, in order.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Successful sends observed for a message id.
    pub fn sent_count(&self, id: uuid::Uuid) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.id() == id)
            .count()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn try_send(&self, message: &Message) -> Result<(), DispatchError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(DispatchError::Transport("mock send failure".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());
        Ok(())
    }
}

impl MessageProducer for MockProducer {
    fn send(&self, message: &Message) -> Result<(), DispatchError> {
        self.try_send(message)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AsyncMessageProducer for MockProducer {
    async fn send(&self, message: &Message) -> Result<(), DispatchError> {
        self.try_send(message)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

type ReplyScript = Box<dyn FnOnce(&ReplySubscription) -> Message + Send>;

/// Mock channel factory producing scripted reply channels.
///
/// Replies are enqueued as builders receiving the per-call subscription,
/// so a script can echo the actual channel id into its correlation id.
#[derive(Default)]
pub struct MockChannelFactory {
    script: Mutex<VecDeque<ReplyScript>>,
    purges: Arc<AtomicUsize>,
    channels_created: AtomicUsize,
    channels_dropped: Arc<AtomicUsize>,
}

impl MockChannelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a reply built from the subscription the call creates.
    pub fn enqueue_reply(
        &self,
        build: impl FnOnce(&ReplySubscription) -> Message + Send + 'static,
    ) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Box::new(build));
    }

    /// How many times channels were purged.
    pub fn purge_count(&self) -> usize {
        self.purges.load(Ordering::SeqCst)
    }

    /// How many channels were created.
    pub fn created_count(&self) -> usize {
        self.channels_created.load(Ordering::SeqCst)
    }

    /// How many channels were destroyed.
    pub fn dropped_count(&self) -> usize {
        self.channels_dropped.load(Ordering::SeqCst)
    }
}

impl ChannelFactory for MockChannelFactory {
    fn create_channel(
        &self,
        subscription: &ReplySubscription,
    ) -> Result<Box<dyn Channel>, DispatchError> {
        self.channels_created.fetch_add(1, Ordering::SeqCst);
        let replies = {
            let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
            script.drain(..).map(|build| build(subscription)).collect()
        };
        Ok(Box::new(MockChannel {
            topic: subscription.channel_name.clone(),
            replies,
            purges: self.purges.clone(),
            dropped: self.channels_dropped.clone(),
        }))
    }
}

struct MockChannel {
    topic: String,
    replies: VecDeque<Message>,
    purges: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

impl Channel for MockChannel {
    fn purge(&mut self) -> Result<(), DispatchError> {
        self.purges.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration) -> Result<Message, DispatchError> {
        Ok(self
            .replies
            .pop_front()
            .unwrap_or_else(|| Message::timeout_indicator(&self.topic)))
    }
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
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
    fn test_mock_producer_records_sends() {
        let producer = MockProducer::new();
        let msg = message("orders");
        MessageProducer::send(&producer, &msg).unwrap();
        assert_eq!(producer.sent_count(msg.id()), 1);
    }

    #[test]
    fn test_mock_producer_fails_then_recovers() {
        let producer = MockProducer::new();
        producer.fail_times(1);
        let msg = message("orders");

        assert!(MessageProducer::send(&producer, &msg).is_err());
        assert!(MessageProducer::send(&producer, &msg).is_ok());
        assert_eq!(producer.sent_count(msg.id()), 1);
    }

    #[test]
    fn test_mock_channel_scripted_reply_then_timeout() {
        let factory = MockChannelFactory::new();
        factory.enqueue_reply(|sub| {
            Message::new(
                MessageHeader::new(Uuid::new_v4(), &*sub.channel_name, MessageType::Document)
                    .with_correlation_id(sub.routing_key.clone()),
                MessageBody::empty(),
            )
        });

        let subscription = ReplySubscription::new("replies");
        let mut channel = factory.create_channel(&subscription).unwrap();

        let first = channel.receive(Duration::from_millis(10)).unwrap();
        assert_eq!(first.message_type(), MessageType::Document);
        assert_eq!(
            first.header.correlation_id.as_deref(),
            Some(subscription.routing_key.as_str())
        );

        let second = channel.receive(Duration::from_millis(10)).unwrap();
        assert_eq!(second.message_type(), MessageType::None);
    }

    #[test]
    fn test_mock_channel_drop_is_counted() {
        let factory = MockChannelFactory::new();
        let channel = factory
            .create_channel(&ReplySubscription::new("replies"))
            .unwrap();
        assert_eq!(factory.dropped_count(), 0);
        drop(channel);
        assert_eq!(factory.dropped_count(), 1);
    }
}
