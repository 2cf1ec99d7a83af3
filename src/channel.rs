//! Reply channels for request-reply exchanges.
//!
//! A call creates an ephemeral channel from a `ReplySubscription` whose
//! channel name and routing key are rewritten to a fresh channel id. The
//! channel is owned by the call scope and dropped on every exit path; a
//! receive that exceeds its budget yields a NONE-typed timeout indicator
//! rather than an error.
//!
//! `InMemoryTransport` is the loopback broker used by tests and
//! single-process deployments: producers deliver into it and channels
//! subscribe to topics on creation.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::DispatchError;
use crate::message::Message;

/// Declared subscription for a reply type.
///
/// Registered once per response type; the processor clones it and
/// rewrites channel name and routing key with the per-call channel id.
#[derive(Debug, Clone)]
pub struct ReplySubscription {
    /// Subscription identity, for logs.
    pub name: String,
    /// Queue/channel the broker should create.
    pub channel_name: String,
    /// Routing key replies are published under.
    pub routing_key: String,
}

impl ReplySubscription {
    /// Subscription with placeholder channel name and routing key.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            channel_name: name.clone(),
            routing_key: name.clone(),
            name,
        }
    }
}

/// An ephemeral subscriber channel.
pub trait Channel: Send {
    /// Drop any queued messages, forcing broker-side creation of the
    /// underlying queue.
    fn purge(&mut self) -> Result<(), DispatchError>;

    /// Block until a message arrives or the budget elapses. A timeout
    /// yields a NONE-typed message, not an error.
    fn receive(&mut self, timeout: Duration) -> Result<Message, DispatchError>;
}

/// Creates reply channels scoped to one call.
pub trait ChannelFactory: Send + Sync {
    fn create_channel(
        &self,
        subscription: &ReplySubscription,
    ) -> Result<Box<dyn Channel>, DispatchError>;
}

const TOPIC_QUEUE_DEPTH: usize = 64;

/// Loopback broker: topic to subscriber queue.
///
/// One subscriber per topic; a later subscription replaces the earlier
/// one, matching the ephemeral reply channels that own their topic.
#[derive(Default)]
pub struct InMemoryTransport {
    topics: Mutex<HashMap<String, SyncSender<Message>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a message to the topic's subscriber. Returns whether a
    /// subscriber existed and accepted it.
    pub fn deliver(&self, message: &Message) -> bool {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        match topics.get(message.topic()) {
            Some(sender) => sender.try_send(message.clone()).is_ok(),
            None => false,
        }
    }

    fn subscribe(&self, topic: &str) -> Receiver<Message> {
        let (sender, receiver) = std::sync::mpsc::sync_channel(TOPIC_QUEUE_DEPTH);
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.insert(topic.to_string(), sender);
        receiver
    }

    fn unsubscribe(&self, topic: &str) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.remove(topic);
    }
}

/// Channel factory over the loopback transport.
pub struct InMemoryChannelFactory {
    transport: Arc<InMemoryTransport>,
}

impl InMemoryChannelFactory {
    pub fn new(transport: Arc<InMemoryTransport>) -> Self {
        Self { transport }
    }
}

impl ChannelFactory for InMemoryChannelFactory {
    fn create_channel(
        &self,
        subscription: &ReplySubscription,
    ) -> Result<Box<dyn Channel>, DispatchError> {
        let receiver = self.transport.subscribe(&subscription.channel_name);
        info!(
            subscription = %subscription.name,
            channel = %subscription.channel_name,
            "Created reply channel"
        );
        Ok(Box::new(InMemoryChannel {
            topic: subscription.channel_name.clone(),
            receiver,
            transport: self.transport.clone(),
        }))
    }
}

struct InMemoryChannel {
    topic: String,
    receiver: Receiver<Message>,
    transport: Arc<InMemoryTransport>,
}

impl Channel for InMemoryChannel {
    fn purge(&mut self) -> Result<(), DispatchError> {
        let mut drained = 0usize;
        while self.receiver.try_recv().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            debug!(topic = %self.topic, drained = drained, "Purged reply channel");
        }
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Message, DispatchError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Ok(message),
            Err(RecvTimeoutError::Timeout) => Ok(Message::timeout_indicator(&self.topic)),
            Err(RecvTimeoutError::Disconnected) => Err(DispatchError::Transport(format!(
                "reply channel '{}' disconnected",
                self.topic
            ))),
        }
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        // Late replies route nowhere once the call scope closes.
        self.transport.unsubscribe(&self.topic);
        debug!(topic = %self.topic, "Reply channel destroyed");
    }
}
