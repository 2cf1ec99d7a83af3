//! External bus: coordinates outbox, producer, and resilience policies.
//!
//! The bus owns the store-and-forward protocol:
//! 1. `add_to_outbox` deposits a message durably, optionally on the
//!    caller's transaction.
//! 2. `clear_outbox` produces deposited messages to the broker under
//!    retry nested inside the circuit breaker and acknowledges success
//!    by marking entries dispatched.
//!
//! Request-reply traffic bypasses the outbox through
//! `send_via_external_bus`, which applies retry only.
//!
//! This module contains:
//! - `ExternalBus` and its builder
//! - `service`: the process-wide handle with a test reset
//! - `mock`: producer and channel doubles for tests

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::message::Message;
use crate::outbox::{AsyncOutbox, Outbox, TransactionProvider};
use crate::producer::{AsyncMessageProducer, MessageProducer};
use crate::registry::{
    PolicyRegistry, CIRCUIT_BREAKER, CIRCUIT_BREAKER_ASYNC, RETRY_POLICY, RETRY_POLICY_ASYNC,
};
use crate::resilience::{AsyncOperation, Operation};

pub mod mock;
pub mod service;

/// Default budget handed to outbox writes.
const DEFAULT_OUTBOX_TIMEOUT: Duration = Duration::from_millis(300);

/// Callback invoked after a message is successfully produced.
pub type DeliveryCallback = Box<dyn Fn(&Message) + Send + Sync>;

/// Builder for [`ExternalBus`].
#[derive(Default)]
pub struct ExternalBusBuilder {
    outbox: Option<Arc<dyn Outbox>>,
    async_outbox: Option<Arc<dyn AsyncOutbox>>,
    producer: Option<Arc<dyn MessageProducer>>,
    async_producer: Option<Arc<dyn AsyncMessageProducer>>,
    policies: Option<PolicyRegistry>,
    outbox_timeout: Option<Duration>,
    transaction_provider: Option<Arc<dyn TransactionProvider>>,
}

impl ExternalBusBuilder {
    /// Attach a blocking outbox.
    pub fn with_outbox(mut self, outbox: Arc<dyn Outbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Attach an asynchronous outbox.
    pub fn with_async_outbox(mut self, outbox: Arc<dyn AsyncOutbox>) -> Self {
        self.async_outbox = Some(outbox);
        self
    }

    /// Attach a blocking producer.
    pub fn with_producer(mut self, producer: Arc<dyn MessageProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Attach an asynchronous producer.
    pub fn with_async_producer(mut self, producer: Arc<dyn AsyncMessageProducer>) -> Self {
        self.async_producer = Some(producer);
        self
    }

    /// Supply the policy registry; defaults are installed for any
    /// reserved name the registry lacks.
    pub fn with_policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = Some(policies);
        self
    }

    /// Budget for outbox writes.
    pub fn with_outbox_timeout(mut self, timeout: Duration) -> Self {
        self.outbox_timeout = Some(timeout);
        self
    }

    /// Tie deposits to caller-owned transactions.
    pub fn with_transaction_provider(mut self, provider: Arc<dyn TransactionProvider>) -> Self {
        self.transaction_provider = Some(provider);
        self
    }

    pub fn build(self) -> ExternalBus {
        let mut policies = self.policies.unwrap_or_default();
        policies.ensure_defaults();
        ExternalBus {
            outbox: self.outbox,
            async_outbox: self.async_outbox,
            producer: self.producer,
            async_producer: self.async_producer,
            policies: Arc::new(policies),
            outbox_timeout: self.outbox_timeout.unwrap_or(DEFAULT_OUTBOX_TIMEOUT),
            transaction_provider: self.transaction_provider,
            on_delivery: Mutex::new(Vec::new()),
        }
    }
}

/// Coordinates outbox, producers, and resilience policies.
pub struct ExternalBus {
    outbox: Option<Arc<dyn Outbox>>,
    async_outbox: Option<Arc<dyn AsyncOutbox>>,
    producer: Option<Arc<dyn MessageProducer>>,
    async_producer: Option<Arc<dyn AsyncMessageProducer>>,
    policies: Arc<PolicyRegistry>,
    outbox_timeout: Duration,
    transaction_provider: Option<Arc<dyn TransactionProvider>>,
    on_delivery: Mutex<Vec<DeliveryCallback>>,
}

impl ExternalBus {
    /// Start building a bus.
    pub fn builder() -> ExternalBusBuilder {
        ExternalBusBuilder::default()
    }

    /// The policy registry this bus applies.
    pub fn policies(&self) -> Arc<PolicyRegistry> {
        self.policies.clone()
    }

    /// Register a callback fired after each successful produce.
    pub fn on_delivery(&self, callback: impl Fn(&Message) + Send + Sync + 'static) {
        self.lock_callbacks().push(Box::new(callback));
    }

    /// Deposit a message durably. When `use_transaction` is set and a
    /// provider is configured, the write runs on the caller's connection.
    pub fn add_to_outbox(
        &self,
        message: &Message,
        use_transaction: bool,
    ) -> Result<(), DispatchError> {
        let outbox = self.outbox.as_ref().ok_or_else(|| {
            DispatchError::Configuration("no outbox configured for blocking operations".into())
        })?;
        let conn = self.transaction_connection(use_transaction);
        outbox.add(
            message,
            self.outbox_timeout,
            conn.as_ref().map(|c| c.as_ref() as &(dyn Any + Send + Sync)),
        )?;
        debug!(message_id = %message.id(), topic = %message.topic(), "Message deposited to outbox");
        Ok(())
    }

    /// Asynchronous deposit; see [`ExternalBus::add_to_outbox`].
    pub async fn add_to_outbox_async(
        &self,
        message: &Message,
        use_transaction: bool,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let outbox = self.async_outbox.as_ref().ok_or_else(|| {
            DispatchError::Configuration("no outbox configured for async operations".into())
        })?;
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        let conn = self.transaction_connection(use_transaction);
        let add = outbox.add(
            message,
            self.outbox_timeout,
            conn.as_ref().map(|c| c.as_ref() as &(dyn Any + Send + Sync)),
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            result = add => result?,
        }
        debug!(message_id = %message.id(), topic = %message.topic(), "Message deposited to outbox");
        Ok(())
    }

    /// Produce deposited messages under retry inside the circuit
    /// breaker, acknowledging each success.
    ///
    /// A missing id is remembered while remaining ids are still
    /// processed; the first missing id is then surfaced as not-found.
    /// Entries already marked dispatched are skipped.
    pub fn clear_outbox(&self, ids: &[Uuid]) -> Result<(), DispatchError> {
        let outbox = self.outbox.as_ref().ok_or_else(|| {
            DispatchError::Configuration("no outbox configured for blocking operations".into())
        })?;
        let producer = self.producer.as_ref().ok_or_else(|| {
            DispatchError::Configuration("no producer configured for blocking operations".into())
        })?;
        let breaker = self.policies.get(CIRCUIT_BREAKER)?;
        let retry = self.policies.get(RETRY_POLICY)?;

        let mut missing = None;
        for &id in ids {
            let Some(entry) = outbox.get(id)? else {
                warn!(message_id = %id, "No outbox entry for message id");
                missing.get_or_insert(id);
                continue;
            };
            if entry.is_dispatched() {
                debug!(message_id = %id, "Outbox entry already dispatched, skipping");
                continue;
            }
            let message = entry.message;
            breaker.execute(&mut || retry.execute(&mut || producer.send(&message)))?;
            outbox.mark_dispatched(id, Utc::now())?;
            self.notify_delivery(&message);
            debug!(message_id = %id, topic = %message.topic(), "Outbox message produced");
        }
        match missing {
            Some(id) => Err(DispatchError::NotFound(id)),
            None => Ok(()),
        }
    }

    /// Asynchronous clear; see [`ExternalBus::clear_outbox`].
    pub async fn clear_outbox_async(
        &self,
        ids: &[Uuid],
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let outbox = self.async_outbox.as_ref().ok_or_else(|| {
            DispatchError::Configuration("no outbox configured for async operations".into())
        })?;
        let producer = self.async_producer.as_ref().ok_or_else(|| {
            DispatchError::Configuration("no producer configured for async operations".into())
        })?;
        let breaker = self.policies.get_async(CIRCUIT_BREAKER_ASYNC)?;
        let retry = self.policies.get_async(RETRY_POLICY_ASYNC)?;

        let mut missing = None;
        for &id in ids {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            let Some(entry) = outbox.get(id).await? else {
                warn!(message_id = %id, "No outbox entry for message id");
                missing.get_or_insert(id);
                continue;
            };
            if entry.is_dispatched() {
                debug!(message_id = %id, "Outbox entry already dispatched, skipping");
                continue;
            }
            let message = Arc::new(entry.message);

            let attempt_producer = producer.clone();
            let attempt_message = message.clone();
            let attempt_retry = retry.clone();
            let attempt_cancel = cancel.clone();
            let mut guarded = move || {
                let producer = attempt_producer.clone();
                let message = attempt_message.clone();
                let retry = attempt_retry.clone();
                let cancel = attempt_cancel.clone();
                async move {
                    let mut send = move || {
                        let producer = producer.clone();
                        let message = message.clone();
                        async move { producer.send(&message).await }.boxed()
                    };
                    retry.execute_async(&mut send, &cancel).await
                }
                .boxed()
            };
            breaker.execute_async(&mut guarded, cancel).await?;

            outbox.mark_dispatched(id, Utc::now()).await?;
            self.notify_delivery(&message);
            debug!(message_id = %id, topic = %message.topic(), "Outbox message produced");
        }
        match missing {
            Some(id) => Err(DispatchError::NotFound(id)),
            None => Ok(()),
        }
    }

    /// Re-drive undispatched entries older than `older_than` through the
    /// clear envelope. Returns how many entries were attempted.
    pub fn clear_outstanding(
        &self,
        older_than: Duration,
        batch_size: usize,
    ) -> Result<usize, DispatchError> {
        let outbox = self.outbox.as_ref().ok_or_else(|| {
            DispatchError::Configuration("no outbox configured for blocking operations".into())
        })?;
        let ids: Vec<Uuid> = outbox
            .outstanding_messages(older_than, batch_size)?
            .iter()
            .map(Message::id)
            .collect();
        if !ids.is_empty() {
            debug!(count = ids.len(), "Re-driving outstanding outbox messages");
            self.clear_outbox(&ids)?;
        }
        Ok(ids.len())
    }

    /// Send without outbox bookkeeping, under retry only. Used by
    /// request-reply.
    pub fn send_via_external_bus(&self, message: &Message) -> Result<(), DispatchError> {
        let producer = self.producer.as_ref().ok_or_else(|| {
            DispatchError::Configuration("no producer configured for blocking operations".into())
        })?;
        let retry = self.policies.get(RETRY_POLICY)?;
        retry.execute(&mut || producer.send(message))?;
        debug!(message_id = %message.id(), topic = %message.topic(), "Message sent via external bus");
        Ok(())
    }

    /// Asynchronous send without outbox bookkeeping, under retry only.
    pub async fn send_via_external_bus_async(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let producer = self.async_producer.as_ref().ok_or_else(|| {
            DispatchError::Configuration("no producer configured for async operations".into())
        })?;
        let retry = self.policies.get_async(RETRY_POLICY_ASYNC)?;
        let shared = Arc::new(message.clone());
        let producer = producer.clone();
        let mut send = move || {
            let producer = producer.clone();
            let message = shared.clone();
            async move { producer.send(&message).await }.boxed()
        };
        retry.execute_async(&mut send, cancel).await?;
        debug!(message_id = %message.id(), topic = %message.topic(), "Message sent via external bus");
        Ok(())
    }

    /// Run an operation under the retry policy alone. Used for reply
    /// channel purge and receive.
    pub fn retry(&self, op: Operation<'_>) -> Result<(), DispatchError> {
        self.policies.get(RETRY_POLICY)?.execute(op)
    }

    /// Run an asynchronous operation under the retry policy alone.
    pub async fn retry_async(
        &self,
        op: AsyncOperation<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        self.policies
            .get_async(RETRY_POLICY_ASYNC)?
            .execute_async(op, cancel)
            .await
    }

    /// Close producers, releasing broker resources.
    pub fn close(&self) {
        if let Some(producer) = &self.producer {
            producer.close();
        }
        if let Some(producer) = &self.async_producer {
            producer.close();
        }
    }

    fn transaction_connection(&self, use_transaction: bool) -> Option<Box<dyn Any + Send + Sync>> {
        if !use_transaction {
            return None;
        }
        self.transaction_provider.as_ref().map(|p| p.connection())
    }

    fn notify_delivery(&self, message: &Message) {
        for callback in self.lock_callbacks().iter() {
            callback(message);
        }
    }

    fn lock_callbacks(&self) -> std::sync::MutexGuard<'_, Vec<DeliveryCallback>> {
        self.on_delivery.lock().unwrap_or_else(|e| e.into_inner())
    }
}
