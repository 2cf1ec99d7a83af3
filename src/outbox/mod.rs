//! Outbox: durable staging store for at-least-once delivery.
//!
//! Messages are deposited keyed by message id, produced to the broker by
//! a clear pass, and acknowledged by marking the entry dispatched.
//! Entries are de-duplicated by id and a stored message is never mutated.
//! Blocking and asynchronous store variants are separate traits; an
//! implementation may provide one or both.

use std::any::Any;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::message::Message;

/// A deposited message with its delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    /// The stored message, immutable once written.
    pub message: Message,
    /// When the deposit happened.
    pub deposited_at: DateTime<Utc>,
    /// When the message was successfully produced, if it has been.
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Whether the entry has been produced and acknowledged.
    pub fn is_dispatched(&self) -> bool {
        self.dispatched_at.is_some()
    }
}

/// Blocking outbox store.
pub trait Outbox: Send + Sync {
    /// Persist a message keyed by its id. Re-adding an existing id is a
    /// no-op. When `conn` is supplied the write must use the caller's
    /// transaction.
    fn add(
        &self,
        message: &Message,
        timeout: Duration,
        conn: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<(), DispatchError>;

    /// Record a successful produce for the entry.
    fn mark_dispatched(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DispatchError>;

    /// Load an entry by message id.
    fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>, DispatchError>;

    /// Undispatched messages older than `older_than`, oldest first, at
    /// most `batch_size` of them.
    fn outstanding_messages(
        &self,
        older_than: Duration,
        batch_size: usize,
    ) -> Result<Vec<Message>, DispatchError>;
}

/// Asynchronous outbox store.
#[async_trait]
pub trait AsyncOutbox: Send + Sync {
    /// Persist a message keyed by its id; see [`Outbox::add`].
    async fn add(
        &self,
        message: &Message,
        timeout: Duration,
        conn: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<(), DispatchError>;

    /// Record a successful produce for the entry.
    async fn mark_dispatched(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DispatchError>;

    /// Load an entry by message id.
    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>, DispatchError>;

    /// Undispatched messages older than `older_than`, oldest first.
    async fn outstanding_messages(
        &self,
        older_than: Duration,
        batch_size: usize,
    ) -> Result<Vec<Message>, DispatchError>;
}

/// Opaque handle carrying a caller-owned transaction or connection.
///
/// The boxed value is passed straight through to the outbox, which
/// downcasts it to whatever its backing store understands.
pub trait TransactionProvider: Send + Sync {
    fn connection(&self) -> Box<dyn Any + Send + Sync>;
}

/// In-memory outbox for tests and single-process deployments.
///
/// Implements both store variants over one entry list; insertion order is
/// preserved for outstanding-message queries.
#[derive(Default)]
pub struct InMemoryOutbox {
    entries: Mutex<Vec<OutboxEntry>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the outbox holds no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of an entry, for assertions.
    pub fn entry(&self, id: Uuid) -> Option<OutboxEntry> {
        self.lock().iter().find(|e| e.message.id() == id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OutboxEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add_entry(&self, message: &Message) {
        let mut entries = self.lock();
        if entries.iter().any(|e| e.message.id() == message.id()) {
            debug!(message_id = %message.id(), "Outbox already holds message, skipping");
            return;
        }
        entries.push(OutboxEntry {
            message: message.clone(),
            deposited_at: Utc::now(),
            dispatched_at: None,
        });
    }

    fn mark_entry(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DispatchError> {
        let mut entries = self.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.message.id() == id)
            .ok_or(DispatchError::NotFound(id))?;
        // Monotone: the first dispatch instant wins.
        entry.dispatched_at.get_or_insert(at);
        Ok(())
    }

    fn get_entry(&self, id: Uuid) -> Option<OutboxEntry> {
        self.lock().iter().find(|e| e.message.id() == id).cloned()
    }

    fn outstanding(&self, older_than: Duration, batch_size: usize) -> Vec<Message> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        self.lock()
            .iter()
            .filter(|e| e.dispatched_at.is_none() && e.deposited_at <= cutoff)
            .take(batch_size)
            .map(|e| e.message.clone())
            .collect()
    }
}

impl Outbox for InMemoryOutbox {
    fn add(
        &self,
        message: &Message,
        _timeout: Duration,
        _conn: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<(), DispatchError> {
        self.add_entry(message);
        Ok(())
    }

    fn mark_dispatched(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DispatchError> {
        self.mark_entry(id, at)
    }

    fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>, DispatchError> {
        Ok(self.get_entry(id))
    }

    fn outstanding_messages(
        &self,
        older_than: Duration,
        batch_size: usize,
    ) -> Result<Vec<Message>, DispatchError> {
        Ok(self.outstanding(older_than, batch_size))
    }
}

#[async_trait]
impl AsyncOutbox for InMemoryOutbox {
    async fn add(
        &self,
        message: &Message,
        _timeout: Duration,
        _conn: Option<&(dyn Any + Send + Sync)>,
    ) -> Result<(), DispatchError> {
        self.add_entry(message);
        Ok(())
    }

    async fn mark_dispatched(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DispatchError> {
        self.mark_entry(id, at)
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>, DispatchError> {
        Ok(self.get_entry(id))
    }

    async fn outstanding_messages(
        &self,
        older_than: Duration,
        batch_size: usize,
    ) -> Result<Vec<Message>, DispatchError> {
        Ok(self.outstanding(older_than, batch_size))
    }
}
