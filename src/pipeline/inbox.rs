//! Inbox deduplication middleware.
//!
//! The inbox records request ids as chains observe them. When a
//! configured inbox sees an id a second time, the synthesized middleware
//! either short-circuits the chain (Skip) or fails the dispatch
//! (Reject). Handlers opt out per registration.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{AsyncNext, Next};
use crate::context::RequestContext;
use crate::error::DispatchError;
use crate::handler::{AsyncMiddleware, Middleware};
use crate::registry::Timing;
use crate::request::Request;

/// Store of request ids already dispatched.
///
/// Implementations must be safe to share across dispatches; lookups never
/// suspend, so one implementation serves blocking and async chains.
pub trait Inbox: Send + Sync {
    /// Record the id; returns true when it was already present.
    fn seen_and_record(&self, id: Uuid) -> Result<bool, DispatchError>;
}

/// Process-local inbox backed by a hash set.
#[derive(Default)]
pub struct InMemoryInbox {
    seen: Mutex<HashSet<Uuid>>,
}

impl InMemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inbox for InMemoryInbox {
    fn seen_and_record(&self, id: Uuid) -> Result<bool, DispatchError> {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        Ok(!seen.insert(id))
    }
}

/// What the synthesized middleware does with a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateAction {
    /// Short-circuit the chain; the dispatch succeeds without the handler.
    #[default]
    Skip,
    /// Fail the dispatch with a contract violation.
    Reject,
}

/// Inbox deduplication settings for pipeline assembly.
pub struct InboxConfig {
    /// The id store shared by all chains.
    pub inbox: Arc<dyn Inbox>,
    /// Ordering step for the synthesized middleware.
    pub step: i32,
    /// Position relative to the terminal handler.
    pub timing: Timing,
    /// Duplicate handling.
    pub action: DuplicateAction,
}

impl InboxConfig {
    /// Config with the middleware first in the chain and duplicates
    /// skipped.
    pub fn new(inbox: Arc<dyn Inbox>) -> Self {
        Self {
            inbox,
            step: i32::MIN,
            timing: Timing::Before,
            action: DuplicateAction::Skip,
        }
    }

    /// Set the ordering step.
    pub fn with_step(mut self, step: i32) -> Self {
        self.step = step;
        self
    }

    /// Set duplicate handling.
    pub fn with_action(mut self, action: DuplicateAction) -> Self {
        self.action = action;
        self
    }
}

/// The synthesized deduplication step.
pub(crate) struct InboxStep {
    inbox: Arc<dyn Inbox>,
    action: DuplicateAction,
}

impl InboxStep {
    pub(crate) fn new(inbox: Arc<dyn Inbox>, action: DuplicateAction) -> Self {
        Self { inbox, action }
    }

    fn check(&self, id: Uuid) -> Result<bool, DispatchError> {
        let duplicate = self.inbox.seen_and_record(id)?;
        if duplicate {
            debug!(request_id = %id, action = ?self.action, "Duplicate request detected");
            if self.action == DuplicateAction::Reject {
                return Err(DispatchError::Contract(format!(
                    "request {id} was already dispatched"
                )));
            }
        }
        Ok(duplicate)
    }
}

impl<R: Request> Middleware<R> for InboxStep {
    fn call(
        &mut self,
        request: R,
        ctx: &mut RequestContext,
        next: Next<'_, R>,
    ) -> Result<R, DispatchError> {
        if self.check(request.id())? {
            return Ok(request);
        }
        next.run(request, ctx)
    }
}

#[async_trait]
impl<R: Request> AsyncMiddleware<R> for InboxStep {
    async fn call(
        &mut self,
        request: R,
        ctx: &mut RequestContext,
        next: AsyncNext<'_, R>,
        cancel: &CancellationToken,
    ) -> Result<R, DispatchError> {
        if self.check(request.id())? {
            return Ok(request);
        }
        next.run(request, ctx, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sight_records() {
        let inbox = InMemoryInbox::new();
        let id = Uuid::new_v4();
        assert!(!inbox.seen_and_record(id).unwrap());
        assert!(inbox.seen_and_record(id).unwrap());
        assert!(inbox.seen_and_record(id).unwrap());
    }

    #[test]
    fn test_distinct_ids_do_not_collide() {
        let inbox = InMemoryInbox::new();
        assert!(!inbox.seen_and_record(Uuid::new_v4()).unwrap());
        assert!(!inbox.seen_and_record(Uuid::new_v4()).unwrap());
    }

    #[test]
    fn test_reject_action_raises_contract() {
        let step = InboxStep::new(Arc::new(InMemoryInbox::new()), DuplicateAction::Reject);
        let id = Uuid::new_v4();
        assert!(!step.check(id).unwrap());
        let err = step.check(id).unwrap_err();
        assert!(matches!(err, DispatchError::Contract(_)));
    }
}
