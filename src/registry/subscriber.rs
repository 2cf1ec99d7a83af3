//! Subscriber registry: request type to ordered handler registrations.
//!
//! Registration is the declarative table that drives pipeline assembly:
//! each subscriber carries its terminal handler factory plus an ordered
//! set of middleware declarations (step number, timing relative to the
//! terminal, optional feature-switch gate). Blocking and asynchronous
//! registrations live in separate tables; an operation fails with a
//! configuration error when only the other table is populated for its
//! request type.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use tracing::debug;

use crate::handler::{AsyncMiddleware, AsyncRequestHandler, Middleware, RequestHandler};
use crate::request::{short_type_name, Request};

/// Where a middleware step sits relative to the terminal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timing {
    /// Runs before the terminal handler.
    Before,
    /// Runs after the terminal handler has returned.
    After,
}

/// A declared middleware step for a blocking chain.
pub struct MiddlewareRegistration<R: Request> {
    pub(crate) factory: Box<dyn Fn() -> Box<dyn Middleware<R>> + Send + Sync>,
    pub(crate) step: i32,
    pub(crate) timing: Timing,
    pub(crate) feature_switch: Option<String>,
}

impl<R: Request> MiddlewareRegistration<R> {
    /// Declare a middleware step built by `factory`.
    ///
    /// Steps sort ascending within their timing; ties keep declaration
    /// order.
    pub fn new<M, F>(factory: F, step: i32, timing: Timing) -> Self
    where
        M: Middleware<R> + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(move || Box::new(factory())),
            step,
            timing,
            feature_switch: None,
        }
    }

    /// Gate this step behind a feature switch; an Off switch drops the
    /// step from built chains.
    pub fn gated_by(mut self, switch: impl Into<String>) -> Self {
        self.feature_switch = Some(switch.into());
        self
    }
}

/// A declared middleware step for an asynchronous chain.
pub struct AsyncMiddlewareRegistration<R: Request> {
    pub(crate) factory: Box<dyn Fn() -> Box<dyn AsyncMiddleware<R>> + Send + Sync>,
    pub(crate) step: i32,
    pub(crate) timing: Timing,
    pub(crate) feature_switch: Option<String>,
}

impl<R: Request> AsyncMiddlewareRegistration<R> {
    /// Declare an async middleware step built by `factory`.
    pub fn new<M, F>(factory: F, step: i32, timing: Timing) -> Self
    where
        M: AsyncMiddleware<R> + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(move || Box::new(factory())),
            step,
            timing,
            feature_switch: None,
        }
    }

    /// Gate this step behind a feature switch.
    pub fn gated_by(mut self, switch: impl Into<String>) -> Self {
        self.feature_switch = Some(switch.into());
        self
    }
}

/// A blocking handler registration.
pub struct SyncSubscriber<R: Request> {
    pub(crate) factory: Box<dyn Fn() -> Box<dyn RequestHandler<R>> + Send + Sync>,
    pub(crate) middleware: Vec<MiddlewareRegistration<R>>,
    pub(crate) inbox_opt_out: bool,
}

impl<R: Request> SyncSubscriber<R> {
    /// Register a terminal handler built by `factory`.
    ///
    /// The factory runs once per dispatch; the chain owns the instance
    /// and drops it when the dispatch ends.
    pub fn new<H, F>(factory: F) -> Self
    where
        H: RequestHandler<R> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(move || Box::new(factory())),
            middleware: Vec::new(),
            inbox_opt_out: false,
        }
    }

    /// Attach a middleware declaration.
    pub fn with_middleware(mut self, registration: MiddlewareRegistration<R>) -> Self {
        self.middleware.push(registration);
        self
    }

    /// Opt this handler out of inbox deduplication.
    pub fn without_inbox(mut self) -> Self {
        self.inbox_opt_out = true;
        self
    }
}

/// An asynchronous handler registration.
pub struct AsyncSubscriber<R: Request> {
    pub(crate) factory: Box<dyn Fn() -> Box<dyn AsyncRequestHandler<R>> + Send + Sync>,
    pub(crate) middleware: Vec<AsyncMiddlewareRegistration<R>>,
    pub(crate) inbox_opt_out: bool,
}

impl<R: Request> AsyncSubscriber<R> {
    /// Register an async terminal handler built by `factory`.
    pub fn new<H, F>(factory: F) -> Self
    where
        H: AsyncRequestHandler<R> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(move || Box::new(factory())),
            middleware: Vec::new(),
            inbox_opt_out: false,
        }
    }

    /// Attach a middleware declaration.
    pub fn with_middleware(mut self, registration: AsyncMiddlewareRegistration<R>) -> Self {
        self.middleware.push(registration);
        self
    }

    /// Opt this handler out of inbox deduplication.
    pub fn without_inbox(mut self) -> Self {
        self.inbox_opt_out = true;
        self
    }
}

/// Request type to ordered handler registrations.
///
/// Duplicate registrations for one type are legal; the dispatch operation
/// polices counts (send requires exactly one, publish accepts any).
#[derive(Default)]
pub struct SubscriberRegistry {
    sync_entries: HashMap<TypeId, Vec<Box<dyn Any + Send + Sync>>>,
    async_entries: HashMap<TypeId, Vec<Box<dyn Any + Send + Sync>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a blocking subscriber for `R`.
    pub fn subscribe<R: Request>(&mut self, subscriber: SyncSubscriber<R>) -> &mut Self {
        debug!(request = short_type_name::<R>(), "Registered handler");
        self.sync_entries
            .entry(TypeId::of::<R>())
            .or_default()
            .push(Box::new(subscriber));
        self
    }

    /// Register an asynchronous subscriber for `R`.
    pub fn subscribe_async<R: Request>(&mut self, subscriber: AsyncSubscriber<R>) -> &mut Self {
        debug!(request = short_type_name::<R>(), "Registered async handler");
        self.async_entries
            .entry(TypeId::of::<R>())
            .or_default()
            .push(Box::new(subscriber));
        self
    }

    /// Shorthand: register a plain handler with no middleware.
    pub fn register<R, H, F>(&mut self, factory: F) -> &mut Self
    where
        R: Request,
        H: RequestHandler<R> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.subscribe(SyncSubscriber::new(factory))
    }

    /// Shorthand: register a plain async handler with no middleware.
    pub fn register_async<R, H, F>(&mut self, factory: F) -> &mut Self
    where
        R: Request,
        H: AsyncRequestHandler<R> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.subscribe_async(AsyncSubscriber::new(factory))
    }

    /// Blocking registrations for `R`, in registration order.
    pub(crate) fn sync_subscribers<R: Request>(&self) -> Vec<&SyncSubscriber<R>> {
        self.sync_entries
            .get(&TypeId::of::<R>())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.downcast_ref::<SyncSubscriber<R>>())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Asynchronous registrations for `R`, in registration order.
    pub(crate) fn async_subscribers<R: Request>(&self) -> Vec<&AsyncSubscriber<R>> {
        self.async_entries
            .get(&TypeId::of::<R>())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.downcast_ref::<AsyncSubscriber<R>>())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of blocking registrations for `R`.
    pub fn sync_count<R: Request>(&self) -> usize {
        self.sync_entries
            .get(&TypeId::of::<R>())
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of asynchronous registrations for `R`.
    pub fn async_count<R: Request>(&self) -> usize {
        self.async_entries
            .get(&TypeId::of::<R>())
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::error::DispatchError;
    use uuid::Uuid;

    #[derive(Clone)]
    struct Order {
        id: Uuid,
    }

    impl Request for Order {
        fn id(&self) -> Uuid {
            self.id
        }
    }

    struct OrderHandler;

    impl RequestHandler<Order> for OrderHandler {
        fn handle(
            &mut self,
            request: Order,
            _ctx: &mut RequestContext,
        ) -> Result<Order, DispatchError> {
            Ok(request)
        }
    }

    #[test]
    fn test_counts_start_at_zero() {
        let registry = SubscriberRegistry::new();
        assert_eq!(registry.sync_count::<Order>(), 0);
        assert_eq!(registry.async_count::<Order>(), 0);
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = SubscriberRegistry::new();
        registry.register::<Order, _, _>(|| OrderHandler);

        assert_eq!(registry.sync_count::<Order>(), 1);
        assert_eq!(registry.sync_subscribers::<Order>().len(), 1);
        assert_eq!(registry.async_count::<Order>(), 0);
    }

    #[test]
    fn test_duplicate_registrations_preserve_order() {
        let mut registry = SubscriberRegistry::new();
        registry.register::<Order, _, _>(|| OrderHandler);
        registry.register::<Order, _, _>(|| OrderHandler);
        registry.register::<Order, _, _>(|| OrderHandler);

        assert_eq!(registry.sync_count::<Order>(), 3);
    }
}
