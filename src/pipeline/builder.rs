//! Pipeline assembly from the subscriber registry.
//!
//! For each subscriber registered for the request type, the builder
//! instantiates the terminal and its declared middleware through the
//! registered factories and composes one chain:
//! `Before` steps ascending by step number, the terminal, then `After`
//! steps ascending by step number. Ties keep declaration order. A
//! middleware gated behind an Off feature switch is left out of the
//! chain. The configured inbox middleware is synthesized into every chain
//! whose subscriber has not opted out.

use tracing::debug;

use super::inbox::{InboxConfig, InboxStep};
use super::{AsyncHandlerChain, AsyncTerminalStep, HandlerChain, TerminalStep};
use crate::context::{FeatureStatus, RequestContext};
use crate::error::DispatchError;
use crate::handler::{AsyncMiddleware, Middleware};
use crate::registry::{SubscriberRegistry, Timing};
use crate::request::{short_type_name, Request};

/// Upper bound on steps per chain.
///
/// Middleware factories can in principle feed registrations back into
/// themselves; a chain deeper than this is treated as a declaration
/// cycle.
const MAX_CHAIN_DEPTH: usize = 64;

/// Builds handler chains for one dispatch.
pub struct PipelineBuilder<'a> {
    registry: &'a SubscriberRegistry,
    inbox: Option<&'a InboxConfig>,
}

impl<'a> PipelineBuilder<'a> {
    /// Builder over the given registry and optional inbox configuration.
    pub fn new(registry: &'a SubscriberRegistry, inbox: Option<&'a InboxConfig>) -> Self {
        Self { registry, inbox }
    }

    /// Build one blocking chain per registered subscriber, in
    /// registration order.
    pub fn build_sync<R: Request>(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<HandlerChain<R>>, DispatchError> {
        let subscribers = self.registry.sync_subscribers::<R>();
        let mut chains = Vec::with_capacity(subscribers.len());
        for subscriber in subscribers {
            let mut before: Vec<(i32, Box<dyn Middleware<R>>)> = Vec::new();
            let mut after: Vec<(i32, Box<dyn Middleware<R>>)> = Vec::new();

            for registration in &subscriber.middleware {
                if self.switched_off(ctx, registration.feature_switch.as_deref()) {
                    continue;
                }
                let step = (registration.factory)();
                match registration.timing {
                    Timing::Before => before.push((registration.step, step)),
                    Timing::After => after.push((registration.step, step)),
                }
            }

            if let Some(config) = self.inbox {
                if !subscriber.inbox_opt_out {
                    let step: Box<dyn Middleware<R>> =
                        Box::new(InboxStep::new(config.inbox.clone(), config.action));
                    match config.timing {
                        Timing::Before => before.push((config.step, step)),
                        Timing::After => after.push((config.step, step)),
                    }
                }
            }

            before.sort_by_key(|(step, _)| *step);
            after.sort_by_key(|(step, _)| *step);

            let mut steps: Vec<Box<dyn Middleware<R>>> =
                before.into_iter().map(|(_, step)| step).collect();
            steps.push(Box::new(TerminalStep::new((subscriber.factory)())));
            steps.extend(after.into_iter().map(|(_, step)| step));

            Self::check_depth::<R>(steps.len())?;
            chains.push(HandlerChain::new(steps));
        }
        Ok(chains)
    }

    /// Build one asynchronous chain per registered subscriber, in
    /// registration order.
    pub fn build_async<R: Request>(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<AsyncHandlerChain<R>>, DispatchError> {
        let subscribers = self.registry.async_subscribers::<R>();
        let mut chains = Vec::with_capacity(subscribers.len());
        for subscriber in subscribers {
            let mut before: Vec<(i32, Box<dyn AsyncMiddleware<R>>)> = Vec::new();
            let mut after: Vec<(i32, Box<dyn AsyncMiddleware<R>>)> = Vec::new();

            for registration in &subscriber.middleware {
                if self.switched_off(ctx, registration.feature_switch.as_deref()) {
                    continue;
                }
                let step = (registration.factory)();
                match registration.timing {
                    Timing::Before => before.push((registration.step, step)),
                    Timing::After => after.push((registration.step, step)),
                }
            }

            if let Some(config) = self.inbox {
                if !subscriber.inbox_opt_out {
                    let step: Box<dyn AsyncMiddleware<R>> =
                        Box::new(InboxStep::new(config.inbox.clone(), config.action));
                    match config.timing {
                        Timing::Before => before.push((config.step, step)),
                        Timing::After => after.push((config.step, step)),
                    }
                }
            }

            before.sort_by_key(|(step, _)| *step);
            after.sort_by_key(|(step, _)| *step);

            let mut steps: Vec<Box<dyn AsyncMiddleware<R>>> =
                before.into_iter().map(|(_, step)| step).collect();
            steps.push(Box::new(AsyncTerminalStep::new((subscriber.factory)())));
            steps.extend(after.into_iter().map(|(_, step)| step));

            Self::check_depth::<R>(steps.len())?;
            chains.push(AsyncHandlerChain::new(steps));
        }
        Ok(chains)
    }

    fn switched_off(&self, ctx: &RequestContext, switch: Option<&str>) -> bool {
        match switch {
            Some(key) if ctx.feature_status(key) == FeatureStatus::Off => {
                debug!(switch = key, "Middleware disabled by feature switch");
                true
            }
            _ => false,
        }
    }

    fn check_depth<R: Request>(depth: usize) -> Result<(), DispatchError> {
        if depth > MAX_CHAIN_DEPTH {
            return Err(DispatchError::Configuration(format!(
                "handler chain for {} exceeds {} steps; middleware declarations form a cycle",
                short_type_name::<R>(),
                MAX_CHAIN_DEPTH
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::context::StaticFeatureSwitches;
    use crate::handler::RequestHandler;
    use crate::pipeline::Next;
    use crate::registry::{MiddlewareRegistration, PolicyRegistry, SyncSubscriber};

    #[derive(Clone)]
    struct Audit {
        id: Uuid,
        hops: Vec<&'static str>,
    }

    impl Request for Audit {
        fn id(&self) -> Uuid {
            self.id
        }
    }

    fn audit() -> Audit {
        Audit {
            id: Uuid::new_v4(),
            hops: Vec::new(),
        }
    }

    struct Hop(&'static str);

    impl Middleware<Audit> for Hop {
        fn call(
            &mut self,
            mut request: Audit,
            ctx: &mut RequestContext,
            next: Next<'_, Audit>,
        ) -> Result<Audit, DispatchError> {
            request.hops.push(self.0);
            next.run(request, ctx)
        }
    }

    struct Record;

    impl RequestHandler<Audit> for Record {
        fn handle(
            &mut self,
            mut request: Audit,
            _ctx: &mut RequestContext,
        ) -> Result<Audit, DispatchError> {
            request.hops.push("terminal");
            Ok(request)
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Arc::new(PolicyRegistry::with_defaults()))
    }

    #[test]
    fn test_before_and_after_ordering_by_step() {
        let mut registry = SubscriberRegistry::new();
        registry.subscribe(
            SyncSubscriber::new(|| Record)
                .with_middleware(MiddlewareRegistration::new(|| Hop("b2"), 2, Timing::Before))
                .with_middleware(MiddlewareRegistration::new(|| Hop("a1"), 1, Timing::After))
                .with_middleware(MiddlewareRegistration::new(|| Hop("b1"), 1, Timing::Before)),
        );

        let builder = PipelineBuilder::new(&registry, None);
        let mut chains = builder.build_sync::<Audit>(&ctx()).unwrap();
        assert_eq!(chains.len(), 1);

        let result = chains[0].execute(audit(), &mut ctx()).unwrap();
        assert_eq!(result.hops, vec!["b1", "b2", "terminal", "a1"]);
    }

    #[test]
    fn test_feature_switch_off_drops_middleware() {
        let mut registry = SubscriberRegistry::new();
        registry.subscribe(
            SyncSubscriber::new(|| Record).with_middleware(
                MiddlewareRegistration::new(|| Hop("gated"), 1, Timing::Before)
                    .gated_by("auditing"),
            ),
        );

        let switches = Arc::new(StaticFeatureSwitches::new().set("auditing", false));
        let context = ctx().with_feature_switches(switches);

        let builder = PipelineBuilder::new(&registry, None);
        let mut chains = builder.build_sync::<Audit>(&context).unwrap();
        let result = chains[0].execute(audit(), &mut ctx()).unwrap();
        assert_eq!(result.hops, vec!["terminal"]);
    }

    #[test]
    fn test_unset_feature_switch_keeps_middleware() {
        let mut registry = SubscriberRegistry::new();
        registry.subscribe(
            SyncSubscriber::new(|| Record).with_middleware(
                MiddlewareRegistration::new(|| Hop("gated"), 1, Timing::Before)
                    .gated_by("auditing"),
            ),
        );

        let builder = PipelineBuilder::new(&registry, None);
        let mut chains = builder.build_sync::<Audit>(&ctx()).unwrap();
        let result = chains[0].execute(audit(), &mut ctx()).unwrap();
        assert_eq!(result.hops, vec!["gated", "terminal"]);
    }

    #[test]
    fn test_inbox_synthesized_unless_opted_out() {
        use crate::pipeline::{InMemoryInbox, InboxConfig};

        let inbox = Arc::new(InMemoryInbox::new());
        let config = InboxConfig::new(inbox);

        let mut registry = SubscriberRegistry::new();
        registry.subscribe(SyncSubscriber::new(|| Record));
        registry.subscribe(SyncSubscriber::new(|| Record).without_inbox());

        let builder = PipelineBuilder::new(&registry, Some(&config));
        let mut chains = builder.build_sync::<Audit>(&ctx()).unwrap();
        assert_eq!(chains.len(), 2);

        let request = audit();
        // First chain records the id; replaying through it short-circuits.
        let first = chains[0].execute(request.clone(), &mut ctx()).unwrap();
        assert_eq!(first.hops, vec!["terminal"]);
        let replay = chains[0].execute(request.clone(), &mut ctx()).unwrap();
        assert!(replay.hops.is_empty());

        // Opted-out chain still runs for the duplicate id.
        let second = chains[1].execute(request, &mut ctx()).unwrap();
        assert_eq!(second.hops, vec!["terminal"]);
    }
}
