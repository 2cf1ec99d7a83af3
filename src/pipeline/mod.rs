//! Handler chains and the pipeline builder.
//!
//! A chain is an ordered sequence of middleware steps with the terminal
//! handler adapted into the sequence, driven by a `Next` continuation.
//! Chains are built fresh per dispatch from the subscriber registry and
//! dropped on every exit path, which releases each handler exactly once.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::RequestContext;
use crate::error::DispatchError;
use crate::handler::{AsyncMiddleware, AsyncRequestHandler, Middleware, RequestHandler};
use crate::request::Request;

mod builder;
mod inbox;

pub use builder::PipelineBuilder;
pub use inbox::{DuplicateAction, InMemoryInbox, Inbox, InboxConfig};

/// Continuation over the remaining steps of a blocking chain.
pub struct Next<'a, R: Request> {
    steps: &'a mut [Box<dyn Middleware<R>>],
}

impl<R: Request> Next<'_, R> {
    /// Run the remaining steps. An empty remainder returns the request.
    pub fn run(self, request: R, ctx: &mut RequestContext) -> Result<R, DispatchError> {
        match self.steps.split_first_mut() {
            Some((head, rest)) => head.call(request, ctx, Next { steps: rest }),
            None => Ok(request),
        }
    }
}

/// A built blocking chain for one subscriber.
pub struct HandlerChain<R: Request> {
    steps: Vec<Box<dyn Middleware<R>>>,
}

impl<R: Request> HandlerChain<R> {
    pub(crate) fn new(steps: Vec<Box<dyn Middleware<R>>>) -> Self {
        Self { steps }
    }

    /// Execute the chain from its entry step.
    pub fn execute(&mut self, request: R, ctx: &mut RequestContext) -> Result<R, DispatchError> {
        Next {
            steps: &mut self.steps,
        }
        .run(request, ctx)
    }
}

/// Continuation over the remaining steps of an asynchronous chain.
pub struct AsyncNext<'a, R: Request> {
    steps: &'a mut [Box<dyn AsyncMiddleware<R>>],
}

impl<R: Request> AsyncNext<'_, R> {
    /// Run the remaining steps, checking for cancellation first.
    pub async fn run(
        self,
        request: R,
        ctx: &mut RequestContext,
        cancel: &CancellationToken,
    ) -> Result<R, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        match self.steps.split_first_mut() {
            Some((head, rest)) => head.call(request, ctx, AsyncNext { steps: rest }, cancel).await,
            None => Ok(request),
        }
    }
}

/// A built asynchronous chain for one subscriber.
pub struct AsyncHandlerChain<R: Request> {
    steps: Vec<Box<dyn AsyncMiddleware<R>>>,
}

impl<R: Request> AsyncHandlerChain<R> {
    pub(crate) fn new(steps: Vec<Box<dyn AsyncMiddleware<R>>>) -> Self {
        Self { steps }
    }

    /// Execute the chain from its entry step.
    pub async fn execute(
        &mut self,
        request: R,
        ctx: &mut RequestContext,
        cancel: &CancellationToken,
    ) -> Result<R, DispatchError> {
        AsyncNext {
            steps: &mut self.steps,
        }
        .run(request, ctx, cancel)
        .await
    }
}

/// Adapts a terminal handler into a chain step: run the handler, then
/// continue into any `After`-timed middleware.
pub(crate) struct TerminalStep<R: Request> {
    handler: Box<dyn RequestHandler<R>>,
}

impl<R: Request> TerminalStep<R> {
    pub(crate) fn new(handler: Box<dyn RequestHandler<R>>) -> Self {
        Self { handler }
    }
}

impl<R: Request> Middleware<R> for TerminalStep<R> {
    fn call(
        &mut self,
        request: R,
        ctx: &mut RequestContext,
        next: Next<'_, R>,
    ) -> Result<R, DispatchError> {
        let request = self.handler.handle(request, ctx)?;
        next.run(request, ctx)
    }
}

pub(crate) struct AsyncTerminalStep<R: Request> {
    handler: Box<dyn AsyncRequestHandler<R>>,
}

impl<R: Request> AsyncTerminalStep<R> {
    pub(crate) fn new(handler: Box<dyn AsyncRequestHandler<R>>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<R: Request> AsyncMiddleware<R> for AsyncTerminalStep<R> {
    async fn call(
        &mut self,
        request: R,
        ctx: &mut RequestContext,
        next: AsyncNext<'_, R>,
        cancel: &CancellationToken,
    ) -> Result<R, DispatchError> {
        let request = self.handler.handle(request, ctx, cancel).await?;
        next.run(request, ctx, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::registry::PolicyRegistry;

    #[derive(Clone)]
    struct Tick {
        id: Uuid,
        hops: Vec<&'static str>,
    }

    impl Request for Tick {
        fn id(&self) -> Uuid {
            self.id
        }
    }

    fn tick() -> Tick {
        Tick {
            id: Uuid::new_v4(),
            hops: Vec::new(),
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Arc::new(PolicyRegistry::with_defaults()))
    }

    struct Tracer(&'static str);

    impl Middleware<Tick> for Tracer {
        fn call(
            &mut self,
            mut request: Tick,
            ctx: &mut RequestContext,
            next: Next<'_, Tick>,
        ) -> Result<Tick, DispatchError> {
            request.hops.push(self.0);
            next.run(request, ctx)
        }
    }

    struct ShortCircuit;

    impl Middleware<Tick> for ShortCircuit {
        fn call(
            &mut self,
            request: Tick,
            _ctx: &mut RequestContext,
            _next: Next<'_, Tick>,
        ) -> Result<Tick, DispatchError> {
            Ok(request)
        }
    }

    struct Terminal(Arc<AtomicUsize>);

    impl RequestHandler<Tick> for Terminal {
        fn handle(
            &mut self,
            mut request: Tick,
            _ctx: &mut RequestContext,
        ) -> Result<Tick, DispatchError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            request.hops.push("terminal");
            Ok(request)
        }
    }

    #[test]
    fn test_steps_run_in_declared_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = HandlerChain::new(vec![
            Box::new(Tracer("first")),
            Box::new(Tracer("second")),
            Box::new(TerminalStep::new(Box::new(Terminal(calls.clone())))),
            Box::new(Tracer("after")),
        ]);

        let result = chain.execute(tick(), &mut ctx()).unwrap();
        assert_eq!(result.hops, vec!["first", "second", "terminal", "after"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_short_circuit_skips_terminal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = HandlerChain::new(vec![
            Box::new(ShortCircuit),
            Box::new(TerminalStep::new(Box::new(Terminal(calls.clone())))),
        ]);

        let result = chain.execute(tick(), &mut ctx()).unwrap();
        assert!(result.hops.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    struct AsyncTerminal(Arc<AtomicUsize>);

    #[async_trait]
    impl AsyncRequestHandler<Tick> for AsyncTerminal {
        async fn handle(
            &mut self,
            request: Tick,
            _ctx: &mut RequestContext,
            _cancel: &CancellationToken,
        ) -> Result<Tick, DispatchError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(request)
        }
    }

    #[tokio::test]
    async fn test_async_chain_invokes_terminal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = AsyncHandlerChain::new(vec![Box::new(AsyncTerminalStep::new(Box::new(
            AsyncTerminal(calls.clone()),
        )))]);

        let cancel = CancellationToken::new();
        chain.execute(tick(), &mut ctx(), &cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_chain_cancelled_before_entry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = AsyncHandlerChain::new(vec![Box::new(AsyncTerminalStep::new(Box::new(
            AsyncTerminal(calls.clone()),
        )))]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = chain.execute(tick(), &mut ctx(), &cancel).await;
        assert!(matches!(result, Err(DispatchError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
