//! Handler and middleware traits.
//!
//! Terminal handlers carry the business logic for a request type.
//! Middleware wraps terminals in a chain: each step receives the request,
//! the dispatch context, and a `Next` continuation. A step short-circuits
//! by returning without running the continuation.
//!
//! Handlers take `&mut self` because the factory hands out one instance
//! per chain; they are not expected to be thread-safe.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::RequestContext;
use crate::error::DispatchError;
use crate::pipeline::{AsyncNext, Next};
use crate::request::Request;

/// Blocking terminal handler for requests of type `R`.
///
/// Returns the request so the chain can continue past the terminal into
/// any `After`-timed middleware.
pub trait RequestHandler<R: Request>: Send {
    fn handle(&mut self, request: R, ctx: &mut RequestContext) -> Result<R, DispatchError>;
}

/// Asynchronous terminal handler for requests of type `R`.
///
/// The cancellation token is checked by the chain before each step; the
/// handler may also observe it across its own suspension points.
#[async_trait]
pub trait AsyncRequestHandler<R: Request>: Send {
    async fn handle(
        &mut self,
        request: R,
        ctx: &mut RequestContext,
        cancel: &CancellationToken,
    ) -> Result<R, DispatchError>;
}

/// Blocking middleware step.
pub trait Middleware<R: Request>: Send {
    /// Process the request and, unless short-circuiting, run `next`.
    fn call(
        &mut self,
        request: R,
        ctx: &mut RequestContext,
        next: Next<'_, R>,
    ) -> Result<R, DispatchError>;
}

/// Asynchronous middleware step.
#[async_trait]
pub trait AsyncMiddleware<R: Request>: Send {
    /// Process the request and, unless short-circuiting, run `next`.
    async fn call(
        &mut self,
        request: R,
        ctx: &mut RequestContext,
        next: AsyncNext<'_, R>,
        cancel: &CancellationToken,
    ) -> Result<R, DispatchError>;
}
