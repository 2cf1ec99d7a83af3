//! Courier - command dispatcher and message-bus mediator
//!
//! An in-process command processor that unifies three messaging patterns
//! behind one façade: typed in-memory dispatch (send/publish), reliable
//! store-and-forward publication through an outbox (deposit/clear/post),
//! and blocking request-reply over an ephemeral channel (call).

pub mod bus;
pub mod channel;
pub mod context;
pub mod error;
pub mod handler;
pub mod message;
pub mod outbox;
pub mod pipeline;
pub mod processor;
pub mod producer;
pub mod registry;
pub mod request;
pub mod resilience;

// Re-export the types most integrations touch.
pub use bus::{ExternalBus, ExternalBusBuilder};
pub use channel::{Channel, ChannelFactory, InMemoryChannelFactory, InMemoryTransport, ReplySubscription};
pub use context::{FeatureStatus, FeatureSwitches, RequestContext, StaticFeatureSwitches};
pub use error::{DispatchError, Result};
pub use handler::{AsyncMiddleware, AsyncRequestHandler, Middleware, RequestHandler};
pub use message::{Message, MessageBody, MessageHeader, MessageType};
pub use outbox::{AsyncOutbox, InMemoryOutbox, Outbox, OutboxEntry, TransactionProvider};
pub use pipeline::{DuplicateAction, InMemoryInbox, Inbox, InboxConfig};
pub use processor::{CommandProcessor, CommandProcessorBuilder};
pub use producer::{AsyncMessageProducer, InMemoryProducer, MessageProducer};
pub use registry::{
    AsyncMiddlewareRegistration, AsyncSubscriber, MapperRegistry, MessageMapper,
    MiddlewareRegistration, PolicyRegistry, SubscriberRegistry, SyncSubscriber, Timing,
};
pub use request::{Call, Command, Event, ReplyAddress, Request};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, RetryConfig, RetryPolicy};
