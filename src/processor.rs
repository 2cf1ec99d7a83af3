//! Command processor façade.
//!
//! One entry point for every dispatch shape:
//! - `send` / `send_async`: exactly-one-handler in-process dispatch
//! - `publish` / `publish_async`: fan-out with aggregated failures
//! - `deposit` / `clear` / `post`: store-and-forward through the outbox
//! - `call`: blocking request-reply over an ephemeral channel
//!
//! The processor composes the subscriber registry, mapper registry,
//! policy registry, external bus, channel factory, and inbox. Construction
//! goes through [`CommandProcessor::builder`].
//!
//! # Example
//!
//! ```ignore
//! let mut subscribers = SubscriberRegistry::new();
//! subscribers.register::<CreateOrder, _, _>(|| CreateOrderHandler::new());
//!
//! let processor = CommandProcessor::builder()
//!     .with_subscribers(subscribers)
//!     .build()?;
//!
//! processor.send(CreateOrder::new())?;
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::ExternalBus;
use crate::channel::{ChannelFactory, ReplySubscription};
use crate::context::{FeatureSwitches, RequestContext};
use crate::error::DispatchError;
use crate::message::{Message, MessageType};
use crate::pipeline::{InboxConfig, PipelineBuilder};
use crate::registry::{MapperRegistry, PolicyRegistry, SubscriberRegistry};
use crate::request::{short_type_name, Call, Command, Event, ReplyAddress, Request};

/// Builder for [`CommandProcessor`].
#[derive(Default)]
pub struct CommandProcessorBuilder {
    subscribers: SubscriberRegistry,
    mappers: MapperRegistry,
    policies: Option<PolicyRegistry>,
    external_bus: Option<Arc<ExternalBus>>,
    channel_factory: Option<Arc<dyn ChannelFactory>>,
    reply_subscriptions: HashMap<TypeId, ReplySubscription>,
    inbox: Option<InboxConfig>,
    feature_switches: Option<Arc<dyn FeatureSwitches>>,
}

impl CommandProcessorBuilder {
    /// Supply the subscriber registry.
    pub fn with_subscribers(mut self, subscribers: SubscriberRegistry) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Supply the mapper registry.
    pub fn with_mappers(mut self, mappers: MapperRegistry) -> Self {
        self.mappers = mappers;
        self
    }

    /// Supply the policy registry used for dispatch contexts.
    ///
    /// When absent, the external bus's registry is shared; with neither,
    /// defaults are installed.
    pub fn with_policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = Some(policies);
        self
    }

    /// Attach the external bus for post/deposit/clear/call.
    pub fn with_external_bus(mut self, bus: Arc<ExternalBus>) -> Self {
        self.external_bus = Some(bus);
        self
    }

    /// Attach the reply channel factory for call.
    pub fn with_channel_factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.channel_factory = Some(factory);
        self
    }

    /// Register the reply subscription for response type `R`.
    pub fn with_reply_subscription<R: Command>(mut self, subscription: ReplySubscription) -> Self {
        self.reply_subscriptions
            .insert(TypeId::of::<R>(), subscription);
        self
    }

    /// Enable inbox deduplication for all chains that do not opt out.
    pub fn with_inbox(mut self, inbox: InboxConfig) -> Self {
        self.inbox = Some(inbox);
        self
    }

    /// Attach a feature switch registry.
    pub fn with_feature_switches(mut self, switches: Arc<dyn FeatureSwitches>) -> Self {
        self.feature_switches = Some(switches);
        self
    }

    /// Validate cross-requirements and build the processor.
    pub fn build(self) -> Result<CommandProcessor, DispatchError> {
        if !self.reply_subscriptions.is_empty() && self.channel_factory.is_none() {
            return Err(DispatchError::Configuration(
                "reply subscriptions are registered but no channel factory is configured".into(),
            ));
        }
        let policies = match (self.policies, &self.external_bus) {
            (Some(mut policies), _) => {
                policies.ensure_defaults();
                Arc::new(policies)
            }
            (None, Some(bus)) => bus.policies(),
            (None, None) => Arc::new(PolicyRegistry::with_defaults()),
        };
        Ok(CommandProcessor {
            subscribers: self.subscribers,
            mappers: self.mappers,
            policies,
            external_bus: self.external_bus,
            channel_factory: self.channel_factory,
            reply_subscriptions: self.reply_subscriptions,
            inbox: self.inbox,
            feature_switches: self.feature_switches,
        })
    }
}

/// The dispatch façade.
pub struct CommandProcessor {
    subscribers: SubscriberRegistry,
    mappers: MapperRegistry,
    policies: Arc<PolicyRegistry>,
    external_bus: Option<Arc<ExternalBus>>,
    channel_factory: Option<Arc<dyn ChannelFactory>>,
    reply_subscriptions: HashMap<TypeId, ReplySubscription>,
    inbox: Option<InboxConfig>,
    feature_switches: Option<Arc<dyn FeatureSwitches>>,
}

impl std::fmt::Debug for CommandProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProcessor").finish_non_exhaustive()
    }
}

impl CommandProcessor {
    /// Start building a processor.
    pub fn builder() -> CommandProcessorBuilder {
        CommandProcessorBuilder::default()
    }

    /// Dispatch a command to its single registered handler.
    #[tracing::instrument(name = "processor.send", skip_all, fields(request = short_type_name::<C>()))]
    pub fn send<C: Command>(&self, command: C) -> Result<(), DispatchError> {
        self.dispatch_send(command).map(|_| ())
    }

    /// Asynchronously dispatch a command to its single registered
    /// handler, honouring cancellation at every suspension point.
    #[tracing::instrument(name = "processor.send_async", skip_all, fields(request = short_type_name::<C>()))]
    pub async fn send_async<C: Command>(
        &self,
        command: C,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let mut ctx = self.new_context();
        let builder = PipelineBuilder::new(&self.subscribers, self.inbox.as_ref());
        let mut chains = builder.build_async::<C>(&ctx)?;
        match chains.len() {
            1 => {}
            0 if self.subscribers.sync_count::<C>() > 0 => {
                return Err(DispatchError::Configuration(format!(
                    "no async handler factory for {}; a blocking handler is registered",
                    short_type_name::<C>()
                )));
            }
            0 => {
                return Err(DispatchError::Contract(format!(
                    "no handler registered for {}",
                    short_type_name::<C>()
                )));
            }
            count => {
                return Err(DispatchError::Contract(format!(
                    "{count} handlers registered for {}; send requires exactly one",
                    short_type_name::<C>()
                )));
            }
        }
        let mut chain = chains.remove(0);
        chain.execute(command, &mut ctx, cancel).await.map(|_| ())
    }

    /// Fan an event out to every registered handler chain, in
    /// registration order. Failures are collected; the publish fails
    /// with an aggregate only when at least one chain failed.
    #[tracing::instrument(name = "processor.publish", skip_all, fields(request = short_type_name::<E>()))]
    pub fn publish<E: Event>(&self, event: E) -> Result<(), DispatchError> {
        let mut ctx = self.new_context();
        let builder = PipelineBuilder::new(&self.subscribers, self.inbox.as_ref());
        let mut chains = builder.build_sync::<E>(&ctx)?;
        if chains.is_empty() && self.subscribers.async_count::<E>() > 0 {
            return Err(DispatchError::Configuration(format!(
                "no blocking handler factory for {}; async handlers are registered",
                short_type_name::<E>()
            )));
        }
        debug!(handler_count = chains.len(), "Publishing event");

        let mut failures = Vec::new();
        for chain in &mut chains {
            if let Err(failure) = chain.execute(event.clone(), &mut ctx) {
                warn!(error = %failure, "Handler chain failed during publish");
                failures.push(failure);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::Aggregate(failures))
        }
    }

    /// Asynchronous publish; chains run sequentially in registration
    /// order to preserve per-event ordering. Cancellation unwinds
    /// immediately instead of being aggregated.
    #[tracing::instrument(name = "processor.publish_async", skip_all, fields(request = short_type_name::<E>()))]
    pub async fn publish_async<E: Event>(
        &self,
        event: E,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let mut ctx = self.new_context();
        let builder = PipelineBuilder::new(&self.subscribers, self.inbox.as_ref());
        let mut chains = builder.build_async::<E>(&ctx)?;
        if chains.is_empty() && self.subscribers.sync_count::<E>() > 0 {
            return Err(DispatchError::Configuration(format!(
                "no async handler factory for {}; blocking handlers are registered",
                short_type_name::<E>()
            )));
        }
        debug!(handler_count = chains.len(), "Publishing event");

        let mut failures = Vec::new();
        for chain in &mut chains {
            match chain.execute(event.clone(), &mut ctx, cancel).await {
                Ok(_) => {}
                Err(DispatchError::Cancelled) => return Err(DispatchError::Cancelled),
                Err(failure) => {
                    warn!(error = %failure, "Handler chain failed during publish");
                    failures.push(failure);
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::Aggregate(failures))
        }
    }

    /// Map a request and write it durably to the outbox, on the caller's
    /// transaction when a provider is configured. Returns the message id
    /// for a later [`CommandProcessor::clear`].
    #[tracing::instrument(name = "processor.deposit", skip_all, fields(request = short_type_name::<R>()))]
    pub fn deposit<R: Request>(&self, request: &R) -> Result<Uuid, DispatchError> {
        let message = self.mappers.get::<R>()?.map_to_message(request)?;
        self.external_bus()?.add_to_outbox(&message, true)?;
        info!(message_id = %message.id(), topic = %message.topic(), "Request deposited");
        Ok(message.id())
    }

    /// Asynchronous deposit.
    #[tracing::instrument(name = "processor.deposit_async", skip_all, fields(request = short_type_name::<R>()))]
    pub async fn deposit_async<R: Request>(
        &self,
        request: &R,
        cancel: &CancellationToken,
    ) -> Result<Uuid, DispatchError> {
        let message = self.mappers.get::<R>()?.map_to_message(request)?;
        self.external_bus()?
            .add_to_outbox_async(&message, true, cancel)
            .await?;
        info!(message_id = %message.id(), topic = %message.topic(), "Request deposited");
        Ok(message.id())
    }

    /// Produce deposited messages to the broker under the policy
    /// envelope.
    #[tracing::instrument(name = "processor.clear", skip_all, fields(count = ids.len()))]
    pub fn clear(&self, ids: &[Uuid]) -> Result<(), DispatchError> {
        self.external_bus()?.clear_outbox(ids)
    }

    /// Asynchronous clear.
    #[tracing::instrument(name = "processor.clear_async", skip_all, fields(count = ids.len()))]
    pub async fn clear_async(
        &self,
        ids: &[Uuid],
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        self.external_bus()?.clear_outbox_async(ids, cancel).await
    }

    /// Deposit then immediately clear, without a caller transaction.
    #[tracing::instrument(name = "processor.post", skip_all, fields(request = short_type_name::<R>()))]
    pub fn post<R: Request>(&self, request: &R) -> Result<(), DispatchError> {
        let message = self.mappers.get::<R>()?.map_to_message(request)?;
        let bus = self.external_bus()?;
        bus.add_to_outbox(&message, false)?;
        bus.clear_outbox(&[message.id()])
    }

    /// Asynchronous post.
    #[tracing::instrument(name = "processor.post_async", skip_all, fields(request = short_type_name::<R>()))]
    pub async fn post_async<R: Request>(
        &self,
        request: &R,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let message = self.mappers.get::<R>()?.map_to_message(request)?;
        let bus = self.external_bus()?;
        bus.add_to_outbox_async(&message, false, cancel).await?;
        bus.clear_outbox_async(&[message.id()], cancel).await
    }

    /// Re-drive undispatched outbox entries older than `older_than`.
    /// Returns how many entries were attempted.
    pub fn clear_outstanding(
        &self,
        older_than: Duration,
        batch_size: usize,
    ) -> Result<usize, DispatchError> {
        self.external_bus()?.clear_outstanding(older_than, batch_size)
    }

    /// Round-trip exchange with a remote handler.
    ///
    /// Sends the mapped request over the external bus (no outbox) and
    /// block-receives on a fresh ephemeral reply channel. A reply is
    /// accepted only when its correlation id matches the channel id; the
    /// accepted reply is dispatched locally as a send and returned.
    /// A timeout yields `Ok(None)`. The reply channel is destroyed on
    /// every exit path.
    #[tracing::instrument(name = "processor.call", skip_all, fields(request = short_type_name::<C>()))]
    pub fn call<C: Call>(
        &self,
        mut request: C,
        timeout: Duration,
    ) -> Result<Option<C::Response>, DispatchError> {
        if timeout.is_zero() {
            return Err(DispatchError::Contract(
                "call timeout must be greater than zero".into(),
            ));
        }
        let mapper = self.mappers.get::<C>()?;
        let reply_mapper = self.mappers.get::<C::Response>()?;
        let bus = self.external_bus()?;
        let factory = self.channel_factory.as_ref().ok_or_else(|| {
            DispatchError::Configuration("no channel factory configured".into())
        })?;
        let template = self
            .reply_subscriptions
            .get(&TypeId::of::<C::Response>())
            .ok_or_else(|| {
                DispatchError::Configuration(format!(
                    "no reply subscription registered for {}",
                    short_type_name::<C::Response>()
                ))
            })?;
        if self.subscribers.sync_count::<C::Response>() == 0 {
            return Err(DispatchError::Configuration(format!(
                "no handler registered for reply {}",
                short_type_name::<C::Response>()
            )));
        }

        let channel_id = Uuid::new_v4().to_string();
        let mut subscription = template.clone();
        subscription.channel_name = channel_id.clone();
        subscription.routing_key = channel_id.clone();

        // The channel is owned by this scope; dropping it on any exit
        // path below tears down the broker-side queue.
        let mut channel = factory.create_channel(&subscription)?;
        bus.retry(&mut || channel.purge())?;

        *request.reply_address_mut() = ReplyAddress {
            topic: channel_id.clone(),
            correlation_id: channel_id.clone(),
        };
        let outbound = mapper.map_to_message(&request)?;
        bus.send_via_external_bus(&outbound)?;
        debug!(channel = %channel_id, message_id = %outbound.id(), "Awaiting reply");

        let deadline = Instant::now() + timeout;
        let reply = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(channel = %channel_id, "Reply wait exhausted its budget");
                return Ok(None);
            }
            let mut received: Option<Message> = None;
            bus.retry(&mut || {
                received = Some(channel.receive(remaining)?);
                Ok(())
            })?;
            let Some(candidate) = received else {
                return Ok(None);
            };
            if candidate.message_type() == MessageType::None {
                debug!(channel = %channel_id, "Reply wait timed out");
                return Ok(None);
            }
            match candidate.header.correlation_id.as_deref() {
                Some(correlation) if correlation == channel_id => break candidate,
                _ => {
                    debug!(
                        channel = %channel_id,
                        message_id = %candidate.id(),
                        "Dropping uncorrelated message"
                    );
                }
            }
        };

        let response = reply_mapper.map_to_request(&reply)?;
        let response = self.dispatch_send(response)?;
        Ok(Some(response))
    }

    fn dispatch_send<R: Request>(&self, request: R) -> Result<R, DispatchError> {
        let mut ctx = self.new_context();
        let builder = PipelineBuilder::new(&self.subscribers, self.inbox.as_ref());
        let mut chains = builder.build_sync::<R>(&ctx)?;
        match chains.len() {
            1 => {}
            0 if self.subscribers.async_count::<R>() > 0 => {
                return Err(DispatchError::Configuration(format!(
                    "no blocking handler factory for {}; an async handler is registered",
                    short_type_name::<R>()
                )));
            }
            0 => {
                return Err(DispatchError::Contract(format!(
                    "no handler registered for {}",
                    short_type_name::<R>()
                )));
            }
            count => {
                return Err(DispatchError::Contract(format!(
                    "{count} handlers registered for {}; send requires exactly one",
                    short_type_name::<R>()
                )));
            }
        }
        let mut chain = chains.remove(0);
        chain.execute(request, &mut ctx)
    }

    fn external_bus(&self) -> Result<&Arc<ExternalBus>, DispatchError> {
        self.external_bus.as_ref().ok_or_else(|| {
            DispatchError::Configuration("no external bus configured".into())
        })
    }

    fn new_context(&self) -> RequestContext {
        let mut ctx = RequestContext::new(self.policies.clone());
        if let Some(switches) = &self.feature_switches {
            ctx = ctx.with_feature_switches(switches.clone());
        }
        ctx
    }
}
