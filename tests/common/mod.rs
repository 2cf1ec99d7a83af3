//! Shared fixtures: a small order-shipping domain with mappers.

// Each integration test binary compiles this module separately and uses
// a different slice of it.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier::{
    Call, Command, DispatchError, Event, Message, MessageBody, MessageHeader, MessageMapper,
    MessageType, ReplyAddress, Request, RequestContext, RequestHandler,
};

static TRACING: Once = Once::new();

/// Install a tracing subscriber once per test binary.
///
/// Honours `RUST_LOG`; defaults to warnings so test output stays quiet
/// unless a run opts in.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub const ORDERS_TOPIC: &str = "orders.ship";
pub const STATUS_TOPIC: &str = "orders.status";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipOrder {
    pub id: Uuid,
    pub order_number: u32,
}

impl ShipOrder {
    pub fn new(order_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_number,
        }
    }
}

impl Request for ShipOrder {
    fn id(&self) -> Uuid {
        self.id
    }
}

impl Command for ShipOrder {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderShipped {
    pub id: Uuid,
    pub order_number: u32,
}

impl OrderShipped {
    pub fn new(order_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_number,
        }
    }
}

impl Request for OrderShipped {
    fn id(&self) -> Uuid {
        self.id
    }
}

impl Event for OrderShipped {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusQuery {
    pub id: Uuid,
    pub order_number: u32,
    #[serde(skip)]
    pub reply_address: ReplyAddress,
}

impl StatusQuery {
    pub fn new(order_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_number,
            reply_address: ReplyAddress::default(),
        }
    }
}

impl Request for StatusQuery {
    fn id(&self) -> Uuid {
        self.id
    }
}

impl Command for StatusQuery {}

impl Call for StatusQuery {
    type Response = StatusReply;

    fn reply_address(&self) -> &ReplyAddress {
        &self.reply_address
    }

    fn reply_address_mut(&mut self) -> &mut ReplyAddress {
        &mut self.reply_address
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    pub id: Uuid,
    pub order_number: u32,
    pub status: String,
}

impl Request for StatusReply {
    fn id(&self) -> Uuid {
        self.id
    }
}

impl Command for StatusReply {}

fn json_error(err: serde_json::Error) -> DispatchError {
    DispatchError::Transport(err.to_string())
}

pub struct ShipOrderMapper;

impl MessageMapper<ShipOrder> for ShipOrderMapper {
    fn map_to_message(&self, request: &ShipOrder) -> Result<Message, DispatchError> {
        Ok(Message::new(
            MessageHeader::new(request.id, ORDERS_TOPIC, MessageType::Command),
            MessageBody::json(request).map_err(json_error)?,
        ))
    }

    fn map_to_request(&self, message: &Message) -> Result<ShipOrder, DispatchError> {
        message.body.parse_json().map_err(json_error)
    }
}

pub struct OrderShippedMapper;

impl MessageMapper<OrderShipped> for OrderShippedMapper {
    fn map_to_message(&self, request: &OrderShipped) -> Result<Message, DispatchError> {
        Ok(Message::new(
            MessageHeader::new(request.id, ORDERS_TOPIC, MessageType::Event),
            MessageBody::json(request).map_err(json_error)?,
        ))
    }

    fn map_to_request(&self, message: &Message) -> Result<OrderShipped, DispatchError> {
        message.body.parse_json().map_err(json_error)
    }
}

pub struct StatusQueryMapper;

impl MessageMapper<StatusQuery> for StatusQueryMapper {
    fn map_to_message(&self, request: &StatusQuery) -> Result<Message, DispatchError> {
        let address = request.reply_address();
        let mut header = MessageHeader::new(request.id, STATUS_TOPIC, MessageType::Command);
        if !address.topic.is_empty() {
            header = header
                .with_reply_to(address.topic.clone())
                .with_correlation_id(address.correlation_id.clone());
        }
        Ok(Message::new(
            header,
            MessageBody::json(request).map_err(json_error)?,
        ))
    }

    fn map_to_request(&self, message: &Message) -> Result<StatusQuery, DispatchError> {
        message.body.parse_json().map_err(json_error)
    }
}

pub struct StatusReplyMapper;

impl MessageMapper<StatusReply> for StatusReplyMapper {
    fn map_to_message(&self, request: &StatusReply) -> Result<Message, DispatchError> {
        Ok(Message::new(
            MessageHeader::new(request.id, STATUS_TOPIC, MessageType::Document),
            MessageBody::json(request).map_err(json_error)?,
        ))
    }

    fn map_to_request(&self, message: &Message) -> Result<StatusReply, DispatchError> {
        message.body.parse_json().map_err(json_error)
    }
}

/// Handler counting its invocations through a shared counter.
pub struct CountingHandler<R> {
    calls: Arc<AtomicUsize>,
    _request: std::marker::PhantomData<fn(R)>,
}

impl<R> CountingHandler<R> {
    pub fn new(calls: Arc<AtomicUsize>) -> Self {
        Self {
            calls,
            _request: std::marker::PhantomData,
        }
    }
}

impl<R: Request> RequestHandler<R> for CountingHandler<R> {
    fn handle(&mut self, request: R, _ctx: &mut RequestContext) -> Result<R, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(request)
    }
}

/// Handler that always fails with the given message.
pub struct FailingHandler<R> {
    error: &'static str,
    _request: std::marker::PhantomData<fn(R)>,
}

impl<R> FailingHandler<R> {
    pub fn new(error: &'static str) -> Self {
        Self {
            error,
            _request: std::marker::PhantomData,
        }
    }
}

impl<R: Request> RequestHandler<R> for FailingHandler<R> {
    fn handle(&mut self, _request: R, _ctx: &mut RequestContext) -> Result<R, DispatchError> {
        Err(DispatchError::handler_msg(self.error))
    }
}
