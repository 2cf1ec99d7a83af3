//! Message mapper registry: request type to wire codec.
//!
//! A mapper is a bidirectional codec between a request value and a wire
//! `Message`. Absence of a mapper is a configuration failure at the call
//! site, not at registration, so registries can be built incrementally.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DispatchError;
use crate::message::Message;
use crate::request::{short_type_name, Request};

/// Bidirectional codec between `R` and the wire message.
///
/// Mapping must be lossless: `map_to_request(map_to_message(r)) == r` for
/// every request a caller can construct. The message id must equal the
/// request id at mapping time.
pub trait MessageMapper<R: Request>: Send + Sync {
    fn map_to_message(&self, request: &R) -> Result<Message, DispatchError>;
    fn map_to_request(&self, message: &Message) -> Result<R, DispatchError>;
}

/// Request type to codec.
#[derive(Default)]
pub struct MapperRegistry {
    mappers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the codec for `R`, replacing any previous one.
    pub fn register<R, M>(&mut self, mapper: M) -> &mut Self
    where
        R: Request,
        M: MessageMapper<R> + 'static,
    {
        let mapper: Arc<dyn MessageMapper<R>> = Arc::new(mapper);
        self.mappers.insert(TypeId::of::<R>(), Box::new(mapper));
        self
    }

    /// Codec for `R`; configuration failure when missing.
    pub fn get<R: Request>(&self) -> Result<Arc<dyn MessageMapper<R>>, DispatchError> {
        self.mappers
            .get(&TypeId::of::<R>())
            .and_then(|entry| entry.downcast_ref::<Arc<dyn MessageMapper<R>>>())
            .cloned()
            .ok_or_else(|| {
                DispatchError::Configuration(format!(
                    "no message mapper registered for {}",
                    short_type_name::<R>()
                ))
            })
    }

    /// Whether a codec for `R` is registered.
    pub fn contains<R: Request>(&self) -> bool {
        self.mappers.contains_key(&TypeId::of::<R>())
    }
}
