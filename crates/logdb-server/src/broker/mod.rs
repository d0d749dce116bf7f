//! Message broker layer
//!
//! Three roles over AMQP 0-9-1: publish to a fanout exchange, send directly
//! to a queue, and consume from a queue through a bounded local buffer with
//! manual acknowledgement. Errors from any of them are fatal for the process.

pub mod connection;
pub mod consumer;
pub mod error;
pub mod registry;

use async_trait::async_trait;
use logdb_common::types::DeliveryTag;

pub use connection::{AmqpConnector, AmqpRegistry, BrokerConnection, ConnectionMode, Publisher, QueueSender};
pub use consumer::{Consumer, ConsumerOptions};
pub use error::BrokerError;
pub use registry::{ConnectionRegistry, Connector};

/// One delivery taken off the local queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: DeliveryTag,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(tag: DeliveryTag, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }
}

/// Non-blocking pull side of a consumer.
pub trait MessageSource: Send {
    /// `Ok(None)` when nothing is buffered right now.
    fn try_next(&mut self) -> Result<Option<Message>, BrokerError>;
}

/// Acknowledges deliveries on the channel they arrived on.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// `multiple` acknowledges every outstanding tag up to and including
    /// `tag`. Failures must surface; a swallowed ack error would leave the
    /// pending batch out of step with the broker.
    async fn ack(&self, tag: DeliveryTag, multiple: bool) -> Result<(), BrokerError>;
}

/// Anything that can put a persistent message onto the broker.
#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish(&self, payload: &[u8]) -> Result<(), BrokerError>;
}

#[async_trait]
impl<A: Acknowledger + ?Sized> Acknowledger for std::sync::Arc<A> {
    async fn ack(&self, tag: DeliveryTag, multiple: bool) -> Result<(), BrokerError> {
        (**self).ack(tag, multiple).await
    }
}
