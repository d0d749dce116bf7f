//! Broker error taxonomy

use logdb_common::types::DeliveryTag;
use thiserror::Error;

/// Errors raised by the broker connection layer.
///
/// Transport and channel failures are not recovered in-process: the worker
/// loop propagates them to `main`, the process exits, and the supervisor
/// relaunches it with a fresh connection and fresh tag state.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to connect to broker: {0}")]
    Connect(#[source] lapin::Error),

    #[error("Broker connection lost: {0}")]
    Disconnected(String),

    #[error("Channel error during {operation}: {source}")]
    Channel {
        operation: &'static str,
        #[source]
        source: lapin::Error,
    },

    #[error("Failed to acknowledge delivery {tag}: {reason}")]
    Ack { tag: DeliveryTag, reason: String },

    #[error("Broker rejected message published to {target}")]
    Publish { target: String },

    #[error("Invalid broker configuration: {0}")]
    Config(String),
}

impl BrokerError {
    /// Whether the error means the broker session can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BrokerError::Config(_))
    }

    pub(crate) fn channel(operation: &'static str) -> impl FnOnce(lapin::Error) -> Self {
        move |source| BrokerError::Channel { operation, source }
    }
}
