//! Transport traits and the delivery envelope.
//!
//! A transport is split the same way a broker client is: a [`Connector`] opens a
//! [`Connection`], a connection hands out a [`Session`], and a session creates
//! per-topic consumers. Implementations only move bytes; retry policy, teardown
//! ordering and subscription bookkeeping belong to the caller.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::address::BrokerAddress;
use crate::error::{Result, TransportError};

/// Body of a message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Raw byte payload
    Bytes(Bytes),
    /// Text payload, for transports that distinguish text frames
    Text(String),
}

impl Message {
    /// Short name of the envelope kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Bytes(_) => "bytes",
            Message::Text(_) => "text",
        }
    }
}

/// A single message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The topic the message was published on
    pub topic: String,
    /// The message body
    pub message: Message,
}

impl Delivery {
    /// Create a delivery carrying a byte payload.
    pub fn bytes(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            message: Message::Bytes(payload.into()),
        }
    }

    /// Create a delivery carrying a text payload.
    pub fn text(topic: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            message: Message::Text(text.into()),
        }
    }
}

/// Receiving end of a topic consumer. Messages arrive in publish order.
pub type Consumer = mpsc::UnboundedReceiver<Delivery>;

/// Fires at most once, when an established connection fails asynchronously.
///
/// The sender is dropped without a value when the connection is closed
/// by its owner.
pub type FailureSignal = oneshot::Receiver<TransportError>;

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection to `address`.
    ///
    /// # Errors
    ///
    /// Returns a `TransportError` if the broker is unreachable, refuses the
    /// connection, or does not answer in time. Implementations must not retry.
    async fn connect(&self, address: &BrokerAddress) -> Result<Box<dyn Connection>>;
}

/// An established broker connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Create a session for consuming topics on this connection.
    async fn create_session(&self) -> Result<Box<dyn Session>>;

    /// Take the asynchronous failure signal for this connection.
    ///
    /// Returns `None` once the signal has been taken.
    fn take_failure_signal(&mut self) -> Option<FailureSignal>;

    /// Close the connection. Closing an already closed connection is not an error.
    async fn close(&self) -> Result<()>;
}

/// A session on an established connection.
#[async_trait]
pub trait Session: Send + Sync {
    /// Start consuming `topic`.
    async fn consume(&self, topic: &str) -> Result<Consumer>;

    /// Stop consuming `topic`. The matching consumer ends.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Close the session; all of its consumers end.
    async fn close(&self) -> Result<()>;
}
