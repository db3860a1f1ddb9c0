//! Error types for the mq-client crate.

use std::time::Duration;

/// Errors reported by a broker transport.
///
/// Transports never retry on their own; every failure is surfaced to the caller,
/// which owns the retry policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The broker address could not be parsed
    #[error("Invalid broker address: {0}")]
    InvalidAddress(String),

    /// The connection could not be established (unreachable host, I/O failure)
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The broker rejected the connection (authentication, protocol mismatch)
    #[error("Connection refused by broker: {0}")]
    Refused(String),

    /// The broker did not acknowledge the connection in time
    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),

    /// An established connection was lost or closed by the broker
    #[error("Connection lost: {0}")]
    Disconnected(String),

    /// A topic consumer could not be created or released
    #[error("Subscription to topic '{topic}' failed: {reason}")]
    Subscribe {
        /// The topic name
        topic: String,
        /// Transport-specific failure description
        reason: String,
    },

    /// The connection or session has already been closed
    #[error("Connection is closed")]
    Closed,
}

/// Convenience type alias for Results using TransportError.
pub type Result<T> = std::result::Result<T, TransportError>;
