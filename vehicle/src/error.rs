//! Error types for the vehicle crate.
//!
//! Only [`ConfigError`] (and lifecycle misuse) ever reaches a caller of
//! `Vehicle::start`. Connection and subscription errors are retried by the
//! recovery controller; delivery and persistence errors are logged per message.

use std::path::PathBuf;

use mq_client::TransportError;

use crate::connection::HandleId;

/// Configuration could not be loaded. Fatal to `start()`, never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A required key is absent or empty
    #[error("{key} is missing from the configuration")]
    MissingKey { key: &'static str },

    /// A key is present but its value is unusable
    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// A broker connection could not be opened or was lost. Transient.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Connecting to the broker failed
    #[error("Failed to connect to {address}: {source}")]
    Open {
        address: String,
        #[source]
        source: TransportError,
    },

    /// The connection opened but no session could be created on it
    #[error("Failed to create session: {0}")]
    Session(#[source] TransportError),

    /// An established connection failed asynchronously
    #[error("Connection {handle} disrupted: {source}")]
    Disrupted {
        handle: HandleId,
        #[source]
        source: TransportError,
    },
}

/// Registering a topic consumer failed. Treated like a connection error.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The topic is already subscribed on this handle
    #[error("Topic '{topic}' is already subscribed on {handle}")]
    AlreadySubscribed { topic: String, handle: HandleId },

    /// The subscription set belongs to another connection handle
    #[error("Subscription set is bound to {bound}, not {requested}")]
    ForeignHandle { bound: HandleId, requested: HandleId },

    /// The handle has been closed or declared dead
    #[error("Connection {0} is closed")]
    HandleClosed(HandleId),

    /// The transport refused to create the consumer
    #[error("Failed to create consumer for topic '{topic}': {source}")]
    Consumer {
        topic: String,
        #[source]
        source: TransportError,
    },
}

/// Writing a payload to durable storage failed. Logged, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The storage key is not a single safe path component
    #[error("Invalid storage key '{0}'")]
    InvalidKey(String),

    /// Filesystem operation failed
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single delivered message could not be handled. Logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The message did not arrive in the expected transport envelope
    #[error("Skipping message for topic {topic}: expected a bytes message, got {kind}")]
    UnexpectedEnvelope { topic: String, kind: &'static str },

    /// The sink could not persist the payload
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Errors surfaced by the vehicle lifecycle API.
#[derive(Debug, thiserror::Error)]
pub enum VehicleError {
    /// Configuration could not be loaded
    #[error("Vehicle configuration can't be loaded: {0}")]
    Config(#[from] ConfigError),

    /// start() was called while the vehicle was not stopped
    #[error("Vehicle is already running")]
    AlreadyRunning,
}

/// The configuration watcher could not be set up.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The path has no usable parent directory or file name
    #[error("Cannot watch {0}: not a file path")]
    InvalidPath(PathBuf),

    /// The underlying file watcher failed
    #[error("File watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// Convenience type alias for Results using VehicleError.
pub type Result<T> = std::result::Result<T, VehicleError>;
