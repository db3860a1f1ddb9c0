//! # Vehicle provisioning
//!
//! Keeps an onboard vehicle connected to its message broker and routes topic
//! payloads to local sinks.
//!
//! A [`Vehicle`] loads its [`VehicleConfig`] from a [`ConfigSource`] on every
//! start, then hands it to the [`RecoveryController`], which opens a broker
//! connection, subscribes the active topics and reconnects with a fixed delay
//! whenever the connection fails. A [`ConfigWatcher`] restarts the vehicle when
//! the configuration file changes.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use mq_client::MqttConnector;
//! use vehicle::{ConfigWatcher, Lifecycle, PropertiesFile, Sinks, Vehicle};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = PropertiesFile::new("conf/provisioning.properties");
//!     let vehicle = Arc::new(Vehicle::new(
//!         Arc::new(source.clone()),
//!         Arc::new(MqttConnector::default()),
//!         Sinks::filesystem("workdir"),
//!     ));
//!
//!     let _watcher = ConfigWatcher::spawn(source.path(), vehicle.clone(), Duration::from_millis(500))?;
//!     vehicle.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     vehicle.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod recovery;
pub mod sink;
pub mod subscription;
pub mod watcher;

pub use config::{ConfigSource, PropertiesFile, TopicRole, Topics, VehicleConfig};
pub use connection::{BrokerConnection, ConnectionHandle, HandleId};
pub use error::{
    ConfigError, ConnectionError, DeliveryError, PersistenceError, Result, SubscriptionError,
    VehicleError, WatchError,
};
pub use lifecycle::{Lifecycle, LifecycleState, Vehicle};
pub use logging::{init_logging, init_logging_from_env, LoggingError, LoggingMode};
pub use recovery::{
    ConnectOutcome, ConnectionStats, InterruptGuard, RecoveryController, RecoveryState,
};
pub use sink::{ContentSink, ContentStore, FsContentStore, MessageSink, Sinks, VehicleMessage};
pub use subscription::{PayloadSink, SubscriptionDescriptor, TopicSubscriptionSet};
pub use watcher::ConfigWatcher;
