//! Broker transport for the onboard provisioner.
//!
//! This crate provides the plumbing between the vehicle lifecycle and a message
//! broker. It is policy-free: it opens connections, hands out
//! sessions and per-topic consumers, and reports connection loss, but it never
//! retries, reconnects or decides what a message means.
//!
//! # Overview
//!
//! - [`Connector`], [`Connection`], [`Session`]: the transport seam. The vehicle
//!   crate only talks to these traits, which keeps it testable without a broker.
//! - [`Delivery`] / [`Message`]: the envelope handed to consumers.
//! - [`TopicRouter`]: fans incoming publishes out to one channel per topic so
//!   ordering holds within a topic and a slow topic never stalls another.
//! - [`BrokerAddress`]: parsed `scheme://host[:port]` broker URI.
//! - [`MqttConnector`]: the production transport, built on rumqttc.
//!
//! # Example
//!
//! ```no_run
//! use mq_client::{BrokerAddress, Connector, MqttConnector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), mq_client::TransportError> {
//!     let connector = MqttConnector::default();
//!     let address = BrokerAddress::parse("tcp://localhost:1883")?;
//!
//!     let mut connection = connector.connect(&address).await?;
//!     let failures = connection.take_failure_signal();
//!     let session = connection.create_session().await?;
//!
//!     let mut consumer = session.consume("content").await?;
//!     tokio::spawn(async move {
//!         while let Some(delivery) = consumer.recv().await {
//!             println!("{} -> {:?}", delivery.topic, delivery.message);
//!         }
//!     });
//!
//!     if let Some(failures) = failures {
//!         if let Ok(error) = failures.await {
//!             eprintln!("connection lost: {error}");
//!         }
//!     }
//!
//!     session.close().await?;
//!     connection.close().await
//! }
//! ```
//!
//! # Private Workspace Crate
//!
//! This crate is intended for internal use within the workspace and is not
//! published to crates.io.

mod address;
mod error;
pub mod mqtt;
pub mod router;
mod transport;

pub use address::BrokerAddress;
pub use error::{Result, TransportError};
pub use mqtt::{MqttConnector, MqttConnectorOptions};
pub use router::TopicRouter;
pub use transport::{Connection, Connector, Consumer, Delivery, FailureSignal, Message, Session};
