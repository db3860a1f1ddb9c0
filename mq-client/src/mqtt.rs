//! MQTT transport built on rumqttc.
//!
//! One MQTT client backs both the connection and its session. A background
//! driver task polls the rumqttc event loop, routes publishes through a
//! [`TopicRouter`] and reports the first connection-level error through the
//! connection's failure signal. The driver never reconnects on its own.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::address::BrokerAddress;
use crate::error::{Result, TransportError};
use crate::router::TopicRouter;
use crate::transport::{Connection, Connector, Consumer, Delivery, FailureSignal, Session};

/// Port used when the broker address does not carry one.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Tuning for [`MqttConnector`].
#[derive(Debug, Clone)]
pub struct MqttConnectorOptions {
    /// Prefix for generated client ids; a random suffix keeps them unique
    /// Default: "onboard-provisioner"
    pub client_id_prefix: String,

    /// MQTT keep-alive interval
    /// Default: 30 seconds
    pub keep_alive: Duration,

    /// How long to wait for the broker's CONNACK
    /// Default: 10 seconds
    pub connect_timeout: Duration,

    /// How long close() waits for the DISCONNECT to be flushed
    /// Default: 2 seconds
    pub close_timeout: Duration,

    /// Capacity of the rumqttc request channel
    /// Default: 64
    pub channel_capacity: usize,

    /// Quality of service for topic subscriptions
    /// Default: AtLeastOnce
    pub qos: QoS,
}

impl Default for MqttConnectorOptions {
    fn default() -> Self {
        Self {
            client_id_prefix: "onboard-provisioner".to_string(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(2),
            channel_capacity: 64,
            qos: QoS::AtLeastOnce,
        }
    }
}

impl MqttConnectorOptions {
    pub fn with_client_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.client_id_prefix = prefix.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

/// Opens MQTT connections. Every scheme is treated as plain TCP.
#[derive(Debug, Clone, Default)]
pub struct MqttConnector {
    options: MqttConnectorOptions,
}

impl MqttConnector {
    pub fn new(options: MqttConnectorOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MqttConnectorOptions {
        &self.options
    }

    fn mqtt_options(&self, address: &BrokerAddress) -> MqttOptions {
        let client_id = format!(
            "{}-{}",
            self.options.client_id_prefix,
            Uuid::new_v4().simple()
        );
        let mut mqtt_options =
            MqttOptions::new(client_id, address.host(), address.port_or(DEFAULT_MQTT_PORT));
        mqtt_options.set_keep_alive(self.options.keep_alive);
        mqtt_options.set_clean_session(true);
        mqtt_options
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, address: &BrokerAddress) -> Result<Box<dyn Connection>> {
        let (client, mut eventloop) =
            AsyncClient::new(self.mqtt_options(address), self.options.channel_capacity);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return if ack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(TransportError::Refused(format!("{:?}", ack.code)))
                        };
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(classify(e)),
                }
            }
        };

        match timeout(self.options.connect_timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(TransportError::Timeout(self.options.connect_timeout)),
        }

        tracing::debug!("MQTT session acknowledged by {}", address);

        let router = TopicRouter::new();
        let (failure_tx, failure_rx) = oneshot::channel();
        let closing = CancellationToken::new();
        let driver = tokio::spawn(drive(
            eventloop,
            router.clone(),
            failure_tx,
            closing.clone(),
        ));

        Ok(Box::new(MqttConnection {
            client,
            router,
            qos: self.options.qos,
            failure: Some(failure_rx),
            closing,
            driver: Mutex::new(Some(driver)),
            close_timeout: self.options.close_timeout,
        }))
    }
}

/// Poll the event loop until the connection fails or is closed.
async fn drive(
    mut eventloop: EventLoop,
    router: TopicRouter,
    failure_tx: oneshot::Sender<TransportError>,
    closing: CancellationToken,
) {
    let failure = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                router.route(Delivery::bytes(publish.topic, publish.payload));
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                break TransportError::Disconnected("broker closed the connection".to_string());
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("MQTT disconnect flushed");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                if closing.is_cancelled() {
                    return;
                }
                break classify(e);
            }
        }
    };

    if closing.is_cancelled() {
        return;
    }
    tracing::debug!("MQTT event loop stopped: {}", failure);
    let _ = failure_tx.send(failure);
}

fn classify(error: rumqttc::ConnectionError) -> TransportError {
    match error {
        rumqttc::ConnectionError::ConnectionRefused(code) => {
            TransportError::Refused(format!("{code:?}"))
        }
        rumqttc::ConnectionError::Io(e) => TransportError::Connect(e.to_string()),
        other => TransportError::Disconnected(other.to_string()),
    }
}

/// An MQTT connection and its event-loop driver.
pub struct MqttConnection {
    client: AsyncClient,
    router: TopicRouter,
    qos: QoS,
    failure: Option<FailureSignal>,
    closing: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    close_timeout: Duration,
}

#[async_trait]
impl Connection for MqttConnection {
    async fn create_session(&self) -> Result<Box<dyn Session>> {
        if self.closing.is_cancelled() {
            return Err(TransportError::Closed);
        }
        Ok(Box::new(MqttSession {
            client: self.client.clone(),
            router: self.router.clone(),
            qos: self.qos,
        }))
    }

    fn take_failure_signal(&mut self) -> Option<FailureSignal> {
        self.failure.take()
    }

    async fn close(&self) -> Result<()> {
        if self.closing.is_cancelled() {
            return Ok(());
        }
        self.closing.cancel();
        self.router.clear();

        if let Err(e) = self.client.disconnect().await {
            // The event loop is already gone when the connection failed first
            tracing::debug!("MQTT disconnect request not sent: {}", e);
        }

        let Some(mut driver) = self.driver.lock().await.take() else {
            return Ok(());
        };
        if timeout(self.close_timeout, &mut driver).await.is_err() {
            tracing::debug!("MQTT driver did not stop in {:?}, aborting", self.close_timeout);
            driver.abort();
        }
        Ok(())
    }
}

/// Session view over a shared MQTT client.
pub struct MqttSession {
    client: AsyncClient,
    router: TopicRouter,
    qos: QoS,
}

#[async_trait]
impl Session for MqttSession {
    async fn consume(&self, topic: &str) -> Result<Consumer> {
        let consumer = self.router.register(topic);
        if let Err(e) = self.client.subscribe(topic, self.qos).await {
            self.router.unregister(topic);
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(consumer)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.router.unregister(topic);
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn close(&self) -> Result<()> {
        self.router.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = MqttConnectorOptions::default();
        assert_eq!(options.client_id_prefix, "onboard-provisioner");
        assert_eq!(options.keep_alive, Duration::from_secs(30));
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.qos, QoS::AtLeastOnce);
    }

    #[test]
    fn test_options_builder() {
        let options = MqttConnectorOptions::default()
            .with_client_id_prefix("train-T1")
            .with_connect_timeout(Duration::from_secs(3))
            .with_keep_alive(Duration::from_secs(60));

        assert_eq!(options.client_id_prefix, "train-T1");
        assert_eq!(options.connect_timeout, Duration::from_secs(3));
        assert_eq!(options.keep_alive, Duration::from_secs(60));
    }

    #[test]
    fn test_mqtt_options_use_address() {
        let connector = MqttConnector::new(
            MqttConnectorOptions::default().with_client_id_prefix("train-T1"),
        );
        let address = BrokerAddress::parse("tcp://broker.local:61616").unwrap();
        let options = connector.mqtt_options(&address);

        assert_eq!(options.broker_address(), ("broker.local".to_string(), 61616));
        assert!(options.client_id().starts_with("train-T1-"));

        let address = BrokerAddress::parse("mqtt://broker.local").unwrap();
        let options = connector.mqtt_options(&address);
        assert_eq!(options.broker_address().1, DEFAULT_MQTT_PORT);
    }

    #[test]
    fn test_classify_refused() {
        let error = classify(rumqttc::ConnectionError::ConnectionRefused(
            ConnectReturnCode::NotAuthorized,
        ));
        assert!(matches!(error, TransportError::Refused(_)));

        let error = classify(rumqttc::ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        assert!(matches!(error, TransportError::Connect(_)));
    }
}
