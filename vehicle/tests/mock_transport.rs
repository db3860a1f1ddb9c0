//! Mock broker transport for testing.
//!
//! `MockConnector` hands out in-memory connections whose sessions create real
//! channel-backed consumers. Tests drive it from the outside: publish messages
//! on the latest connection, simulate a dropped connection, or make the next
//! connection attempts fail or hang.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mq_client::{
    BrokerAddress, Connection, Connector, Consumer, Delivery, FailureSignal, Message, Session,
    TransportError,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;

/// Observable state of one mock connection.
pub struct MockConnectionState {
    pub index: usize,
    closes: AtomicU32,
    session_closes: AtomicU32,
    failure_tx: Mutex<Option<oneshot::Sender<TransportError>>>,
    consumers: Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
    subscribe_calls: Mutex<Vec<String>>,
    unsubscribe_calls: Mutex<Vec<String>>,
    open_gauge: Arc<OpenGauge>,
}

impl MockConnectionState {
    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn session_closes(&self) -> u32 {
        self.session_closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closes() > 0
    }

    /// Topics passed to `consume`, in call order.
    pub fn subscribe_calls(&self) -> Vec<String> {
        self.subscribe_calls.lock().clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<String> {
        self.unsubscribe_calls.lock().clone()
    }

    /// Deliver `message` to the consumer of `topic`. Returns false if nobody
    /// consumes the topic on this connection.
    pub fn publish(&self, topic: &str, message: Message) -> bool {
        let consumers = self.consumers.lock();
        match consumers.get(topic) {
            Some(tx) => tx
                .send(Delivery {
                    topic: topic.to_string(),
                    message,
                })
                .is_ok(),
            None => false,
        }
    }

    /// Report an asynchronous failure. Returns false if the signal was
    /// already used or nobody observes it.
    pub fn fail(&self, reason: &str) -> bool {
        match self.failure_tx.lock().take() {
            Some(tx) => tx
                .send(TransportError::Disconnected(reason.to_string()))
                .is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        if self.closes.fetch_add(1, Ordering::SeqCst) == 0 {
            self.open_gauge.close();
        }
        self.consumers.lock().clear();
    }
}

/// Tracks how many connections are open at once.
#[derive(Default)]
struct OpenGauge {
    open: AtomicUsize,
    max_open: AtomicUsize,
}

impl OpenGauge {
    fn open(&self) {
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now, Ordering::SeqCst);
    }

    fn close(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Inner {
    fail_connects: AtomicU32,
    fail_session: AtomicBool,
    block_connects: AtomicBool,
    fail_subscribe_once: Mutex<Option<String>>,
    hold_unsubscribes: AtomicBool,
    unsubscribes_released: Notify,
    attempts: Mutex<Vec<Instant>>,
    addresses: Mutex<Vec<String>>,
    connections: Mutex<Vec<Arc<MockConnectionState>>>,
    gauge: Arc<OpenGauge>,
}

/// Mock connector with configurable failure modes.
#[derive(Clone, Default)]
pub struct MockConnector {
    inner: Arc<Inner>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Fail every connection attempt until `fail_next_connects(0)`.
    pub fn fail_all_connects(&self) {
        self.fail_next_connects(u32::MAX);
    }

    pub fn set_fail_session(&self, fail: bool) {
        self.inner.fail_session.store(fail, Ordering::SeqCst);
    }

    /// Make connection attempts hang until cancelled.
    pub fn set_blocking(&self, block: bool) {
        self.inner.block_connects.store(block, Ordering::SeqCst);
    }

    /// Fail the next `consume` call for `topic`.
    pub fn fail_subscribe_once(&self, topic: &str) {
        *self.inner.fail_subscribe_once.lock() = Some(topic.to_string());
    }

    /// Make `unsubscribe` calls wait until `release_unsubscribes`. The call
    /// is recorded before it waits.
    pub fn hold_unsubscribes(&self) {
        self.inner.hold_unsubscribes.store(true, Ordering::SeqCst);
    }

    pub fn release_unsubscribes(&self) {
        self.inner.hold_unsubscribes.store(false, Ordering::SeqCst);
        self.inner.unsubscribes_released.notify_waiters();
    }

    /// Times at which `connect` was called.
    pub fn attempts(&self) -> Vec<Instant> {
        self.inner.attempts.lock().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.inner.attempts.lock().len()
    }

    /// Addresses passed to `connect`, in call order.
    pub fn addresses(&self) -> Vec<String> {
        self.inner.addresses.lock().clone()
    }

    /// Every connection handed out, oldest first.
    pub fn connections(&self) -> Vec<Arc<MockConnectionState>> {
        self.inner.connections.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<MockConnectionState>> {
        self.inner.connections.lock().last().cloned()
    }

    pub fn open_connections(&self) -> usize {
        self.inner.gauge.open.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open connections observed.
    pub fn max_open_connections(&self) -> usize {
        self.inner.gauge.max_open.load(Ordering::SeqCst)
    }

    /// Publish on the latest connection.
    pub fn publish(&self, topic: &str, message: Message) -> bool {
        self.latest().is_some_and(|c| c.publish(topic, message))
    }

    /// Simulate the broker dropping the latest connection.
    pub fn drop_connection(&self) -> bool {
        self.latest().is_some_and(|c| c.fail("connection reset by broker"))
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &BrokerAddress) -> mq_client::Result<Box<dyn Connection>> {
        self.inner.attempts.lock().push(Instant::now());
        self.inner.addresses.lock().push(address.to_string());

        if self.inner.block_connects.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let failing = self
            .inner
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Connect("mock broker unavailable".to_string()));
        }

        let (failure_tx, failure_rx) = oneshot::channel();
        let state = {
            let mut connections = self.inner.connections.lock();
            let state = Arc::new(MockConnectionState {
                index: connections.len(),
                closes: AtomicU32::new(0),
                session_closes: AtomicU32::new(0),
                failure_tx: Mutex::new(Some(failure_tx)),
                consumers: Mutex::new(HashMap::new()),
                subscribe_calls: Mutex::new(Vec::new()),
                unsubscribe_calls: Mutex::new(Vec::new()),
                open_gauge: Arc::clone(&self.inner.gauge),
            });
            connections.push(Arc::clone(&state));
            state
        };
        self.inner.gauge.open();

        Ok(Box::new(MockConnection {
            state,
            inner: Arc::clone(&self.inner),
            failure: Some(failure_rx),
        }))
    }
}

struct MockConnection {
    state: Arc<MockConnectionState>,
    inner: Arc<Inner>,
    failure: Option<FailureSignal>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn create_session(&self) -> mq_client::Result<Box<dyn Session>> {
        if self.inner.fail_session.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(Box::new(MockSession {
            state: Arc::clone(&self.state),
            inner: Arc::clone(&self.inner),
        }))
    }

    fn take_failure_signal(&mut self) -> Option<FailureSignal> {
        self.failure.take()
    }

    async fn close(&self) -> mq_client::Result<()> {
        self.state.close();
        Ok(())
    }
}

struct MockSession {
    state: Arc<MockConnectionState>,
    inner: Arc<Inner>,
}

#[async_trait]
impl Session for MockSession {
    async fn consume(&self, topic: &str) -> mq_client::Result<Consumer> {
        self.state.subscribe_calls.lock().push(topic.to_string());

        let mut fail_once = self.inner.fail_subscribe_once.lock();
        if fail_once.as_deref() == Some(topic) {
            fail_once.take();
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "mock subscribe failure".to_string(),
            });
        }
        drop(fail_once);

        let (tx, rx) = mpsc::unbounded_channel();
        self.state.consumers.lock().insert(topic.to_string(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> mq_client::Result<()> {
        self.state.unsubscribe_calls.lock().push(topic.to_string());
        loop {
            let released = self.inner.unsubscribes_released.notified();
            if !self.inner.hold_unsubscribes.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }
        self.state.consumers.lock().remove(topic);
        Ok(())
    }

    async fn close(&self) -> mq_client::Result<()> {
        self.state.session_closes.fetch_add(1, Ordering::SeqCst);
        self.state.consumers.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> BrokerAddress {
        BrokerAddress::parse("broker://localhost:61616").unwrap()
    }

    #[tokio::test]
    async fn test_fail_next_connects() {
        let connector = MockConnector::new();
        connector.fail_next_connects(2);

        assert!(connector.connect(&address()).await.is_err());
        assert!(connector.connect(&address()).await.is_err());
        assert!(connector.connect(&address()).await.is_ok());
        assert_eq!(connector.attempt_count(), 3);
        assert_eq!(connector.connections().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_consumer() {
        let connector = MockConnector::new();
        let connection = connector.connect(&address()).await.unwrap();
        let session = connection.create_session().await.unwrap();
        let mut consumer = session.consume("content").await.unwrap();

        assert!(connector.publish("content", Message::Bytes(vec![1, 2].into())));
        assert!(!connector.publish("other", Message::Text("x".to_string())));

        let delivery = consumer.recv().await.unwrap();
        assert_eq!(delivery, Delivery::bytes("content", vec![1, 2]));
    }

    #[tokio::test]
    async fn test_open_gauge() {
        let connector = MockConnector::new();
        let first = connector.connect(&address()).await.unwrap();
        let second = connector.connect(&address()).await.unwrap();
        assert_eq!(connector.open_connections(), 2);

        first.close().await.unwrap();
        first.close().await.unwrap();
        second.close().await.unwrap();
        assert_eq!(connector.open_connections(), 0);
        assert_eq!(connector.max_open_connections(), 2);
    }

    #[tokio::test]
    async fn test_drop_connection_fires_failure_signal() {
        let connector = MockConnector::new();
        let mut connection = connector.connect(&address()).await.unwrap();
        let signal = connection.take_failure_signal().unwrap();

        assert!(connector.drop_connection());
        assert!(!connector.drop_connection());
        assert!(matches!(signal.await, Ok(TransportError::Disconnected(_))));
    }
}
