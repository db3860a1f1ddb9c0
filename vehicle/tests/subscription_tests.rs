//! Tests for connection handles and topic subscription sets.

mod mock_transport;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mock_transport::MockConnector;
use mq_client::{BrokerAddress, Message};
use parking_lot::Mutex;
use vehicle::{
    BrokerConnection, ConnectionError, DeliveryError, PayloadSink, PersistenceError,
    SubscriptionError, TopicRole, TopicSubscriptionSet,
};

/// Sink that records payloads and fails every `fail_every`-th delivery.
#[derive(Default)]
struct CountingSink {
    received: Mutex<Vec<Bytes>>,
    calls: AtomicU32,
    fail_every: u32,
}

#[async_trait]
impl PayloadSink for CountingSink {
    async fn deliver(&self, _topic: &str, payload: Bytes) -> Result<(), DeliveryError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_every > 0 && call % self.fail_every == 0 {
            return Err(PersistenceError::InvalidKey("unwritable".to_string()).into());
        }
        self.received.lock().push(payload);
        Ok(())
    }
}

fn address() -> BrokerAddress {
    BrokerAddress::parse("broker://localhost:61616").unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_subscribe_and_deliver() {
    let connector = MockConnector::new();
    let broker = BrokerConnection::new(Arc::new(connector.clone()));
    let mut handle = broker.open(&address()).await.unwrap();
    let sink = Arc::new(CountingSink::default());

    let mut set = TopicSubscriptionSet::new(handle.id());
    set.subscribe(&handle, "content", TopicRole::Content, sink.clone())
        .await
        .unwrap();
    assert!(set.is_subscribed("content"));
    assert_eq!(set.len(), 1);

    connector.publish("content", Message::Bytes(Bytes::from_static(&[1, 2])));
    settle().await;
    assert_eq!(*sink.received.lock(), vec![Bytes::from_static(&[1, 2])]);

    set.unsubscribe(handle.id()).await.unwrap();
    handle.close().await;
}

#[tokio::test]
async fn test_duplicate_topic_rejected() {
    let connector = MockConnector::new();
    let broker = BrokerConnection::new(Arc::new(connector.clone()));
    let mut handle = broker.open(&address()).await.unwrap();
    let sink = Arc::new(CountingSink::default());

    let mut set = TopicSubscriptionSet::new(handle.id());
    set.subscribe(&handle, "content", TopicRole::Content, sink.clone())
        .await
        .unwrap();
    let result = set
        .subscribe(&handle, "content", TopicRole::Content, sink)
        .await;

    assert!(matches!(
        result,
        Err(SubscriptionError::AlreadySubscribed { ref topic, .. }) if topic == "content"
    ));
    assert_eq!(connector.latest().unwrap().subscribe_calls(), vec!["content"]);

    set.unsubscribe(handle.id()).await.unwrap();
    handle.close().await;
}

#[tokio::test]
async fn test_foreign_handle_rejected() {
    let connector = MockConnector::new();
    let broker = BrokerConnection::new(Arc::new(connector));
    let mut first = broker.open(&address()).await.unwrap();
    let mut second = broker.open(&address()).await.unwrap();

    let mut set = TopicSubscriptionSet::new(first.id());
    let result = set
        .subscribe(&second, "content", TopicRole::Content, Arc::new(CountingSink::default()))
        .await;
    assert!(matches!(result, Err(SubscriptionError::ForeignHandle { .. })));

    assert!(matches!(
        set.unsubscribe(second.id()).await,
        Err(SubscriptionError::ForeignHandle { .. })
    ));

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn test_closed_handle_rejected() {
    let connector = MockConnector::new();
    let broker = BrokerConnection::new(Arc::new(connector));
    let mut handle = broker.open(&address()).await.unwrap();
    handle.close().await;

    let mut set = TopicSubscriptionSet::new(handle.id());
    let result = set
        .subscribe(&handle, "content", TopicRole::Content, Arc::new(CountingSink::default()))
        .await;
    assert!(matches!(result, Err(SubscriptionError::HandleClosed(_))));
}

#[tokio::test]
async fn test_no_delivery_after_unsubscribe() {
    let connector = MockConnector::new();
    let broker = BrokerConnection::new(Arc::new(connector.clone()));
    let mut handle = broker.open(&address()).await.unwrap();
    let sink = Arc::new(CountingSink::default());

    let mut set = TopicSubscriptionSet::new(handle.id());
    set.subscribe(&handle, "content", TopicRole::Content, sink.clone())
        .await
        .unwrap();
    set.unsubscribe(handle.id()).await.unwrap();
    set.unsubscribe(handle.id()).await.unwrap();

    assert!(!connector.publish("content", Message::Bytes(Bytes::from_static(b"late"))));
    settle().await;
    assert!(sink.received.lock().is_empty());
    assert!(set.is_empty());
    assert_eq!(connector.latest().unwrap().unsubscribe_calls(), vec!["content"]);

    // A released set cannot be reused
    let result = set
        .subscribe(&handle, "messages", TopicRole::Messages, sink)
        .await;
    assert!(matches!(result, Err(SubscriptionError::HandleClosed(_))));
    handle.close().await;
}

#[tokio::test]
async fn test_sink_errors_and_bad_envelopes_do_not_stop_delivery() {
    let connector = MockConnector::new();
    let broker = BrokerConnection::new(Arc::new(connector.clone()));
    let mut handle = broker.open(&address()).await.unwrap();
    let sink = Arc::new(CountingSink {
        fail_every: 2,
        ..Default::default()
    });

    let mut set = TopicSubscriptionSet::new(handle.id());
    set.subscribe(&handle, "content", TopicRole::Content, sink.clone())
        .await
        .unwrap();

    connector.publish("content", Message::Bytes(Bytes::from_static(b"a")));
    connector.publish("content", Message::Bytes(Bytes::from_static(b"b")));
    connector.publish("content", Message::Text("c".to_string()));
    connector.publish("content", Message::Bytes(Bytes::from_static(b"d")));
    settle().await;

    assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        *sink.received.lock(),
        vec![Bytes::from_static(b"a"), Bytes::from_static(b"d")]
    );
    assert!(handle.is_open());

    set.unsubscribe(handle.id()).await.unwrap();
    handle.close().await;
}

#[tokio::test]
async fn test_open_failure_is_reported() {
    let connector = MockConnector::new();
    connector.fail_next_connects(1);
    let broker = BrokerConnection::new(Arc::new(connector.clone()));

    let result = broker.open(&address()).await;
    assert!(matches!(result, Err(ConnectionError::Open { .. })));
    assert_eq!(connector.attempt_count(), 1);
    assert!(connector.connections().is_empty());
}
