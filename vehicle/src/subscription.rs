//! Topic subscriptions bound to one connection handle
//!
//! Each subscribed topic gets one consumer and one delivery task. The task
//! hands payloads to the topic's [`PayloadSink`] one at a time, so ordering is
//! preserved per topic but not across topics.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mq_client::{Consumer, Message, Session};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::TopicRole;
use crate::connection::{ConnectionHandle, HandleId};
use crate::error::{DeliveryError, SubscriptionError};

/// Consumer of the payloads delivered on a topic.
#[async_trait]
pub trait PayloadSink: Send + Sync {
    /// Handle one payload. Errors are logged by the caller and never affect
    /// the connection.
    async fn deliver(&self, topic: &str, payload: Bytes) -> Result<(), DeliveryError>;
}

/// A topic registered on a connection handle.
#[derive(Clone)]
pub struct SubscriptionDescriptor {
    pub topic: String,
    pub role: TopicRole,
    pub sink: Arc<dyn PayloadSink>,
}

impl fmt::Debug for SubscriptionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionDescriptor")
            .field("topic", &self.topic)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

struct ActiveTopic {
    descriptor: SubscriptionDescriptor,
    task: JoinHandle<()>,
}

/// The set of topic subscriptions created on one [`ConnectionHandle`].
///
/// The set is torn down together with its handle: once `unsubscribe` returns,
/// no delivery from that handle can reach a sink.
pub struct TopicSubscriptionSet {
    handle: HandleId,
    session: Option<Arc<dyn Session>>,
    topics: Vec<ActiveTopic>,
    cancel: CancellationToken,
    released: bool,
}

impl TopicSubscriptionSet {
    /// Create an empty set bound to `handle`.
    pub fn new(handle: HandleId) -> Self {
        Self {
            handle,
            session: None,
            topics: Vec::new(),
            cancel: CancellationToken::new(),
            released: false,
        }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    /// Create a consumer for `topic` on `handle` and start delivering to `sink`.
    pub async fn subscribe(
        &mut self,
        handle: &ConnectionHandle,
        topic: &str,
        role: TopicRole,
        sink: Arc<dyn PayloadSink>,
    ) -> Result<(), SubscriptionError> {
        if handle.id() != self.handle {
            return Err(SubscriptionError::ForeignHandle {
                bound: self.handle,
                requested: handle.id(),
            });
        }
        if self.released || !handle.is_open() {
            return Err(SubscriptionError::HandleClosed(self.handle));
        }
        if self.is_subscribed(topic) {
            return Err(SubscriptionError::AlreadySubscribed {
                topic: topic.to_string(),
                handle: self.handle,
            });
        }

        let session = handle
            .session()
            .ok_or(SubscriptionError::HandleClosed(self.handle))?;
        let consumer = session
            .consume(topic)
            .await
            .map_err(|source| SubscriptionError::Consumer {
                topic: topic.to_string(),
                source,
            })?;

        let descriptor = SubscriptionDescriptor {
            topic: topic.to_string(),
            role,
            sink,
        };
        let task = tokio::spawn(run_delivery(
            descriptor.clone(),
            consumer,
            self.cancel.child_token(),
        ));
        debug!("Subscribed {} topic '{}' on {}", role, topic, self.handle);

        self.session = Some(session);
        self.topics.push(ActiveTopic { descriptor, task });
        Ok(())
    }

    /// Stop every delivery task and release the consumers.
    ///
    /// Returns once all delivery tasks have finished. Calling it again is a
    /// no-op.
    pub async fn unsubscribe(&mut self, handle: HandleId) -> Result<(), SubscriptionError> {
        if handle != self.handle {
            return Err(SubscriptionError::ForeignHandle {
                bound: self.handle,
                requested: handle,
            });
        }
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.cancel.cancel();

        let session = self.session.take();
        for active in self.topics.drain(..) {
            if let Err(e) = active.task.await {
                if e.is_panic() {
                    error!(
                        "Delivery task for topic '{}' panicked",
                        active.descriptor.topic
                    );
                }
            }
            if let Some(session) = &session {
                if let Err(e) = session.unsubscribe(&active.descriptor.topic).await {
                    debug!(
                        "Unsubscribe '{}' on {} failed: {}",
                        active.descriptor.topic, self.handle, e
                    );
                }
            }
        }
        debug!("Subscriptions on {} released", self.handle);
        Ok(())
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t.descriptor.topic == topic)
    }

    /// Descriptors of the current subscriptions, in subscription order.
    pub fn descriptors(&self) -> impl Iterator<Item = &SubscriptionDescriptor> {
        self.topics.iter().map(|t| &t.descriptor)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

impl fmt::Debug for TopicSubscriptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicSubscriptionSet")
            .field("handle", &self.handle)
            .field(
                "topics",
                &self.descriptors().map(|d| d.topic.as_str()).collect::<Vec<_>>(),
            )
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for TopicSubscriptionSet {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_delivery(
    descriptor: SubscriptionDescriptor,
    mut consumer: Consumer,
    cancel: CancellationToken,
) {
    let topic = descriptor.topic.as_str();
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = consumer.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        match delivery.message {
            Message::Bytes(payload) => {
                if let Err(e) = descriptor.sink.deliver(topic, payload).await {
                    error!("Failed to handle message on topic '{}': {}", topic, e);
                }
            }
            other => {
                let e = DeliveryError::UnexpectedEnvelope {
                    topic: topic.to_string(),
                    kind: other.kind(),
                };
                warn!("{}", e);
            }
        }
    }
    debug!("Delivery task for topic '{}' stopped", topic);
}
