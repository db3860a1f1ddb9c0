//! Topic routing for incoming broker messages.
//!
//! This module provides the `TopicRouter` which maintains one channel per
//! consumed topic and routes every incoming publish to the matching consumer.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::transport::{Consumer, Delivery};

/// Routes deliveries from a connection's event loop to per-topic consumers.
///
/// Each registered topic owns an unbounded channel, so a slow consumer on one
/// topic never blocks delivery on another, and messages keep their publish
/// order within a topic.
#[derive(Clone, Default)]
pub struct TopicRouter {
    /// Active routes keyed by topic name
    routes: Arc<DashMap<String, mpsc::UnboundedSender<Delivery>>>,
}

impl TopicRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a topic and return its consumer.
    ///
    /// Registering a topic that already has a route replaces it; the previous
    /// consumer ends.
    pub fn register(&self, topic: impl Into<String>) -> Consumer {
        let (tx, rx) = mpsc::unbounded_channel();
        let topic = topic.into();
        if self.routes.insert(topic.clone(), tx).is_some() {
            tracing::debug!("Replaced existing route for topic {}", topic);
        }
        rx
    }

    /// Remove the route for a topic. Returns `true` if a route existed.
    pub fn unregister(&self, topic: &str) -> bool {
        self.routes.remove(topic).is_some()
    }

    /// Route a delivery to its topic's consumer.
    ///
    /// Returns `false` if no consumer is registered for the topic or the
    /// consumer has been dropped; in the latter case the stale route is removed.
    pub fn route(&self, delivery: Delivery) -> bool {
        let topic = delivery.topic.clone();
        let sent = match self.routes.get(&topic) {
            Some(tx) => tx.send(delivery).is_ok(),
            None => {
                tracing::debug!("Dropping message for unrouted topic {}", topic);
                return false;
            }
        };

        if !sent {
            tracing::debug!("Consumer for topic {} is gone, removing route", topic);
            self.routes.remove(&topic);
        }
        sent
    }

    /// Drop every route; all consumers end.
    pub fn clear(&self) {
        self.routes.clear();
    }

    pub fn is_registered(&self, topic: &str) -> bool {
        self.routes.contains_key(topic)
    }

    /// Number of registered topics.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
