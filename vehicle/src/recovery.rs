//! Connection recovery
//!
//! [`RecoveryController`] owns the single live connection and its topic
//! subscriptions. Connecting, failure recovery and shutdown all run under one
//! async lock, so at most one connection attempt is in flight and teardown of a
//! handle always completes before a new one is opened.
//!
//! Waits between attempts are cancellable through a [`CancellationToken`] that
//! can be triggered without taking the lock. While an [`InterruptGuard`] is
//! held, every connect loop, including ones started after the interrupt,
//! exits without connecting.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use mq_client::Connector;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::VehicleConfig;
use crate::connection::{BrokerConnection, ConnectionHandle, HandleId};
use crate::error::{ConnectionError, SubscriptionError};
use crate::sink::Sinks;
use crate::subscription::TopicSubscriptionSet;

/// Connection state as seen by the recovery controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Disconnected,
    Connecting,
    Subscribing,
    Live,
    Closing,
}

/// Result of a connect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A connection is open and all active topics are subscribed
    Live,
    /// The loop was interrupted before a connection became live
    Cancelled,
}

/// Connection counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Calls to open a broker connection
    pub connect_attempts: u64,
    /// Connections that reached Live
    pub connects: u64,
    /// Async failures reported for the live connection
    pub async_failures: u64,
    /// Failure notifications for handles that were no longer live
    pub stale_notifications: u64,
}

struct LiveConnection {
    handle: ConnectionHandle,
    subscriptions: TopicSubscriptionSet,
}

#[derive(Default)]
struct Slot {
    config: Option<Arc<VehicleConfig>>,
    live: Option<LiveConnection>,
}

/// Cancellation token plus the lifecycle requests still waiting to run.
struct Interrupts {
    token: CancellationToken,
    pending: usize,
    halted: bool,
}

impl Interrupts {
    /// Token for a new connect loop. A cancelled token is only replaced once
    /// no interrupt is pending.
    fn token(&mut self) -> CancellationToken {
        if self.token.is_cancelled() && self.pending == 0 && !self.halted {
            self.token = CancellationToken::new();
        }
        self.token.clone()
    }
}

struct Shared {
    broker: BrokerConnection,
    sinks: Sinks,
    slot: Mutex<Slot>,
    interrupts: parking_lot::Mutex<Interrupts>,
    state_tx: watch::Sender<RecoveryState>,
    connect_attempts: AtomicU64,
    connects: AtomicU64,
    async_failures: AtomicU64,
    stale_notifications: AtomicU64,
}

/// Reconnect loop and failure-driven recovery for one vehicle.
#[derive(Clone)]
pub struct RecoveryController {
    shared: Arc<Shared>,
}

impl RecoveryController {
    pub fn new(connector: Arc<dyn Connector>, sinks: Sinks) -> Self {
        let (state_tx, _) = watch::channel(RecoveryState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                broker: BrokerConnection::new(connector),
                sinks,
                slot: Mutex::new(Slot::default()),
                interrupts: parking_lot::Mutex::new(Interrupts {
                    token: CancellationToken::new(),
                    pending: 0,
                    halted: false,
                }),
                state_tx,
                connect_attempts: AtomicU64::new(0),
                connects: AtomicU64::new(0),
                async_failures: AtomicU64::new(0),
                stale_notifications: AtomicU64::new(0),
            }),
        }
    }

    /// Tear down any live connection, then retry with `config` until a
    /// connection is live or the loop is interrupted.
    pub async fn connect(&self, config: Arc<VehicleConfig>) -> ConnectOutcome {
        let mut slot = self.shared.slot.lock().await;
        let cancel = self.shared.current_token();

        self.shared.teardown(&mut slot).await;
        slot.config = Some(Arc::clone(&config));
        self.shared.connect_loop(&mut slot, &config, &cancel).await
    }

    /// Cancel the current open attempt or reconnect wait. Does not wait for
    /// the loop to exit.
    pub fn interrupt(&self) {
        self.shared.interrupts.lock().token.cancel();
    }

    /// Interrupt, and keep any connect loop from running until the guard is
    /// dropped. Taken by lifecycle requests queued behind the current one.
    pub fn hold_interrupted(&self) -> InterruptGuard {
        let mut interrupts = self.shared.interrupts.lock();
        interrupts.pending += 1;
        interrupts.token.cancel();
        InterruptGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Interrupt permanently. Recovery never connects again.
    pub fn halt(&self) {
        let mut interrupts = self.shared.interrupts.lock();
        interrupts.halted = true;
        interrupts.token.cancel();
    }

    /// Interrupt pending waits, close the live connection and forget the
    /// configuration. Returns once teardown is complete. Idempotent.
    pub async fn shutdown(&self) {
        self.interrupt();
        let mut slot = self.shared.slot.lock().await;

        self.shared.set_state(RecoveryState::Closing);
        self.shared.teardown(&mut slot).await;
        slot.config = None;
        self.shared.set_state(RecoveryState::Disconnected);
    }

    pub fn state(&self) -> RecoveryState {
        *self.shared.state_tx.borrow()
    }

    /// Watch recovery state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<RecoveryState> {
        self.shared.state_tx.subscribe()
    }

    pub fn stats(&self) -> ConnectionStats {
        let shared = &self.shared;
        ConnectionStats {
            connect_attempts: shared.connect_attempts.load(Ordering::Relaxed),
            connects: shared.connects.load(Ordering::Relaxed),
            async_failures: shared.async_failures.load(Ordering::Relaxed),
            stale_notifications: shared.stale_notifications.load(Ordering::Relaxed),
        }
    }
}

/// Returned by [`RecoveryController::hold_interrupted`].
#[must_use = "the interrupt is released when the guard is dropped"]
pub struct InterruptGuard {
    shared: Arc<Shared>,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        let mut interrupts = self.shared.interrupts.lock();
        interrupts.pending = interrupts.pending.saturating_sub(1);
    }
}

impl Shared {
    fn current_token(&self) -> CancellationToken {
        self.interrupts.lock().token()
    }

    fn set_state(&self, state: RecoveryState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Recovery state {:?} -> {:?}", previous, state);
        }
    }

    async fn connect_loop(
        self: &Arc<Self>,
        slot: &mut Slot,
        config: &VehicleConfig,
        cancel: &CancellationToken,
    ) -> ConnectOutcome {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.set_state(RecoveryState::Connecting);
            self.connect_attempts.fetch_add(1, Ordering::Relaxed);

            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.broker.open(&config.broker_address) => Some(result),
            };
            let Some(result) = opened else {
                break;
            };

            match result {
                Ok(handle) => match self.install(handle, config).await {
                    Ok(live) => {
                        slot.live = Some(live);
                        self.connects.fetch_add(1, Ordering::Relaxed);
                        self.set_state(RecoveryState::Live);
                        info!("Connected to MQ at {}", config.broker_address);
                        return ConnectOutcome::Live;
                    }
                    Err(e) => error!("Failed to subscribe MQ topics: {}", e),
                },
                Err(e) => error!("Failed to connect to MQ: {}", e),
            }

            let delay = config.reconnect_delay;
            info!("Trying to reconnect again after {} seconds", delay.as_secs());
            let interrupted = tokio::select! {
                biased;
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if interrupted {
                break;
            }
        }

        debug!("Connect loop interrupted");
        self.set_state(RecoveryState::Disconnected);
        ConnectOutcome::Cancelled
    }

    /// Subscribe the active topics on a fresh handle and start observing it.
    async fn install(
        self: &Arc<Self>,
        mut handle: ConnectionHandle,
        config: &VehicleConfig,
    ) -> Result<LiveConnection, SubscriptionError> {
        self.set_state(RecoveryState::Subscribing);
        let mut subscriptions = TopicSubscriptionSet::new(handle.id());

        for (role, topic) in config.active_topics() {
            let Some(sink) = self.sinks.for_role(role) else {
                continue;
            };
            if let Err(e) = subscriptions.subscribe(&handle, topic, role, sink).await {
                if let Err(release) = subscriptions.unsubscribe(handle.id()).await {
                    debug!("Releasing subscriptions on {} failed: {}", handle.id(), release);
                }
                handle.close().await;
                return Err(e);
            }
        }
        for (role, topic) in config.inactive_topics() {
            debug!("Topic '{}' ({}) is configured but not subscribed", topic, role);
        }

        let weak: Weak<Shared> = Arc::downgrade(self);
        handle.on_async_failure(move |id, error| {
            if let Some(shared) = weak.upgrade() {
                tokio::spawn(shared.recover(id, error));
            }
        });

        Ok(LiveConnection {
            handle,
            subscriptions,
        })
    }

    /// Replace the failed live connection, unless `failed` is no longer live.
    ///
    /// Boxed because the connect loop registers this as the failure observer.
    fn recover(
        self: Arc<Self>,
        failed: HandleId,
        error: ConnectionError,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut slot = self.slot.lock().await;

            let live_id = slot.live.as_ref().map(|live| live.handle.id());
            if live_id != Some(failed) {
                self.stale_notifications.fetch_add(1, Ordering::Relaxed);
                debug!("Ignoring failure of {}, no longer live: {}", failed, error);
                return;
            }
            let Some(config) = slot.config.clone() else {
                return;
            };

            self.async_failures.fetch_add(1, Ordering::Relaxed);
            warn!("MQ connection lost: {}", error);

            let cancel = self.current_token();
            self.teardown(&mut slot).await;
            if self.connect_loop(&mut slot, &config, &cancel).await == ConnectOutcome::Live {
                info!("MQ connection recovered");
            }
        })
    }

    async fn teardown(&self, slot: &mut Slot) {
        if let Some(mut live) = slot.live.take() {
            let id = live.handle.id();
            if let Err(e) = live.subscriptions.unsubscribe(id).await {
                debug!("Releasing subscriptions on {} failed: {}", id, e);
            }
            live.handle.close().await;
        }
    }
}
