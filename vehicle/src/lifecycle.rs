//! Vehicle lifecycle
//!
//! [`Vehicle`] is the public start/stop/restart surface used by the host
//! process and by the configuration watcher. All three operations are
//! serialized by one async lock; `stop` and `restart` interrupt a blocked
//! reconnect wait before queuing on that lock, and keep later connect loops
//! interrupted until they have run.

use std::sync::Arc;

use async_trait::async_trait;
use mq_client::Connector;
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};

use crate::config::{ConfigSource, VehicleConfig};
use crate::error::{Result, VehicleError};
use crate::recovery::{ConnectOutcome, ConnectionStats, RecoveryController, RecoveryState};
use crate::sink::Sinks;

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Connected,
    /// Started, but the connection is being re-established
    Reconnecting,
    Stopping,
}

/// Start/stop/restart contract of a long-running component.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Load configuration and connect. Resolves once connected, or once
    /// interrupted by a concurrent `stop`/`restart`.
    async fn start(&self) -> Result<()>;

    /// Release all resources. Idempotent.
    async fn stop(&self);

    /// `stop` followed by `start`, as one serialized operation.
    async fn restart(&self, reason: &str) -> Result<()>;
}

/// One provisioned vehicle: configuration, broker connection and topic sinks.
pub struct Vehicle {
    source: Arc<dyn ConfigSource>,
    controller: RecoveryController,
    lock: Mutex<()>,
    config: RwLock<Option<Arc<VehicleConfig>>>,
    state_tx: watch::Sender<LifecycleState>,
}

impl Vehicle {
    pub fn new(source: Arc<dyn ConfigSource>, connector: Arc<dyn Connector>, sinks: Sinks) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Stopped);
        Self {
            source,
            controller: RecoveryController::new(connector, sinks),
            lock: Mutex::new(()),
            config: RwLock::new(None),
            state_tx,
        }
    }

    /// Current state. Reports `Reconnecting` while started but not live.
    pub fn state(&self) -> LifecycleState {
        let state = *self.state_tx.borrow();
        if state == LifecycleState::Connected && self.controller.state() != RecoveryState::Live {
            LifecycleState::Reconnecting
        } else {
            state
        }
    }

    /// Watch lifecycle transitions. `Reconnecting` is not published here; use
    /// [`Vehicle::state`] or [`Vehicle::subscribe_recovery`].
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_recovery(&self) -> watch::Receiver<RecoveryState> {
        self.controller.subscribe_state()
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.controller.state()
    }

    /// Configuration of the current run, if started.
    pub fn config(&self) -> Option<Arc<VehicleConfig>> {
        self.config.read().clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.controller.stats()
    }

    fn set_state(&self, state: LifecycleState) {
        self.state_tx.send_replace(state);
    }

    async fn start_locked(&self) -> Result<()> {
        if *self.state_tx.borrow() != LifecycleState::Stopped {
            return Err(VehicleError::AlreadyRunning);
        }

        let config = match self.source.load() {
            Ok(config) => Arc::new(config),
            Err(e) => {
                error!(
                    "Vehicle configuration can't be loaded from {}: {}",
                    self.source.describe(),
                    e
                );
                return Err(e.into());
            }
        };

        self.set_state(LifecycleState::Starting);
        info!("Starting vehicle {}", config.vehicle_id);
        *self.config.write() = Some(Arc::clone(&config));

        match self.controller.connect(Arc::clone(&config)).await {
            ConnectOutcome::Live => {
                self.set_state(LifecycleState::Connected);
                info!("Vehicle {} started", config.vehicle_id);
            }
            ConnectOutcome::Cancelled => {
                info!("Start of vehicle {} interrupted", config.vehicle_id);
                self.controller.shutdown().await;
                *self.config.write() = None;
                self.set_state(LifecycleState::Stopped);
            }
        }
        Ok(())
    }

    async fn stop_locked(&self) {
        let running = *self.state_tx.borrow() != LifecycleState::Stopped;
        if running {
            self.set_state(LifecycleState::Stopping);
            info!("Stopping vehicle");
        }

        self.controller.shutdown().await;
        *self.config.write() = None;

        if running {
            self.set_state(LifecycleState::Stopped);
            info!("Vehicle stopped");
        }
    }
}

#[async_trait]
impl Lifecycle for Vehicle {
    async fn start(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.start_locked().await
    }

    async fn stop(&self) {
        let _interrupt = self.controller.hold_interrupted();
        let _guard = self.lock.lock().await;
        self.stop_locked().await;
    }

    async fn restart(&self, reason: &str) -> Result<()> {
        let interrupt = self.controller.hold_interrupted();
        let _guard = self.lock.lock().await;
        info!("{}", reason);
        self.stop_locked().await;
        // Requests queued behind this one still cancel the start half
        drop(interrupt);
        self.start_locked().await
    }
}

impl Drop for Vehicle {
    fn drop(&mut self) {
        self.controller.halt();
    }
}
