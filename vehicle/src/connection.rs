//! Broker connection ownership
//!
//! [`BrokerConnection`] opens a connection plus session pair through a
//! [`Connector`] and hands it out as a [`ConnectionHandle`]. The handle owns both
//! resources and is the only place they are closed.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mq_client::{BrokerAddress, Connection, Connector, FailureSignal, Session};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;

/// Process-unique identifier of a [`ConnectionHandle`].
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct HandleId(u64);

impl HandleId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Opens broker connections. Errors are reported to the caller, never retried.
pub struct BrokerConnection {
    connector: Arc<dyn Connector>,
    next_id: AtomicU64,
}

impl BrokerConnection {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            next_id: AtomicU64::new(1),
        }
    }

    /// Connect to `address` and create a session on the new connection.
    ///
    /// If the session cannot be created the connection is closed before the
    /// error is returned, so a failed open never leaks a connection.
    pub async fn open(&self, address: &BrokerAddress) -> Result<ConnectionHandle, ConnectionError> {
        let mut connection =
            self.connector
                .connect(address)
                .await
                .map_err(|source| ConnectionError::Open {
                    address: address.to_string(),
                    source,
                })?;

        let session = match connection.create_session().await {
            Ok(session) => session,
            Err(source) => {
                if let Err(e) = connection.close().await {
                    debug!("Closing connection after session failure: {}", e);
                }
                return Err(ConnectionError::Session(source));
            }
        };

        let id = HandleId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let failure = connection.take_failure_signal();
        info!("Connection {} opened to {}", id, address);

        Ok(ConnectionHandle {
            id,
            address: address.clone(),
            connection: Some(connection),
            session: Some(Arc::from(session)),
            failure,
            watcher: None,
            dead: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Close `handle`. Equivalent to [`ConnectionHandle::close`].
    pub async fn close(&self, handle: &mut ConnectionHandle) {
        handle.close().await;
    }
}

/// One live connection and session pair.
pub struct ConnectionHandle {
    id: HandleId,
    address: BrokerAddress,
    connection: Option<Box<dyn Connection>>,
    session: Option<Arc<dyn Session>>,
    failure: Option<FailureSignal>,
    watcher: Option<JoinHandle<()>>,
    dead: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    /// The session, while the handle is open.
    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.session.clone()
    }

    /// True until `close()` runs or an async failure is reported.
    pub fn is_open(&self) -> bool {
        self.connection.is_some() && !self.is_dead()
    }

    /// True once the transport reported an asynchronous failure.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Register the single observer for asynchronous connection failures.
    ///
    /// `handler` runs at most once, on a spawned task, and only for failures
    /// reported before `close()`. Returns false (and logs a warning) when an
    /// observer was already registered or the handle is closed.
    pub fn on_async_failure<F>(&mut self, handler: F) -> bool
    where
        F: FnOnce(HandleId, ConnectionError) + Send + 'static,
    {
        let Some(signal) = self.failure.take() else {
            warn!("Failure observer for {} already registered or handle closed", self.id);
            return false;
        };

        let id = self.id;
        let dead = Arc::clone(&self.dead);
        self.watcher = Some(tokio::spawn(async move {
            // A dropped sender means the transport shut down cleanly
            if let Ok(source) = signal.await {
                dead.store(true, Ordering::SeqCst);
                handler(id, ConnectionError::Disrupted { handle: id, source });
            }
        }));
        true
    }

    /// Close the session, then the connection. Idempotent and infallible.
    pub async fn close(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.failure = None;

        let session = self.session.take();
        let connection = self.connection.take();
        if session.is_none() && connection.is_none() {
            return;
        }

        if let Some(session) = session {
            if let Err(e) = session.close().await {
                debug!("Session close on {} failed: {}", self.id, e);
            }
        }
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                debug!("Connection close on {} failed: {}", self.id, e);
            }
        }
        info!("Connection {} closed", self.id);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("address", &self.address.as_str())
            .field("open", &self.is_open())
            .field("dead", &self.is_dead())
            .finish()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if self.connection.is_some() {
            warn!("Connection {} dropped without close", self.id);
        }
    }
}
