//! Payload sinks for the active topic roles
//!
//! - [`ContentSink`] persists content packages through a [`ContentStore`]
//! - [`MessageSink`] logs operator messages and optionally forwards them

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::TopicRole;
use crate::error::{DeliveryError, PersistenceError};
use crate::subscription::PayloadSink;

/// Default work directory for persisted content.
pub const DEFAULT_WORKDIR: &str = "workdir";

/// Durable storage for content payloads, keyed by topic.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Replace the stored payload for `topic` with `payload`.
    async fn store(&self, topic: &str, payload: &[u8]) -> Result<(), PersistenceError>;
}

/// Stores each topic's payload as `<root>/content/<topic>.zip`.
///
/// Hierarchical topics map to a single file name: `/`, `\\` and `%` are
/// percent-encoded, so `train/content` is stored as `train%2Fcontent.zip`.
///
/// Writes go to a unique temp file in the same directory which is synced and
/// then renamed over the target, so readers see either the old or the new
/// payload, never a partial one.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the stored content files.
    pub fn content_dir(&self) -> PathBuf {
        self.root.join("content")
    }

    /// Final path for `topic`, if the topic is a valid storage key.
    pub fn path_for(&self, topic: &str) -> Result<PathBuf, PersistenceError> {
        let stem = file_stem(topic)?;
        Ok(self.content_dir().join(format!("{stem}.zip")))
    }
}

impl Default for FsContentStore {
    fn default() -> Self {
        Self::new(DEFAULT_WORKDIR)
    }
}

fn file_stem(topic: &str) -> Result<String, PersistenceError> {
    if topic.is_empty() || topic.contains('\0') {
        return Err(PersistenceError::InvalidKey(topic.to_string()));
    }
    let mut stem = String::with_capacity(topic.len());
    for c in topic.chars() {
        match c {
            '%' => stem.push_str("%25"),
            '/' => stem.push_str("%2F"),
            '\\' => stem.push_str("%5C"),
            c => stem.push(c),
        }
    }
    Ok(stem)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn write_synced(path: &Path, payload: &[u8]) -> Result<(), PersistenceError> {
    let mut file = fs::File::create(path).await.map_err(io_error(path))?;
    file.write_all(payload).await.map_err(io_error(path))?;
    file.sync_all().await.map_err(io_error(path))?;
    Ok(())
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn store(&self, topic: &str, payload: &[u8]) -> Result<(), PersistenceError> {
        let stem = file_stem(topic)?;
        let dir = self.content_dir();
        let target = dir.join(format!("{stem}.zip"));
        fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;

        let temp = dir.join(format!(".{stem}.{}.tmp", Uuid::new_v4()));
        let written = match write_synced(&temp, payload).await {
            Ok(()) => fs::rename(&temp, &target).await.map_err(io_error(&target)),
            Err(e) => Err(e),
        };
        if written.is_err() {
            let _ = fs::remove_file(&temp).await;
        }
        written?;

        debug!(
            "Stored {} bytes for topic '{}' at {}",
            payload.len(),
            topic,
            target.display()
        );
        Ok(())
    }
}

/// Persists content payloads.
pub struct ContentSink<S: ContentStore> {
    store: S,
}

impl<S: ContentStore> ContentSink<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S: ContentStore> PayloadSink for ContentSink<S> {
    async fn deliver(&self, topic: &str, payload: Bytes) -> Result<(), DeliveryError> {
        self.store.store(topic, &payload).await?;
        info!("MQ content received and assembled correctly.");
        Ok(())
    }
}

/// A text message received on the messages topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleMessage {
    pub topic: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Logs operator messages and forwards them to an optional listener.
#[derive(Debug, Default)]
pub struct MessageSink {
    listener: Option<mpsc::UnboundedSender<VehicleMessage>>,
}

impl MessageSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink that also forwards every message to the returned receiver.
    pub fn with_listener() -> (Self, mpsc::UnboundedReceiver<VehicleMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { listener: Some(tx) }, rx)
    }
}

#[async_trait]
impl PayloadSink for MessageSink {
    async fn deliver(&self, topic: &str, payload: Bytes) -> Result<(), DeliveryError> {
        let text = String::from_utf8_lossy(&payload).into_owned();
        info!("Message received from MQ topic: {}", text);

        if let Some(listener) = &self.listener {
            let message = VehicleMessage {
                topic: topic.to_string(),
                text,
                received_at: Utc::now(),
            };
            if listener.send(message).is_err() {
                debug!("Message listener dropped; message for '{}' not forwarded", topic);
            }
        }
        Ok(())
    }
}

/// The sinks bound to the active topic roles.
#[derive(Clone)]
pub struct Sinks {
    pub content: Arc<dyn PayloadSink>,
    pub messages: Arc<dyn PayloadSink>,
}

impl Sinks {
    pub fn new(content: Arc<dyn PayloadSink>, messages: Arc<dyn PayloadSink>) -> Self {
        Self { content, messages }
    }

    /// Content persisted under `workdir`, messages logged only.
    pub fn filesystem(workdir: impl Into<PathBuf>) -> Self {
        Self::new(
            Arc::new(ContentSink::new(FsContentStore::new(workdir))),
            Arc::new(MessageSink::new()),
        )
    }

    /// The sink for `role`, or `None` for roles that are not subscribed.
    pub fn for_role(&self, role: TopicRole) -> Option<Arc<dyn PayloadSink>> {
        match role {
            TopicRole::Content => Some(Arc::clone(&self.content)),
            TopicRole::Messages => Some(Arc::clone(&self.messages)),
            TopicRole::Realtime | TopicRole::Gtfs => None,
        }
    }
}
