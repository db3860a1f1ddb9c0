//! Configuration file watcher
//!
//! Watches the directory holding the configuration file and restarts the
//! vehicle whenever the file is created, modified or removed.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::WatchError;
use crate::lifecycle::Lifecycle;

/// Reason logged by the restart triggered on a configuration change.
pub const RESTART_REASON: &str = "Configuration values were altered. Applying the new ones.";

/// Default quiet period before a burst of file events triggers a restart.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Restarts a [`Lifecycle`] when its configuration file changes.
///
/// Each restart runs on its own task, so a newer change can interrupt a
/// restart that is still blocked reconnecting.
pub struct ConfigWatcher {
    path: PathBuf,
    debouncer: Option<Debouncer<RecommendedWatcher>>,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `path`. Must be called from within a tokio runtime.
    pub fn spawn(
        path: impl Into<PathBuf>,
        lifecycle: Arc<dyn Lifecycle>,
        debounce: Duration,
    ) -> Result<Self, WatchError> {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| WatchError::InvalidPath(path.clone()))?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watched = file_name.clone();
        let mut debouncer = new_debouncer(debounce, move |result: DebounceEventResult| match result {
            Ok(events) => {
                if touches(events.iter().map(|e| e.path.as_path()), &watched) {
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!("Configuration watch error: {}", e),
        })?;
        debouncer.watcher().watch(&dir, RecursiveMode::NonRecursive)?;
        info!("Watching {} for configuration changes", path.display());

        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                debug!("Configuration file {:?} changed", file_name);
                let lifecycle = Arc::clone(&lifecycle);
                tokio::spawn(async move {
                    if let Err(e) = lifecycle.restart(RESTART_REASON).await {
                        error!("Restart after configuration change failed: {}", e);
                    }
                });
            }
        });

        Ok(Self {
            path,
            debouncer: Some(debouncer),
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop watching. Restarts already in flight are not cancelled.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.debouncer.take();
        self.task.abort();
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn touches<'a>(mut paths: impl Iterator<Item = &'a Path>, file_name: &OsString) -> bool {
    paths.any(|path| path.file_name() == Some(file_name.as_os_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touches_matches_file_name_only() {
        let name = OsString::from("provisioning.properties");
        let changed = [
            Path::new("/etc/x"),
            Path::new("/opt/conf/provisioning.properties"),
        ];
        assert!(touches(changed.into_iter(), &name));
        assert!(!touches(
            std::iter::once(Path::new("/opt/conf/provisioning.properties.swp")),
            &name
        ));
        assert!(!touches(std::iter::empty(), &name));
    }

    #[tokio::test]
    async fn test_spawn_rejects_path_without_file_name() {
        struct Idle;

        #[async_trait::async_trait]
        impl Lifecycle for Idle {
            async fn start(&self) -> crate::error::Result<()> {
                Ok(())
            }
            async fn stop(&self) {}
            async fn restart(&self, _reason: &str) -> crate::error::Result<()> {
                Ok(())
            }
        }

        let result = ConfigWatcher::spawn("/", Arc::new(Idle), DEFAULT_DEBOUNCE);
        assert!(matches!(result, Err(WatchError::InvalidPath(_))));
    }
}
