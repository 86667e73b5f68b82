//! Config file watcher
//!
//! Watches a bridge config file and applies edits to a running [`Bridge`].
//! A reload whose digest matches the active config is a no-op, so editor
//! save bursts do not flush the cache.

use crate::bridge::Bridge;
use crate::config::{ConfigProvider, FileProvider};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Configuration for the config watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce duration for file events
    pub debounce: Duration,
    /// Whether to apply the file's current contents on start
    pub load_existing: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            load_existing: true,
        }
    }
}

/// Reloads bridge config when its file changes
pub struct ConfigWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    shutdown_tx: mpsc::Sender<()>,
}

impl ConfigWatcher {
    /// Start watching `path` for `bridge`. Must be called within a tokio runtime.
    pub async fn new(
        bridge: Bridge,
        path: impl AsRef<Path>,
        config: WatcherConfig,
    ) -> Result<Self, WatcherError> {
        let path = path.as_ref().to_path_buf();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if !dir.is_dir() {
            return Err(WatcherError::Io(format!(
                "Config directory {} does not exist",
                dir.display()
            )));
        }

        if config.load_existing {
            Self::reload(&bridge, &path);
        }

        let (event_tx, mut event_rx) = mpsc::channel::<Event>(100);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = event_tx.blocking_send(event);
            }
        })
        .map_err(WatcherError::WatcherInit)?;

        // Watch the directory: editors often replace the file instead of writing it
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(WatcherError::WatcherInit)?;
        tracing::info!(path = %path.display(), "Watching bridge config");

        let file = path.clone();
        let debounce = config.debounce;
        tokio::spawn(async move {
            let mut deadline: Option<tokio::time::Instant> = None;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Config watcher shutting down");
                        break;
                    }

                    Some(event) = event_rx.recv() => {
                        if event.paths.iter().any(|p| same_file(p, &file)) {
                            deadline = Some(tokio::time::Instant::now() + debounce);
                        }
                    }

                    _ = async {
                        match deadline {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        deadline = None;
                        Self::reload(&bridge, &file);
                    }
                }
            }
        });

        Ok(Self {
            path,
            _watcher: watcher,
            shutdown_tx,
        })
    }

    /// Apply the file's config when it differs from the active one
    fn reload(bridge: &Bridge, path: &Path) -> bool {
        let provider = FileProvider::new(path);
        match provider.load() {
            Ok(Some(config)) => {
                if config.digest() == bridge.config().digest() {
                    tracing::debug!(path = %path.display(), "Config unchanged");
                    return false;
                }
                bridge.apply_config(config);
                true
            }
            Ok(None) => {
                tracing::debug!(path = %path.display(), "Config file empty or removed, keeping active config");
                false
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to reload config");
                false
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shutdown the watcher
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

fn same_file(event_path: &Path, file: &Path) -> bool {
    event_path == file || event_path.file_name() == file.file_name()
}

/// Errors that can occur while setting up the watcher
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Failed to initialize watcher: {0}")]
    WatcherInit(#[source] notify::Error),

    #[error("IO error: {0}")]
    Io(String),
}
