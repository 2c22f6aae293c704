// File watcher that re-runs incremental indexing on changes

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::scan::relative_path;
use super::IndexMode;
use crate::config::PathFilter;
use crate::engine::CodeIndex;

/// Quiet period before a burst of events triggers one indexing pass
const DEBOUNCE: Duration = Duration::from_millis(300);

/// File watcher for automatic re-indexing
pub struct FileWatcher {
    index: Arc<CodeIndex>,
    root: PathBuf,
    filter: PathFilter,
}

impl FileWatcher {
    /// Create a new file watcher
    pub fn new(index: Arc<CodeIndex>) -> Result<Self> {
        let filter = index.config().path_filter()?;
        let root = index.root().to_path_buf();
        Ok(Self {
            index,
            root,
            filter,
        })
    }

    /// Start watching for file changes; runs until the event stream closes
    pub async fn watch(&self) -> Result<()> {
        info!("Starting file watcher for: {}", self.root.display());

        let (tx, mut rx) = mpsc::channel(256);

        // notify calls back on its own thread, outside the runtime
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if tx.blocking_send(event).is_err() {
                        debug!("Watcher channel closed");
                    }
                }
                Err(e) => error!("File watch error: {}", e),
            },
            Config::default(),
        )?;

        watcher.watch(&self.root, RecursiveMode::Recursive)?;

        info!("File watcher started. Monitoring for changes...");

        while let Some(event) = rx.recv().await {
            let mut relevant = self.is_relevant(&event);

            // Coalesce the burst that usually follows a save
            while let Ok(Some(next)) = tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                relevant |= self.is_relevant(&next);
            }

            if relevant {
                self.reindex().await;
            }
        }

        Ok(())
    }

    /// Check if an event touches a file we index
    fn is_relevant(&self, event: &Event) -> bool {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return false;
        }

        event.paths.iter().any(|path| {
            relative_path(&self.root, path)
                .map(|rel| self.filter.should_index(&rel) && self.index.can_index(&rel))
                .unwrap_or(false)
        })
    }

    async fn reindex(&self) {
        let index = Arc::clone(&self.index);
        let outcome =
            tokio::task::spawn_blocking(move || index.index_project(IndexMode::Incremental)).await;

        match outcome {
            Ok(Ok(report)) => info!(
                "Re-indexed: {} added, {} modified, {} removed, {} errored",
                report.added.len(),
                report.modified.len(),
                report.removed.len(),
                report.errored.len()
            ),
            // Indexing errors must not stop the watcher
            Ok(Err(e)) => warn!("Re-index failed: {}", e),
            Err(e) => error!("Re-index task panicked: {}", e),
        }
    }
}

/// Start the file watcher for a project
pub async fn start_watcher(index: Arc<CodeIndex>) -> Result<()> {
    let watcher = FileWatcher::new(index)?;
    watcher.watch().await
}
