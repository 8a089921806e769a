//! Regular files of one directory as watchable resources.
//!
//! `list` reads the directory; `watch` re-reads it every `poll_interval` and
//! turns the difference between consecutive snapshots into watch events.
//! Subdirectories and unreadable entries are skipped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::informer::{ListWatch, WatchEvent};

/// A file as seen by the last directory scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileObject {
    /// File name; also the cache key.
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl FileObject {
    /// Cache key function for an [`Indexer`](crate::cache::Indexer) of files.
    pub fn key(obj: &FileObject) -> Result<String> {
        Ok(obj.name.clone())
    }
}

/// [`ListWatch`] over the regular files of a directory.
pub struct DirectoryListWatch {
    dir: PathBuf,
    poll_interval: Duration,
    /// Snapshot the next watch starts diffing from.
    last_listing: Mutex<HashMap<String, FileObject>>,
}

impl DirectoryListWatch {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
            last_listing: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

async fn scan(dir: &Path) -> std::io::Result<HashMap<String, FileObject>> {
    let mut files = HashMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        files.insert(
            name.clone(),
            FileObject {
                name,
                path: entry.path(),
                size: metadata.len(),
                modified,
            },
        );
    }
    Ok(files)
}

/// Events turning `before` into `after`.
fn diff(
    before: &HashMap<String, FileObject>,
    after: &HashMap<String, FileObject>,
) -> Vec<WatchEvent<FileObject>> {
    let mut events = Vec::new();
    for (name, file) in after {
        match before.get(name) {
            None => events.push(WatchEvent::Added(file.clone())),
            Some(old) if old != file => events.push(WatchEvent::Modified(file.clone())),
            Some(_) => {}
        }
    }
    for (name, file) in before {
        if !after.contains_key(name) {
            events.push(WatchEvent::Deleted(file.clone()));
        }
    }
    events
}

#[async_trait]
impl ListWatch<FileObject> for DirectoryListWatch {
    async fn list(&self) -> anyhow::Result<Vec<FileObject>> {
        let files = scan(&self.dir).await?;
        let listing = files.values().cloned().collect();
        *self
            .last_listing
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = files;
        Ok(listing)
    }

    async fn watch(
        &self,
        shutdown: CancellationToken,
    ) -> anyhow::Result<mpsc::Receiver<WatchEvent<FileObject>>> {
        let (tx, rx) = mpsc::channel(64);
        let dir = self.dir.clone();
        let poll_interval = self.poll_interval;
        let mut previous = self
            .last_listing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(poll_interval) => {}
                }
                let current = match scan(&dir).await {
                    Ok(current) => current,
                    Err(e) => {
                        // Closing the channel makes the informer relist.
                        warn!(dir = %dir.display(), error = %e, "directory scan failed");
                        return;
                    }
                };
                for event in diff(&previous, &current) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                previous = current;
            }
        });

        Ok(rx)
    }
}
