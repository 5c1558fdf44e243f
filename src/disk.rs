// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::Metadata as FileMetadata;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{RwLock, watch};
use walkdir::WalkDir;

use crate::paths::{PARTIAL_SUFFIX, SharedPathResolver};

/// Sum the allocated size of every file below `dir`.
///
/// A directory that does not exist is empty.
pub fn directory_size(dir: &Path) -> Result<u64, walkdir::Error> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut total: u64 = 0;
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total = total.saturating_add(allocated_size(&entry.metadata()?));
        }
    }
    Ok(total)
}

#[cfg(unix)]
fn allocated_size(metadata: &FileMetadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.blocks() * 512
}

#[cfg(not(unix))]
fn allocated_size(metadata: &FileMetadata) -> u64 {
    metadata.len()
}

/// Remove `.partial` files left behind by interrupted downloads.
///
/// Returns the number of files removed.
pub fn clean_partial_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    let mut cleaned = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_partial = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(PARTIAL_SUFFIX));

        if is_partial && std::fs::remove_file(&path).is_ok() {
            cleaned += 1;
        }
    }
    cleaned
}

/// Cached total size of the download directory
#[derive(Clone)]
pub struct DiskUsage {
    paths: SharedPathResolver,
    dir_lock: Arc<RwLock<()>>,
    size_tx: Arc<watch::Sender<u64>>,
}

impl DiskUsage {
    /// `dir_lock` is shared with the workers: scans take it exclusively so
    /// they never observe a half-finished move.
    pub fn new(paths: SharedPathResolver, dir_lock: Arc<RwLock<()>>) -> Self {
        let (size_tx, _) = watch::channel(0);
        Self {
            paths,
            dir_lock,
            size_tx: Arc::new(size_tx),
        }
    }

    /// Rescan the directory and publish the new size.
    ///
    /// Scan failures reset the size to zero instead of failing.
    pub async fn refresh(&self) -> u64 {
        let Some(dir) = self.paths.destination_directory() else {
            self.size_tx.send_replace(0);
            return 0;
        };

        let size = {
            let _guard = self.dir_lock.write().await;
            let scan_dir = dir.clone();
            match tokio::task::spawn_blocking(move || directory_size(&scan_dir)).await {
                Ok(Ok(size)) => size,
                Ok(Err(e)) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Directory scan failed, resetting size");
                    0
                }
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Directory scan aborted, resetting size");
                    0
                }
            }
        };

        self.size_tx.send_replace(size);
        size
    }

    /// The last computed size
    pub fn current(&self) -> u64 {
        *self.size_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.size_tx.subscribe()
    }
}
