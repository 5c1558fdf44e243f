// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

use crate::aggregate::{AggregationMode, ProgressAggregator};
use crate::bus::{EventBus, EventSubscription};
use crate::disk::{DiskUsage, clean_partial_files};
use crate::error::{OptionsError, ServiceError};
use crate::event::{AggregatedEvent, JobState, TransferEvent};
use crate::item::{Downloadable, Metadata, TransferJob};
use crate::paths::{DEFAULT_EXTENSION, DownloadDirectory, SharedPathResolver};
use crate::record::{DownloadRecord, list_records, read_record};
use crate::transfer::{DEFAULT_MAX_CONCURRENT, TransferQueue, WorkerDeps};
use crate::transport::SharedTransport;

/// Options for a download service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Maximum number of concurrent transfers
    pub max_concurrent: usize,
    /// Extension of downloaded files, used by `with_directory`
    pub file_extension: String,
    pub aggregation: AggregationMode,
    /// Write a JSON completion record next to each finished file
    pub write_records: bool,
    /// Remove `.partial` files left by an earlier process on start
    pub clean_partials_on_start: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            file_extension: DEFAULT_EXTENSION.to_string(),
            aggregation: AggregationMode::default(),
            write_records: true,
            clean_partials_on_start: true,
        }
    }
}

impl ServiceOptions {
    /// Load options from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, OptionsError> {
        let content = std::fs::read_to_string(path).map_err(|e| OptionsError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_json::from_str(&content).map_err(|e| OptionsError::JsonParseFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Background download manager.
///
/// Owns the transfer queue, the event bus, the progress aggregator and the
/// disk usage tracker. Cloning is cheap and every clone drives the same
/// service. Dropping the last clone cancels whatever is still running.
#[derive(Clone)]
pub struct DownloadService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    paths: SharedPathResolver,
    bus: Arc<EventBus>,
    queue: TransferQueue,
    disk: DiskUsage,
    dir_lock: Arc<RwLock<()>>,
    aggregate: watch::Receiver<Option<AggregatedEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        self.queue.close();
        self.bus.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl DownloadService {
    /// Create a service writing through `paths`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        transport: SharedTransport,
        paths: SharedPathResolver,
        options: ServiceOptions,
    ) -> Self {
        if options.clean_partials_on_start
            && let Some(dir) = paths.destination_directory()
        {
            let cleaned = clean_partial_files(&dir);
            if cleaned > 0 {
                tracing::info!(dir = %dir.display(), cleaned, "Removed stale partial files");
            }
        }

        let bus = Arc::new(EventBus::new());
        let dir_lock = Arc::new(RwLock::new(()));
        let disk = DiskUsage::new(paths.clone(), dir_lock.clone());

        let queue = TransferQueue::new(
            WorkerDeps {
                transport,
                paths: paths.clone(),
                bus: bus.clone(),
                dir_lock: dir_lock.clone(),
                write_records: options.write_records,
            },
            options.max_concurrent,
        );

        let (aggregate_tx, aggregate) = watch::channel(None);
        let tasks = vec![
            tokio::spawn(run_aggregator(
                bus.subscribe(),
                options.aggregation,
                aggregate_tx,
            )),
            tokio::spawn(run_size_tracker(bus.subscribe(), disk.clone())),
        ];

        Self {
            inner: Arc::new(ServiceInner {
                paths,
                bus,
                queue,
                disk,
                dir_lock,
                aggregate,
                tasks,
            }),
        }
    }

    /// Create a service downloading into `dir`
    pub fn with_directory(
        transport: SharedTransport,
        dir: impl Into<PathBuf>,
        options: ServiceOptions,
    ) -> Self {
        let paths = DownloadDirectory::new(dir.into())
            .with_extension(options.file_extension.clone())
            .shared();
        Self::new(transport, paths, options)
    }

    /// Submit an item for download.
    ///
    /// Returns once the job is enqueued. Submitting an item that is
    /// already active succeeds without creating a second job. How the
    /// transfer ends is only observable through `events()`.
    pub fn download(&self, item: &dyn Downloadable, metadata: Metadata) -> Result<(), ServiceError> {
        self.inner.queue.submit(item, metadata)
    }

    /// Remove an item's file and record.
    ///
    /// An active job for the item is cancelled first. Removing a file
    /// that does not exist succeeds.
    pub async fn delete(&self, item: &dyn Downloadable) -> Result<(), ServiceError> {
        let paths = &self.inner.paths;
        let Some(path) = paths.path_for(item.id()) else {
            return Err(ServiceError::DirectoryUnavailable);
        };

        if self.inner.queue.cancel(item.id()) {
            self.inner.queue.wait_until_inactive(item.id()).await;
        }

        {
            let _guard = self.inner.dir_lock.write().await;
            remove_if_present(&path).await?;
            if let Some(record_path) = paths.record_path_for(item.id()) {
                remove_if_present(&record_path).await?;
            }
        }

        tracing::info!(id = %item.id(), "Download deleted");
        let job = TransferJob::snapshot(item, Metadata::new());
        self.inner.bus.publish(TransferEvent::Deleted(Arc::new(job)));

        self.inner.disk.refresh().await;
        Ok(())
    }

    /// Remove the whole download directory, cancelling every active job
    pub async fn delete_all(&self) -> Result<(), ServiceError> {
        let Some(dir) = self.inner.paths.destination_directory() else {
            return Err(ServiceError::DirectoryUnavailable);
        };

        self.cancel_and_wait_all().await;

        {
            let _guard = self.inner.dir_lock.write().await;
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ServiceError::RemoveDirectoryFailed {
                        path: dir,
                        source: e,
                    });
                }
            }
        }

        tracing::info!(dir = %dir.display(), "All downloads deleted");
        self.inner.disk.refresh().await;
        Ok(())
    }

    /// Whether the item's file exists at its destination path.
    ///
    /// An unresolvable destination counts as not downloaded.
    pub async fn is_downloaded(&self, item: &dyn Downloadable) -> Result<bool, ServiceError> {
        let Some(path) = self.inner.paths.path_for(item.id()) else {
            return Ok(false);
        };

        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| ServiceError::ExistsCheckFailed { path, source: e })
    }

    /// Pause an active job. Returns false when the item is not active.
    pub fn pause(&self, item: &dyn Downloadable) -> bool {
        self.inner.queue.pause(item.id())
    }

    /// Resume a paused job. Returns false when the item is not active.
    pub fn resume(&self, item: &dyn Downloadable) -> bool {
        self.inner.queue.resume(item.id())
    }

    /// Cancel an active job. Returns false when the item is not active.
    pub fn cancel(&self, item: &dyn Downloadable) -> bool {
        self.inner.queue.cancel(item.id())
    }

    /// Cancel every active job, returning how many were cancelled
    pub fn cancel_all(&self) -> usize {
        self.inner.queue.cancel_all()
    }

    /// Stop the service.
    ///
    /// Further submissions fail with `ServiceError::ShutDown`, active jobs
    /// are cancelled and waited for, then every event stream ends.
    pub async fn shutdown(&self) {
        self.inner.queue.close();
        self.cancel_and_wait_all().await;
        self.inner.bus.close();
        tracing::info!("Download service shut down");
    }

    pub fn is_active(&self, item: &dyn Downloadable) -> bool {
        self.inner.queue.is_active(item.id())
    }

    pub fn state(&self, item: &dyn Downloadable) -> Option<JobState> {
        self.inner.queue.state(item.id())
    }

    /// Active jobs in submission order
    pub fn active_jobs(&self) -> Vec<(Arc<TransferJob>, JobState)> {
        self.inner.queue.active_jobs()
    }

    /// Stream of every per-job event published from now on
    pub fn events(&self) -> impl Stream<Item = TransferEvent> + Send + 'static {
        self.subscribe().into_stream()
    }

    /// Subscription handle for per-job events
    pub fn subscribe(&self) -> EventSubscription {
        self.inner.bus.subscribe()
    }

    /// Combined progress over all non-silent jobs.
    ///
    /// Only the latest snapshot is kept; a slow reader skips
    /// intermediate values.
    pub fn aggregated_events(&self) -> impl Stream<Item = AggregatedEvent> + Send + 'static {
        WatchStream::from_changes(self.inner.aggregate.clone())
            .filter_map(futures::future::ready)
    }

    /// The latest combined progress, if anything is being tracked
    pub fn aggregate_snapshot(&self) -> Option<AggregatedEvent> {
        self.inner.aggregate.borrow().clone()
    }

    /// Cached size of the download directory, starting with the current value
    pub fn downloaded_size(&self) -> impl Stream<Item = u64> + Send + 'static {
        WatchStream::new(self.inner.disk.subscribe())
    }

    pub fn downloaded_size_now(&self) -> u64 {
        self.inner.disk.current()
    }

    /// Rescan the download directory and return the new size
    pub async fn refresh_size(&self) -> u64 {
        self.inner.disk.refresh().await
    }

    /// Completion records of every finished download, ordered by id
    pub async fn downloads(&self) -> Result<Vec<DownloadRecord>, ServiceError> {
        let Some(dir) = self.inner.paths.destination_directory() else {
            return Ok(Vec::new());
        };
        let _guard = self.inner.dir_lock.read().await;
        Ok(list_records(&dir)?)
    }

    /// Completion record for one item, if it has been downloaded
    pub async fn record(
        &self,
        item: &dyn Downloadable,
    ) -> Result<Option<DownloadRecord>, ServiceError> {
        let Some(path) = self.inner.paths.record_path_for(item.id()) else {
            return Ok(None);
        };
        let _guard = self.inner.dir_lock.read().await;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(read_record(&path)?))
    }

    async fn cancel_and_wait_all(&self) {
        let queue = &self.inner.queue;
        let active: Vec<String> = queue
            .active_jobs()
            .into_iter()
            .map(|(job, _)| job.id.clone())
            .collect();

        queue.cancel_all();
        for id in &active {
            queue.wait_until_inactive(id).await;
        }
    }
}

async fn remove_if_present(path: &Path) -> Result<(), ServiceError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ServiceError::RemoveFileFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Fold non-silent events into the aggregate snapshot channel
async fn run_aggregator(
    mut events: EventSubscription,
    mode: AggregationMode,
    tx: watch::Sender<Option<AggregatedEvent>>,
) {
    let mut aggregator = ProgressAggregator::new(mode);

    while let Some(event) = events.recv().await {
        if event.job().is_silent() {
            continue;
        }

        match aggregator.apply(&event) {
            Some(snapshot) => {
                tx.send_replace(Some(snapshot));
            }
            None if aggregator.tracked_count() == 0 => {
                tx.send_if_modified(|current| current.take().is_some());
            }
            None => {}
        }
    }
}

/// Rescan the directory on every job state transition
async fn run_size_tracker(mut events: EventSubscription, disk: DiskUsage) {
    disk.refresh().await;

    while let Some(event) = events.recv().await {
        if !matches!(event, TransferEvent::InProgress { .. }) {
            disk.refresh().await;
        }
    }
}
