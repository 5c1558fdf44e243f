// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use tokio::runtime::Handle;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{ServiceError, TransferError};
use crate::event::{JobState, TransferEvent};
use crate::item::{Downloadable, Metadata, TransferJob};

use super::worker::{WorkerContext, WorkerDeps, run_transfer};

/// Default number of transfers allowed to run at the same time
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Control handles for one active job
struct JobControl {
    job: Arc<TransferJob>,
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    started: AtomicBool,
}

impl JobControl {
    fn new(job: Arc<TransferJob>) -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            job,
            cancel: CancellationToken::new(),
            pause,
            started: AtomicBool::new(false),
        }
    }

    fn state(&self) -> JobState {
        if *self.pause.borrow() {
            JobState::Paused
        } else if self.started.load(Ordering::SeqCst) {
            JobState::Running
        } else {
            JobState::Queued
        }
    }
}

#[derive(Default)]
struct QueueState {
    /// Every non-terminal job, in submission order
    active: IndexMap<String, JobControl>,
    /// Ids waiting for a free slot, oldest first
    pending: VecDeque<String>,
    running: usize,
    closed: bool,
}

struct QueueInner {
    deps: WorkerDeps,
    max_concurrent: usize,
    runtime: Handle,
    state: Mutex<QueueState>,
    /// Woken whenever a job leaves the active set
    retired: Notify,
}

/// Bounded-concurrency scheduler for transfer jobs.
///
/// Membership, the pending list and event publication for queue-driven
/// transitions all happen under one lock, so duplicate submissions are
/// rejected even when callers race, and a job's `Queued` event always
/// precedes anything its worker emits.
#[derive(Clone)]
pub struct TransferQueue {
    inner: Arc<QueueInner>,
}

impl TransferQueue {
    /// Create a queue running at most `max_concurrent` transfers at once.
    ///
    /// Must be called from within a Tokio runtime; workers are spawned on it.
    pub fn new(deps: WorkerDeps, max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                deps,
                max_concurrent: max_concurrent.max(1),
                runtime: Handle::current(),
                state: Mutex::new(QueueState::default()),
                retired: Notify::new(),
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Accept an item for download.
    ///
    /// Succeeds without doing anything if a job with the same id is
    /// already active. Success means the job was enqueued, not that it
    /// will finish.
    pub fn submit(&self, item: &dyn Downloadable, metadata: Metadata) -> Result<(), ServiceError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(ServiceError::ShutDown);
        }
        if state.active.contains_key(item.id()) {
            tracing::debug!(id = %item.id(), "Ignoring duplicate submission");
            return Ok(());
        }

        let job = Arc::new(TransferJob::snapshot(item, metadata));
        tracing::info!(id = %job.id, title = %job.title, "Download queued");

        // Register and announce under the lock so no worker event can precede Queued
        state
            .active
            .insert(job.id.clone(), JobControl::new(job.clone()));
        state.pending.push_back(job.id.clone());
        self.inner.deps.bus.publish(TransferEvent::Queued(job));

        self.inner.schedule(&mut state);
        Ok(())
    }

    /// Pause an active job. Returns false if no active job has this id.
    pub fn pause(&self, id: &str) -> bool {
        self.set_paused(id, true)
    }

    /// Resume a paused job. Returns false if no active job has this id.
    pub fn resume(&self, id: &str) -> bool {
        self.set_paused(id, false)
    }

    /// Cancel an active job.
    ///
    /// A job still waiting for a slot ends immediately; a running job ends
    /// once its worker has torn the transfer down. Either way the job's
    /// final event is an `Error` whose cause is `TransferError::Cancelled`.
    /// Returns false if no active job has this id.
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = self.inner.lock();
        self.inner.cancel_locked(&mut state, id)
    }

    /// Cancel every active job, returning how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let mut state = self.inner.lock();
        let ids: Vec<String> = state.active.keys().cloned().collect();
        ids.iter()
            .filter(|id| self.inner.cancel_locked(&mut state, id))
            .count()
    }

    /// Stop accepting submissions and cancel everything
    pub fn close(&self) {
        self.inner.lock().closed = true;
        let cancelled = self.cancel_all();
        tracing::info!(cancelled, "Transfer queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.inner.lock().active.contains_key(id)
    }

    pub fn state(&self, id: &str) -> Option<JobState> {
        self.inner.lock().active.get(id).map(JobControl::state)
    }

    /// Active jobs in submission order
    pub fn active_jobs(&self) -> Vec<(Arc<TransferJob>, JobState)> {
        self.inner
            .lock()
            .active
            .values()
            .map(|control| (control.job.clone(), control.state()))
            .collect()
    }

    /// Wait until no job with this id is active
    pub async fn wait_until_inactive(&self, id: &str) {
        loop {
            let notified = self.inner.retired.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_active(id) {
                return;
            }
            notified.await;
        }
    }

    /// Number of workers currently holding a slot
    pub fn running_count(&self) -> usize {
        self.inner.lock().running
    }

    fn set_paused(&self, id: &str, paused: bool) -> bool {
        let state = self.inner.lock();
        let Some(control) = state.active.get(id) else {
            tracing::debug!(id, paused, "No active job to pause or resume");
            return false;
        };

        let was_paused = control.pause.send_replace(paused);
        if was_paused != paused {
            tracing::info!(id, paused, "Job pause state changed");
        }
        true
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start pending jobs while slots are free
    fn schedule(self: &Arc<Self>, state: &mut QueueState) {
        while state.running < self.max_concurrent {
            // Take the oldest waiting job
            let Some(id) = state.pending.pop_front() else {
                break;
            };
            let Some(control) = state.active.get(&id) else {
                continue;
            };

            // Claim a slot
            control.started.store(true, Ordering::SeqCst);
            state.running += 1;

            let ctx = WorkerContext {
                job: control.job.clone(),
                deps: self.deps.clone(),
                cancel: control.cancel.clone(),
                pause: control.pause.subscribe(),
            };
            tracing::info!(id = %id, running = state.running, "Download started");

            // Run the transfer, then hand the slot back
            let inner = Arc::clone(self);
            self.runtime.spawn(async move {
                let job = ctx.job.clone();
                let event = match run_transfer(ctx).await {
                    Ok(outcome) => {
                        tracing::info!(id = %job.id, bytes = outcome.bytes, "Download finished");
                        TransferEvent::Finished(job)
                    }
                    Err(e) => {
                        if e.is_cancelled() {
                            tracing::info!(id = %job.id, "Download cancelled");
                        } else {
                            tracing::warn!(id = %job.id, error = %e, "Download failed");
                        }
                        TransferEvent::Error {
                            job,
                            cause: Arc::new(e),
                        }
                    }
                };
                inner.finish(event);
            });
        }
    }

    /// Retire a running job and hand its slot to the next pending one
    fn finish(self: &Arc<Self>, event: TransferEvent) {
        let mut state = self.lock();
        state.active.shift_remove(event.job_id());
        state.running = state.running.saturating_sub(1);
        self.deps.bus.publish(event);
        self.retired.notify_waiters();
        self.schedule(&mut state);
    }

    fn cancel_locked(&self, state: &mut QueueState, id: &str) -> bool {
        let Some(control) = state.active.get(id) else {
            tracing::debug!(id, "No active job to cancel");
            return false;
        };

        if control.started.load(Ordering::SeqCst) {
            // The worker publishes the terminal event once teardown is done
            control.cancel.cancel();
            return true;
        }

        state.pending.retain(|pending| pending != id);
        if let Some(control) = state.active.shift_remove(id) {
            tracing::info!(id, "Queued download cancelled");
            self.deps.bus.publish(TransferEvent::Error {
                job: control.job,
                cause: Arc::new(TransferError::Cancelled),
            });
            self.retired.notify_waiters();
        }
        true
    }
}
