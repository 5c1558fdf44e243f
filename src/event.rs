// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use crate::error::TransferError;
use crate::item::{Metadata, TransferJob};

/// Lifecycle events for a single job
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// The job was accepted by the queue
    Queued(Arc<TransferJob>),

    /// Byte-level progress reported by the transport
    InProgress {
        job: Arc<TransferJob>,
        bytes_completed: u64,
        /// Total size in bytes, if the server announced one
        bytes_total: Option<u64>,
    },

    /// The file was moved to its final destination
    Finished(Arc<TransferJob>),

    /// The transfer failed or was cancelled
    Error {
        job: Arc<TransferJob>,
        cause: Arc<TransferError>,
    },

    /// The downloaded file was removed from disk
    Deleted(Arc<TransferJob>),
}

impl TransferEvent {
    pub fn job(&self) -> &Arc<TransferJob> {
        match self {
            Self::Queued(job) | Self::Finished(job) | Self::Deleted(job) => job,
            Self::InProgress { job, .. } | Self::Error { job, .. } => job,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job().id
    }

    /// Terminal events end a job's observable lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished(_) | Self::Error { .. } | Self::Deleted(_)
        )
    }

    /// True for the `Error` emitted when a job was cancelled
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Error { cause, .. } if cause.is_cancelled())
    }
}

/// Observable state of an active (non-terminal) job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for a free transfer slot
    Queued,
    Running,
    Paused,
}

/// One combined progress snapshot over every tracked job
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedEvent {
    /// Jobs currently tracked, in the order they were first seen
    pub items: Vec<Arc<TransferJob>>,
    /// Combined progress in `[0, 1]`
    pub combined_fraction_complete: f64,
    pub is_finished: bool,
    /// Union of all tracked jobs' metadata, later jobs winning on conflicts
    pub merged_metadata: Metadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn make_job(id: &str) -> Arc<TransferJob> {
        Arc::new(TransferJob {
            id: id.to_string(),
            title: format!("Episode {id}"),
            remote_url: Url::parse("https://example.com/a.mp3").unwrap(),
            metadata: Metadata::new(),
        })
    }

    #[test]
    fn terminal_events_are_classified() {
        let job = make_job("ep1");

        assert!(!TransferEvent::Queued(job.clone()).is_terminal());
        assert!(
            !TransferEvent::InProgress {
                job: job.clone(),
                bytes_completed: 1,
                bytes_total: Some(2),
            }
            .is_terminal()
        );
        assert!(TransferEvent::Finished(job.clone()).is_terminal());
        assert!(TransferEvent::Deleted(job.clone()).is_terminal());
        assert!(
            TransferEvent::Error {
                job,
                cause: Arc::new(TransferError::Cancelled),
            }
            .is_terminal()
        );
    }

    #[test]
    fn cancellation_error_is_recognised() {
        let job = make_job("ep1");
        let cancelled = TransferEvent::Error {
            job: job.clone(),
            cause: Arc::new(TransferError::Cancelled),
        };
        let failed = TransferEvent::Error {
            job,
            cause: Arc::new(TransferError::DirectoryUnavailable),
        };

        assert!(cancelled.is_cancellation());
        assert!(!failed.is_cancellation());
        assert_eq!(cancelled.job_id(), "ep1");
    }
}
