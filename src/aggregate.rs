// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::event::{AggregatedEvent, TransferEvent};
use crate::item::{Metadata, TransferJob};

/// Units each job contributes when progress is averaged over fractions
pub const PRECISION_UNITS: u64 = 8192;

/// How per-job progress is combined into one number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    /// Exact `sum(completed) / sum(total)` when every job knows its size,
    /// falling back to `Fractions` otherwise
    #[default]
    Bytes,
    /// Average of per-job fractions, scaled to `PRECISION_UNITS` per job
    Fractions,
}

#[derive(Debug, Clone)]
struct TrackedJob {
    job: Arc<TransferJob>,
    completed: u64,
    total: Option<u64>,
    finished: bool,
}

impl TrackedJob {
    fn new(job: Arc<TransferJob>) -> Self {
        Self {
            job,
            completed: 0,
            total: None,
            finished: false,
        }
    }

    fn fraction(&self) -> f64 {
        if self.finished {
            return 1.0;
        }
        match self.total {
            Some(total) if total > 0 => (self.completed as f64 / total as f64).min(1.0),
            _ => 0.0,
        }
    }
}

/// Folds the event stream into combined progress snapshots.
///
/// Jobs are tracked from the first event that mentions them until they
/// fail or are deleted. Finished jobs stay tracked (at 100%) until a new
/// job arrives after the whole batch has finished.
#[derive(Debug, Default)]
pub struct ProgressAggregator {
    mode: AggregationMode,
    tracked: IndexMap<String, TrackedJob>,
    last: Option<AggregatedEvent>,
}

impl ProgressAggregator {
    pub fn new(mode: AggregationMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Apply one event, returning a snapshot if the combined state changed.
    ///
    /// Nothing is returned while no jobs are tracked.
    pub fn apply(&mut self, event: &TransferEvent) -> Option<AggregatedEvent> {
        match event {
            TransferEvent::Queued(job) => {
                // A new run of a known id starts from scratch
                let entry = self.track(job);
                *entry = TrackedJob::new(job.clone());
            }
            TransferEvent::InProgress {
                job,
                bytes_completed,
                bytes_total,
            } => {
                let entry = self.track(job);
                entry.completed = *bytes_completed;
                if bytes_total.is_some() {
                    entry.total = *bytes_total;
                }
            }
            TransferEvent::Finished(job) => {
                let entry = self.track(job);
                entry.finished = true;
                if let Some(total) = entry.total {
                    entry.completed = total;
                }
            }
            TransferEvent::Error { job, .. } | TransferEvent::Deleted(job) => {
                self.tracked.shift_remove(&job.id);
            }
        }

        let Some(snapshot) = self.snapshot() else {
            self.last = None;
            return None;
        };

        if self.last.as_ref() == Some(&snapshot) {
            return None;
        }
        self.last = Some(snapshot.clone());
        Some(snapshot)
    }

    /// The most recently emitted snapshot
    pub fn current(&self) -> Option<&AggregatedEvent> {
        self.last.as_ref()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    fn track(&mut self, job: &Arc<TransferJob>) -> &mut TrackedJob {
        if !self.tracked.contains_key(&job.id) && self.batch_finished() {
            self.tracked.clear();
        }
        self.tracked
            .entry(job.id.clone())
            .or_insert_with(|| TrackedJob::new(job.clone()))
    }

    fn batch_finished(&self) -> bool {
        !self.tracked.is_empty() && self.tracked.values().all(|tracked| tracked.finished)
    }

    fn snapshot(&self) -> Option<AggregatedEvent> {
        if self.tracked.is_empty() {
            return None;
        }

        let (mut completed_units, total_units) = self
            .byte_units()
            .unwrap_or_else(|| self.fraction_units());

        // Float drift must not keep a finished batch below 100%
        if self.tracked.values().all(|tracked| tracked.finished) {
            completed_units = total_units;
        }

        let combined_fraction_complete = if total_units == 0 {
            0.0
        } else {
            completed_units as f64 / total_units as f64
        };

        let mut merged_metadata = Metadata::new();
        for tracked in self.tracked.values() {
            merged_metadata.extend(tracked.job.metadata.clone());
        }

        Some(AggregatedEvent {
            items: self
                .tracked
                .values()
                .map(|tracked| tracked.job.clone())
                .collect(),
            combined_fraction_complete,
            is_finished: completed_units == total_units,
            merged_metadata,
        })
    }

    /// Exact byte counts, if the mode allows it and every size is known
    fn byte_units(&self) -> Option<(u64, u64)> {
        if self.mode != AggregationMode::Bytes {
            return None;
        }

        let mut completed = 0u64;
        let mut total = 0u64;
        for tracked in self.tracked.values() {
            let job_total = tracked.total?;
            total = total.saturating_add(job_total);
            completed = completed.saturating_add(tracked.completed.min(job_total));
        }

        (total > 0).then_some((completed, total))
    }

    fn fraction_units(&self) -> (u64, u64) {
        let total = self.tracked.len() as u64 * PRECISION_UNITS;
        let fraction_sum: f64 = self.tracked.values().map(TrackedJob::fraction).sum();
        let completed = (fraction_sum * PRECISION_UNITS as f64).floor() as u64;
        (completed.min(total), total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use serde_json::Value;
    use url::Url;

    fn make_job(id: &str) -> Arc<TransferJob> {
        Arc::new(TransferJob {
            id: id.to_string(),
            title: format!("Episode {id}"),
            remote_url: Url::parse("https://example.com/a.mp3").unwrap(),
            metadata: Metadata::new(),
        })
    }

    fn progress(job: &Arc<TransferJob>, done: u64, total: Option<u64>) -> TransferEvent {
        TransferEvent::InProgress {
            job: job.clone(),
            bytes_completed: done,
            bytes_total: total,
        }
    }

    #[test]
    fn averages_two_jobs() {
        let mut aggregator = ProgressAggregator::default();
        let a = make_job("a");
        let b = make_job("b");

        aggregator.apply(&TransferEvent::Queued(a.clone()));
        aggregator.apply(&TransferEvent::Queued(b.clone()));
        aggregator.apply(&progress(&a, 20, Some(100)));
        let snapshot = aggregator.apply(&progress(&b, 80, Some(100))).unwrap();

        assert!((snapshot.combined_fraction_complete - 0.5).abs() < 1e-9);
        assert!(!snapshot.is_finished);
        assert_eq!(snapshot.items.len(), 2);
    }

    #[test]
    fn fraction_mode_ignores_file_sizes() {
        let mut aggregator = ProgressAggregator::new(AggregationMode::Fractions);
        let a = make_job("a");
        let b = make_job("b");

        aggregator.apply(&progress(&a, 2, Some(10)));
        let snapshot = aggregator.apply(&progress(&b, 800, Some(1000))).unwrap();

        assert!((snapshot.combined_fraction_complete - 0.5).abs() < 1.0 / 8192.0);
    }

    #[test]
    fn byte_mode_weights_by_size() {
        let mut aggregator = ProgressAggregator::new(AggregationMode::Bytes);
        let a = make_job("a");
        let b = make_job("b");

        aggregator.apply(&progress(&a, 10, Some(10)));
        let snapshot = aggregator.apply(&progress(&b, 0, Some(90))).unwrap();

        assert!((snapshot.combined_fraction_complete - 0.1).abs() < 1e-9);
    }

    #[test]
    fn unknown_sizes_fall_back_to_fractions() {
        let mut aggregator = ProgressAggregator::new(AggregationMode::Bytes);
        let a = make_job("a");
        let b = make_job("b");

        aggregator.apply(&progress(&a, 50, Some(100)));
        let snapshot = aggregator.apply(&progress(&b, 400, None)).unwrap();

        assert!((snapshot.combined_fraction_complete - 0.25).abs() < 1.0 / 8192.0);
    }

    #[test]
    fn all_finished_forces_completion() {
        let mut aggregator = ProgressAggregator::new(AggregationMode::Fractions);
        let jobs: Vec<_> = (0..3).map(|i| make_job(&format!("ep{i}"))).collect();

        for job in &jobs {
            aggregator.apply(&progress(job, 1, Some(3)));
        }
        let mut last = None;
        for job in &jobs {
            last = aggregator.apply(&TransferEvent::Finished(job.clone()));
        }

        let snapshot = last.unwrap();
        assert!(snapshot.is_finished);
        assert_eq!(snapshot.combined_fraction_complete, 1.0);
    }

    #[test]
    fn unchanged_state_is_not_emitted_twice() {
        let mut aggregator = ProgressAggregator::default();
        let a = make_job("a");

        assert!(aggregator.apply(&progress(&a, 10, Some(100))).is_some());
        assert!(aggregator.apply(&progress(&a, 10, Some(100))).is_none());
        assert!(aggregator.apply(&progress(&a, 11, Some(100))).is_some());
    }

    #[test]
    fn errors_and_deletes_drop_the_job() {
        let mut aggregator = ProgressAggregator::default();
        let a = make_job("a");
        let b = make_job("b");

        aggregator.apply(&progress(&a, 10, Some(100)));
        aggregator.apply(&progress(&b, 50, Some(100)));
        let snapshot = aggregator
            .apply(&TransferEvent::Error {
                job: a,
                cause: Arc::new(TransferError::Cancelled),
            })
            .unwrap();

        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(snapshot.items[0].id, "b");
        assert!((snapshot.combined_fraction_complete - 0.5).abs() < 1e-9);

        assert!(aggregator.apply(&TransferEvent::Deleted(b)).is_none());
        assert_eq!(aggregator.tracked_count(), 0);
        assert!(aggregator.current().is_none());
    }

    #[test]
    fn new_job_after_finished_batch_starts_fresh() {
        let mut aggregator = ProgressAggregator::default();
        let a = make_job("a");
        let b = make_job("b");

        aggregator.apply(&TransferEvent::Queued(a.clone()));
        let done = aggregator.apply(&TransferEvent::Finished(a)).unwrap();
        assert!(done.is_finished);

        let fresh = aggregator.apply(&TransferEvent::Queued(b)).unwrap();
        assert_eq!(fresh.items.len(), 1);
        assert_eq!(fresh.items[0].id, "b");
        assert_eq!(fresh.combined_fraction_complete, 0.0);
    }

    #[test]
    fn requeued_finished_job_is_no_longer_complete() {
        let mut aggregator = ProgressAggregator::default();
        let a = make_job("a");
        let b = make_job("b");

        aggregator.apply(&TransferEvent::Queued(a.clone()));
        aggregator.apply(&TransferEvent::Queued(b.clone()));
        aggregator.apply(&TransferEvent::Finished(a.clone()));
        aggregator.apply(&TransferEvent::Queued(a.clone()));
        aggregator.apply(&progress(&a, 1, Some(100)));
        aggregator.apply(&progress(&b, 100, Some(100)));
        let snapshot = aggregator.apply(&TransferEvent::Finished(b)).unwrap();

        assert!(!snapshot.is_finished);
        assert!((snapshot.combined_fraction_complete - 101.0 / 200.0).abs() < 1e-9);
        assert_eq!(snapshot.items.len(), 2);
    }

    #[test]
    fn metadata_is_merged_across_jobs() {
        let mut aggregator = ProgressAggregator::default();
        let mut a = (*make_job("a")).clone();
        a.metadata.insert("podcast".to_string(), Value::from("one"));
        let mut b = (*make_job("b")).clone();
        b.metadata.insert("priority".to_string(), Value::from(1));

        aggregator.apply(&TransferEvent::Queued(Arc::new(a)));
        let snapshot = aggregator
            .apply(&TransferEvent::Queued(Arc::new(b)))
            .unwrap();

        assert_eq!(snapshot.merged_metadata.len(), 2);
        assert_eq!(
            snapshot.merged_metadata.get("podcast"),
            Some(&Value::from("one"))
        );
    }
}
