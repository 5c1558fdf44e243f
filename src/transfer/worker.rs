// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::error::TransferError;
use crate::event::TransferEvent;
use crate::item::TransferJob;
use crate::paths::SharedPathResolver;
use crate::record::{DownloadRecord, write_record};
use crate::transport::SharedTransport;

/// Shared dependencies handed to every worker
#[derive(Clone)]
pub struct WorkerDeps {
    pub transport: SharedTransport,
    pub paths: SharedPathResolver,
    pub bus: Arc<EventBus>,
    /// Held shared while moving a finished file into place
    pub dir_lock: Arc<RwLock<()>>,
    /// Write a completion record next to each finished file
    pub write_records: bool,
}

/// Everything one worker needs to run one job
pub(crate) struct WorkerContext {
    pub job: Arc<TransferJob>,
    pub deps: WorkerDeps,
    pub cancel: CancellationToken,
    pub pause: watch::Receiver<bool>,
}

/// Result of a successful transfer
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub path: PathBuf,
    pub bytes: u64,
    pub content_hash: String,
}

enum Step {
    Chunk(Option<Result<Bytes, TransferError>>),
    PauseChanged(bool),
    Cancelled,
}

/// Run one job to completion.
///
/// Streams the body into `<id>.<ext>.partial`, emitting `InProgress` for every
/// chunk, then moves it to the final path. The partial file is removed on
/// any error, including cancellation. Terminal events are left to the queue.
pub(crate) async fn run_transfer(
    mut ctx: WorkerContext,
) -> Result<TransferOutcome, TransferError> {
    let dir = ctx
        .deps
        .paths
        .destination_directory()
        .ok_or(TransferError::DirectoryUnavailable)?;
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| TransferError::CreateDirectoryFailed {
            path: dir.clone(),
            source: e,
        })?;

    let (partial_path, final_path) = match (
        ctx.deps.paths.partial_path_for(&ctx.job.id),
        ctx.deps.paths.path_for(&ctx.job.id),
    ) {
        (Some(partial), Some(target)) => (partial, target),
        _ => return Err(TransferError::DirectoryUnavailable),
    };

    // Stream into the partial file, removing it on any failure
    let (bytes, content_hash) = match stream_to_file(&mut ctx, &partial_path).await {
        Ok(streamed) => streamed,
        Err(e) => {
            discard_partial(&partial_path).await;
            return Err(e);
        }
    };

    // Move into place
    let moved = {
        let _guard = ctx.deps.dir_lock.read().await;
        // Checked under the lock so a concurrent delete cannot be undone by this move
        if ctx.cancel.is_cancelled() {
            Err(TransferError::Cancelled)
        } else {
            tokio::fs::rename(&partial_path, &final_path)
                .await
                .map_err(|e| TransferError::MoveFailed {
                    from: partial_path.clone(),
                    to: final_path.clone(),
                    source: e,
                })
        }
    };
    if let Err(e) = moved {
        discard_partial(&partial_path).await;
        return Err(e);
    }

    if ctx.deps.write_records {
        save_record(&ctx, &final_path, bytes, &content_hash).await;
    }

    Ok(TransferOutcome {
        path: final_path,
        bytes,
        content_hash,
    })
}

/// Stream the job's body into `partial_path`, returning bytes written and the content hash
async fn stream_to_file(
    ctx: &mut WorkerContext,
    partial_path: &Path,
) -> Result<(u64, String), TransferError> {
    let url = ctx.job.remote_url.to_string();

    let mut file = File::create(partial_path)
        .await
        .map_err(|e| TransferError::FileCreateFailed {
            path: partial_path.to_path_buf(),
            source: e,
        })?;

    let mut hasher = Sha256::new();
    let mut bytes_completed: u64 = 0;
    let mut bytes_total: Option<u64> = None;

    'connection: loop {
        wait_while_paused(ctx).await?;

        // Paused right after the last chunk: nothing is left to fetch
        if bytes_completed > 0 && bytes_total == Some(bytes_completed) {
            break 'connection;
        }

        // Open the body at the current offset
        let opened = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            response = ctx.deps.transport.open(&ctx.job.remote_url, bytes_completed) => Some(response),
        };
        let Some(response) = opened else {
            return Err(TransferError::Cancelled);
        };
        let response = response?;
        if bytes_completed > 0 {
            tracing::debug!(id = %ctx.job.id, offset = bytes_completed, "Transfer resumed");
        }

        // Check for HTTP errors
        if response.status >= 400 {
            return Err(TransferError::HttpStatus {
                url,
                status: response.status,
            });
        }

        // Make sure the body continues where the partial file ends
        if response.offset != bytes_completed {
            if response.offset != 0 {
                return Err(TransferError::ConnectionLost {
                    url,
                    reason: format!(
                        "resumed at byte {} instead of {}",
                        response.offset, bytes_completed
                    ),
                });
            }

            // Range was ignored, start over
            tracing::debug!(id = %ctx.job.id, "Server ignored range request, restarting transfer");
            rewind(&mut file, partial_path).await?;
            hasher = Sha256::new();
            bytes_completed = 0;
        }

        if response.total_length.is_some() {
            bytes_total = response.total_length;
        }
        let mut body = response.body;

        // Stream body to file until it ends, pauses or is cancelled
        loop {
            let step = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Step::Cancelled,
                changed = ctx.pause.changed() => Step::PauseChanged(changed.is_ok()),
                chunk = body.next() => Step::Chunk(chunk),
            };

            match step {
                Step::Cancelled => return Err(TransferError::Cancelled),
                Step::PauseChanged(false) => return Err(TransferError::Cancelled),
                Step::PauseChanged(true) => {
                    if *ctx.pause.borrow_and_update() {
                        tracing::info!(id = %ctx.job.id, bytes = bytes_completed, "Transfer paused");
                        flush(&mut file, partial_path).await?;
                        // Dropping the body releases the connection; resume reopens at our offset
                        continue 'connection;
                    }
                }
                Step::Chunk(None) => break 'connection,
                Step::Chunk(Some(chunk)) => {
                    let chunk = chunk?;

                    // Write chunk and report progress
                    file.write_all(&chunk)
                        .await
                        .map_err(|e| TransferError::FileWriteFailed {
                            path: partial_path.to_path_buf(),
                            source: e,
                        })?;
                    hasher.update(&chunk);
                    bytes_completed += chunk.len() as u64;

                    ctx.deps.bus.publish(TransferEvent::InProgress {
                        job: ctx.job.clone(),
                        bytes_completed,
                        bytes_total,
                    });
                }
            }
        }
    }

    flush(&mut file, partial_path).await?;

    Ok((bytes_completed, format!("sha256:{:x}", hasher.finalize())))
}

/// Block while the job is paused; cancellation still wins
async fn wait_while_paused(ctx: &mut WorkerContext) -> Result<(), TransferError> {
    while *ctx.pause.borrow_and_update() {
        let step = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Step::Cancelled,
            changed = ctx.pause.changed() => Step::PauseChanged(changed.is_ok()),
        };

        match step {
            Step::PauseChanged(true) => {}
            _ => return Err(TransferError::Cancelled),
        }
    }

    if ctx.cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    Ok(())
}

async fn flush(file: &mut File, path: &Path) -> Result<(), TransferError> {
    file.flush()
        .await
        .map_err(|e| TransferError::FileWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
}

async fn rewind(file: &mut File, path: &Path) -> Result<(), TransferError> {
    let map_err = |e: std::io::Error| TransferError::FileWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };
    file.set_len(0).await.map_err(map_err)?;
    file.seek(SeekFrom::Start(0)).await.map_err(map_err)?;
    Ok(())
}

async fn discard_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial file");
    }
}

async fn save_record(ctx: &WorkerContext, final_path: &Path, bytes: u64, content_hash: &str) {
    let Some(record_path) = ctx.deps.paths.record_path_for(&ctx.job.id) else {
        return;
    };
    let audio_filename = final_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let record = DownloadRecord::from_job(
        &ctx.job,
        &audio_filename,
        bytes,
        Some(content_hash.to_string()),
    );
    match tokio::task::spawn_blocking(move || write_record(&record, &record_path)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(id = %ctx.job.id, error = %e, "Failed to write download record");
        }
        Err(e) => {
            tracing::warn!(id = %ctx.job.id, error = %e, "Download record task failed");
        }
    }
}
