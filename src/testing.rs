// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;
use url::Url;

use crate::error::TransferError;
use crate::transport::{ByteStream, SharedTransport, Transport, TransportResponse};

/// Serves the same in-memory body for every URL, in fixed-size chunks.
///
/// A gated transport hands out one chunk, or the end of the body, per
/// semaphore permit, which lets tests hold transfers open for as long as
/// they need.
#[derive(Clone)]
pub struct MemoryTransport {
    data: Arc<Vec<u8>>,
    chunk_size: usize,
    honour_ranges: bool,
    reject_past_end: bool,
    gate: Option<Arc<Semaphore>>,
    opens: Arc<Mutex<Vec<u64>>>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct BodyState {
    data: Arc<Vec<u8>>,
    pos: usize,
    chunk_size: usize,
    gate: Option<Arc<Semaphore>>,
    _live: LiveGuard,
}

impl MemoryTransport {
    pub fn new(data: Vec<u8>, chunk_size: usize) -> Self {
        Self {
            data: Arc::new(data),
            chunk_size: chunk_size.max(1),
            honour_ranges: true,
            reject_past_end: false,
            gate: None,
            opens: Arc::new(Mutex::new(Vec::new())),
            live: Arc::new(AtomicUsize::new(0)),
            max_live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn without_ranges(mut self) -> Self {
        self.honour_ranges = false;
        self
    }

    /// Answer 416 to ranges starting at or past the end, like an HTTP server
    pub fn rejecting_ranges_past_end(mut self) -> Self {
        self.reject_past_end = true;
        self
    }

    pub fn gate(&self) -> Arc<Semaphore> {
        self.gate.clone().expect("transport is not gated")
    }

    /// Offsets of every `open` call, in order
    pub fn opens(&self) -> Arc<Mutex<Vec<u64>>> {
        self.opens.clone()
    }

    /// Bodies currently open
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of bodies that were open at the same time
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn shared(self) -> SharedTransport {
        Arc::new(self)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, _url: &Url, offset: u64) -> Result<TransportResponse, TransferError> {
        self.opens.lock().unwrap().push(offset);

        let len = self.data.len() as u64;
        if self.honour_ranges && self.reject_past_end && offset > 0 && offset >= len {
            return Ok(TransportResponse {
                status: 416,
                offset: 0,
                total_length: None,
                body: Box::pin(futures::stream::empty()),
            });
        }

        let (status, start) = if self.honour_ranges && offset > 0 {
            (206, offset.min(len))
        } else {
            (200, 0)
        };

        let now_live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now_live, Ordering::SeqCst);

        let state = BodyState {
            data: self.data.clone(),
            pos: start as usize,
            chunk_size: self.chunk_size,
            gate: self.gate.clone(),
            _live: LiveGuard(self.live.clone()),
        };

        let body: ByteStream = Box::pin(futures::stream::unfold(state, |mut state| async move {
            if let Some(gate) = &state.gate {
                gate.acquire().await.ok()?.forget();
            }
            if state.pos >= state.data.len() {
                return None;
            }
            let end = (state.pos + state.chunk_size).min(state.data.len());
            let chunk = Bytes::copy_from_slice(&state.data[state.pos..end]);
            state.pos = end;
            Some((Ok(chunk), state))
        }));

        Ok(TransportResponse {
            status,
            offset: start,
            total_length: Some(len),
            body,
        })
    }
}

/// A transport whose transfers always fail
pub enum FailingTransport {
    Status(u16),
    ConnectionLost,
}

impl FailingTransport {
    pub fn status(status: u16) -> Self {
        Self::Status(status)
    }

    pub fn connection_lost() -> Self {
        Self::ConnectionLost
    }

    pub fn shared(self) -> SharedTransport {
        Arc::new(self)
    }
}

#[async_trait]
impl Transport for FailingTransport {
    async fn open(&self, url: &Url, _offset: u64) -> Result<TransportResponse, TransferError> {
        match self {
            Self::Status(status) => Ok(TransportResponse {
                status: *status,
                offset: 0,
                total_length: None,
                body: Box::pin(futures::stream::empty()),
            }),
            Self::ConnectionLost => Err(TransferError::ConnectionLost {
                url: url.to_string(),
                reason: "connection reset by peer".to_string(),
            }),
        }
    }
}
