// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{CONTENT_RANGE, RANGE};
use url::Url;

use crate::error::TransferError;

/// A streaming response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransferError>> + Send>>;

/// An opened transfer: where the body starts, how long the resource is, and the body itself
pub struct TransportResponse {
    /// Status code (HTTP semantics; non-HTTP transports report 200)
    pub status: u16,
    /// Offset of the first body byte within the full resource.
    ///
    /// Zero when the transport could not honour the requested offset.
    pub offset: u64,
    /// Size of the full resource in bytes, if known
    pub total_length: Option<u64>,
    pub body: ByteStream,
}

/// Byte transport used by the transfer workers.
///
/// Pause and resume are built on top of `open` with an offset: a paused
/// transfer drops its body stream and reopens at the number of bytes it
/// already has on disk.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open `url`, asking for the body to start at `offset`
    async fn open(&self, url: &Url, offset: u64) -> Result<TransportResponse, TransferError>;
}

/// A shared reference to a transport
pub type SharedTransport = Arc<dyn Transport>;

/// Default transport implementation using reqwest
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a new ReqwestTransport with default settings
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Create a new ReqwestTransport with a custom reqwest::Client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Wrap this transport in an Arc
    pub fn shared(self) -> SharedTransport {
        Arc::new(self)
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn open(&self, url: &Url, offset: u64) -> Result<TransportResponse, TransferError> {
        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransferError::HttpFailed {
                url: url.to_string(),
                source: e,
            })?;

        let status = response.status().as_u16();
        let content_length = response.content_length();

        // Only a 206 means the server honoured the range
        let (start, total_length) = if status == 206 {
            let total = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_content_range_total);
            (offset, total.or_else(|| content_length.map(|len| offset + len)))
        } else {
            (0, content_length)
        };

        let url_string = url.to_string();
        let body: ByteStream = Box::pin(response.bytes_stream().map(move |result| {
            result.map_err(|e| TransferError::StreamFailed {
                url: url_string.clone(),
                source: e,
            })
        }));

        Ok(TransportResponse {
            status,
            offset: start,
            total_length,
            body,
        })
    }
}

/// Extract the complete length from a `Content-Range` value like `bytes 100-199/1000`
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reqwest_transport_can_be_created() {
        let _transport = ReqwestTransport::new();
        let _transport_default = ReqwestTransport::default();
        let _shared = ReqwestTransport::new().shared();
    }

    #[test]
    fn content_range_total_is_parsed() {
        assert_eq!(parse_content_range_total("bytes 100-199/1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes 0-0/1"), Some(1));
    }

    #[test]
    fn content_range_with_unknown_total_is_ignored() {
        assert_eq!(parse_content_range_total("bytes 100-199/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }
}
