// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that end a single transfer, delivered through `TransferEvent::Error`
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Connection to {url} lost: {reason}")]
    ConnectionLost { url: String, reason: String },

    #[error("Download directory could not be resolved")]
    DirectoryUnavailable,

    #[error("Failed to create directory {path}: {source}")]
    CreateDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create file {path}: {source}")]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move {from} to {to}: {source}")]
    MoveFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Transfer was cancelled")]
    Cancelled,
}

impl TransferError {
    /// True when the transfer ended because someone asked it to stop.
    ///
    /// Retry logic should skip these, they are not failures.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors returned by the synchronous operations of the download service
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Download directory could not be resolved")]
    DirectoryUnavailable,

    #[error("Failed to remove file {path}: {source}")]
    RemoveFileFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove directory {path}: {source}")]
    RemoveDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to check whether {path} exists: {source}")]
    ExistsCheckFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Download record error: {0}")]
    Record(#[from] RecordError),

    #[error("Download service has been shut down")]
    ShutDown,
}

/// Errors that can occur when reading or writing completion records
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Failed to read record file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write record file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse record JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize record: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),
}

/// Errors that can occur when loading service options from disk
#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("Failed to read options file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse options JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
