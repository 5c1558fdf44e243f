// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::RecordError;
use crate::item::{Metadata, TransferJob};
use crate::paths::RECORD_EXTENSION;

/// Completion record stored next to a downloaded file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: String,
    pub title: String,
    pub remote_url: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    pub audio_filename: String,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub downloaded_at: String,
}

impl DownloadRecord {
    /// Create a record for a job that just finished
    pub fn from_job(
        job: &TransferJob,
        audio_filename: &str,
        bytes: u64,
        content_hash: Option<String>,
    ) -> Self {
        Self {
            id: job.id.clone(),
            title: job.title.clone(),
            remote_url: job.remote_url.to_string(),
            metadata: job.metadata.clone(),
            audio_filename: audio_filename.to_string(),
            bytes,
            content_hash,
            downloaded_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Write a completion record to a JSON file
pub fn write_record(record: &DownloadRecord, path: &Path) -> Result<(), RecordError> {
    let json = serde_json::to_string_pretty(record)?;
    std::fs::write(path, json).map_err(|e| RecordError::WriteFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Read a completion record from a JSON file
pub fn read_record(path: &Path) -> Result<DownloadRecord, RecordError> {
    let content = std::fs::read_to_string(path).map_err(|e| RecordError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    serde_json::from_str(&content).map_err(|e| RecordError::JsonParseFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Read every record in a directory, ordered by id.
///
/// A missing directory has no records. Files that do not parse are skipped.
pub fn list_records(dir: &Path) -> Result<Vec<DownloadRecord>, RecordError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(dir).map_err(|e| RecordError::ReadFailed {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut records = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| RecordError::ReadFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;

        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
            continue;
        }

        match read_record(&path) {
            Ok(record) => records.push(record),
            Err(e) => tracing::debug!(path = %path.display(), error = %e, "Skipping unreadable record"),
        }
    }

    records.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(records)
}
