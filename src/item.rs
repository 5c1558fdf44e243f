// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Opaque key/value flags attached to a download
pub type Metadata = serde_json::Map<String, Value>;

/// Metadata key marking a download that should never surface in aggregate progress
pub const SILENT_KEY: &str = "silent";

/// Anything that can be downloaded by the queue.
///
/// Identity is `id`: two items with the same id are the same job,
/// whatever their other fields say.
pub trait Downloadable: Send + Sync {
    fn id(&self) -> &str;

    fn title(&self) -> &str;

    fn remote_url(&self) -> &Url;

    fn metadata(&self) -> Metadata {
        Metadata::new()
    }
}

/// A plain downloadable item, e.g. a podcast episode enclosure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadItem {
    pub id: String,
    pub title: String,
    pub remote_url: Url,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl DownloadItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>, remote_url: Url) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            remote_url,
            metadata: Metadata::new(),
        }
    }

    /// Attach a metadata flag
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Mark the item as a silent (background) download
    pub fn silent(self) -> Self {
        self.with_metadata(SILENT_KEY, true)
    }
}

impl Downloadable for DownloadItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn remote_url(&self) -> &Url {
        &self.remote_url
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }
}

/// Snapshot of a `Downloadable` taken at submission time.
///
/// Later changes to the source item do not reach an in-flight job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferJob {
    pub id: String,
    pub title: String,
    pub remote_url: Url,
    pub metadata: Metadata,
}

impl TransferJob {
    /// Copy an item, layering submission metadata over the item's own
    pub fn snapshot(item: &dyn Downloadable, extra: Metadata) -> Self {
        let mut metadata = item.metadata();
        metadata.extend(extra);

        Self {
            id: item.id().to_string(),
            title: item.title().to_string(),
            remote_url: item.remote_url().clone(),
            metadata,
        }
    }

    /// Whether this job was flagged as silent
    pub fn is_silent(&self) -> bool {
        matches!(self.metadata.get(SILENT_KEY), Some(Value::Bool(true)))
    }
}

impl Downloadable for TransferJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn remote_url(&self) -> &Url {
        &self.remote_url
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_item() -> DownloadItem {
        DownloadItem::new(
            "ep1",
            "Episode 1",
            Url::parse("https://example.com/a.mp3").unwrap(),
        )
    }

    #[test]
    fn snapshot_is_detached_from_source() {
        let mut item = make_item();
        let job = TransferJob::snapshot(&item, Metadata::new());

        item.title = "Renamed".to_string();

        assert_eq!(job.title, "Episode 1");
        assert_eq!(job.id, "ep1");
    }

    #[test]
    fn submission_metadata_overrides_item_metadata() {
        let item = make_item().with_metadata("source", "feed");
        let mut extra = Metadata::new();
        extra.insert("source".to_string(), Value::from("manual"));

        let job = TransferJob::snapshot(&item, extra);

        assert_eq!(job.metadata.get("source"), Some(&Value::from("manual")));
    }

    #[test]
    fn silent_flag_requires_boolean_true() {
        assert!(TransferJob::snapshot(&make_item().silent(), Metadata::new()).is_silent());
        assert!(!TransferJob::snapshot(&make_item(), Metadata::new()).is_silent());

        let stringly = make_item().with_metadata(SILENT_KEY, "true");
        assert!(!TransferJob::snapshot(&stringly, Metadata::new()).is_silent());
    }
}
