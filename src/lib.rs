pub mod aggregate;
pub mod bus;
pub mod disk;
pub mod error;
pub mod event;
pub mod item;
pub mod paths;
pub mod record;
pub mod service;
pub mod transfer;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use aggregate::{AggregationMode, ProgressAggregator};
pub use bus::{EventBus, EventSubscription};
pub use error::{OptionsError, RecordError, ServiceError, TransferError};
pub use event::{AggregatedEvent, JobState, TransferEvent};
pub use item::{DownloadItem, Downloadable, Metadata, TransferJob};
pub use paths::{DownloadDirectory, PathResolver, SharedPathResolver};
pub use record::DownloadRecord;
pub use service::{DownloadService, ServiceOptions};
pub use transfer::{TransferQueue, WorkerDeps};
pub use transport::{ReqwestTransport, SharedTransport, Transport, TransportResponse};
