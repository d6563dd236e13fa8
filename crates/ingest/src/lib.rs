//! Ingestion core: the staged pipeline that walks image directories,
//! de-duplicates by content hash, delegates embedding/captioning to the ML
//! service, and bulk-upserts points into the vector store.
//!
//! ```text
//! [Scanner] -> io_queue -> [CPU Processor] -> ml_queue -> [GPU Worker] -> db_queue -> [DB Upserter]
//!                                   \------(cache hit)--------------------------/
//! ```
//!
//! Each stage is a pool of tasks over bounded channels; full queues block
//! producers, which is the backpressure mechanism. Sentinels propagate
//! shutdown: the scanner emits one per CPU worker, the CPU pool collapses
//! them to one for the GPU worker, and the GPU worker forwards one to the
//! upserter, which triggers finalization.

pub mod cache;
pub mod capability;
pub mod jobs;
pub mod pipeline;
pub mod retry;
pub mod service;

pub use cache::{CacheEntry, DedupCache};
pub use capability::{CapabilityProbe, CapabilitySnapshot};
pub use jobs::JobRegistry;
pub use pipeline::PipelineConfig;
pub use retry::RetryConfig;
pub use service::{IngestService, IngestSource, ServiceError, StartedJob, UploadFile};
