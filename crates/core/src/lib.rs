pub mod config;
pub mod job;
pub mod media;

pub use config::{CacheConfig, Config, IngestConfig, InferenceConfig, StoreConfig};
pub use job::{
  FailedFile, FailureKind, JobCounters, JobId, JobLogEntry, JobReport, JobSnapshot, JobStatus, LogLevel, ProcessedFile,
  ProcessedSource,
};
pub use media::{ExifSummary, ImageKind, ImageMeta};
