//! Job domain model: identity, lifecycle, counters, logs, and the terminal
//! report callers poll for.
//!
//! The registry in the `ingest` crate owns the mutable records; everything
//! here is the plain data that crosses that boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque job identifier, unique across the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }

  pub fn as_uuid(&self) -> Uuid {
    self.0
  }
}

impl Default for JobId {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Display for JobId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    self.0.fmt(f)
  }
}

impl std::str::FromStr for JobId {
  type Err = uuid::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(Self(Uuid::parse_str(s)?))
  }
}

/// Job lifecycle state.
///
/// `pending -> running -> {completed | failed | cancelled}`; a terminal
/// state is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
  Pending,
  Running,
  Completed,
  Failed,
  Cancelled,
}

impl JobStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
  }
}

impl std::fmt::Display for JobStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Pending => "pending",
      Self::Running => "running",
      Self::Completed => "completed",
      Self::Failed => "failed",
      Self::Cancelled => "cancelled",
    };
    f.write_str(s)
  }
}

/// Live progress counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
  /// Files discovered by the scanner so far
  pub total_files: u64,
  /// Files embedded via the ML service and durably upserted
  pub processed: u64,
  /// Files that ended in the failed-files list
  pub failed: u64,
  /// Files satisfied from the dedup cache
  pub from_cache: u64,
}

impl JobCounters {
  /// Files accounted for (any outcome)
  pub fn settled(&self) -> u64 {
    self.processed + self.failed + self.from_cache
  }
}

/// Log severity for job log entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
  Info,
  Warn,
  Error,
}

/// One job log line, timestamped at insertion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
  pub at: DateTime<Utc>,
  pub level: LogLevel,
  pub message: String,
}

/// How a processed file got its vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedSource {
  BatchMl,
  Cache,
}

/// A file that made it into the vector store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedFile {
  pub path: String,
  pub source: ProcessedSource,
}

/// Per-item failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
  TooLarge,
  DecodeError,
  MlRejected,
  MlUnreachable,
  StoreWriteFailed,
}

impl std::fmt::Display for FailureKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::TooLarge => "too_large",
      Self::DecodeError => "decode_error",
      Self::MlRejected => "ml_rejected",
      Self::MlUnreachable => "ml_unreachable",
      Self::StoreWriteFailed => "store_write_failed",
    };
    f.write_str(s)
  }
}

/// A file that could not be ingested
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedFile {
  pub path: String,
  pub kind: FailureKind,
  pub detail: String,
}

/// Terminal report written into the job record at finalization
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobReport {
  pub total_processed: u64,
  pub total_failed: u64,
  pub total_from_cache: u64,
  pub processed_files: Vec<ProcessedFile>,
  pub failed_files: Vec<FailedFile>,
}

/// Point-in-time copy of a job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
  pub id: JobId,
  pub collection: String,
  pub source: String,
  pub status: JobStatus,
  pub progress_percent: u8,
  pub counters: JobCounters,
  pub logs: Vec<JobLogEntry>,
  pub result: Option<JobReport>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_job_id_roundtrip() {
    let id = JobId::new();
    let parsed: JobId = id.to_string().parse().unwrap();
    assert_eq!(id, parsed);
  }

  #[test]
  fn test_terminal_states() {
    assert!(!JobStatus::Pending.is_terminal());
    assert!(!JobStatus::Running.is_terminal());
    assert!(JobStatus::Completed.is_terminal());
    assert!(JobStatus::Failed.is_terminal());
    assert!(JobStatus::Cancelled.is_terminal());
  }

  #[test]
  fn test_failure_kind_serialization() {
    let json = serde_json::to_string(&FailureKind::TooLarge).unwrap();
    assert_eq!(json, "\"too_large\"");
    let json = serde_json::to_string(&FailureKind::StoreWriteFailed).unwrap();
    assert_eq!(json, "\"store_write_failed\"");
  }

  #[test]
  fn test_settled_counters() {
    let counters = JobCounters {
      total_files: 10,
      processed: 5,
      failed: 2,
      from_cache: 3,
    };
    assert_eq!(counters.settled(), 10);
  }
}
