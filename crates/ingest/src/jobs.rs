//! In-memory job registry: the exclusive owner of job records.
//!
//! All mutations go through methods here and are serialized per job by the
//! map's shard locking; reads return a point-in-time snapshot. Terminal
//! jobs stay in the registry so callers can keep polling them.

use chrono::Utc;
use dashmap::DashMap;
use photovec_core::job::{
  FailedFile, FailureKind, JobCounters, JobId, JobLogEntry, JobReport, JobSnapshot, JobStatus, LogLevel,
  ProcessedFile, ProcessedSource,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
struct JobRecord {
  collection: String,
  source: String,
  status: JobStatus,
  progress_percent: u8,
  counters: JobCounters,
  logs: Vec<JobLogEntry>,
  processed_files: Vec<ProcessedFile>,
  failed_files: Vec<FailedFile>,
  result: Option<JobReport>,
  /// Set when a stage exits abnormally; finalization turns it into `Failed`
  stage_failed: bool,
  cancel: CancellationToken,
}

impl JobRecord {
  fn push_log(&mut self, level: LogLevel, message: String) {
    self.logs.push(JobLogEntry {
      at: Utc::now(),
      level,
      message,
    });
  }

  /// Recompute progress from counters; writes with a lower percent are
  /// ignored so progress is monotone even while `total_files` still grows.
  fn refresh_progress(&mut self) {
    if self.counters.total_files == 0 {
      return;
    }
    let percent = (self.counters.settled() * 100 / self.counters.total_files).min(100) as u8;
    if percent > self.progress_percent {
      self.progress_percent = percent;
    }
  }
}

#[derive(Debug, Default)]
pub struct JobRegistry {
  jobs: DashMap<JobId, JobRecord>,
}

impl JobRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a new pending job. The returned token is the job's
  /// cancellation handle (a child of `parent` so service shutdown cancels
  /// every job).
  pub fn create(&self, collection: String, source: String, parent: &CancellationToken) -> (JobId, CancellationToken) {
    let id = JobId::new();
    let cancel = parent.child_token();

    let mut record = JobRecord {
      collection: collection.clone(),
      source,
      status: JobStatus::Pending,
      progress_percent: 0,
      counters: JobCounters::default(),
      logs: Vec::new(),
      processed_files: Vec::new(),
      failed_files: Vec::new(),
      result: None,
      stage_failed: false,
      cancel: cancel.clone(),
    };
    record.push_log(LogLevel::Info, format!("job created for collection '{collection}'"));

    self.jobs.insert(id, record);
    debug!(job_id = %id, "Job registered");
    (id, cancel)
  }

  pub fn mark_running(&self, id: JobId) {
    if let Some(mut record) = self.jobs.get_mut(&id)
      && record.status == JobStatus::Pending
    {
      record.status = JobStatus::Running;
      record.push_log(LogLevel::Info, "pipeline started".to_string());
    }
  }

  pub fn append_log(&self, id: JobId, level: LogLevel, message: impl Into<String>) {
    if let Some(mut record) = self.jobs.get_mut(&id) {
      record.push_log(level, message.into());
    }
  }

  /// Scanner: another candidate path discovered
  pub fn add_discovered(&self, id: JobId, count: u64) {
    if let Some(mut record) = self.jobs.get_mut(&id) {
      record.counters.total_files += count;
    }
  }

  /// CPU stage: dedup cache satisfied this file
  pub fn record_cache_hit(&self, id: JobId) {
    if let Some(mut record) = self.jobs.get_mut(&id) {
      record.counters.from_cache += 1;
      record.refresh_progress();
    }
  }

  /// Upserter: file durably written to the store
  pub fn record_processed(&self, id: JobId, path: String, source: ProcessedSource) {
    if let Some(mut record) = self.jobs.get_mut(&id) {
      if source == ProcessedSource::BatchMl {
        record.counters.processed += 1;
      }
      record.processed_files.push(ProcessedFile { path, source });
      record.refresh_progress();
    }
  }

  /// Any stage: file failed with a structured reason
  pub fn record_failed(&self, id: JobId, path: String, kind: FailureKind, detail: impl Into<String>) {
    if let Some(mut record) = self.jobs.get_mut(&id) {
      let detail = detail.into();
      record.push_log(LogLevel::Warn, format!("{kind}: {path}: {detail}"));
      record.failed_files.push(FailedFile { path, kind, detail });
      record.counters.failed += 1;
      record.refresh_progress();
    }
  }

  /// Monotone progress write; lower values are ignored
  pub fn set_progress(&self, id: JobId, percent: u8) {
    if let Some(mut record) = self.jobs.get_mut(&id) {
      let percent = percent.min(100);
      if percent > record.progress_percent {
        record.progress_percent = percent;
      }
    }
  }

  /// Record that a stage exited abnormally (worker panic)
  pub fn mark_stage_failure(&self, id: JobId, message: impl Into<String>) {
    if let Some(mut record) = self.jobs.get_mut(&id) {
      record.stage_failed = true;
      record.push_log(LogLevel::Error, message.into());
    }
  }

  pub fn stage_failed(&self, id: JobId) -> bool {
    self.jobs.get(&id).map(|r| r.stage_failed).unwrap_or(false)
  }

  /// Request cooperative cancellation. Returns false for unknown jobs.
  pub fn cancel(&self, id: JobId) -> bool {
    let Some(mut record) = self.jobs.get_mut(&id) else {
      return false;
    };
    if record.status.is_terminal() {
      return true;
    }
    record.push_log(LogLevel::Info, "cancellation requested".to_string());
    record.cancel.cancel();
    true
  }

  pub fn is_cancelled(&self, id: JobId) -> bool {
    self.jobs.get(&id).map(|r| r.cancel.is_cancelled()).unwrap_or(false)
  }

  /// Transition to a terminal state exactly once, writing the terminal
  /// report built from the accumulated processed/failed lists. Later
  /// attempts are rejected.
  pub fn finalize(&self, id: JobId, terminal: JobStatus) -> bool {
    debug_assert!(terminal.is_terminal());
    let Some(mut record) = self.jobs.get_mut(&id) else {
      return false;
    };
    if record.status.is_terminal() {
      warn!(job_id = %id, status = %record.status, "Rejected transition on terminal job");
      return false;
    }

    let report = JobReport {
      total_processed: record
        .processed_files
        .iter()
        .filter(|f| f.source == ProcessedSource::BatchMl)
        .count() as u64,
      total_from_cache: record
        .processed_files
        .iter()
        .filter(|f| f.source == ProcessedSource::Cache)
        .count() as u64,
      total_failed: record.failed_files.len() as u64,
      processed_files: record.processed_files.clone(),
      failed_files: record.failed_files.clone(),
    };

    if terminal == JobStatus::Completed {
      record.progress_percent = 100;
    }
    record.status = terminal;
    record.result = Some(report);
    record.push_log(LogLevel::Info, format!("job finished: {terminal}"));
    debug!(job_id = %id, status = %terminal, "Job finalized");
    true
  }

  pub fn get(&self, id: JobId) -> Option<JobSnapshot> {
    self.jobs.get(&id).map(|record| JobSnapshot {
      id,
      collection: record.collection.clone(),
      source: record.source.clone(),
      status: record.status,
      progress_percent: record.progress_percent,
      counters: record.counters,
      logs: record.logs.clone(),
      result: record.result.clone(),
    })
  }
}
