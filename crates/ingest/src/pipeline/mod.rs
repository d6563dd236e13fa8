//! Pipeline manager: allocates the bounded queues for a job, spawns the
//! stage workers, supervises completion, and guarantees the job reaches
//! exactly one terminal state.
//!
//! ```text
//! [Scanner] -> io_queue -> [CPU xW] -> ml_queue -> [GPU] -> db_queue -> [Upserter]
//!                              \------(cache hit)--------------/
//! ```
//!
//! Shutdown is sentinel-driven: the scanner emits W sentinels (one per CPU
//! worker), the CPU pool's done-aggregator collapses them to one sentinel
//! for the GPU worker, and the GPU worker forwards one to the upserter.
//! The manager finalizes the job once every stage task has joined, so
//! abnormal exits are always recorded before the terminal transition.

mod gpu;
mod processor;
mod scanner;
mod upserter;

use std::{path::PathBuf, sync::Arc, time::Duration};

use photovec_core::{Config, JobId, JobStatus};
use tokio::{
  sync::{Mutex, mpsc, watch},
  task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use self::{
  gpu::{GpuConfig, gpu_worker},
  processor::{processor_done_aggregator, processor_worker},
  scanner::scanner_stage,
  upserter::{UpserterConfig, upserter_stage},
};
use crate::{cache::DedupCache, capability::CapabilitySnapshot, jobs::JobRegistry, retry::RetryConfig};

/// Queue capacities, worker counts, and flush timing for one job
#[derive(Debug, Clone)]
pub struct PipelineConfig {
  /// CPU processor workers
  pub cpu_workers: usize,
  /// io_queue capacity (scanned paths)
  pub io_queue_capacity: usize,
  /// Configured maximum ML batch size; the effective size is additionally
  /// clamped by the capability snapshot
  pub ml_batch_size: usize,
  /// ml_queue capacity as a multiple of the batch size
  pub ml_queue_factor: usize,
  /// Idle flush for a partial ML batch
  pub ml_flush_timeout: Duration,
  /// Points per bulk upsert
  pub upsert_batch_size: usize,
  /// db_queue capacity as a multiple of the upsert batch size
  pub db_queue_factor: usize,
  /// Idle flush for a partial upsert batch
  pub db_flush_timeout: Duration,
  /// Files above this size fail with `too_large`
  pub max_file_size: u64,
  /// Backoff policy for ML and store calls
  pub retry: RetryConfig,
}

impl PipelineConfig {
  pub fn from_config(config: &Config) -> Self {
    Self {
      cpu_workers: config.ingest.effective_cpu_workers(),
      io_queue_capacity: config.ingest.io_queue_capacity,
      ml_batch_size: config.inference.max_batch_size.max(1),
      ml_queue_factor: config.ingest.ml_queue_factor.max(1),
      ml_flush_timeout: config.ingest.ml_flush_timeout(),
      upsert_batch_size: config.store.upsert_batch_size.max(1),
      db_queue_factor: config.ingest.db_queue_factor.max(1),
      db_flush_timeout: config.ingest.db_flush_timeout(),
      max_file_size: config.ingest.max_file_size,
      retry: RetryConfig::default(),
    }
  }

  fn ml_queue_capacity(&self) -> usize {
    self.ml_batch_size * self.ml_queue_factor
  }

  fn db_queue_capacity(&self) -> usize {
    self.upsert_batch_size * self.db_queue_factor
  }
}

/// Everything a job's stage tasks share
pub(crate) struct PipelineContext {
  pub job_id: JobId,
  pub collection: String,
  pub registry: Arc<JobRegistry>,
  pub cache: Arc<DedupCache>,
  pub store: Arc<dyn vecstore::VectorStore>,
  pub provider: Arc<dyn inference::InferenceProvider>,
  pub capability: watch::Receiver<CapabilitySnapshot>,
  pub config: PipelineConfig,
}

/// Run one job's pipeline to its terminal state.
///
/// This is the supervisor: it owns the queues and the `JoinSet` of stage
/// tasks. Worker panics are surfaced as join errors, logged to the job,
/// and turn the terminal state into `Failed`; downstream stages still
/// drain because a dead stage drops its channel ends.
pub(crate) async fn run_pipeline(
  ctx: PipelineContext,
  root: PathBuf,
  staging_cleanup: Option<PathBuf>,
  cancel: CancellationToken,
) {
  let job_id = ctx.job_id;
  debug!(job_id = %job_id, root = %root.display(), "Pipeline starting");
  ctx.registry.mark_running(job_id);

  let (io_tx, io_rx) = mpsc::channel(ctx.config.io_queue_capacity);
  let (ml_tx, ml_rx) = mpsc::channel(ctx.config.ml_queue_capacity());
  let (db_tx, db_rx) = mpsc::channel(ctx.config.db_queue_capacity());

  // CPU workers share one receiver
  let io_rx = Arc::new(Mutex::new(io_rx));

  // Done signals from the CPU pool, collapsed to one ml_queue sentinel
  let (done_tx, done_rx) = mpsc::channel::<()>(ctx.config.cpu_workers);

  let mut workers = JoinSet::new();

  // Scanner
  {
    let registry = ctx.registry.clone();
    let cancel = cancel.clone();
    let cpu_workers = ctx.config.cpu_workers;
    let root = root.clone();
    workers.spawn(async move {
      scanner_stage(job_id, root, registry, io_tx, cpu_workers, cancel).await;
    });
  }

  // The aggregator keeps its own ml_queue sender so the single sentinel is
  // emitted only after every CPU worker has finished
  let agg_ml_tx = ml_tx.clone();

  // CPU processor pool
  for worker_id in 0..ctx.config.cpu_workers {
    let rx = io_rx.clone();
    let ml_tx = ml_tx.clone();
    let db_tx = db_tx.clone();
    let done_tx = done_tx.clone();
    let registry = ctx.registry.clone();
    let cache = ctx.cache.clone();
    let collection = ctx.collection.clone();
    let max_file_size = ctx.config.max_file_size;
    let cancel = cancel.clone();
    workers.spawn(async move {
      processor_worker(
        worker_id,
        job_id,
        collection,
        rx,
        ml_tx,
        db_tx,
        done_tx,
        registry,
        cache,
        max_file_size,
        cancel,
      )
      .await;
    });
  }
  drop(done_tx);
  drop(ml_tx);
  // Release the manager's receiver reference; once the workers exit, the
  // io_queue closes and a scanner blocked on a full queue unblocks
  drop(io_rx);

  // CPU done aggregator
  {
    let registry = ctx.registry.clone();
    let cpu_workers = ctx.config.cpu_workers;
    workers.spawn(async move {
      processor_done_aggregator(job_id, cpu_workers, done_rx, agg_ml_tx, registry).await;
    });
  }

  // GPU worker
  let gpu_config = GpuConfig {
    configured_batch: ctx.config.ml_batch_size,
    flush_timeout: ctx.config.ml_flush_timeout,
    retry: ctx.config.retry.clone(),
  };
  {
    let provider = ctx.provider.clone();
    let capability = ctx.capability.clone();
    let registry = ctx.registry.clone();
    let db_tx = db_tx.clone();
    let cancel = cancel.clone();
    workers.spawn(async move {
      gpu_worker(job_id, ml_rx, db_tx, provider, capability, gpu_config, registry, cancel).await;
    });
  }
  drop(db_tx);

  // DB upserter
  let upserter_config = UpserterConfig {
    batch_size: ctx.config.upsert_batch_size,
    flush_timeout: ctx.config.db_flush_timeout,
    retry: ctx.config.retry.clone(),
  };
  {
    let store = ctx.store.clone();
    let cache = ctx.cache.clone();
    let registry = ctx.registry.clone();
    let collection = ctx.collection.clone();
    let cancel = cancel.clone();
    workers.spawn(async move {
      upserter_stage(job_id, collection, db_rx, store, cache, upserter_config, registry, cancel).await;
    });
  }

  // Supervise: join every stage task, recording abnormal exits
  while let Some(result) = workers.join_next().await {
    if let Err(e) = result {
      if e.is_panic() {
        error!(job_id = %job_id, error = %e, "Pipeline stage panicked");
        ctx.registry.mark_stage_failure(job_id, format!("pipeline stage panicked: {e}"));
      } else {
        warn!(job_id = %job_id, error = %e, "Pipeline stage aborted");
      }
    }
  }

  let terminal = if cancel.is_cancelled() {
    JobStatus::Cancelled
  } else if ctx.registry.stage_failed(job_id) {
    JobStatus::Failed
  } else {
    JobStatus::Completed
  };
  ctx.registry.finalize(job_id, terminal);

  // Uploaded file sets are staged in a temp directory owned by this job
  if let Some(dir) = staging_cleanup
    && let Err(e) = tokio::fs::remove_dir_all(&dir).await
    && e.kind() != std::io::ErrorKind::NotFound
  {
    warn!(job_id = %job_id, dir = %dir.display(), error = %e, "Failed to remove staging directory");
  }

  debug!(job_id = %job_id, status = %terminal, "Pipeline finished");
}

/// Tracks "Done" signals across a worker pool
#[derive(Debug)]
pub(crate) struct DoneTracker {
  expected: usize,
  received: usize,
}

impl DoneTracker {
  pub fn new(worker_count: usize) -> Self {
    Self {
      expected: worker_count,
      received: 0,
    }
  }

  /// Record a Done signal. Returns true if this was the last one.
  pub fn record_done(&mut self) -> bool {
    self.received += 1;
    self.received >= self.expected
  }
}
