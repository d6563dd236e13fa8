//! DB upserter stage - accumulates points and performs bulk writes into
//! the vector store.
//!
//! The cache-after-upsert discipline lives here: a dedup cache entry is
//! written only once the bulk upsert that carried it has succeeded, so a
//! cache hit always corresponds to durable store state. A batch that
//! exhausts its retries records every item as `store_write_failed` and
//! writes nothing to the cache.

use std::{
  sync::Arc,
  time::{Duration, Instant},
};

use photovec_core::{
  JobId,
  job::{FailureKind, ProcessedSource},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use vecstore::{PointStruct, VectorStore};

use crate::{
  cache::{CacheEntry, DedupCache},
  jobs::JobRegistry,
  retry::RetryConfig,
};

/// db_queue message
#[derive(Debug)]
pub(crate) enum DbItem {
  Point(DbPoint),
  /// Sentinel; the GPU worker emits exactly one
  Done,
}

/// A point ready for the store, with the bookkeeping the upserter needs
#[derive(Debug)]
pub(crate) struct DbPoint {
  pub point: PointStruct,
  pub hash_hex: String,
  pub path: String,
  pub source: ProcessedSource,
}

#[derive(Debug, Clone)]
pub(crate) struct UpserterConfig {
  pub batch_size: usize,
  pub flush_timeout: Duration,
  pub retry: RetryConfig,
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn upserter_stage(
  job_id: JobId,
  collection: String,
  mut rx: mpsc::Receiver<DbItem>,
  store: Arc<dyn VectorStore>,
  cache: Arc<DedupCache>,
  config: UpserterConfig,
  registry: Arc<JobRegistry>,
  cancel: CancellationToken,
) {
  debug!(
    job_id = %job_id,
    batch_size = config.batch_size,
    flush_timeout_ms = config.flush_timeout.as_millis(),
    "Upserter stage starting"
  );

  let mut buffer: Vec<DbPoint> = Vec::new();
  let mut last_add = Instant::now();
  let mut ticker = tokio::time::interval(config.flush_timeout);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

  loop {
    tokio::select! {
      biased;

      _ = cancel.cancelled() => {
        debug!(job_id = %job_id, buffered = buffer.len(), "Upserter cancelled, flushing residual batch");
        flush(job_id, &collection, &mut buffer, &store, &cache, &config, &registry, &cancel).await;
        break;
      }

      msg = rx.recv() => {
        match msg {
          Some(DbItem::Point(point)) => {
            buffer.push(point);
            last_add = Instant::now();

            if buffer.len() >= config.batch_size {
              flush(job_id, &collection, &mut buffer, &store, &cache, &config, &registry, &cancel).await;
            }
          }
          Some(DbItem::Done) | None => {
            flush(job_id, &collection, &mut buffer, &store, &cache, &config, &registry, &cancel).await;
            debug!(job_id = %job_id, "Upserter stage complete");
            break;
          }
        }
      }

      _ = ticker.tick() => {
        if !buffer.is_empty() && last_add.elapsed() >= config.flush_timeout {
          trace!(job_id = %job_id, batch_size = buffer.len(), "Idle flush to store");
          flush(job_id, &collection, &mut buffer, &store, &cache, &config, &registry, &cancel).await;
        }
      }
    }
  }
}

/// One bulk upsert with retries; on success, write dedup cache entries for
/// items that went through ML and record every item as processed.
#[allow(clippy::too_many_arguments)]
async fn flush(
  job_id: JobId,
  collection: &str,
  buffer: &mut Vec<DbPoint>,
  store: &Arc<dyn VectorStore>,
  cache: &Arc<DedupCache>,
  config: &UpserterConfig,
  registry: &Arc<JobRegistry>,
  cancel: &CancellationToken,
) {
  if buffer.is_empty() {
    return;
  }

  let items = std::mem::take(buffer);
  let points: Vec<PointStruct> = items.iter().map(|item| item.point.clone()).collect();
  let count = points.len();

  let mut attempt = 1u32;
  let result = loop {
    match store.upsert_points(collection, points.clone()).await {
      Ok(()) => break Ok(()),
      Err(e) if e.is_retryable() && attempt < config.retry.max_attempts => {
        // Items mid-retry on a cancelled job count as in-flight; drop them
        if cancel.is_cancelled() {
          debug!(job_id = %job_id, count, "Cancelled during upsert retries, dropping batch");
          return;
        }
        let backoff = config.retry.backoff_for_attempt(attempt - 1);
        warn!(
          job_id = %job_id,
          attempt,
          max_attempts = config.retry.max_attempts,
          backoff_ms = backoff.as_millis(),
          error = %e,
          "Bulk upsert failed, retrying after backoff"
        );
        tokio::time::sleep(backoff).await;
        attempt += 1;
      }
      Err(e) => break Err(e),
    }
  };

  match result {
    Ok(()) => {
      trace!(job_id = %job_id, count, "Bulk upsert succeeded");
      for item in items {
        if item.source == ProcessedSource::BatchMl {
          let entry = CacheEntry {
            point_id: item.point.id,
            vector: item.point.vector,
            payload: item.point.payload,
          };
          if let Err(e) = cache.put(collection, &item.hash_hex, &entry).await {
            warn!(job_id = %job_id, hash = %item.hash_hex, error = %e, "Failed to write dedup cache entry");
          }
        }
        registry.record_processed(job_id, item.path, item.source);
      }
    }
    Err(e) => {
      warn!(job_id = %job_id, count, error = %e, "Bulk upsert failed permanently");
      // No cache writes for a failed batch
      for item in items {
        registry.record_failed(
          job_id,
          item.path,
          FailureKind::StoreWriteFailed,
          format!("bulk upsert failed: {e}"),
        );
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tempfile::TempDir;
  use uuid::Uuid;
  use vecstore::StoreError;

  /// In-memory store that can be scripted to fail
  struct MockStore {
    upsert_calls: AtomicUsize,
    points_written: std::sync::Mutex<Vec<PointStruct>>,
    fail_always: bool,
  }

  impl MockStore {
    fn ok() -> Self {
      Self {
        upsert_calls: AtomicUsize::new(0),
        points_written: std::sync::Mutex::new(Vec::new()),
        fail_always: false,
      }
    }

    fn failing() -> Self {
      Self {
        fail_always: true,
        ..Self::ok()
      }
    }
  }

  #[async_trait::async_trait]
  impl VectorStore for MockStore {
    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
      Ok(Vec::new())
    }

    async fn create_collection(&self, _: &str, _: usize, _: vecstore::Distance) -> Result<(), StoreError> {
      Ok(())
    }

    async fn delete_collection(&self, _: &str) -> Result<(), StoreError> {
      Ok(())
    }

    async fn collection_exists(&self, _: &str) -> Result<bool, StoreError> {
      Ok(true)
    }

    async fn upsert_points(&self, _: &str, points: Vec<PointStruct>) -> Result<(), StoreError> {
      self.upsert_calls.fetch_add(1, Ordering::SeqCst);
      if self.fail_always {
        return Err(StoreError::Api {
          status: 503,
          message: "scripted outage".to_string(),
        });
      }
      self.points_written.lock().unwrap().extend(points);
      Ok(())
    }
  }

  fn db_point(path: &str, source: ProcessedSource) -> DbPoint {
    let mut payload = serde_json::Map::new();
    payload.insert("filename".to_string(), json!(path));
    DbPoint {
      point: PointStruct {
        id: Uuid::new_v4(),
        vector: vec![0.1, 0.2],
        payload,
      },
      hash_hex: format!("{:064x}", path.len()),
      path: path.to_string(),
      source,
    }
  }

  struct Harness {
    registry: Arc<JobRegistry>,
    job_id: JobId,
    store: Arc<MockStore>,
    cache: Arc<DedupCache>,
    cancel: CancellationToken,
    _cache_dir: TempDir,
  }

  fn harness(store: MockStore) -> Harness {
    let registry = Arc::new(JobRegistry::new());
    let parent = CancellationToken::new();
    let (job_id, cancel) = registry.create("photos".to_string(), "dir".to_string(), &parent);
    let cache_dir = TempDir::new().unwrap();
    Harness {
      registry,
      job_id,
      store: Arc::new(store),
      cache: Arc::new(DedupCache::new(cache_dir.path().to_path_buf())),
      cancel,
      _cache_dir: cache_dir,
    }
  }

  fn fast_config(batch_size: usize) -> UpserterConfig {
    UpserterConfig {
      batch_size,
      flush_timeout: Duration::from_millis(20),
      retry: RetryConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        add_jitter: false,
        ..Default::default()
      },
    }
  }

  async fn run_stage(h: &Harness, config: UpserterConfig, items: Vec<DbItem>) {
    let (tx, rx) = mpsc::channel(64);
    let store: Arc<dyn VectorStore> = h.store.clone();
    let handle = tokio::spawn(upserter_stage(
      h.job_id,
      "photos".to_string(),
      rx,
      store,
      h.cache.clone(),
      config,
      h.registry.clone(),
      h.cancel.clone(),
    ));
    for item in items {
      tx.send(item).await.unwrap();
    }
    tx.send(DbItem::Done).await.unwrap();
    handle.await.unwrap();
  }

  #[tokio::test]
  async fn test_flush_writes_points_and_cache_entries() {
    let h = harness(MockStore::ok());
    let ml_item = db_point("a.jpg", ProcessedSource::BatchMl);
    let cached_item = db_point("b.jpg", ProcessedSource::Cache);
    let ml_hash = ml_item.hash_hex.clone();
    let cached_hash = cached_item.hash_hex.clone();

    run_stage(&h, fast_config(64), vec![DbItem::Point(ml_item), DbItem::Point(cached_item)]).await;

    assert_eq!(h.store.points_written.lock().unwrap().len(), 2);

    // Cache is written only for ML-sourced items; cache hits already have
    // their entry
    assert!(h.cache.get("photos", &ml_hash).await.is_some());
    assert!(h.cache.get("photos", &cached_hash).await.is_none());

    let counters = h.registry.get(h.job_id).unwrap().counters;
    assert_eq!(counters.processed, 1);
  }

  #[tokio::test]
  async fn test_full_batch_triggers_flush() {
    let h = harness(MockStore::ok());
    let items: Vec<DbItem> = (0..5)
      .map(|i| DbItem::Point(db_point(&format!("{i}.jpg"), ProcessedSource::BatchMl)))
      .collect();

    run_stage(&h, fast_config(2), items).await;

    // 5 points with batch size 2: two full flushes plus the sentinel flush
    assert_eq!(h.store.upsert_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.store.points_written.lock().unwrap().len(), 5);
  }

  #[tokio::test]
  async fn test_store_failure_records_items_and_skips_cache() {
    let h = harness(MockStore::failing());
    let item = db_point("a.jpg", ProcessedSource::BatchMl);
    let hash = item.hash_hex.clone();

    run_stage(&h, fast_config(64), vec![DbItem::Point(item)]).await;

    // Three attempts, then the items fail and the cache stays empty
    assert_eq!(h.store.upsert_calls.load(Ordering::SeqCst), 3);
    assert!(h.cache.get("photos", &hash).await.is_none());

    h.registry.finalize(h.job_id, photovec_core::JobStatus::Completed);
    let report = h.registry.get(h.job_id).unwrap().result.unwrap();
    assert_eq!(report.total_failed, 1);
    assert_eq!(report.failed_files[0].kind, FailureKind::StoreWriteFailed);
  }

  #[tokio::test]
  async fn test_idle_timeout_flushes_partial_batch() {
    let h = harness(MockStore::ok());
    let (tx, rx) = mpsc::channel(8);
    let store: Arc<dyn VectorStore> = h.store.clone();
    let handle = tokio::spawn(upserter_stage(
      h.job_id,
      "photos".to_string(),
      rx,
      store,
      h.cache.clone(),
      fast_config(64),
      h.registry.clone(),
      h.cancel.clone(),
    ));

    tx.send(DbItem::Point(db_point("a.jpg", ProcessedSource::BatchMl)))
      .await
      .unwrap();

    // Wait past the idle timeout without sending the sentinel
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(h.store.points_written.lock().unwrap().len(), 1);

    tx.send(DbItem::Done).await.unwrap();
    handle.await.unwrap();
  }
}
