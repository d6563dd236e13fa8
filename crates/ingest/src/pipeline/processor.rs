//! CPU processor stage - reads bytes, hashes content, extracts metadata,
//! and consults the dedup cache.
//!
//! Multiple workers pull from a shared io_queue receiver. Hashing and
//! metadata extraction are CPU-bound and run on the blocking pool so the
//! I/O scheduler never stalls. Every path ends up in exactly one of:
//! ml_queue (cache miss), db_queue (cache hit), or the job's failed list.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use photovec_core::{
  JobId,
  job::{FailureKind, ProcessedSource},
  media::{self, ImageMeta},
};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use vecstore::PointStruct;

use super::{
  DoneTracker,
  scanner::ScanItem,
  upserter::{DbItem, DbPoint},
};
use crate::{cache::DedupCache, jobs::JobRegistry};

/// ml_queue message
#[derive(Debug)]
pub(crate) enum MlItem {
  Image(MlImage),
  /// Sentinel; the done aggregator emits exactly one
  Done,
}

/// A cache-miss image bound for the ML service
#[derive(Debug)]
pub(crate) struct MlImage {
  /// Normalized source path (forward slashes, case preserved)
  pub path: String,
  pub file_name: String,
  pub bytes: Vec<u8>,
  pub hash: [u8; 32],
  pub hash_hex: String,
  /// Store payload; the GPU stage merges the caption in
  pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Forward slashes, case preserved
pub(crate) fn normalize_path(path: &Path) -> String {
  path.to_string_lossy().replace('\\', "/")
}

/// Everything the blocking-pool step produces for one file
#[derive(Debug)]
struct CpuOutcome {
  bytes: Vec<u8>,
  hash: [u8; 32],
  hash_hex: String,
  meta: ImageMeta,
}

/// CPU-bound part: signature validation, SHA-256, metadata extraction.
/// The hash is over the raw bytes, untouched by path normalization.
fn process_bytes(path: &Path, bytes: Vec<u8>) -> Result<CpuOutcome, String> {
  let ext = path
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| e.to_ascii_lowercase())
    .unwrap_or_default();

  media::validate_bytes(&ext, &bytes)?;

  let mut hasher = Sha256::new();
  hasher.update(&bytes);
  let hash: [u8; 32] = hasher.finalize().into();
  let hash_hex = hex::encode(hash);

  let meta = ImageMeta::extract(path, &bytes);

  Ok(CpuOutcome {
    bytes,
    hash,
    hash_hex,
    meta,
  })
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn processor_worker(
  worker_id: usize,
  job_id: JobId,
  collection: String,
  rx: Arc<Mutex<mpsc::Receiver<ScanItem>>>,
  ml_tx: mpsc::Sender<MlItem>,
  db_tx: mpsc::Sender<DbItem>,
  done_tx: mpsc::Sender<()>,
  registry: Arc<JobRegistry>,
  cache: Arc<DedupCache>,
  max_file_size: u64,
  cancel: CancellationToken,
) {
  trace!(worker_id, job_id = %job_id, "CPU worker starting");
  let mut processed = 0u64;

  loop {
    // Pull the next path from the shared receiver; the cancel check sits
    // here so a worker never dequeues new work after cancellation
    let msg = {
      let mut rx_guard = rx.lock().await;
      tokio::select! {
          biased;
          _ = cancel.cancelled() => {
              trace!(worker_id, processed, "CPU worker cancelled");
              break;
          }
          msg = rx_guard.recv() => msg
      }
    };

    match msg {
      Some(ScanItem::File(path)) => {
        process_one(job_id, &collection, path, &ml_tx, &db_tx, &registry, &cache, max_file_size).await;
        processed += 1;
      }
      Some(ScanItem::Done) | None => {
        trace!(worker_id, processed, "CPU worker: input exhausted");
        break;
      }
    }
  }

  let _ = done_tx.send(()).await;
  trace!(worker_id, processed, "CPU worker finished");
}

#[allow(clippy::too_many_arguments)]
async fn process_one(
  job_id: JobId,
  collection: &str,
  path: PathBuf,
  ml_tx: &mpsc::Sender<MlItem>,
  db_tx: &mpsc::Sender<DbItem>,
  registry: &Arc<JobRegistry>,
  cache: &Arc<DedupCache>,
  max_file_size: u64,
) {
  let display_path = normalize_path(&path);

  // Size gate before reading anything; a file exactly at the cap passes
  let file_size = match tokio::fs::metadata(&path).await {
    Ok(meta) => meta.len(),
    Err(e) => {
      registry.record_failed(job_id, display_path, FailureKind::DecodeError, format!("unreadable file: {e}"));
      return;
    }
  };
  if file_size > max_file_size {
    registry.record_failed(
      job_id,
      display_path,
      FailureKind::TooLarge,
      format!("{file_size} bytes exceeds the {max_file_size} byte cap"),
    );
    return;
  }

  let bytes = match tokio::fs::read(&path).await {
    Ok(bytes) => bytes,
    Err(e) => {
      registry.record_failed(job_id, display_path, FailureKind::DecodeError, format!("read failed: {e}"));
      return;
    }
  };

  // Hashing and EXIF parsing are CPU-bound; keep them off the I/O scheduler
  let blocking_path = path.clone();
  let outcome = match tokio::task::spawn_blocking(move || process_bytes(&blocking_path, bytes)).await {
    Ok(Ok(outcome)) => outcome,
    Ok(Err(reason)) => {
      registry.record_failed(job_id, display_path, FailureKind::DecodeError, reason);
      return;
    }
    Err(e) => {
      registry.record_failed(
        job_id,
        display_path,
        FailureKind::DecodeError,
        format!("metadata extraction failed: {e}"),
      );
      return;
    }
  };

  match cache.get(collection, &outcome.hash_hex).await {
    Some(entry) => {
      // Rebuild the point from the cached tuple; filename and path are
      // live values and may differ from the original ingest
      let mut payload = entry.payload;
      payload.insert("filename".to_string(), json!(outcome.meta.file_name));
      payload.insert("path".to_string(), json!(display_path));

      let point = PointStruct {
        id: entry.point_id,
        vector: entry.vector,
        payload,
      };

      registry.record_cache_hit(job_id);
      trace!(job_id = %job_id, path = %display_path, "Dedup cache hit");

      let item = DbItem::Point(DbPoint {
        point,
        hash_hex: outcome.hash_hex,
        path: display_path,
        source: ProcessedSource::Cache,
      });
      if db_tx.send(item).await.is_err() {
        debug!(job_id = %job_id, "CPU worker: db queue closed");
      }
    }
    None => {
      let file_name = outcome.meta.file_name.clone();
      let payload = outcome.meta.into_payload(&display_path, &outcome.hash_hex);

      let item = MlItem::Image(MlImage {
        path: display_path,
        file_name,
        bytes: outcome.bytes,
        hash: outcome.hash,
        hash_hex: outcome.hash_hex,
        payload,
      });
      if ml_tx.send(item).await.is_err() {
        debug!(job_id = %job_id, "CPU worker: ml queue closed");
      }
    }
  }
}

/// Collapses the CPU pool's Done signals into the single ml_queue sentinel.
///
/// If the pool shuts down short of the expected count, a worker died
/// without signalling; record that, then still emit the sentinel so the
/// downstream stages drain instead of leaking buffered items.
pub(crate) async fn processor_done_aggregator(
  job_id: JobId,
  worker_count: usize,
  mut done_rx: mpsc::Receiver<()>,
  ml_tx: mpsc::Sender<MlItem>,
  registry: Arc<JobRegistry>,
) {
  let mut tracker = DoneTracker::new(worker_count);
  let mut complete = false;

  while let Some(()) = done_rx.recv().await {
    if tracker.record_done() {
      complete = true;
      break;
    }
  }

  if !complete {
    registry.mark_stage_failure(job_id, "cpu worker exited without signalling completion");
  }

  let _ = ml_tx.send(MlItem::Done).await;
  trace!(worker_count, complete, "CPU pool drained, sentinel forwarded");
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_normalize_path() {
    assert_eq!(normalize_path(Path::new("photos/Shoot/IMG.dng")), "photos/Shoot/IMG.dng");
    assert_eq!(normalize_path(Path::new(r"photos\Shoot\IMG.dng")), "photos/Shoot/IMG.dng");
  }

  #[test]
  fn test_process_bytes_hashes_raw_content() {
    let bytes = b"II*\0dng-payload".to_vec();
    let outcome = process_bytes(Path::new("/a/b.dng"), bytes.clone()).unwrap();

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let expected: [u8; 32] = hasher.finalize().into();

    assert_eq!(outcome.hash, expected);
    assert_eq!(outcome.hash_hex, hex::encode(expected));
    assert_eq!(outcome.bytes, bytes);
    assert!(outcome.meta.raw);
  }

  #[test]
  fn test_process_bytes_rejects_garbage() {
    let err = process_bytes(Path::new("/a/b.jpg"), b"garbage".to_vec()).unwrap_err();
    assert!(err.contains("JPEG"));
  }

  #[test]
  fn test_same_bytes_same_hash_across_paths() {
    let bytes = b"II*\0content".to_vec();
    let a = process_bytes(Path::new("/one.dng"), bytes.clone()).unwrap();
    let b = process_bytes(Path::new("/two.dng"), bytes).unwrap();
    assert_eq!(a.hash, b.hash);
  }
}
