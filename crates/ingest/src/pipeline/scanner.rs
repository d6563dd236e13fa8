//! Scanner stage - walks the source directory and streams candidate image
//! paths onto io_queue.
//!
//! Paths are yielded one at a time; the full listing is never materialized.
//! `walkdir` is synchronous, so the walk runs on the blocking pool and
//! feeds the bounded channel with `blocking_send`, which is where
//! backpressure from the CPU stage lands.

use std::{path::PathBuf, sync::Arc};

use photovec_core::{JobId, LogLevel, media};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::jobs::JobRegistry;

/// io_queue message
#[derive(Debug)]
pub(crate) enum ScanItem {
  File(PathBuf),
  /// Sentinel; the scanner emits one per CPU worker
  Done,
}

pub(crate) async fn scanner_stage(
  job_id: JobId,
  root: PathBuf,
  registry: Arc<JobRegistry>,
  tx: mpsc::Sender<ScanItem>,
  cpu_workers: usize,
  cancel: CancellationToken,
) {
  debug!(job_id = %job_id, root = %root.display(), "Scanner stage starting");

  let walk_registry = registry.clone();
  let walk_tx = tx.clone();
  let walk_cancel = cancel.clone();
  let walk_root = root.clone();

  let walk = tokio::task::spawn_blocking(move || {
    let mut yielded = 0u64;

    for entry in WalkDir::new(&walk_root).follow_links(false) {
      if walk_cancel.is_cancelled() {
        debug!(job_id = %job_id, yielded, "Scanner cancelled");
        break;
      }

      let entry = match entry {
        Ok(e) => e,
        Err(e) => {
          // Unreadable subdirectories are logged and skipped
          let path = e
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| walk_root.display().to_string());
          warn!(job_id = %job_id, path = %path, error = %e, "Unreadable path, skipping");
          walk_registry.append_log(job_id, LogLevel::Warn, format!("skipping unreadable path {path}: {e}"));
          continue;
        }
      };

      if !entry.file_type().is_file() || !media::is_image_path(entry.path()) {
        continue;
      }

      // Count before handing the path downstream so progress has a
      // denominator as early as possible
      walk_registry.add_discovered(job_id, 1);
      yielded += 1;

      if walk_tx.blocking_send(ScanItem::File(entry.into_path())).is_err() {
        debug!(job_id = %job_id, yielded, "Scanner: downstream closed");
        break;
      }
    }

    yielded
  })
  .await;

  let yielded = match walk {
    Ok(count) => count,
    Err(e) => {
      warn!(job_id = %job_id, error = %e, "Directory walk task failed");
      registry.mark_stage_failure(job_id, format!("directory walk failed: {e}"));
      0
    }
  };

  // One sentinel per CPU worker, even after cancellation, so no worker
  // stays parked on the queue
  for _ in 0..cpu_workers {
    if tx.send(ScanItem::Done).await.is_err() {
      break;
    }
  }

  debug!(job_id = %job_id, yielded, "Scanner stage complete");
}
