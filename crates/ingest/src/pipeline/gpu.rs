//! GPU worker stage - groups cache-miss images into batches and delegates
//! embedding + captioning to the ML service.
//!
//! The active batch size is `min(configured_max, capability.safe_batch)`,
//! further clamped by a worker-local limit that halves whenever the service
//! reports out-of-memory. The clamp persists until a fresh capability
//! snapshot raises the safe batch above it. A batch is flushed when it is
//! full, when the idle timeout elapses, or when the sentinel arrives.

use std::{
  collections::{HashMap, VecDeque},
  sync::Arc,
  time::{Duration, Instant},
};

use inference::{ImageInput, InferenceError, InferenceProvider};
use photovec_core::{
  JobId, LogLevel,
  job::{FailureKind, ProcessedSource},
};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use vecstore::{PointStruct, point_id_for_hash};

use super::{
  processor::{MlImage, MlItem},
  upserter::{DbItem, DbPoint},
};
use crate::{capability::CapabilitySnapshot, jobs::JobRegistry, retry::RetryConfig};

#[derive(Debug, Clone)]
pub(crate) struct GpuConfig {
  pub configured_batch: usize,
  pub flush_timeout: Duration,
  pub retry: RetryConfig,
}

struct GpuCtx<'a> {
  job_id: JobId,
  provider: &'a Arc<dyn InferenceProvider>,
  registry: &'a Arc<JobRegistry>,
  db_tx: &'a mpsc::Sender<DbItem>,
  retry: &'a RetryConfig,
  cancel: &'a CancellationToken,
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn gpu_worker(
  job_id: JobId,
  mut rx: mpsc::Receiver<MlItem>,
  db_tx: mpsc::Sender<DbItem>,
  provider: Arc<dyn InferenceProvider>,
  mut capability: watch::Receiver<CapabilitySnapshot>,
  config: GpuConfig,
  registry: Arc<JobRegistry>,
  cancel: CancellationToken,
) {
  debug!(
    job_id = %job_id,
    configured_batch = config.configured_batch,
    flush_timeout_ms = config.flush_timeout.as_millis(),
    "GPU worker starting"
  );

  let mut pending: Vec<MlImage> = Vec::new();
  let mut last_add = Instant::now();
  let mut ticker = tokio::time::interval(config.flush_timeout);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

  // Worker-local OOM clamp on the batch size
  let mut oom_limit: Option<usize> = None;

  let ctx = GpuCtx {
    job_id,
    provider: &provider,
    registry: &registry,
    db_tx: &db_tx,
    retry: &config.retry,
    cancel: &cancel,
  };

  loop {
    let target = active_batch_limit(&mut capability, &mut oom_limit, config.configured_batch);

    tokio::select! {
      biased;

      _ = cancel.cancelled() => {
        debug!(job_id = %job_id, dropped = pending.len(), "GPU worker cancelled");
        break;
      }

      msg = rx.recv() => {
        match msg {
          Some(MlItem::Image(image)) => {
            pending.push(image);
            last_add = Instant::now();

            if pending.len() >= target {
              let batch: Vec<MlImage> = pending.drain(..).collect();
              dispatch(&ctx, batch, &mut oom_limit).await;
            }
          }
          Some(MlItem::Done) | None => {
            while !pending.is_empty() {
              let target = active_batch_limit(&mut capability, &mut oom_limit, config.configured_batch);
              let take = target.min(pending.len());
              let batch: Vec<MlImage> = pending.drain(..take).collect();
              dispatch(&ctx, batch, &mut oom_limit).await;
            }
            let _ = db_tx.send(DbItem::Done).await;
            debug!(job_id = %job_id, "GPU worker complete");
            return;
          }
        }
      }

      _ = ticker.tick() => {
        // The idle flush keeps small trailing batches from stalling on
        // sparse input
        if !pending.is_empty() && last_add.elapsed() >= config.flush_timeout {
          trace!(job_id = %job_id, batch_size = pending.len(), "Idle flush");
          while !pending.is_empty() {
            let target = active_batch_limit(&mut capability, &mut oom_limit, config.configured_batch);
            let take = target.min(pending.len());
            let batch: Vec<MlImage> = pending.drain(..take).collect();
            dispatch(&ctx, batch, &mut oom_limit).await;
          }
        }
      }
    }
  }

  // Cancelled: whatever was buffered stays in flight and is counted
  // nowhere; still forward the sentinel so the upserter can settle
  let _ = db_tx.send(DbItem::Done).await;
}

/// Current batch limit, lifting the OOM clamp when a fresh snapshot raises
/// the service's safe batch above it.
fn active_batch_limit(
  capability: &mut watch::Receiver<CapabilitySnapshot>,
  oom_limit: &mut Option<usize>,
  configured: usize,
) -> usize {
  let changed = capability.has_changed().unwrap_or(false);
  let snapshot = *capability.borrow_and_update();

  if changed
    && let Some(limit) = *oom_limit
    && snapshot.safe_batch.is_some_and(|safe| safe > limit)
  {
    debug!(previous_limit = limit, "Capability snapshot lifted the OOM batch clamp");
    *oom_limit = None;
  }

  let mut target = snapshot.effective_batch(configured);
  if let Some(limit) = *oom_limit {
    target = target.min(limit);
  }
  target.max(1)
}

/// Run one batch, splitting on OOM until every image is emitted or failed.
async fn dispatch(ctx: &GpuCtx<'_>, images: Vec<MlImage>, oom_limit: &mut Option<usize>) {
  let mut queue: VecDeque<Vec<MlImage>> = VecDeque::new();
  queue.push_back(images);

  while let Some(batch) = queue.pop_front() {
    if batch.is_empty() {
      continue;
    }
    match call_with_retry(ctx, batch, oom_limit).await {
      CallResult::Done => {}
      CallResult::Split(left, right) => {
        queue.push_front(right);
        queue.push_front(left);
      }
      CallResult::Cancelled => return,
    }
  }
}

enum CallResult {
  /// Every image was emitted or recorded as failed
  Done,
  /// OOM: retry the two halves separately
  Split(Vec<MlImage>, Vec<MlImage>),
  Cancelled,
}

async fn call_with_retry(ctx: &GpuCtx<'_>, batch: Vec<MlImage>, oom_limit: &mut Option<usize>) -> CallResult {
  let inputs: Vec<ImageInput> = batch
    .iter()
    .enumerate()
    .map(|(idx, image)| ImageInput {
      unique_id: format!("img-{idx}"),
      filename: image.file_name.clone(),
      bytes: image.bytes.clone(),
    })
    .collect();

  let mut attempt = 1u32;
  loop {
    // Retry boundary doubles as the cancellation check
    if ctx.cancel.is_cancelled() {
      return CallResult::Cancelled;
    }

    trace!(job_id = %ctx.job_id, batch_size = batch.len(), attempt, "Calling ML service");
    match ctx.provider.embed_batch(&inputs).await {
      Ok(results) => {
        emit_results(ctx, batch, results).await;
        return CallResult::Done;
      }
      Err(InferenceError::OutOfMemory) => {
        if batch.len() <= 1 {
          fail_batch(ctx, batch, FailureKind::MlUnreachable, "ml service out of memory with a single image");
          return CallResult::Done;
        }

        let mid = batch.len() / 2;
        let new_limit = mid.max(1);
        *oom_limit = Some(oom_limit.map_or(new_limit, |limit| limit.min(new_limit)));

        warn!(
          job_id = %ctx.job_id,
          batch_size = batch.len(),
          new_limit,
          "ML service out of memory; halving batch and retrying the halves"
        );
        ctx.registry.append_log(
          ctx.job_id,
          LogLevel::Warn,
          format!("ml service out of memory; batch limit reduced to {new_limit}"),
        );

        let mut left = batch;
        let right = left.split_off(mid);
        return CallResult::Split(left, right);
      }
      Err(InferenceError::Rejected { status, message }) => {
        // 4xx is deterministic; retrying would only repeat it
        fail_batch(
          ctx,
          batch,
          FailureKind::MlRejected,
          format!("ml service returned {status}: {message}"),
        );
        return CallResult::Done;
      }
      Err(e) if e.is_retryable() && attempt < ctx.retry.max_attempts => {
        let backoff = ctx.retry.backoff_for_attempt(attempt - 1);
        warn!(
          job_id = %ctx.job_id,
          attempt,
          max_attempts = ctx.retry.max_attempts,
          backoff_ms = backoff.as_millis(),
          error = %e,
          "ML call failed, retrying after backoff"
        );
        tokio::time::sleep(backoff).await;
        attempt += 1;
      }
      Err(e) => {
        fail_batch(ctx, batch, FailureKind::MlUnreachable, e.to_string());
        return CallResult::Done;
      }
    }
  }
}

/// Pair results with inputs by unique id and forward points to db_queue.
async fn emit_results(ctx: &GpuCtx<'_>, batch: Vec<MlImage>, results: Vec<inference::ImageEmbedding>) {
  let by_id: HashMap<String, inference::ImageEmbedding> =
    results.into_iter().map(|r| (r.unique_id.clone(), r)).collect();

  for (idx, image) in batch.into_iter().enumerate() {
    let key = format!("img-{idx}");
    match by_id.get(&key) {
      Some(result) if result.error.is_none() && !result.embedding.is_empty() => {
        let mut payload = image.payload;
        if let Some(caption) = &result.caption {
          payload.insert("caption".to_string(), json!(caption));
        }

        let point = PointStruct {
          id: point_id_for_hash(&image.hash),
          vector: result.embedding.clone(),
          payload,
        };

        let item = DbItem::Point(DbPoint {
          point,
          hash_hex: image.hash_hex,
          path: image.path,
          source: ProcessedSource::BatchMl,
        });
        if ctx.db_tx.send(item).await.is_err() {
          debug!(job_id = %ctx.job_id, "GPU worker: db queue closed");
          return;
        }
      }
      Some(result) => {
        let detail = result
          .error
          .clone()
          .unwrap_or_else(|| "empty embedding in result".to_string());
        ctx
          .registry
          .record_failed(ctx.job_id, image.path, FailureKind::MlRejected, detail);
      }
      None => {
        ctx.registry.record_failed(
          ctx.job_id,
          image.path,
          FailureKind::MlRejected,
          "ml service returned no result for this image",
        );
      }
    }
  }
}

fn fail_batch(ctx: &GpuCtx<'_>, batch: Vec<MlImage>, kind: FailureKind, detail: impl Into<String>) {
  let detail = detail.into();
  for image in batch {
    ctx.registry.record_failed(ctx.job_id, image.path, kind, detail.clone());
  }
}
