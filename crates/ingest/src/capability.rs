//! Capability probe: a named background task that periodically refreshes
//! the ML service's self-reported safe batch size and readiness.
//!
//! The snapshot is published through a `tokio::sync::watch` channel:
//! single writer (the probe), many readers (one GPU worker per running
//! job), atomic publish-read.

use std::{sync::Arc, time::Duration};

use inference::InferenceProvider;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Last observed ML service capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySnapshot {
  /// None until the first successful probe; workers fall back to the
  /// configured batch size.
  pub safe_batch: Option<usize>,
  pub ready: bool,
}

impl CapabilitySnapshot {
  /// Batch size a worker should use: the configured maximum, clamped by
  /// the service's declared safe batch when known.
  pub fn effective_batch(&self, configured_max: usize) -> usize {
    self
      .safe_batch
      .map_or(configured_max, |safe| configured_max.min(safe))
      .max(1)
  }
}

pub struct CapabilityProbe;

impl CapabilityProbe {
  /// Spawn the probe task. Runs until `cancel` fires; the first probe
  /// happens immediately.
  pub fn spawn(
    provider: Arc<dyn InferenceProvider>,
    interval: Duration,
    cancel: CancellationToken,
  ) -> watch::Receiver<CapabilitySnapshot> {
    let (tx, rx) = watch::channel(CapabilitySnapshot::default());

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      debug!(interval_secs = interval.as_secs(), "Capability probe starting");

      loop {
        tokio::select! {
          biased;
          _ = cancel.cancelled() => {
            debug!("Capability probe stopped");
            break;
          }
          _ = ticker.tick() => {}
        }

        let previous = *tx.borrow();
        match provider.capabilities().await {
          Ok(caps) => {
            let snapshot = CapabilitySnapshot {
              safe_batch: Some(caps.safe_batch.max(1)),
              ready: caps.ready,
            };
            if snapshot != previous {
              info!(
                safe_batch = caps.safe_batch,
                ready = caps.ready,
                "ML service capabilities changed"
              );
            }
            let _ = tx.send(snapshot);
          }
          Err(e) => {
            if previous.ready {
              warn!(error = %e, "ML service unreachable, marking not ready");
            }
            tx.send_modify(|s| s.ready = false);
          }
        }
      }
    });

    rx
  }
}
