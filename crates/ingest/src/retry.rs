//! Exponential backoff with jitter for the external-service call sites
//! (ML batches, bulk upserts).

use std::time::Duration;

/// Retry policy for one external call
#[derive(Debug, Clone)]
pub struct RetryConfig {
  /// Total attempts, including the first
  pub max_attempts: u32,
  /// Backoff before the first retry
  pub initial_backoff: Duration,
  /// Backoff ceiling
  pub max_backoff: Duration,
  /// Exponential factor
  pub backoff_multiplier: f64,
  /// Whether to add up to 25% jitter
  pub add_jitter: bool,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      initial_backoff: Duration::from_millis(500),
      max_backoff: Duration::from_secs(30),
      backoff_multiplier: 2.0,
      add_jitter: true,
    }
  }
}

impl RetryConfig {
  /// Backoff before retry number `retry` (0-based: the wait before the
  /// first retry is `backoff_for_attempt(0)`).
  pub fn backoff_for_attempt(&self, retry: u32) -> Duration {
    let base = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(retry as i32);
    let mut backoff = Duration::from_secs_f64(base.min(self.max_backoff.as_secs_f64()));

    if self.add_jitter {
      let jitter_factor = 1.0 + (rand_f64() * 0.25);
      backoff = Duration::from_secs_f64(backoff.as_secs_f64() * jitter_factor);
    }

    backoff.min(self.max_backoff)
  }
}

/// A simple pseudo-random number generator for jitter (no external deps)
fn rand_f64() -> f64 {
  use std::time::{SystemTime, UNIX_EPOCH};

  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .subsec_nanos();

  (nanos as f64 / u32::MAX as f64).fract()
}
