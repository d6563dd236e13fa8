//! Client for the external ML inference service (batch image embedding and
//! captioning). The pipeline never generates embeddings locally; everything
//! flows through the [`InferenceProvider`] trait so tests can substitute a
//! mock service.

mod clip;

pub use clip::ClipHttpProvider;

use serde::Deserialize;

/// One image submitted for embedding
#[derive(Debug, Clone)]
pub struct ImageInput {
  /// Correlation id; results are matched back to inputs by this value
  pub unique_id: String,
  pub filename: String,
  pub bytes: Vec<u8>,
}

/// One embedding result from the service
#[derive(Debug, Clone, Deserialize)]
pub struct ImageEmbedding {
  pub unique_id: String,
  #[serde(default)]
  pub embedding: Vec<f32>,
  #[serde(default)]
  pub caption: Option<String>,
  /// Per-item failure reported by the service; the rest of the batch is
  /// still usable when this is set.
  #[serde(default)]
  pub error: Option<String>,
}

/// Self-reported service capability snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Capabilities {
  /// Largest batch the service asserts it can embed without OOM
  #[serde(rename = "safe_clip_batch")]
  pub safe_batch: usize,
  pub ready: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
  #[error("request failed: {0}")]
  Network(#[from] reqwest::Error),
  #[error("request timed out")]
  Timeout,
  #[error("ml service rejected the batch ({status}): {message}")]
  Rejected { status: u16, message: String },
  #[error("ml service unavailable: {0}")]
  Unavailable(String),
  #[error("ml service out of memory")]
  OutOfMemory,
  #[error("protocol error: {0}")]
  Protocol(String),
}

impl InferenceError {
  /// Transient errors worth retrying with backoff. `OutOfMemory` is not
  /// retryable as-is: the caller owns the batch-halving policy.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
      Self::Timeout | Self::Unavailable(_) => true,
      Self::Rejected { .. } | Self::OutOfMemory | Self::Protocol(_) => false,
    }
  }
}

#[async_trait::async_trait]
pub trait InferenceProvider: Send + Sync {
  fn name(&self) -> &str;

  /// Embedding dimension produced by this deployment
  fn vector_size(&self) -> usize;

  /// Embed (and caption) a batch in a single request.
  ///
  /// Returns one result per input, in service order; callers match by
  /// `unique_id`.
  async fn embed_batch(&self, images: &[ImageInput]) -> Result<Vec<ImageEmbedding>, InferenceError>;

  /// Query the service's capability endpoint
  async fn capabilities(&self) -> Result<Capabilities, InferenceError>;
}
