//! Vector store client: collection management and bulk point upserts.
//!
//! The pipeline talks to the store through the [`VectorStore`] trait;
//! [`QdrantHttpStore`] is the REST implementation. Point ids are derived
//! deterministically from content hashes so re-upserting the same bytes is
//! idempotent at the store level.

mod qdrant;

pub use qdrant::QdrantHttpStore;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("request failed: {0}")]
  Network(#[from] reqwest::Error),
  #[error("request timed out")]
  Timeout,
  #[error("store returned {status}: {message}")]
  Api { status: u16, message: String },
  #[error("collection not found: {0}")]
  NotFound(String),
  #[error("protocol error: {0}")]
  Protocol(String),
}

impl StoreError {
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
      Self::Timeout => true,
      Self::Api { status, .. } => *status == 429 || *status >= 500,
      Self::NotFound(_) | Self::Protocol(_) => false,
    }
  }
}

/// Distance metric for a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Distance {
  #[default]
  Cosine,
  Euclid,
  Dot,
}

impl std::str::FromStr for Distance {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "cosine" => Ok(Self::Cosine),
      "euclid" | "euclidean" => Ok(Self::Euclid),
      "dot" => Ok(Self::Dot),
      _ => Err(format!("unknown distance metric: {s}")),
    }
  }
}

impl std::fmt::Display for Distance {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Cosine => "Cosine",
      Self::Euclid => "Euclid",
      Self::Dot => "Dot",
    };
    f.write_str(s)
  }
}

/// A `(id, vector, payload)` triple bound for the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointStruct {
  pub id: Uuid,
  pub vector: Vec<f32>,
  pub payload: Map<String, Value>,
}

/// Derive the point id from a SHA-256 content hash: the first 128 bits
/// interpreted as a UUID. Deterministic, so identical bytes always map to
/// the same point.
pub fn point_id_for_hash(hash: &[u8; 32]) -> Uuid {
  let mut bytes = [0u8; 16];
  bytes.copy_from_slice(&hash[..16]);
  Uuid::from_bytes(bytes)
}

#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
  async fn list_collections(&self) -> Result<Vec<String>, StoreError>;

  async fn create_collection(&self, name: &str, vector_size: usize, distance: Distance) -> Result<(), StoreError>;

  async fn delete_collection(&self, name: &str) -> Result<(), StoreError>;

  async fn collection_exists(&self, name: &str) -> Result<bool, StoreError>;

  /// Bulk upsert; one call per flushed batch
  async fn upsert_points(&self, collection: &str, points: Vec<PointStruct>) -> Result<(), StoreError>;
}
