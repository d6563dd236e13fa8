//! Configuration for the ingestion service.
//!
//! Config priority: explicit TOML file > environment overrides > defaults.
//! The collaborator endpoints (ML service, vector store) are the values most
//! deployments override, so each of them also has a `PHOTOVEC_*` env var.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

// ============================================================================
// Inference Service
// ============================================================================

/// ML inference service (embedding + captioning) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
  /// Base URL of the inference service
  pub base_url: String,

  /// Request timeout in seconds for batch embed calls.
  /// Large batches on busy GPUs can legitimately take minutes.
  pub request_timeout_secs: u64,

  /// Maximum images per embedding request. The effective batch size is
  /// `min(max_batch_size, capability.safe_batch)`.
  pub max_batch_size: usize,

  /// How often the capability probe refreshes the service snapshot (seconds)
  pub probe_interval_secs: u64,

  /// Request timeout for the capability probe (seconds)
  pub probe_timeout_secs: u64,
}

impl Default for InferenceConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8001".to_string(),
      request_timeout_secs: 300,
      max_batch_size: 128,
      probe_interval_secs: 10,
      probe_timeout_secs: 5,
    }
  }
}

impl InferenceConfig {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs)
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_secs(self.probe_timeout_secs)
  }
}

// ============================================================================
// Vector Store
// ============================================================================

/// Vector store connection and collection defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// Base URL of the vector store REST API
  pub url: String,

  /// Vector dimension for new collections. Must match the inference
  /// service's embedding output.
  pub vector_size: usize,

  /// Distance metric for new collections: "Cosine", "Euclid", or "Dot"
  pub distance: String,

  /// Bulk upsert request timeout (seconds)
  pub upsert_timeout_secs: u64,

  /// Points per bulk upsert call
  pub upsert_batch_size: usize,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:6333".to_string(),
      vector_size: 512,
      distance: "Cosine".to_string(),
      upsert_timeout_secs: 60,
      upsert_batch_size: 64,
    }
  }
}

impl StoreConfig {
  pub fn upsert_timeout(&self) -> Duration {
    Duration::from_secs(self.upsert_timeout_secs)
  }
}

// ============================================================================
// Ingestion Pipeline
// ============================================================================

/// Pipeline worker counts, queue capacities, and flush timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
  /// CPU processor workers (hashing, metadata). 0 = number of cores.
  pub cpu_workers: usize,

  /// io_queue capacity (scanned paths)
  pub io_queue_capacity: usize,

  /// ml_queue capacity as a multiple of the ML batch size
  pub ml_queue_factor: usize,

  /// db_queue capacity as a multiple of the upsert batch size
  pub db_queue_factor: usize,

  /// Files above this size are rejected with `too_large` (bytes)
  pub max_file_size: u64,

  /// Idle flush for a partially filled ML batch (milliseconds)
  pub ml_flush_timeout_ms: u64,

  /// Idle flush for a partially filled upsert batch (milliseconds)
  pub db_flush_timeout_ms: u64,

  /// Directory where uploaded file sets are staged before ingestion
  pub staging_dir: PathBuf,
}

impl Default for IngestConfig {
  fn default() -> Self {
    Self {
      cpu_workers: 0,
      io_queue_capacity: 1000,
      ml_queue_factor: 4,
      db_queue_factor: 4,
      max_file_size: 100 * 1024 * 1024, // 100MB
      ml_flush_timeout_ms: 500,
      db_flush_timeout_ms: 1000,
      staging_dir: std::env::temp_dir().join("photovec-staging"),
    }
  }
}

impl IngestConfig {
  /// Resolved CPU worker count (0 means "number of cores")
  pub fn effective_cpu_workers(&self) -> usize {
    if self.cpu_workers == 0 {
      num_cpus::get().max(1)
    } else {
      self.cpu_workers
    }
  }

  pub fn ml_flush_timeout(&self) -> Duration {
    Duration::from_millis(self.ml_flush_timeout_ms)
  }

  pub fn db_flush_timeout(&self) -> Duration {
    Duration::from_millis(self.db_flush_timeout_ms)
  }
}

// ============================================================================
// Dedup Cache
// ============================================================================

/// Content-addressed dedup cache location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Cache directory. Entries are laid out as `<dir>/<collection>/<hash>.json`.
  pub directory: PathBuf,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      directory: default_cache_dir(),
    }
  }
}

fn default_cache_dir() -> PathBuf {
  dirs::data_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("photovec")
    .join("dedup-cache")
}

// ============================================================================
// Main Configuration
// ============================================================================

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  #[serde(default)]
  pub inference: InferenceConfig,

  #[serde(default)]
  pub store: StoreConfig,

  #[serde(default)]
  pub ingest: IngestConfig,

  #[serde(default)]
  pub cache: CacheConfig,
}

impl Config {
  /// Load config from a TOML file, falling back to defaults, then apply
  /// environment overrides.
  pub fn load(path: Option<&std::path::Path>) -> Self {
    let mut config = match path {
      Some(p) => match std::fs::read_to_string(p) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
          tracing::warn!(path = %p.display(), error = %e, "Invalid config file, using defaults");
          Self::default()
        }),
        Err(e) => {
          tracing::warn!(path = %p.display(), error = %e, "Could not read config file, using defaults");
          Self::default()
        }
      },
      None => Self::default(),
    };
    config.apply_env();
    config
  }

  /// Apply `PHOTOVEC_*` environment overrides in place.
  pub fn apply_env(&mut self) {
    if let Ok(url) = std::env::var("PHOTOVEC_ML_URL") {
      self.inference.base_url = url;
    }
    if let Ok(url) = std::env::var("PHOTOVEC_STORE_URL") {
      self.store.url = url;
    }
    if let Ok(size) = std::env::var("PHOTOVEC_VECTOR_SIZE")
      && let Ok(size) = size.parse()
    {
      self.store.vector_size = size;
    }
    if let Ok(distance) = std::env::var("PHOTOVEC_DISTANCE") {
      self.store.distance = distance;
    }
    if let Ok(batch) = std::env::var("PHOTOVEC_ML_BATCH")
      && let Ok(batch) = batch.parse()
    {
      self.inference.max_batch_size = batch;
    }
    if let Ok(batch) = std::env::var("PHOTOVEC_UPSERT_BATCH")
      && let Ok(batch) = batch.parse()
    {
      self.store.upsert_batch_size = batch;
    }
    if let Ok(dir) = std::env::var("PHOTOVEC_CACHE_DIR") {
      self.cache.directory = PathBuf::from(dir);
    }
  }
}
