//! Shared test doubles and fixtures for the ingestion integration tests.
//!
//! The ML service and vector store are scripted in-memory implementations
//! of the same traits the HTTP clients implement, so the whole pipeline
//! runs end-to-end without a network.

#![allow(dead_code)]

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use async_trait::async_trait;
use ingest::IngestService;
use inference::{Capabilities, ImageEmbedding, ImageInput, InferenceError, InferenceProvider};
use photovec_core::{Config, JobId, JobSnapshot};
use vecstore::{Distance, PointStruct, StoreError, VectorStore};

// ============================================================================
// Mock ML service
// ============================================================================

pub struct MockInference {
  pub calls: AtomicUsize,
  pub batch_sizes: Mutex<Vec<usize>>,
  /// Batches strictly larger than this report OOM
  pub oom_above: Mutex<Option<usize>>,
  /// Artificial latency per call
  pub delay: Duration,
  pub safe_batch: usize,
}

impl MockInference {
  pub fn new() -> Self {
    Self {
      calls: AtomicUsize::new(0),
      batch_sizes: Mutex::new(Vec::new()),
      oom_above: Mutex::new(None),
      delay: Duration::ZERO,
      safe_batch: 128,
    }
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn with_oom_above(self, limit: usize) -> Self {
    *self.oom_above.lock().unwrap() = Some(limit);
    self
  }

  pub fn call_count(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn max_batch_seen(&self) -> usize {
    self.batch_sizes.lock().unwrap().iter().copied().max().unwrap_or(0)
  }
}

#[async_trait]
impl InferenceProvider for MockInference {
  fn name(&self) -> &str {
    "mock"
  }

  fn vector_size(&self) -> usize {
    8
  }

  async fn embed_batch(&self, images: &[ImageInput]) -> Result<Vec<ImageEmbedding>, InferenceError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.batch_sizes.lock().unwrap().push(images.len());

    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }

    if let Some(limit) = *self.oom_above.lock().unwrap()
      && images.len() > limit
    {
      return Err(InferenceError::OutOfMemory);
    }

    Ok(
      images
        .iter()
        .map(|img| ImageEmbedding {
          unique_id: img.unique_id.clone(),
          // Deterministic embedding derived from content so identical
          // bytes always embed identically
          embedding: deterministic_vector(&img.bytes),
          caption: Some(format!("caption for {}", img.filename)),
          error: None,
        })
        .collect(),
    )
  }

  async fn capabilities(&self) -> Result<Capabilities, InferenceError> {
    Ok(Capabilities {
      safe_batch: self.safe_batch,
      ready: true,
    })
  }
}

fn deterministic_vector(bytes: &[u8]) -> Vec<f32> {
  (0..8)
    .map(|i| bytes.get(i % bytes.len().max(1)).copied().unwrap_or(0) as f32 / 255.0)
    .collect()
}

// ============================================================================
// Mock vector store
// ============================================================================

pub struct MemoryStore {
  pub collections: Mutex<HashMap<String, HashMap<uuid::Uuid, PointStruct>>>,
  pub upsert_calls: AtomicUsize,
  /// Upserts containing a point whose payload filename matches one of
  /// these always fail, so that one batch permanently fails
  pub fail_filenames: Mutex<Vec<String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self {
      collections: Mutex::new(HashMap::new()),
      upsert_calls: AtomicUsize::new(0),
      fail_filenames: Mutex::new(Vec::new()),
    }
  }

  pub fn with_collection(self, name: &str) -> Self {
    self.collections.lock().unwrap().insert(name.to_string(), HashMap::new());
    self
  }

  pub fn fail_batches_containing(&self, filename: &str) {
    self.fail_filenames.lock().unwrap().push(filename.to_string());
  }

  pub fn point_count(&self, collection: &str) -> usize {
    self
      .collections
      .lock()
      .unwrap()
      .get(collection)
      .map(|points| points.len())
      .unwrap_or(0)
  }

  pub fn point_ids(&self, collection: &str) -> Vec<uuid::Uuid> {
    self
      .collections
      .lock()
      .unwrap()
      .get(collection)
      .map(|points| points.keys().copied().collect())
      .unwrap_or_default()
  }
}

#[async_trait]
impl VectorStore for MemoryStore {
  async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
    Ok(self.collections.lock().unwrap().keys().cloned().collect())
  }

  async fn create_collection(&self, name: &str, _vector_size: usize, _distance: Distance) -> Result<(), StoreError> {
    self.collections.lock().unwrap().insert(name.to_string(), HashMap::new());
    Ok(())
  }

  async fn delete_collection(&self, name: &str) -> Result<(), StoreError> {
    if self.collections.lock().unwrap().remove(name).is_none() {
      return Err(StoreError::NotFound(name.to_string()));
    }
    Ok(())
  }

  async fn collection_exists(&self, name: &str) -> Result<bool, StoreError> {
    Ok(self.collections.lock().unwrap().contains_key(name))
  }

  async fn upsert_points(&self, collection: &str, points: Vec<PointStruct>) -> Result<(), StoreError> {
    self.upsert_calls.fetch_add(1, Ordering::SeqCst);

    {
      let poisoned = self.fail_filenames.lock().unwrap();
      let hit = points.iter().any(|p| {
        p.payload
          .get("filename")
          .and_then(|v| v.as_str())
          .is_some_and(|name| poisoned.iter().any(|f| f == name))
      });
      if hit {
        return Err(StoreError::Api {
          status: 503,
          message: "scripted write outage".to_string(),
        });
      }
    }

    let mut collections = self.collections.lock().unwrap();
    let Some(existing) = collections.get_mut(collection) else {
      return Err(StoreError::NotFound(collection.to_string()));
    };
    for point in points {
      existing.insert(point.id, point);
    }
    Ok(())
  }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Minimal JPEG with unique content per seed; valid per signature checks
pub fn write_jpeg(dir: &Path, name: &str, seed: u8) -> PathBuf {
  let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, seed, seed.wrapping_add(1)];
  bytes.extend_from_slice(&[0xFF, 0xD9]);
  let path = dir.join(name);
  std::fs::write(&path, bytes).unwrap();
  path
}

/// Minimal DNG (TIFF container) with unique content per seed
pub fn write_dng(dir: &Path, name: &str, seed: u8) -> PathBuf {
  let mut bytes = b"II*\0".to_vec();
  bytes.extend_from_slice(&[seed, seed.wrapping_mul(3), 0x01, 0x00]);
  let path = dir.join(name);
  std::fs::write(&path, bytes).unwrap();
  path
}

/// JPEG with a valid start-of-image but no end-of-image trailer
pub fn write_truncated_jpeg(dir: &Path, name: &str) -> PathBuf {
  let path = dir.join(name);
  std::fs::write(&path, [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10]).unwrap();
  path
}

/// Valid JPEG padded to exactly `size` bytes
pub fn write_jpeg_of_size(dir: &Path, name: &str, size: usize) -> PathBuf {
  assert!(size >= 6);
  let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
  bytes.resize(size - 2, 0x42);
  bytes.extend_from_slice(&[0xFF, 0xD9]);
  let path = dir.join(name);
  std::fs::write(&path, bytes).unwrap();
  path
}

// ============================================================================
// Service harness
// ============================================================================

pub struct TestEnv {
  pub service: IngestService,
  pub store: Arc<MemoryStore>,
  pub ml: Arc<MockInference>,
  pub cache_dir: tempfile::TempDir,
  pub staging_dir: tempfile::TempDir,
}

pub fn test_config(cache_dir: &Path, staging_dir: &Path) -> Config {
  let mut config = Config::default();
  config.inference.max_batch_size = 128;
  config.inference.probe_interval_secs = 1;
  config.store.upsert_batch_size = 64;
  config.ingest.cpu_workers = 2;
  config.ingest.ml_flush_timeout_ms = 200;
  config.ingest.db_flush_timeout_ms = 200;
  config.cache.directory = cache_dir.to_path_buf();
  config.ingest.staging_dir = staging_dir.to_path_buf();
  config
}

pub fn build_env(store: MemoryStore, ml: MockInference, mutate: impl FnOnce(&mut Config)) -> TestEnv {
  let cache_dir = tempfile::TempDir::new().unwrap();
  let staging_dir = tempfile::TempDir::new().unwrap();
  let mut config = test_config(cache_dir.path(), staging_dir.path());
  mutate(&mut config);

  let store = Arc::new(store);
  let ml = Arc::new(ml);
  let service = IngestService::new(config, store.clone(), ml.clone());

  TestEnv {
    service,
    store,
    ml,
    cache_dir,
    staging_dir,
  }
}

/// Poll a job until it reaches a terminal state
pub async fn wait_terminal(service: &IngestService, job_id: JobId) -> JobSnapshot {
  let deadline = std::time::Instant::now() + Duration::from_secs(15);
  loop {
    let snapshot = service.get_job_status(job_id).expect("job should exist");
    if snapshot.status.is_terminal() {
      return snapshot;
    }
    assert!(std::time::Instant::now() < deadline, "job did not settle in time");
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}
