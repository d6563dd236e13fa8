//! Control surface exposed to callers: collection administration, job
//! start/poll/cancel, and dedup cache maintenance. Transport-agnostic;
//! whatever protocol layer sits on top calls these methods.

use std::{
  path::{Path, PathBuf},
  sync::{Arc, RwLock},
};

use inference::InferenceProvider;
use photovec_core::{Config, JobId, JobSnapshot};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use vecstore::{Distance, StoreError, VectorStore};

use crate::{
  cache::DedupCache,
  capability::{CapabilityProbe, CapabilitySnapshot},
  jobs::JobRegistry,
  pipeline::{PipelineConfig, PipelineContext, run_pipeline},
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
  #[error("job not found: {0}")]
  JobNotFound(JobId),
  #[error("no active collection selected")]
  NoActiveCollection,
  #[error("unknown collection: {0}")]
  UnknownCollection(String),
  #[error("vector store error: {0}")]
  Store(#[from] StoreError),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Input source for one ingestion job
pub enum IngestSource {
  /// Server-side directory, walked recursively
  Directory(PathBuf),
  /// Uploaded file set; staged to a temp directory that is deleted once
  /// the job reaches a terminal state
  Upload(Vec<UploadFile>),
}

pub struct UploadFile {
  pub file_name: String,
  pub bytes: Vec<u8>,
}

/// Accepted-for-processing response for `start_ingestion`
#[derive(Debug, Clone, Serialize)]
pub struct StartedJob {
  pub job_id: JobId,
  pub status: &'static str,
}

pub struct IngestService {
  config: Config,
  store: Arc<dyn VectorStore>,
  provider: Arc<dyn InferenceProvider>,
  registry: Arc<JobRegistry>,
  cache: Arc<DedupCache>,
  capability: watch::Receiver<CapabilitySnapshot>,
  active_collection: RwLock<Option<String>>,
  /// Parent of every job token and the probe; cancelling it shuts the
  /// whole service down
  shutdown: CancellationToken,
}

impl IngestService {
  /// Build the service and start the capability probe. Must be called
  /// from within a tokio runtime.
  pub fn new(config: Config, store: Arc<dyn VectorStore>, provider: Arc<dyn InferenceProvider>) -> Self {
    let shutdown = CancellationToken::new();
    let capability = CapabilityProbe::spawn(
      provider.clone(),
      config.inference.probe_interval(),
      shutdown.child_token(),
    );
    let cache = Arc::new(DedupCache::new(config.cache.directory.clone()));

    Self {
      config,
      store,
      provider,
      registry: Arc::new(JobRegistry::new()),
      cache,
      capability,
      active_collection: RwLock::new(None),
      shutdown,
    }
  }

  // ==========================================================================
  // Collections
  // ==========================================================================

  pub async fn list_collections(&self) -> Result<Vec<String>, ServiceError> {
    Ok(self.store.list_collections().await?)
  }

  /// Create a collection; size and distance default to the configured
  /// values (which match the ML deployment's vector output).
  pub async fn create_collection(
    &self,
    name: &str,
    vector_size: Option<usize>,
    distance: Option<Distance>,
  ) -> Result<(), ServiceError> {
    let vector_size = vector_size.unwrap_or(self.config.store.vector_size);
    let distance = distance.unwrap_or_else(|| self.config.store.distance.parse().unwrap_or_default());
    self.store.create_collection(name, vector_size, distance).await?;
    info!(collection = name, vector_size, "Collection created");
    Ok(())
  }

  /// Delete a collection. Clears the active collection if it was the one
  /// deleted. The dedup cache for the collection is kept; `clear_cache`
  /// is the explicit operation for that.
  pub async fn delete_collection(&self, name: &str) -> Result<(), ServiceError> {
    self.store.delete_collection(name).await?;

    let mut active = self.active_collection.write().expect("active collection lock poisoned");
    if active.as_deref() == Some(name) {
      *active = None;
      info!(collection = name, "Deleted collection was active; active collection cleared");
    }
    Ok(())
  }

  /// Set the active collection used by jobs started without an explicit
  /// one. The collection must exist.
  pub async fn select_collection(&self, name: &str) -> Result<(), ServiceError> {
    if !self.store.collection_exists(name).await? {
      return Err(ServiceError::UnknownCollection(name.to_string()));
    }
    *self.active_collection.write().expect("active collection lock poisoned") = Some(name.to_string());
    info!(collection = name, "Active collection selected");
    Ok(())
  }

  pub fn active_collection(&self) -> Option<String> {
    self.active_collection.read().expect("active collection lock poisoned").clone()
  }

  /// Clear the dedup cache for the active collection
  pub async fn clear_cache(&self) -> Result<(), ServiceError> {
    let collection = self.active_collection().ok_or(ServiceError::NoActiveCollection)?;
    self.cache.clear(&collection).await?;
    Ok(())
  }

  // ==========================================================================
  // Jobs
  // ==========================================================================

  /// Start an ingestion job. Returns as soon as the workers are
  /// scheduled; poll `get_job_status` for progress.
  pub async fn start_ingestion(
    &self,
    source: IngestSource,
    collection: Option<String>,
  ) -> Result<StartedJob, ServiceError> {
    let collection = collection
      .or_else(|| self.active_collection())
      .ok_or(ServiceError::NoActiveCollection)?;

    if !self.store.collection_exists(&collection).await? {
      return Err(ServiceError::UnknownCollection(collection));
    }

    let (root, staging_cleanup, source_desc) = match source {
      IngestSource::Directory(path) => {
        let desc = path.display().to_string();
        (path, None, desc)
      }
      IngestSource::Upload(files) => {
        let count = files.len();
        let dir = self.stage_uploads(files).await?;
        (dir.clone(), Some(dir), format!("upload of {count} files"))
      }
    };

    let (job_id, cancel) = self.registry.create(collection.clone(), source_desc, &self.shutdown);

    let ctx = PipelineContext {
      job_id,
      collection,
      registry: self.registry.clone(),
      cache: self.cache.clone(),
      store: self.store.clone(),
      provider: self.provider.clone(),
      capability: self.capability.clone(),
      config: PipelineConfig::from_config(&self.config),
    };
    tokio::spawn(run_pipeline(ctx, root, staging_cleanup, cancel));

    info!(job_id = %job_id, "Ingestion job started");
    Ok(StartedJob {
      job_id,
      status: "started",
    })
  }

  pub fn get_job_status(&self, job_id: JobId) -> Result<JobSnapshot, ServiceError> {
    self.registry.get(job_id).ok_or(ServiceError::JobNotFound(job_id))
  }

  /// Request cooperative cancellation. Workers drain their in-flight item
  /// and exit; the job transitions to `cancelled` once the pipeline
  /// settles.
  pub fn cancel_job(&self, job_id: JobId) -> Result<(), ServiceError> {
    if !self.registry.cancel(job_id) {
      return Err(ServiceError::JobNotFound(job_id));
    }
    Ok(())
  }

  /// Cancel the probe and every running job
  pub fn shutdown(&self) {
    self.shutdown.cancel();
  }

  /// Write uploaded files into a fresh staging directory. File names are
  /// flattened to their final component so uploads cannot escape the
  /// staging root.
  async fn stage_uploads(&self, files: Vec<UploadFile>) -> Result<PathBuf, ServiceError> {
    let dir = self.config.ingest.staging_dir.join(Uuid::new_v4().to_string());
    tokio::fs::create_dir_all(&dir).await?;

    for file in files {
      let name = Path::new(&file.file_name)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string().into());
      if let Err(e) = tokio::fs::write(dir.join(&name), &file.bytes).await {
        warn!(file = %name.to_string_lossy(), error = %e, "Failed to stage uploaded file");
        // Best effort: abandon the partial staging dir
        let _ = tokio::fs::remove_dir_all(&dir).await;
        return Err(e.into());
      }
    }
    Ok(dir)
  }
}

impl Drop for IngestService {
  fn drop(&mut self) {
    self.shutdown.cancel();
  }
}
