//! Disk-backed dedup cache, keyed by `(collection, content_hash)`.
//!
//! An entry holds everything needed to rebuild a store point without
//! re-running ML: `(point_id, vector, payload)`. Entries are written only
//! after a successful upsert, so a cache hit always refers to durable store
//! state. Writes go through a temp file + rename, which makes each key
//! atomic; the cache is content-addressed, so concurrent writers of the
//! same key converge on the same value and last-writer-wins is fine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

/// Cached `(point_id, vector, payload)` tuple for one content hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub point_id: Uuid,
  pub vector: Vec<f32>,
  pub payload: Map<String, Value>,
}

#[derive(Debug)]
pub struct DedupCache {
  root: PathBuf,
}

impl DedupCache {
  pub fn new(root: PathBuf) -> Self {
    Self { root }
  }

  fn collection_dir(&self, collection: &str) -> PathBuf {
    // Collection names come from callers; keep path separators out of the key
    let safe: String = collection
      .chars()
      .map(|c| if c == '/' || c == '\\' { '_' } else { c })
      .collect();
    self.root.join(safe)
  }

  fn entry_path(&self, collection: &str, hash_hex: &str) -> PathBuf {
    self.collection_dir(collection).join(format!("{hash_hex}.json"))
  }

  /// Look up an entry. Unreadable or corrupt entries read as misses.
  pub async fn get(&self, collection: &str, hash_hex: &str) -> Option<CacheEntry> {
    let path = self.entry_path(collection, hash_hex);
    let bytes = tokio::fs::read(&path).await.ok()?;
    match serde_json::from_slice(&bytes) {
      Ok(entry) => Some(entry),
      Err(e) => {
        warn!(path = %path.display(), error = %e, "Corrupt cache entry, treating as miss");
        None
      }
    }
  }

  /// Write an entry atomically at key granularity.
  pub async fn put(&self, collection: &str, hash_hex: &str, entry: &CacheEntry) -> std::io::Result<()> {
    let dir = self.collection_dir(collection);
    tokio::fs::create_dir_all(&dir).await?;

    let target = self.entry_path(collection, hash_hex);
    let tmp = dir.join(format!("{hash_hex}.json.tmp.{}", Uuid::new_v4()));

    let bytes = serde_json::to_vec(entry).map_err(std::io::Error::other)?;
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, &target).await?;
    Ok(())
  }

  /// Drop every entry for a collection.
  pub async fn clear(&self, collection: &str) -> std::io::Result<()> {
    let dir = self.collection_dir(collection);
    match tokio::fs::remove_dir_all(&dir).await {
      Ok(()) => {
        debug!(collection, "Dedup cache cleared");
        Ok(())
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }
}
