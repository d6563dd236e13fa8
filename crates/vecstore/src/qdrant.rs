//! REST implementation of [`VectorStore`] for a Qdrant-compatible server.

use std::time::{Duration, Instant};

use photovec_core::config::StoreConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{Distance, PointStruct, StoreError, VectorStore};

#[derive(Debug, Clone)]
pub struct QdrantHttpStore {
  client: reqwest::Client,
  base_url: String,
  upsert_timeout: Duration,
}

impl QdrantHttpStore {
  pub fn new(config: &StoreConfig) -> Self {
    Self {
      client: reqwest::Client::new(),
      base_url: config.url.trim_end_matches('/').to_string(),
      upsert_timeout: config.upsert_timeout(),
    }
  }

  fn collection_url(&self, name: &str) -> String {
    format!("{}/collections/{}", self.base_url, name)
  }

  async fn check_response(response: reqwest::Response, collection: &str) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 404 {
      return Err(StoreError::NotFound(collection.to_string()));
    }
    Err(StoreError::Api {
      status: status.as_u16(),
      message: body,
    })
  }
}

#[derive(Debug, Deserialize)]
struct ListCollectionsResponse {
  result: CollectionsResult,
}

#[derive(Debug, Deserialize)]
struct CollectionsResult {
  collections: Vec<CollectionDescription>,
}

#[derive(Debug, Deserialize)]
struct CollectionDescription {
  name: String,
}

#[derive(Debug, Serialize)]
struct CreateCollectionRequest {
  vectors: VectorParams,
}

#[derive(Debug, Serialize)]
struct VectorParams {
  size: usize,
  distance: Distance,
}

#[derive(Debug, Deserialize)]
struct ExistsResponse {
  result: ExistsResult,
}

#[derive(Debug, Deserialize)]
struct ExistsResult {
  exists: bool,
}

#[derive(Debug, Serialize)]
struct UpsertPointsRequest {
  points: Vec<PointStruct>,
}

#[async_trait::async_trait]
impl VectorStore for QdrantHttpStore {
  async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
    let response = self
      .client
      .get(format!("{}/collections", self.base_url))
      .send()
      .await
      .map_err(map_send_error)?;
    let response = Self::check_response(response, "").await?;

    let parsed: ListCollectionsResponse = response
      .json()
      .await
      .map_err(|e| StoreError::Protocol(format!("invalid collections response: {e}")))?;

    Ok(parsed.result.collections.into_iter().map(|c| c.name).collect())
  }

  async fn create_collection(&self, name: &str, vector_size: usize, distance: Distance) -> Result<(), StoreError> {
    let request = CreateCollectionRequest {
      vectors: VectorParams {
        size: vector_size,
        distance,
      },
    };

    debug!(collection = name, vector_size, %distance, "Creating collection");

    let response = self
      .client
      .put(self.collection_url(name))
      .json(&request)
      .send()
      .await
      .map_err(map_send_error)?;
    Self::check_response(response, name).await?;
    Ok(())
  }

  async fn delete_collection(&self, name: &str) -> Result<(), StoreError> {
    debug!(collection = name, "Deleting collection");

    let response = self
      .client
      .delete(self.collection_url(name))
      .send()
      .await
      .map_err(map_send_error)?;
    Self::check_response(response, name).await?;
    Ok(())
  }

  async fn collection_exists(&self, name: &str) -> Result<bool, StoreError> {
    let response = self
      .client
      .get(format!("{}/exists", self.collection_url(name)))
      .send()
      .await
      .map_err(map_send_error)?;
    let response = Self::check_response(response, name).await?;

    let parsed: ExistsResponse = response
      .json()
      .await
      .map_err(|e| StoreError::Protocol(format!("invalid exists response: {e}")))?;

    Ok(parsed.result.exists)
  }

  async fn upsert_points(&self, collection: &str, points: Vec<PointStruct>) -> Result<(), StoreError> {
    if points.is_empty() {
      return Ok(());
    }

    let count = points.len();
    let request = UpsertPointsRequest { points };

    trace!(collection, count, "Sending bulk upsert");
    let start = Instant::now();

    let response = self
      .client
      .put(format!("{}/points?wait=true", self.collection_url(collection)))
      .timeout(self.upsert_timeout)
      .json(&request)
      .send()
      .await
      .map_err(map_send_error)?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      warn!(collection, count, status = %status, "Bulk upsert failed");
      if status.as_u16() == 404 {
        return Err(StoreError::NotFound(collection.to_string()));
      }
      return Err(StoreError::Api {
        status: status.as_u16(),
        message: body,
      });
    }

    debug!(
      collection,
      count,
      elapsed_ms = start.elapsed().as_millis(),
      "Bulk upsert complete"
    );
    Ok(())
  }
}

fn map_send_error(e: reqwest::Error) -> StoreError {
  if e.is_timeout() { StoreError::Timeout } else { e.into() }
}
