//! HTTP implementation of [`InferenceProvider`] against the CLIP inference
//! service's batch embed/caption API.

use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use photovec_core::config::InferenceConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{Capabilities, ImageEmbedding, ImageInput, InferenceError, InferenceProvider};

#[derive(Debug, Clone)]
pub struct ClipHttpProvider {
  client: reqwest::Client,
  base_url: String,
  vector_size: usize,
  request_timeout: Duration,
  probe_timeout: Duration,
}

impl ClipHttpProvider {
  pub fn new(config: &InferenceConfig, vector_size: usize) -> Self {
    Self {
      client: reqwest::Client::new(),
      base_url: config.base_url.trim_end_matches('/').to_string(),
      vector_size,
      request_timeout: config.request_timeout(),
      probe_timeout: config.probe_timeout(),
    }
  }

  fn embed_url(&self) -> String {
    format!("{}/api/v1/batch_embed_and_caption", self.base_url)
  }

  fn capabilities_url(&self) -> String {
    format!("{}/api/v1/capabilities", self.base_url)
  }
}

/// Request for the batch embed/caption endpoint
#[derive(Debug, Serialize)]
struct BatchEmbedRequest<'a> {
  images: Vec<ImageEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct ImageEntry<'a> {
  image_base64: String,
  filename: &'a str,
  unique_id: &'a str,
}

/// Response from the batch embed/caption endpoint
#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
  results: Vec<ImageEmbedding>,
}

/// Map a non-success HTTP status to an error variant.
///
/// The service signals GPU memory exhaustion either with 507 or with a 5xx
/// whose body carries an out-of-memory marker.
fn classify_status(status: u16, body: &str) -> InferenceError {
  if status == 507 {
    return InferenceError::OutOfMemory;
  }
  if status >= 500 {
    let lower = body.to_ascii_lowercase();
    if lower.contains("out of memory") || lower.contains("cuda oom") {
      return InferenceError::OutOfMemory;
    }
    return InferenceError::Unavailable(format!("status {status}: {body}"));
  }
  InferenceError::Rejected {
    status,
    message: body.to_string(),
  }
}

#[async_trait::async_trait]
impl InferenceProvider for ClipHttpProvider {
  fn name(&self) -> &str {
    "clip-http"
  }

  fn vector_size(&self) -> usize {
    self.vector_size
  }

  async fn embed_batch(&self, images: &[ImageInput]) -> Result<Vec<ImageEmbedding>, InferenceError> {
    if images.is_empty() {
      return Ok(Vec::new());
    }

    let request = BatchEmbedRequest {
      images: images
        .iter()
        .map(|img| ImageEntry {
          image_base64: BASE64.encode(&img.bytes),
          filename: &img.filename,
          unique_id: &img.unique_id,
        })
        .collect(),
    };

    trace!(batch_size = images.len(), "Sending batch embed request");
    let start = Instant::now();

    let response = self
      .client
      .post(self.embed_url())
      .timeout(self.request_timeout)
      .json(&request)
      .send()
      .await
      .map_err(|e| if e.is_timeout() { InferenceError::Timeout } else { e.into() })?;

    let status = response.status();
    trace!(
      status = %status,
      elapsed_ms = start.elapsed().as_millis(),
      "Received batch embed response"
    );

    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      warn!(
        status = %status,
        batch_size = images.len(),
        "Batch embed request failed"
      );
      return Err(classify_status(status.as_u16(), &body));
    }

    let result: BatchEmbedResponse = response
      .json()
      .await
      .map_err(|e| InferenceError::Protocol(format!("invalid embed response: {e}")))?;

    if result.results.len() != images.len() {
      return Err(InferenceError::Protocol(format!(
        "result count mismatch: got {} results for {} images",
        result.results.len(),
        images.len()
      )));
    }

    for item in &result.results {
      if item.error.is_none() && item.embedding.len() != self.vector_size {
        warn!(
          unique_id = %item.unique_id,
          expected = self.vector_size,
          got = item.embedding.len(),
          "Unexpected embedding dimensions"
        );
      }
    }

    debug!(
      batch_size = images.len(),
      elapsed_ms = start.elapsed().as_millis(),
      "Batch embed complete"
    );

    Ok(result.results)
  }

  async fn capabilities(&self) -> Result<Capabilities, InferenceError> {
    let response = self
      .client
      .get(self.capabilities_url())
      .timeout(self.probe_timeout)
      .send()
      .await
      .map_err(|e| if e.is_timeout() { InferenceError::Timeout } else { e.into() })?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(classify_status(status.as_u16(), &body));
    }

    response
      .json()
      .await
      .map_err(|e| InferenceError::Protocol(format!("invalid capabilities response: {e}")))
  }
}
