//! Control-surface tests: collection admin, active-collection semantics,
//! upload staging, and error mapping.

mod common;

use std::time::Duration;

use common::*;
use ingest::{IngestSource, ServiceError, UploadFile};
use photovec_core::{JobId, JobStatus};
use tempfile::TempDir;

#[tokio::test]
async fn test_start_without_collection_fails() {
  let env = build_env(MemoryStore::new(), MockInference::new(), |_| {});
  let input = TempDir::new().unwrap();

  let result = env
    .service
    .start_ingestion(IngestSource::Directory(input.path().to_path_buf()), None)
    .await;
  assert!(matches!(result, Err(ServiceError::NoActiveCollection)));
}

#[tokio::test]
async fn test_start_with_unknown_collection_fails() {
  let env = build_env(MemoryStore::new(), MockInference::new(), |_| {});
  let input = TempDir::new().unwrap();

  let result = env
    .service
    .start_ingestion(
      IngestSource::Directory(input.path().to_path_buf()),
      Some("missing".to_string()),
    )
    .await;
  assert!(matches!(result, Err(ServiceError::UnknownCollection(name)) if name == "missing"));
}

#[tokio::test]
async fn test_selected_collection_is_used_for_jobs() {
  let env = build_env(MemoryStore::new().with_collection("photos"), MockInference::new(), |_| {});
  let input = TempDir::new().unwrap();
  write_jpeg(input.path(), "a.jpg", 1);

  env.service.select_collection("photos").await.unwrap();
  assert_eq!(env.service.active_collection().as_deref(), Some("photos"));

  let started = env
    .service
    .start_ingestion(IngestSource::Directory(input.path().to_path_buf()), None)
    .await
    .unwrap();
  let snapshot = wait_terminal(&env.service, started.job_id).await;

  assert_eq!(snapshot.collection, "photos");
  assert_eq!(snapshot.status, JobStatus::Completed);
  assert_eq!(env.store.point_count("photos"), 1);
}

#[tokio::test]
async fn test_select_unknown_collection_fails() {
  let env = build_env(MemoryStore::new(), MockInference::new(), |_| {});
  let result = env.service.select_collection("nope").await;
  assert!(matches!(result, Err(ServiceError::UnknownCollection(_))));
  assert!(env.service.active_collection().is_none());
}

#[tokio::test]
async fn test_collection_lifecycle() {
  let env = build_env(MemoryStore::new(), MockInference::new(), |_| {});

  env.service.create_collection("photos", None, None).await.unwrap();
  assert_eq!(env.service.list_collections().await.unwrap(), vec!["photos".to_string()]);

  env.service.select_collection("photos").await.unwrap();
  env.service.delete_collection("photos").await.unwrap();

  // Deleting the active collection clears the selection
  assert!(env.service.active_collection().is_none());
  assert!(env.service.list_collections().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_clear_cache_requires_active_collection() {
  let env = build_env(MemoryStore::new(), MockInference::new(), |_| {});
  let result = env.service.clear_cache().await;
  assert!(matches!(result, Err(ServiceError::NoActiveCollection)));
}

#[tokio::test]
async fn test_clear_cache_forces_reembedding() {
  let input = TempDir::new().unwrap();
  for i in 0..4 {
    write_dng(input.path(), &format!("{i}.dng"), i as u8);
  }

  let env = build_env(MemoryStore::new().with_collection("photos"), MockInference::new(), |_| {});
  env.service.select_collection("photos").await.unwrap();

  let first = env
    .service
    .start_ingestion(IngestSource::Directory(input.path().to_path_buf()), None)
    .await
    .unwrap();
  wait_terminal(&env.service, first.job_id).await;
  let calls_after_cold = env.ml.call_count();

  env.service.clear_cache().await.unwrap();

  let second = env
    .service
    .start_ingestion(IngestSource::Directory(input.path().to_path_buf()), None)
    .await
    .unwrap();
  let snapshot = wait_terminal(&env.service, second.job_id).await;

  // With the cache gone, the content goes through ML again
  let report = snapshot.result.unwrap();
  assert_eq!(report.total_from_cache, 0);
  assert_eq!(report.total_processed, 4);
  assert!(env.ml.call_count() > calls_after_cold);
}

#[tokio::test]
async fn test_upload_is_staged_and_cleaned_up() {
  let env = build_env(MemoryStore::new().with_collection("photos"), MockInference::new(), |_| {});

  let files = (0..3)
    .map(|i| {
      let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0, i as u8];
      bytes.extend_from_slice(&[0xFF, 0xD9]);
      UploadFile {
        // Path components in upload names must not escape the staging dir
        file_name: format!("../shoot/{i}.jpg"),
        bytes,
      }
    })
    .collect();

  let started = env
    .service
    .start_ingestion(IngestSource::Upload(files), Some("photos".to_string()))
    .await
    .unwrap();
  let snapshot = wait_terminal(&env.service, started.job_id).await;

  assert_eq!(snapshot.status, JobStatus::Completed);
  assert_eq!(snapshot.result.unwrap().total_processed, 3);
  assert!(snapshot.source.starts_with("upload of 3"));

  // The staging directory is deleted once the job settles
  tokio::time::sleep(Duration::from_millis(100)).await;
  let staged = std::fs::read_dir(env.staging_dir.path()).unwrap().count();
  assert_eq!(staged, 0);
}

#[tokio::test]
async fn test_cancelled_upload_job_cleans_staging() {
  let env = build_env(
    MemoryStore::new().with_collection("photos"),
    MockInference::new().with_delay(Duration::from_millis(25)),
    |c| {
      c.inference.max_batch_size = 2;
    },
  );

  let files = (0..60)
    .map(|i| {
      let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0, i as u8];
      bytes.extend_from_slice(&[0xFF, 0xD9]);
      UploadFile {
        file_name: format!("{i}.jpg"),
        bytes,
      }
    })
    .collect();

  let started = env
    .service
    .start_ingestion(IngestSource::Upload(files), Some("photos".to_string()))
    .await
    .unwrap();

  loop {
    let snapshot = env.service.get_job_status(started.job_id).unwrap();
    if snapshot.counters.settled() >= 2 {
      break;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  env.service.cancel_job(started.job_id).unwrap();

  let snapshot = wait_terminal(&env.service, started.job_id).await;
  assert_eq!(snapshot.status, JobStatus::Cancelled);

  tokio::time::sleep(Duration::from_millis(100)).await;
  let staged = std::fs::read_dir(env.staging_dir.path()).unwrap().count();
  assert_eq!(staged, 0);
}

#[tokio::test]
async fn test_unknown_job_errors() {
  let env = build_env(MemoryStore::new(), MockInference::new(), |_| {});
  let bogus = JobId::new();

  assert!(matches!(env.service.get_job_status(bogus), Err(ServiceError::JobNotFound(_))));
  assert!(matches!(env.service.cancel_job(bogus), Err(ServiceError::JobNotFound(_))));
}

#[tokio::test]
async fn test_terminal_job_remains_pollable() {
  let input = TempDir::new().unwrap();
  write_jpeg(input.path(), "a.jpg", 1);

  let env = build_env(MemoryStore::new().with_collection("photos"), MockInference::new(), |_| {});
  let started = env
    .service
    .start_ingestion(
      IngestSource::Directory(input.path().to_path_buf()),
      Some("photos".to_string()),
    )
    .await
    .unwrap();
  wait_terminal(&env.service, started.job_id).await;

  // Polling after completion keeps returning the terminal snapshot
  let again = env.service.get_job_status(started.job_id).unwrap();
  assert_eq!(again.status, JobStatus::Completed);
  assert!(again.result.is_some());
}
