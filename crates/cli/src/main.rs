//! photovec - ingest image directories into a vector database for
//! semantic search.

mod logging;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use ingest::{IngestService, IngestSource};
use inference::ClipHttpProvider;
use photovec_core::{Config, JobStatus};
use vecstore::{Distance, QdrantHttpStore};

#[derive(Parser)]
#[command(name = "photovec", about = "Ingest image directories into a vector database", version)]
struct Cli {
  /// Path to a TOML config file; `PHOTOVEC_*` env vars override it
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Manage vector store collections
  Collections {
    #[command(subcommand)]
    command: CollectionsCommand,
  },
  /// Ingest a directory of images and wait for the job to finish
  Ingest {
    /// Directory to scan recursively
    dir: PathBuf,
    /// Target collection
    #[arg(long)]
    collection: String,
    /// Print the full report as JSON
    #[arg(long)]
    json: bool,
  },
  /// Clear the dedup cache for a collection
  ClearCache {
    /// Collection whose cache should be dropped
    collection: String,
  },
}

#[derive(Subcommand)]
enum CollectionsCommand {
  /// List collections
  List,
  /// Create a collection
  Create {
    name: String,
    /// Vector dimension; defaults to the configured ML output size
    #[arg(long)]
    vector_size: Option<usize>,
    /// Distance metric: Cosine, Euclid, or Dot
    #[arg(long)]
    distance: Option<Distance>,
  },
  /// Delete a collection
  Delete { name: String },
}

fn build_service(config: &Config) -> IngestService {
  let store = Arc::new(QdrantHttpStore::new(&config.store));
  let provider = Arc::new(ClipHttpProvider::new(&config.inference, config.store.vector_size));
  IngestService::new(config.clone(), store, provider)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  logging::init();

  let cli = Cli::parse();
  let config = Config::load(cli.config.as_deref());
  let service = build_service(&config);

  match cli.command {
    Command::Collections { command } => match command {
      CollectionsCommand::List => {
        for name in service.list_collections().await.context("listing collections")? {
          println!("{name}");
        }
      }
      CollectionsCommand::Create {
        name,
        vector_size,
        distance,
      } => {
        service
          .create_collection(&name, vector_size, distance)
          .await
          .context("creating collection")?;
        println!("created {name}");
      }
      CollectionsCommand::Delete { name } => {
        service.delete_collection(&name).await.context("deleting collection")?;
        println!("deleted {name}");
      }
    },

    Command::Ingest { dir, collection, json } => {
      let started = service
        .start_ingestion(IngestSource::Directory(dir), Some(collection))
        .await
        .context("starting ingestion")?;
      eprintln!("job {} started", started.job_id);

      let snapshot = loop {
        let snapshot = service.get_job_status(started.job_id)?;
        eprint!(
          "\r{:>3}%  {} scanned, {} processed, {} cached, {} failed ",
          snapshot.progress_percent,
          snapshot.counters.total_files,
          snapshot.counters.processed,
          snapshot.counters.from_cache,
          snapshot.counters.failed,
        );
        if snapshot.status.is_terminal() {
          eprintln!();
          break snapshot;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
      };

      if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
      } else if let Some(report) = &snapshot.result {
        println!(
          "{}: {} processed, {} from cache, {} failed",
          snapshot.status, report.total_processed, report.total_from_cache, report.total_failed
        );
        for failed in &report.failed_files {
          println!("  failed {} ({}): {}", failed.path, failed.kind, failed.detail);
        }
      }

      if snapshot.status == JobStatus::Failed {
        bail!("ingestion job failed");
      }
    }

    Command::ClearCache { collection } => {
      service.select_collection(&collection).await.context("selecting collection")?;
      service.clear_cache().await.context("clearing cache")?;
      println!("cache cleared for {collection}");
    }
  }

  service.shutdown();
  Ok(())
}
