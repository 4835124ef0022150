use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use syncq::{
  Config, ControlMessage, OfflineAgent, ReqwestClient, SqliteCacheStore, SqliteQueueStore,
  SyncStep,
};

#[derive(Parser, Debug)]
#[command(name = "syncq")]
#[command(about = "Offline-first HTTP cache and sync queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/syncq/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print connectivity, pending-operation count, and last sync time
  Status,
  /// List the queued mutating requests in replay order
  Queue,
  /// Run a drain pass now and report the outcome
  Sync,
  /// Pre-cache the configured (or given) core assets
  Precache {
    /// URLs to cache; defaults to the config's precache list
    urls: Vec<String>,
  },
  /// Drop all cached responses
  ClearCache,
  /// Probe connectivity against the configured probe URL
  Check,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = init_tracing();

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let db_path = config.database_path()?;
  let cache = SqliteCacheStore::open(&db_path)?;
  let queue = SqliteQueueStore::open(&db_path)?;
  let network = ReqwestClient::new(Duration::from_secs(30))?;

  let agent = Arc::new(OfflineAgent::new(config.clone(), cache, queue, network));

  match args.command {
    Command::Status => {
      if config.probe_url.is_some() {
        if let Err(e) = agent.probe().await {
          tracing::warn!(error = %e, "Connectivity probe failed");
        }
      }
      let status = agent.sync_status();
      println!("{}", serde_json::to_string_pretty(&status)?);
    }
    Command::Queue => {
      let requests = agent.queued_requests()?;
      if requests.is_empty() {
        println!("Sync queue is empty");
      } else {
        for request in requests {
          println!(
            "{}  {:6} {}  (queued {})",
            request.id, request.method, request.url, request.enqueued_at
          );
        }
      }
    }
    Command::Sync => {
      agent.on_sync_progress(|progress| {
        println!("[{:>3}%] {} - {}", progress.progress, progress.step, progress.message);
        if progress.step == SyncStep::Complete || progress.step == SyncStep::Error {
          for error in &progress.errors {
            eprintln!("  failed: {}", error);
          }
        }
      });
      let outcome = agent.force_sync_all().await?;
      println!("Synced {}, {} remaining", outcome.synced, outcome.failed);
    }
    Command::Precache { urls } => {
      if urls.is_empty() {
        agent.install().await?;
      } else {
        agent.handle_control(ControlMessage::Precache(urls)).await?;
      }
      agent.activate()?;
      println!("Precache complete");
    }
    Command::ClearCache => {
      agent.handle_control(ControlMessage::ClearCaches).await?;
      println!("Caches cleared");
    }
    Command::Check => {
      let online = agent.probe().await?;
      println!("{}", if online { "online" } else { "offline" });
    }
  }

  Ok(())
}

/// Log to a rolling file under the data directory, or stderr as fallback.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  if let Some(data_dir) = dirs::data_dir() {
    let appender = tracing_appender::rolling::daily(data_dir.join("syncq"), "syncq.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(writer)
      .with_ansi(false)
      .init();
    Some(guard)
  } else {
    tracing_subscriber::fmt().with_env_filter(filter).init();
    None
  }
}
