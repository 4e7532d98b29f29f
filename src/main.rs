mod cache;
mod config;
mod control;
mod hooks;
mod http;
mod lifecycle;
mod network;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::{CacheSource, SqliteStorage};
use control::ControlHandle;
use hooks::LogNotifier;
use http::Request;
use lifecycle::InstallOutcome;
use network::HttpNetwork;
use worker::CacheWorker;

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline request cache for the community directory app shell")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache generation name, overriding the config file
  #[arg(short, long)]
  generation: Option<String>,

  /// Cache database path, overriding the config file
  #[arg(long)]
  db: Option<PathBuf>,

  /// Use a throwaway in-memory cache
  #[arg(long, conflicts_with = "db")]
  ephemeral: bool,

  #[command(subcommand)]
  command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Fetch the app shell into the configured generation
  Install,
  /// Make the installed generation current and delete the others
  Activate,
  /// Request a URL through the cache
  Fetch {
    /// Absolute URL or path relative to the origin
    target: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Print only status and headers
    #[arg(long)]
    head: bool,
  },
  /// Send a raw control message, e.g. '{"type":"FORCE_ACTIVATE"}'
  Message { json: String },
  /// Delete the current generation's store
  Clear,
  /// Show generations and lifecycle state
  Status,
  /// Queue a request for the next background sync
  Queue {
    target: String,
    #[arg(short = 'X', long, default_value = "POST")]
    method: String,
  },
  /// Trigger a background sync
  Sync {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Deliver a push payload
  Push {
    payload: Option<String>,
    /// Click the resulting notification
    #[arg(long)]
    click: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;
  if let Some(generation) = args.generation {
    config.generation = generation;
  }
  if let Some(db) = args.db {
    config.database = Some(db);
  }

  let _log_guard = init_tracing()?;

  let storage = if args.ephemeral {
    SqliteStorage::open_in_memory()?
  } else {
    SqliteStorage::open(&config.database_path()?)?
  };
  let network = HttpNetwork::new(&config)?;
  let worker = CacheWorker::new(config, storage, network, Arc::new(LogNotifier))?;

  run(worker, args.command).await
}

async fn run(worker: CacheWorker<SqliteStorage, HttpNetwork>, command: Cmd) -> Result<()> {
  let mut out = std::io::stdout().lock();

  match command {
    Cmd::Install => match worker.install().await? {
      InstallOutcome::Activated(report) => {
        writeln!(out, "installed and activated {}", report.current)?;
        for name in report.deleted {
          writeln!(out, "deleted {}", name)?;
        }
      }
      InstallOutcome::Waiting => {
        writeln!(out, "installed {} (waiting)", worker.config().generation)?;
      }
    },
    Cmd::Activate => {
      let report = worker.activate().await?;
      writeln!(out, "activated {}", report.current)?;
      for name in report.deleted {
        writeln!(out, "deleted {}", name)?;
      }
      for name in report.failed {
        writeln!(out, "failed to delete {}", name)?;
      }
    }
    Cmd::Fetch {
      target,
      method,
      head,
    } => {
      let request = Request::parse(&method, &target, &worker.config().origin)?;
      let result = worker.fetch(&request).await?;
      if result.source == CacheSource::Unavailable {
        warn!("{} is not cached and the network is unreachable", request);
      }
      let response = result.data;
      writeln!(
        out,
        "{} {} ({})",
        response.status, response.status_text, result.source
      )?;
      if let Some(cached_at) = result.cached_at {
        writeln!(out, "cached at {}", cached_at.to_rfc3339())?;
      }
      for (name, value) in response.headers.iter() {
        writeln!(out, "{}: {}", name, value)?;
      }
      if !head {
        writeln!(out)?;
        out.write_all(&response.body)?;
        writeln!(out)?;
      }
    }
    Cmd::Message { json } => {
      let (control, task) = ControlHandle::spawn(worker.clone());
      let (tx, rx) = tokio::sync::oneshot::channel();
      control.post_raw(&json, Some(tx));
      drop(control);
      task.await?;
      if let Ok(reply) = rx.await {
        writeln!(out, "{}", reply)?;
      }
    }
    Cmd::Clear => {
      let (control, task) = ControlHandle::spawn(worker.clone());
      let reply = control.clear().await?;
      drop(control);
      task.await?;
      writeln!(out, "{}", reply)?;
    }
    Cmd::Status => {
      let lifecycle = worker.lifecycle();
      writeln!(
        out,
        "current: {}",
        lifecycle.current().as_deref().unwrap_or("-")
      )?;
      writeln!(
        out,
        "waiting: {}",
        lifecycle.waiting()?.as_deref().unwrap_or("-")
      )?;
      writeln!(out, "configured: {}", worker.config().generation)?;
      for (name, count) in lifecycle.inventory()? {
        writeln!(out, "  {} ({} entries)", name, count)?;
      }
    }
    Cmd::Queue { target, method } => {
      let request = Request::parse(&method, &target, &worker.config().origin)?;
      worker.queue_sync(request)?;
    }
    Cmd::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| worker.config().sync_tag.clone());
      match worker.dispatch_sync(tag).await? {
        Some(report) => writeln!(
          out,
          "replayed {}, pending {}",
          report.replayed, report.pending
        )?,
        None => return Err(eyre!("Background sync failed, see log")),
      }
    }
    Cmd::Push { payload, click } => {
      let payload = payload.map(String::into_bytes);
      if let Some(notification) = worker.dispatch_push(payload).await? {
        writeln!(out, "{}: {}", notification.title, notification.body)?;
        if click {
          worker.on_notification_click(&notification)?;
        }
      }
    }
  }

  Ok(())
}

/// Log to stderr and to a daily rolling file in the data directory.
///
/// Filter with SHELLCACHE_LOG (default: info).
fn init_tracing() -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let log_dir = config::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let file_appender = tracing_appender::rolling::daily(log_dir, "shellcache.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  let filter = EnvFilter::try_from_env("SHELLCACHE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
