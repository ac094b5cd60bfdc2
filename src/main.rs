mod broker;
mod cache;
mod collections;
mod config;
mod event;
mod remote;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use broker::ConnectorEvent;
use cache::{CacheEngine, GetOptions, SqliteStorage, StorageLocation};
use collections::Collections;
use config::{Config, LogConfig};
use event::{EventBus, StoreEvent};
use remote::HttpRemote;

#[derive(Parser, Debug)]
#[command(name = "habsync")]
#[command(about = "Offline-first mirror of an openHAB server's items and things")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/habsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// openHAB host, overrides the config file
  #[arg(long)]
  host: Option<String>,

  /// openHAB port, overrides the config file
  #[arg(long)]
  port: Option<u16>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print every store event as JSON until interrupted
  Watch,
  /// Read a collection, or a single record of it
  Get {
    collection: String,
    id: Option<String>,
    /// Ignore the expiry window and refresh from the server
    #[arg(long)]
    force_refresh: bool,
  },
}

fn init_logging(config: &LogConfig) -> Result<WorkerGuard> {
  let directory = config.directory()?;
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.filter))
    .map_err(|e| eyre!("Invalid log filter '{}': {}", config.filter, e))?;

  let appender = tracing_appender::rolling::daily(&directory, "habsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

/// Wait for the first connection outcome relayed by the worker.
async fn wait_for_connection(events: &mut broadcast::Receiver<ConnectorEvent>) -> Result<()> {
  loop {
    match events.recv().await {
      Ok(ConnectorEvent::Store(StoreEvent::ConnectionEstablished { host })) => {
        info!("Connected to {}", host);
        return Ok(());
      }
      Ok(ConnectorEvent::Store(StoreEvent::ConnectionLost { code, message })) => {
        return Err(eyre!("Connection failed ({}): {}", code, message));
      }
      Ok(_) => {}
      Err(broadcast::error::RecvError::Lagged(skipped)) => {
        warn!("Skipped {} events while connecting", skipped);
      }
      Err(broadcast::error::RecvError::Closed) => {
        return Err(eyre!("Event bus closed before connecting"));
      }
    }
  }
}

async fn watch(mut events: broadcast::Receiver<ConnectorEvent>) -> Result<()> {
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => return Ok(()),
      event = events.recv() => match event {
        Ok(event) => println!("{}", serde_json::to_string(&event)?),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!("Watcher fell behind, {} events dropped", skipped);
        }
        Err(broadcast::error::RecvError::Closed) => return Ok(()),
      },
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(host) = args.host {
    config.remote.host = host;
  }
  if let Some(port) = args.port {
    config.remote.port = port;
  }

  let _log_guard = init_logging(&config.log)?;

  let db_path = match &config.cache.path {
    Some(path) => path.clone(),
    None => SqliteStorage::default_path()?,
  };
  let engine = CacheEngine::new(
    SqliteStorage::new(StorageLocation::File(db_path)),
    HttpRemote::new(config.fetch_timeout())?,
    Collections::default(),
    EventBus::new(config.cache.event_capacity),
    config.cache.settings(),
  );

  let (connector, _worker) =
    broker::spawn_in_process(engine, config.call_timeout(), config.cache.event_capacity);
  let mut events = connector.events().subscribe();

  connector.connect(&config.remote.host, config.remote.port)?;

  match args.command {
    Command::Watch => watch(events).await,
    Command::Get {
      collection,
      id,
      force_refresh,
    } => {
      wait_for_connection(&mut events).await?;
      let result = connector
        .get(&collection, id.as_deref(), GetOptions { force_refresh })
        .await?;
      println!("{}", serde_json::to_string_pretty(&result)?);
      Ok(())
    }
  }
}
