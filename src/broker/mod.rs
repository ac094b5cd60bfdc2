//! Request/reply bridge between a client and the storage worker that owns
//! the cache engine.
//!
//! The two sides share nothing but a pair of channels carrying JSON values:
//! requests one way, replies and relayed events the other.

mod connector;
mod message;
mod queue;
mod worker;

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub use connector::{ConnectorEvent, StorageConnector};
pub use worker::StorageWorker;

use crate::cache::{CacheEngine, RecordStore};
use crate::remote::RemoteSource;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
  #[error("StorageConnector queue item '{0}' timed out")]
  Timeout(String),
  #[error("{0}")]
  Remote(String),
  #[error("all message ids are in use")]
  QueueFull,
  #[error("storage worker is not running")]
  Disconnected,
}

/// Wire a connector to a worker serving `engine`, both on the current runtime.
pub fn spawn_in_process<S: RecordStore, R: RemoteSource>(
  engine: CacheEngine<S, R>,
  call_timeout: Duration,
  event_capacity: usize,
) -> (StorageConnector, StorageWorker) {
  let (requests_tx, requests_rx) = mpsc::unbounded_channel::<Value>();
  let (replies_tx, replies_rx) = mpsc::unbounded_channel::<Value>();

  let worker = StorageWorker::spawn(engine, requests_rx, replies_tx);
  let connector = StorageConnector::new(requests_tx, replies_rx, call_timeout, event_capacity);
  (connector, worker)
}
