//! Collapses concurrent fetches of the same resource into one request.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

use super::traits::FailedRefresh;
use crate::remote::FetchError;

/// A fetch that any number of callers can await.
pub type SharedFetch = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

#[derive(Debug, Clone, Copy)]
struct RefreshMark {
  at: Instant,
  succeeded: bool,
}

struct ActiveQuery {
  generation: u64,
  fetch: SharedFetch,
}

#[derive(Default)]
struct QueryTable {
  generation: u64,
  active: HashMap<String, ActiveQuery>,
  last_refresh: HashMap<String, RefreshMark>,
}

/// Table of in-flight remote queries keyed by URI.
///
/// Holds at most one entry per URI. The entry is removed when its fetch
/// settles, and the settle time is recorded whatever the outcome. A fetch
/// that outlives a [`clear`](Self::clear) never removes its successor.
#[derive(Clone, Default)]
pub struct InflightQueries {
  table: Arc<Mutex<QueryTable>>,
}

impl InflightQueries {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, QueryTable> {
    self.table.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Join the running fetch for `uri`, or start one with `fetch`.
  ///
  /// The returned future must be polled for the entry to ever settle.
  pub fn run<F, Fut>(&self, uri: &str, fetch: F) -> SharedFetch
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
  {
    let mut table = self.lock();
    if let Some(running) = table.active.get(uri) {
      debug!("Joining running query for {}", uri);
      return running.fetch.clone();
    }

    table.generation += 1;
    let generation = table.generation;
    let key = uri.to_string();
    let queries = Arc::clone(&self.table);
    let request = fetch();
    let shared = async move {
      let result = request.await;
      let mut table = queries.lock().unwrap_or_else(PoisonError::into_inner);
      if table.active.get(&key).map(|q| q.generation) == Some(generation) {
        table.active.remove(&key);
      }
      table.last_refresh.insert(
        key,
        RefreshMark {
          at: Instant::now(),
          succeeded: result.is_ok(),
        },
      );
      result
    }
    .boxed()
    .shared();

    table.active.insert(
      uri.to_string(),
      ActiveQuery {
        generation,
        fetch: shared.clone(),
      },
    );
    shared
  }

  /// Whether the last refresh of `uri` is younger than `max_age`.
  pub fn is_fresh(&self, uri: &str, max_age: Duration, policy: FailedRefresh) -> bool {
    match self.lock().last_refresh.get(uri) {
      Some(mark) if mark.succeeded || policy == FailedRefresh::Suppress => {
        mark.at.elapsed() < max_age
      }
      _ => false,
    }
  }

  #[cfg(test)]
  pub fn is_running(&self, uri: &str) -> bool {
    self.lock().active.contains_key(uri)
  }

  /// Forget every running query. Refresh timestamps are kept.
  pub fn clear(&self) {
    self.lock().active.clear();
  }
}
