//! Core types for the caching system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single entity: named fields mapped to JSON values.
pub type Record = Map<String, Value>;

/// Per-read options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetOptions {
  /// Refresh from the server even if the last refresh is still within the expiry window
  #[serde(default)]
  pub force_refresh: bool,
}

/// Result from a cache read, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was written locally (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from local data.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at,
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Local store; a background refresh may be in progress
  Cache,
  /// Nothing usable was cached, so the read waited for the server
  Network,
}

/// What to do with a refresh that failed, when deciding whether the
/// expiry window still holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailedRefresh {
  /// Failed refreshes do not count; the next read tries again
  #[default]
  Retry,
  /// Any settled refresh counts, successful or not
  Suppress,
}
