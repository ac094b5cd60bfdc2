//! Local mirror of the server's collections.
//!
//! This module provides:
//! - A SQLite record store keyed by collection and record key
//! - A stale-while-revalidate engine that answers from the store first
//! - Deduplication of concurrent fetches of the same URL

mod engine;
mod inflight;
mod storage;
mod traits;

pub use engine::{CacheEngine, CacheSettings, ConnectionState};
pub use storage::{RecordStore, SqliteStorage, StorageLocation};
pub use traits::{CacheResult, CacheSource, FailedRefresh, GetOptions, Record};
