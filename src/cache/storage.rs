//! Record store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use super::traits::Record;

/// A single stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
  pub record: Record,
  /// When the record was last written locally
  pub cached_at: DateTime<Utc>,
}

/// Trait for persistent record stores.
///
/// Every mutating method runs as one transaction: either all of its writes land
/// or none do.
pub trait RecordStore: Send + Sync + 'static {
  /// Open the store at `version`, wiping every collection if the stored
  /// version differs.
  fn open(&self, version: u32) -> Result<()>;

  /// Release the underlying handle. Further calls fail until reopened.
  fn close(&self);

  fn get(&self, collection: &str, key: &str) -> Result<Option<StoredRecord>>;

  /// All records of a collection in insertion order.
  fn get_all(&self, collection: &str) -> Result<Vec<Record>>;

  /// Clear the collection and insert `records`.
  fn replace_all(&self, collection: &str, records: &[(String, Record)]) -> Result<()>;

  /// Upsert `records` in order, returning the record each one replaced.
  fn upsert_all(&self, collection: &str, records: &[(String, Record)])
    -> Result<Vec<Option<Record>>>;

  /// Delete by key. Returns whether a record was removed.
  fn remove(&self, collection: &str, key: &str) -> Result<bool>;

  /// Set one field of an existing record. Returns the updated record, or
  /// `None` if no record has that key.
  fn patch_field(
    &self,
    collection: &str,
    key: &str,
    field: &str,
    value: &Value,
  ) -> Result<Option<Record>>;
}

/// Where the SQLite database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
  File(PathBuf),
  Memory,
}

/// SQLite-based record storage.
pub struct SqliteStorage {
  location: StorageLocation,
  conn: Mutex<Option<Connection>>,
}

impl SqliteStorage {
  pub fn new(location: StorageLocation) -> Self {
    Self {
      location,
      conn: Mutex::new(None),
    }
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("habsync").join("cache.db"))
  }

  fn connect(&self) -> Result<Connection> {
    match &self.location {
      StorageLocation::Memory => Connection::open_in_memory()
        .map_err(|e| eyre!("Failed to open in-memory database: {}", e)),
      StorageLocation::File(path) => open_file(path),
    }
  }

  fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let conn = guard
      .as_mut()
      .ok_or_else(|| eyre!("Record store is not open"))?;
    f(conn)
  }
}

fn open_file(path: &Path) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
  }

  Connection::open(path)
    .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))
}

/// Schema for the record table.
const RECORD_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    record_key TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (collection, record_key)
);
"#;

const UPSERT_RECORD: &str = "INSERT INTO records (collection, record_key, data, cached_at)
   VALUES (?, ?, ?, datetime('now'))
   ON CONFLICT (collection, record_key)
   DO UPDATE SET data = excluded.data, cached_at = excluded.cached_at";

/// Drop every table and recreate the schema at `version`.
fn recreate(conn: &mut Connection, version: u32) -> Result<()> {
  let tx = conn
    .transaction()
    .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

  let tables: Vec<String> = {
    let mut stmt = tx
      .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")
      .map_err(|e| eyre!("Failed to list tables: {}", e))?;
    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list tables: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to list tables: {}", e))?;
    names
  };

  for table in &tables {
    tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\"", table.replace('"', "\"\"")))
      .map_err(|e| eyre!("Failed to drop table {}: {}", table, e))?;
  }

  tx.execute_batch(RECORD_SCHEMA)
    .map_err(|e| eyre!("Failed to create record table: {}", e))?;
  tx.pragma_update(None, "user_version", version)
    .map_err(|e| eyre!("Failed to set schema version: {}", e))?;

  tx.commit()
    .map_err(|e| eyre!("Failed to commit schema upgrade: {}", e))
}

fn decode(data: &[u8]) -> Result<Record> {
  serde_json::from_slice(data).map_err(|e| eyre!("Failed to deserialize record: {}", e))
}

fn encode(record: &Record) -> Result<Vec<u8>> {
  serde_json::to_vec(record).map_err(|e| eyre!("Failed to serialize record: {}", e))
}

fn read_record(conn: &Connection, collection: &str, key: &str) -> Result<Option<Record>> {
  let data: Option<Vec<u8>> = conn
    .query_row(
      "SELECT data FROM records WHERE collection = ? AND record_key = ?",
      params![collection, key],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| eyre!("Failed to read record {}:{}: {}", collection, key, e))?;

  data.as_deref().map(decode).transpose()
}

impl RecordStore for SqliteStorage {
  fn open(&self, version: u32) -> Result<()> {
    let mut conn = self.connect()?;

    let stored: u32 = conn
      .pragma_query_value(None, "user_version", |row| row.get(0))
      .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

    if stored != version {
      info!(
        "Upgrading record store from version {} to {}",
        stored, version
      );
      recreate(&mut conn, version)?;
    } else {
      conn
        .execute_batch(RECORD_SCHEMA)
        .map_err(|e| eyre!("Failed to run record store migrations: {}", e))?;
    }

    let mut guard = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *guard = Some(conn);
    Ok(())
  }

  fn close(&self) {
    if let Ok(mut guard) = self.conn.lock() {
      if guard.take().is_some() {
        debug!("Record store closed");
      }
    }
  }

  fn get(&self, collection: &str, key: &str) -> Result<Option<StoredRecord>> {
    self.with_conn(|conn| {
      let row: Option<(Vec<u8>, String)> = conn
        .query_row(
          "SELECT data, cached_at FROM records WHERE collection = ? AND record_key = ?",
          params![collection, key],
          |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read record {}:{}: {}", collection, key, e))?;

      match row {
        Some((data, cached_at)) => Ok(Some(StoredRecord {
          record: decode(&data)?,
          cached_at: parse_datetime(&cached_at)?,
        })),
        None => Ok(None),
      }
    })
  }

  fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
    self.with_conn(|conn| {
      let mut stmt = conn
        .prepare("SELECT data FROM records WHERE collection = ? ORDER BY rowid")
        .map_err(|e| eyre!("Failed to prepare record query: {}", e))?;

      let rows = stmt
        .query_map(params![collection], |row| row.get::<_, Vec<u8>>(0))
        .map_err(|e| eyre!("Failed to query records: {}", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to query records: {}", e))?;

      rows.iter().map(|data| decode(data)).collect()
    })
  }

  fn replace_all(&self, collection: &str, records: &[(String, Record)]) -> Result<()> {
    self.with_conn(|conn| {
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

      tx.execute("DELETE FROM records WHERE collection = ?", params![collection])
        .map_err(|e| eyre!("Failed to clear '{}': {}", collection, e))?;

      for (key, record) in records {
        tx.execute(UPSERT_RECORD, params![collection, key, encode(record)?])
          .map_err(|e| eyre!("Failed to add to '{}': {}", collection, e))?;
      }

      tx.commit()
        .map_err(|e| eyre!("Failed to fill '{}': {}", collection, e))
    })
  }

  fn upsert_all(
    &self,
    collection: &str,
    records: &[(String, Record)],
  ) -> Result<Vec<Option<Record>>> {
    self.with_conn(|conn| {
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

      let mut previous = Vec::with_capacity(records.len());
      for (key, record) in records {
        previous.push(read_record(&tx, collection, key)?);
        tx.execute(UPSERT_RECORD, params![collection, key, encode(record)?])
          .map_err(|e| eyre!("Failed to store {}:{}: {}", collection, key, e))?;
      }

      tx.commit()
        .map_err(|e| eyre!("Failed to commit into '{}': {}", collection, e))?;
      Ok(previous)
    })
  }

  fn remove(&self, collection: &str, key: &str) -> Result<bool> {
    self.with_conn(|conn| {
      let removed = conn
        .execute(
          "DELETE FROM records WHERE collection = ? AND record_key = ?",
          params![collection, key],
        )
        .map_err(|e| eyre!("Failed to remove {}:{}: {}", collection, key, e))?;
      Ok(removed > 0)
    })
  }

  fn patch_field(
    &self,
    collection: &str,
    key: &str,
    field: &str,
    value: &Value,
  ) -> Result<Option<Record>> {
    self.with_conn(|conn| {
      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

      let Some(mut record) = read_record(&tx, collection, key)? else {
        return Ok(None);
      };
      record.insert(field.to_string(), value.clone());

      tx.execute(UPSERT_RECORD, params![collection, key, encode(&record)?])
        .map_err(|e| eyre!("Failed to update {}:{}: {}", collection, key, e))?;
      tx.commit()
        .map_err(|e| eyre!("Failed to update into '{}': {}", collection, e))?;

      Ok(Some(record))
    })
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
  }

  fn item(name: &str, state: &str) -> (String, Record) {
    (name.to_string(), record(json!({"name": name, "state": state})))
  }

  fn open_memory() -> SqliteStorage {
    let storage = SqliteStorage::new(StorageLocation::Memory);
    storage.open(3).unwrap();
    storage
  }

  #[test]
  fn test_upsert_returns_previous_records_in_order() {
    let storage = open_memory();

    let previous = storage
      .upsert_all("items", &[item("A", "ON"), item("B", "OFF"), item("A", "OFF")])
      .unwrap();

    assert_eq!(previous[0], None);
    assert_eq!(previous[1], None);
    assert_eq!(previous[2], Some(record(json!({"name": "A", "state": "ON"}))));

    let stored = storage.get("items", "A").unwrap().unwrap();
    assert_eq!(stored.record, record(json!({"name": "A", "state": "OFF"})));
  }

  #[test]
  fn test_get_all_keeps_insertion_order() {
    let storage = open_memory();
    storage
      .upsert_all("items", &[item("Z", "1"), item("A", "2")])
      .unwrap();
    storage.upsert_all("items", &[item("Z", "3")]).unwrap();

    let names: Vec<_> = storage
      .get_all("items")
      .unwrap()
      .into_iter()
      .map(|r| r["name"].clone())
      .collect();
    assert_eq!(names, vec![json!("Z"), json!("A")]);
  }

  #[test]
  fn test_replace_all_clears_only_that_collection() {
    let storage = open_memory();
    storage.upsert_all("items", &[item("A", "ON")]).unwrap();
    storage.upsert_all("things", &[item("T", "ONLINE")]).unwrap();

    storage.replace_all("items", &[item("B", "OFF")]).unwrap();

    assert!(storage.get("items", "A").unwrap().is_none());
    assert!(storage.get("items", "B").unwrap().is_some());
    assert_eq!(storage.get_all("things").unwrap().len(), 1);
  }

  #[test]
  fn test_patch_field_missing_record() {
    let storage = open_memory();
    let patched = storage
      .patch_field("items", "Z", "state", &json!("ON"))
      .unwrap();
    assert!(patched.is_none());
    assert!(storage.get_all("items").unwrap().is_empty());
  }

  #[test]
  fn test_patch_field_and_remove() {
    let storage = open_memory();
    storage.upsert_all("items", &[item("A", "ON")]).unwrap();

    let patched = storage
      .patch_field("items", "A", "state", &json!("OFF"))
      .unwrap()
      .unwrap();
    assert_eq!(patched["state"], json!("OFF"));

    assert!(storage.remove("items", "A").unwrap());
    assert!(!storage.remove("items", "A").unwrap());
  }

  #[test]
  fn test_closed_store_rejects_reads() {
    let storage = open_memory();
    storage.close();
    assert!(storage.get_all("items").is_err());
  }

  #[test]
  fn test_version_change_wipes_every_collection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    let storage = SqliteStorage::new(StorageLocation::File(path.clone()));
    storage.open(3).unwrap();
    storage.upsert_all("items", &[item("A", "ON")]).unwrap();
    storage.upsert_all("things", &[item("T", "ONLINE")]).unwrap();
    storage.close();

    // Same version keeps data
    storage.open(3).unwrap();
    assert_eq!(storage.get_all("items").unwrap().len(), 1);
    storage.close();

    let upgraded = SqliteStorage::new(StorageLocation::File(path));
    upgraded.open(4).unwrap();
    assert!(upgraded.get_all("items").unwrap().is_empty());
    assert!(upgraded.get_all("things").unwrap().is_empty());
  }
}
