//! Stale-while-revalidate engine between the local record store and the server.

use color_eyre::{
  eyre::{bail, eyre, WrapErr},
  Result,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use super::inflight::{InflightQueries, SharedFetch};
use super::storage::RecordStore;
use super::traits::{CacheResult, FailedRefresh, GetOptions, Record};
use crate::collections::{CollectionDescriptor, Collections, SCHEMA_VERSION};
use crate::event::{EventBus, StoreEvent};
use crate::remote::{FetchError, RemoteSource};
use crate::sync::Synchronizer;

/// State of the link to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Connected,
}

/// Tunables for cache freshness.
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
  /// How long a full-collection refresh stays valid
  pub expire_after: Duration,
  pub failed_refresh: FailedRefresh,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      expire_after: Duration::from_secs(60 * 60),
      failed_refresh: FailedRefresh::default(),
    }
  }
}

struct Session {
  /// Bumped on every teardown; signals from older streams are ignored
  generation: u64,
  host: String,
  base: Option<Url>,
  state: ConnectionState,
  stream: Option<JoinHandle<()>>,
}

struct Inner<S, R> {
  store: S,
  remote: Arc<R>,
  collections: Collections,
  events: EventBus<StoreEvent>,
  queries: InflightQueries,
  settings: CacheSettings,
  session: Mutex<Session>,
  /// Held for the whole of `connect`
  connecting: AsyncMutex<()>,
  /// Held from a store write until its events are published
  writes: Mutex<()>,
}

/// Serves reads from the local store immediately and refreshes them from the
/// server in the background.
///
/// Every write, whether it comes from a refresh or from a push event, goes
/// through the same upsert routine and produces the same change events.
pub struct CacheEngine<S, R> {
  inner: Arc<Inner<S, R>>,
}

impl<S, R> Clone for CacheEngine<S, R> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: RecordStore, R: RemoteSource> CacheEngine<S, R> {
  pub fn new(
    store: S,
    remote: R,
    collections: Collections,
    events: EventBus<StoreEvent>,
    settings: CacheSettings,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        remote: Arc::new(remote),
        collections,
        events,
        queries: InflightQueries::new(),
        settings,
        session: Mutex::new(Session {
          generation: 0,
          host: String::new(),
          base: None,
          state: ConnectionState::Disconnected,
          stream: None,
        }),
        connecting: AsyncMutex::new(()),
        writes: Mutex::new(()),
      }),
    }
  }

  pub fn events(&self) -> &EventBus<StoreEvent> {
    &self.inner.events
  }

  pub fn state(&self) -> ConnectionState {
    self.session().state
  }

  fn session(&self) -> MutexGuard<'_, Session> {
    self
      .inner
      .session
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn write_lock(&self) -> MutexGuard<'_, ()> {
    self
      .inner
      .writes
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Whether `generation` still names the live connection.
  pub(crate) fn is_current(&self, generation: u64) -> bool {
    self.session().generation == generation
  }

  fn base_url(&self) -> Result<Url> {
    self
      .session()
      .base
      .clone()
      .ok_or_else(|| eyre!("Cache engine is not connected"))
  }

  /// Connect to `host:port`, load the eager collections and subscribe to the
  /// event stream.
  ///
  /// Any previous connection is torn down first, and overlapping calls run
  /// one after the other. On failure `connectionLost` is emitted and the error
  /// returned; there is no automatic retry.
  pub async fn connect(&self, host: &str, port: u16) -> Result<()> {
    let _connecting = self.inner.connecting.lock().await;
    self.dispose();

    let label = format!("{}:{}", host, port);
    let generation = {
      let mut session = self.session();
      session.host = label.clone();
      session.state = ConnectionState::Connecting;
      session.generation
    };
    info!("Connecting to {}", label);
    self
      .inner
      .events
      .publish(StoreEvent::Connecting { host: label });

    match self.establish(host, port, generation).await {
      Ok(stream) => {
        let previous = self.session().stream.replace(stream);
        if let Some(previous) = previous {
          previous.abort();
        }
        Ok(())
      }
      Err(err) => {
        let code = err
          .chain()
          .find_map(|e| e.downcast_ref::<FetchError>())
          .map(FetchError::code)
          .unwrap_or(500);
        self.connection_lost(generation, code, format!("{:#}", err));
        Err(err)
      }
    }
  }

  async fn establish(&self, host: &str, port: u16, generation: u64) -> Result<JoinHandle<()>> {
    let base = Url::parse(&format!("http://{}:{}/", host, port))
      .map_err(|e| eyre!("Invalid server address {}:{}: {}", host, port, e))?;

    self.inner.store.open(SCHEMA_VERSION)?;
    self.session().base = Some(base.clone());

    let loads = self
      .inner
      .collections
      .eager()
      .map(|descriptor| self.load_snapshot(&base, descriptor));
    futures::future::try_join_all(loads).await?;

    let events_url = base
      .join("rest/events")
      .map_err(|e| eyre!("Invalid event stream URL: {}", e))?;
    let stream = self
      .inner
      .remote
      .subscribe(&events_url)
      .await
      .wrap_err_with(|| format!("Failed to subscribe to {}", events_url))?;

    Synchronizer::new(self.clone(), generation)
      .start(stream)
      .await
  }

  /// Replace a collection with the server's full snapshot.
  async fn load_snapshot(&self, base: &Url, descriptor: &CollectionDescriptor) -> Result<()> {
    let url = descriptor.collection_url(base)?;
    let json = self
      .query(&url)
      .await
      .wrap_err_with(|| format!("Failed to fetch {}", url))?;

    let Value::Array(entries) = json else {
      warn!("Unknown or invalid data structure for '{}'", descriptor.id);
      return Ok(());
    };

    let records = keyed(descriptor, entries);
    self
      .inner
      .store
      .replace_all(descriptor.id, &records)
      .wrap_err_with(|| format!("Failed to fill '{}'", descriptor.id))?;

    info!("Loaded {} {}", records.len(), descriptor.label);
    Ok(())
  }

  /// Shared, deduplicated fetch of `url`.
  fn query(&self, url: &Url) -> SharedFetch {
    let remote = Arc::clone(&self.inner.remote);
    let target = url.clone();
    self
      .inner
      .queries
      .run(url.as_str(), move || async move { remote.fetch(&target).await })
  }

  /// Read a whole collection or a single record, as JSON.
  ///
  /// A missing record is returned as `null`.
  pub async fn get(&self, collection: &str, id: Option<&str>, options: GetOptions) -> Result<Value> {
    match id {
      Some(id) => {
        let result = self.get_one(collection, id).await?;
        Ok(result.data.map(Value::Object).unwrap_or(Value::Null))
      }
      None => {
        let result = self.get_all(collection, options).await?;
        Ok(Value::Array(
          result.data.into_iter().map(Value::Object).collect(),
        ))
      }
    }
  }

  /// Read a whole collection.
  ///
  /// Returns the local table and refreshes it in the background, unless the
  /// last refresh is still within the expiry window. An empty table waits for
  /// the refresh instead, and its failure is returned.
  pub async fn get_all(
    &self,
    collection: &str,
    options: GetOptions,
  ) -> Result<CacheResult<Vec<Record>>> {
    let descriptor = self.inner.collections.require(collection)?;
    let url = descriptor.collection_url(&self.base_url()?)?;
    let local = self.inner.store.get_all(collection)?;

    let settings = self.inner.settings;
    if !options.force_refresh
      && self
        .inner
        .queries
        .is_fresh(url.as_str(), settings.expire_after, settings.failed_refresh)
    {
      debug!("Serving '{}' from cache", collection);
      return Ok(CacheResult::from_cache(local, None));
    }

    let refresh = self.spawn_refresh(descriptor, url, None);
    if !local.is_empty() {
      return Ok(CacheResult::from_cache(local, None));
    }

    let records = join_refresh(refresh).await?;
    Ok(CacheResult::from_network(records))
  }

  /// Read a single record.
  ///
  /// Returns the local record and refreshes it in the background. Without a
  /// local record the read waits for the server; `None` means the server does
  /// not know the record either.
  pub async fn get_one(&self, collection: &str, id: &str) -> Result<CacheResult<Option<Record>>> {
    let descriptor = self.inner.collections.require(collection)?;
    let url = descriptor.record_url(&self.base_url()?, id)?;
    let local = self.inner.store.get(collection, id)?;

    let refresh = self.spawn_refresh(descriptor, url, Some(id.to_string()));
    match local {
      Some(stored) => Ok(CacheResult::from_cache(
        Some(stored.record),
        Some(stored.cached_at),
      )),
      None => {
        let mut records = join_refresh(refresh).await?;
        Ok(CacheResult::from_network(records.pop()))
      }
    }
  }

  /// Fetch `url` in the background and write the result through
  /// [`Self::insert_all_or_update_all`].
  fn spawn_refresh(
    &self,
    descriptor: &'static CollectionDescriptor,
    url: Url,
    id: Option<String>,
  ) -> JoinHandle<Result<Vec<Record>>> {
    let engine = self.clone();
    let fetch = self.query(&url);

    tokio::spawn(async move {
      let result: Result<Vec<Record>> = async {
        let json = fetch
          .await
          .wrap_err_with(|| format!("REST API query failed for {}", url))?;

        // Without single-record fetch the lookup got the whole collection; store all of it
        let (records, wanted) = match (&id, json) {
          (Some(_), json) if descriptor.single_fetch => (vec![json], None),
          (id, Value::Array(entries)) => (entries, id.as_deref()),
          (_, other) => bail!("Unexpected response from {}: {}", url, other),
        };

        let written = engine.insert_all_or_update_all(descriptor.id, records)?;
        Ok(match wanted {
          Some(id) => written
            .into_iter()
            .filter(|record| key_of(record.get(descriptor.key)).as_deref() == Some(id))
            .collect(),
          None => written,
        })
      }
      .await;

      if let Err(err) = &result {
        warn!("{:#}", err);
      }
      result
    })
  }

  /// Upsert one record. See [`Self::insert_all_or_update_all`].
  pub fn insert_or_update(&self, collection: &str, record: Value) -> Result<Option<Record>> {
    Ok(self.insert_all_or_update_all(collection, vec![record])?.pop())
  }

  /// Upsert records in one transaction and emit change events in input order.
  ///
  /// A new key emits `storeItemAdded`; an existing key emits `storeItemChanged`
  /// only when the stored record differs. Entries that are not objects or lack
  /// the key field are logged and skipped. Returns the records written.
  pub fn insert_all_or_update_all(&self, collection: &str, records: Vec<Value>) -> Result<Vec<Record>> {
    let descriptor = self.inner.collections.require(collection)?;
    let entries = keyed(descriptor, records);
    if entries.is_empty() {
      return Ok(Vec::new());
    }

    let _write = self.write_lock();
    let previous = self
      .inner
      .store
      .upsert_all(collection, &entries)
      .inspect_err(|e| error!("Failed to insert into '{}': {:#}", collection, e))?;

    for ((_, record), prior) in entries.iter().zip(previous) {
      match prior {
        None => self
          .inner
          .events
          .publish(StoreEvent::added(collection, Value::Object(record.clone()))),
        Some(prior) if prior != *record => self
          .inner
          .events
          .publish(StoreEvent::changed(collection, Value::Object(record.clone()))),
        Some(_) => {}
      }
    }

    Ok(entries.into_iter().map(|(_, record)| record).collect())
  }

  /// Delete the record with the same key as `record` and emit `storeItemRemoved`.
  pub fn remove(&self, collection: &str, record: Value) -> Result<()> {
    let descriptor = self.inner.collections.require(collection)?;
    let Some(key) = record_key(descriptor, &record) else {
      warn!(
        "Remove from '{}' needs an object with a '{}' field, got {}",
        collection, descriptor.key, record
      );
      return Ok(());
    };

    let _write = self.write_lock();
    self
      .inner
      .store
      .remove(collection, &key)
      .inspect_err(|e| error!("Failed to remove '{}' from '{}': {:#}", key, collection, e))?;
    self
      .inner
      .events
      .publish(StoreEvent::removed(collection, record));
    Ok(())
  }

  /// Set `field` of record `id` and emit `storeItemChanged`.
  ///
  /// A missing record is logged and nothing is emitted.
  pub fn patch_field(
    &self,
    collection: &str,
    id: &str,
    field: &str,
    value: Value,
  ) -> Result<Option<Record>> {
    self.inner.collections.require(collection)?;

    let _write = self.write_lock();
    match self
      .inner
      .store
      .patch_field(collection, id, field, &value)
      .inspect_err(|e| error!("Failed to update '{}': {}.{}: {:#}", collection, id, field, e))?
    {
      Some(record) => {
        self
          .inner
          .events
          .publish(StoreEvent::changed(collection, Value::Object(record.clone())));
        Ok(Some(record))
      }
      None => {
        warn!("Failed to update '{}': {} not found", collection, id);
        Ok(None)
      }
    }
  }

  /// Stream opened: the engine is connected.
  pub(crate) fn connection_established(&self, generation: u64) {
    let host = {
      let mut session = self.session();
      if session.generation != generation {
        debug!("Ignoring open signal from a replaced stream");
        return;
      }
      session.state = ConnectionState::Connected;
      session.host.clone()
    };
    info!("Connection established to {}", host);
    self
      .inner
      .events
      .publish(StoreEvent::ConnectionEstablished { host });
  }

  /// Connection failed or the stream died.
  pub(crate) fn connection_lost(&self, generation: u64, code: u16, message: String) {
    let host = {
      let mut session = self.session();
      if session.generation != generation {
        debug!("Ignoring loss of a replaced stream ({}): {}", code, message);
        return;
      }
      session.state = ConnectionState::Disconnected;
      session.host.clone()
    };
    warn!("Connection lost to {} ({}): {}", host, code, message);
    self
      .inner
      .events
      .publish(StoreEvent::ConnectionLost { code, message });
  }

  /// Close the event stream and the record store, and forget running queries.
  ///
  /// Callers awaiting a reply elsewhere are not settled by this.
  pub fn dispose(&self) {
    let stream = {
      let mut session = self.session();
      session.generation += 1;
      session.state = ConnectionState::Disconnected;
      session.base = None;
      session.stream.take()
    };
    if let Some(stream) = stream {
      stream.abort();
    }
    self.inner.store.close();
    self.inner.queries.clear();
  }
}

async fn join_refresh(refresh: JoinHandle<Result<Vec<Record>>>) -> Result<Vec<Record>> {
  refresh
    .await
    .map_err(|e| eyre!("Refresh task failed: {}", e))?
}

/// Key of `record` under the collection's key field.
fn record_key(descriptor: &CollectionDescriptor, record: &Value) -> Option<String> {
  key_of(record.get(descriptor.key))
}

fn key_of(field: Option<&Value>) -> Option<String> {
  match field? {
    Value::String(key) => Some(key.clone()),
    Value::Number(key) => Some(key.to_string()),
    _ => None,
  }
}

/// Pair every valid record with its key, logging and dropping the rest.
fn keyed(descriptor: &CollectionDescriptor, records: Vec<Value>) -> Vec<(String, Record)> {
  records
    .into_iter()
    .filter_map(|value| {
      let key = record_key(descriptor, &value);
      match (key, value) {
        (Some(key), Value::Object(record)) => Some((key, record)),
        (_, value) => {
          warn!(
            "'{}' must be written with objects carrying '{}', got {}",
            descriptor.id, descriptor.key, value
          );
          None
        }
      }
    })
    .collect()
}
