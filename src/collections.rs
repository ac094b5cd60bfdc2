//! Static description of the remote collections mirrored in the local store.

use color_eyre::{eyre::eyre, Result};
use url::Url;

/// Version of the local record layout. Opening a store written with any other
/// version wipes every collection.
pub const SCHEMA_VERSION: u32 = 3;

/// Metadata for one mirrored collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionDescriptor {
  /// Collection name, also used as the local table name
  pub id: &'static str,
  /// REST resource relative to the server root, optionally with a query string
  pub uri: &'static str,
  /// Record field holding the unique key
  pub key: &'static str,
  /// Whether `<uri>/<id>` returns a single record
  pub single_fetch: bool,
  /// Whether the full collection is loaded on connect
  pub eager: bool,
  pub label: &'static str,
}

impl CollectionDescriptor {
  /// URL of the full collection resource.
  pub fn collection_url(&self, base: &Url) -> Result<Url> {
    base
      .join(self.uri)
      .map_err(|e| eyre!("Invalid resource '{}' for '{}': {}", self.uri, self.id, e))
  }

  /// URL to fetch when refreshing a single record.
  ///
  /// Collections without single-record support fall back to the collection URL.
  pub fn record_url(&self, base: &Url, id: &str) -> Result<Url> {
    let mut url = self.collection_url(base)?;
    if self.single_fetch {
      url
        .path_segments_mut()
        .map_err(|_| eyre!("Resource URL for '{}' cannot take a record id", self.id))?
        .pop_if_empty()
        .push(id);
    }
    Ok(url)
  }
}

/// Collections known to the openHAB REST API.
pub const DEFAULT_COLLECTIONS: &[CollectionDescriptor] = &[
  CollectionDescriptor {
    id: "items",
    uri: "rest/items?metadata=.*",
    key: "name",
    single_fetch: true,
    eager: true,
    label: "Items",
  },
  CollectionDescriptor {
    id: "things",
    uri: "rest/things",
    key: "UID",
    single_fetch: false,
    eager: false,
    label: "Things",
  },
];

/// Immutable lookup table of collection descriptors.
#[derive(Debug, Clone, Copy)]
pub struct Collections {
  descriptors: &'static [CollectionDescriptor],
}

impl Collections {
  pub fn new(descriptors: &'static [CollectionDescriptor]) -> Self {
    Self { descriptors }
  }

  pub fn get(&self, id: &str) -> Option<&'static CollectionDescriptor> {
    self.descriptors.iter().find(|d| d.id == id)
  }

  /// Descriptor lookup that fails for unknown collections.
  pub fn require(&self, id: &str) -> Result<&'static CollectionDescriptor> {
    self
      .get(id)
      .ok_or_else(|| eyre!("Unknown collection '{}'", id))
  }

  /// Collections loaded in full on connect.
  pub fn eager(&self) -> impl Iterator<Item = &'static CollectionDescriptor> {
    self.descriptors.iter().filter(|d| d.eager)
  }
}

impl Default for Collections {
  fn default() -> Self {
    Self::new(DEFAULT_COLLECTIONS)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn base() -> Url {
    Url::parse("http://openhab.local:8080/").unwrap()
  }

  #[test]
  fn test_collection_url_keeps_query() {
    let items = Collections::default().require("items").unwrap();
    let url = items.collection_url(&base()).unwrap();
    assert_eq!(url.path(), "/rest/items");
    assert_eq!(url.query(), Some("metadata=.*"));
  }

  #[test]
  fn test_record_url_appends_id() {
    let items = Collections::default().require("items").unwrap();
    let url = items.record_url(&base(), "Kitchen Light").unwrap();
    assert_eq!(url.path(), "/rest/items/Kitchen%20Light");
    assert_eq!(url.query(), Some("metadata=.*"));
  }

  #[test]
  fn test_record_url_without_single_fetch() {
    let things = Collections::default().require("things").unwrap();
    let url = things.record_url(&base(), "zwave:node:1").unwrap();
    assert_eq!(url.path(), "/rest/things");
  }

  #[test]
  fn test_unknown_collection() {
    assert!(Collections::default().require("bindings").is_err());
    assert_eq!(Collections::default().eager().count(), 1);
  }
}
