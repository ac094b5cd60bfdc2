use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// Payload of the `storeItem*` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDetail {
  pub value: Value,
  #[serde(rename = "storeName")]
  pub store_name: String,
}

/// Lifecycle and change notifications emitted by the cache engine.
///
/// Serializes to the relay wire shape `{ "type": <name>, "msg": <detail> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "msg")]
pub enum StoreEvent {
  #[serde(rename = "connecting")]
  Connecting { host: String },
  #[serde(rename = "connectionEstablished")]
  ConnectionEstablished { host: String },
  #[serde(rename = "connectionLost")]
  ConnectionLost {
    #[serde(rename = "type")]
    code: u16,
    message: String,
  },
  #[serde(rename = "storeItemAdded")]
  ItemAdded(ItemDetail),
  #[serde(rename = "storeItemChanged")]
  ItemChanged(ItemDetail),
  #[serde(rename = "storeItemRemoved")]
  ItemRemoved(ItemDetail),
}

impl StoreEvent {
  pub fn name(&self) -> &'static str {
    match self {
      StoreEvent::Connecting { .. } => "connecting",
      StoreEvent::ConnectionEstablished { .. } => "connectionEstablished",
      StoreEvent::ConnectionLost { .. } => "connectionLost",
      StoreEvent::ItemAdded(_) => "storeItemAdded",
      StoreEvent::ItemChanged(_) => "storeItemChanged",
      StoreEvent::ItemRemoved(_) => "storeItemRemoved",
    }
  }

  pub fn added(store_name: &str, value: Value) -> Self {
    StoreEvent::ItemAdded(ItemDetail {
      value,
      store_name: store_name.to_string(),
    })
  }

  pub fn changed(store_name: &str, value: Value) -> Self {
    StoreEvent::ItemChanged(ItemDetail {
      value,
      store_name: store_name.to_string(),
    })
  }

  pub fn removed(store_name: &str, value: Value) -> Self {
    StoreEvent::ItemRemoved(ItemDetail {
      value,
      store_name: store_name.to_string(),
    })
  }
}

/// Broadcast bus for typed events.
///
/// Subscribing hands out a receiver; dropping the receiver unsubscribes.
#[derive(Debug, Clone)]
pub struct EventBus<T> {
  tx: broadcast::Sender<T>,
}

impl<T: Clone + std::fmt::Debug> EventBus<T> {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<T> {
    self.tx.subscribe()
  }

  /// Publish to all current subscribers. Events with no subscriber are dropped.
  pub fn publish(&self, event: T) {
    if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
      trace!("No subscribers for {:?}", event);
    }
  }
}
