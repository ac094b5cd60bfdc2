//! Applies server push events to the cache engine.
//!
//! Event envelopes look like
//! `{"type": "ItemStateEvent", "topic": "smarthome/items/Lamp/state", "payload": "{...}"}`
//! where `payload` is itself JSON-encoded text.

use color_eyre::{
  eyre::{bail, eyre, Report, WrapErr},
  Result,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cache::{CacheEngine, RecordStore};
use crate::remote::{FetchError, RemoteSource, SignalStream, StreamSignal};

/// Event types that carry nothing the mirror needs.
const IGNORED_EVENTS: &[&str] = &[
  "InboxAddedEvent",
  "InboxUpdatedEvent",
  "ThingUpdatedEvent",
  "GroupItemStateChangedEvent",
  "ItemStateChangedEvent",
  "ItemStatePredictedEvent",
  "ItemCommandEvent",
  "ThingStatusInfoEvent",
  "ThingStatusInfoChangedEvent",
];

#[derive(Debug, Deserialize)]
struct Envelope {
  #[serde(rename = "type")]
  kind: Option<String>,
  topic: Option<String>,
  payload: Option<String>,
}

/// Parsed `<root>/<collection>/<entityId>[/<field>]` topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
  pub collection: String,
  pub entity_id: String,
  pub field: Option<String>,
}

impl Topic {
  pub fn parse(topic: &str) -> Option<Self> {
    let mut parts = topic.split('/');
    let _root = parts.next()?;
    let collection = parts.next().filter(|s| !s.is_empty())?;
    let entity_id = parts.next().filter(|s| !s.is_empty())?;
    let field = parts.next().filter(|s| !s.is_empty());

    Some(Self {
      collection: collection.to_string(),
      entity_id: entity_id.to_string(),
      field: field.map(String::from),
    })
  }
}

/// A push event that mutates the mirror.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
  Added {
    collection: String,
    record: Value,
  },
  Updated {
    collection: String,
    record: Value,
  },
  FieldChanged {
    collection: String,
    id: String,
    field: String,
    value: Value,
  },
  Removed {
    collection: String,
    record: Value,
  },
}

/// Outcome of decoding one stream message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
  Event(PushEvent),
  /// Known type with no effect on the mirror
  Ignored,
  /// Type this client does not know
  Unknown(String),
}

/// Decode the raw `data` of one server-sent event.
pub fn decode(data: &str) -> Result<Decoded> {
  let envelope: Envelope =
    serde_json::from_str(data).wrap_err("Event stream message is not a JSON envelope")?;

  let (Some(kind), Some(topic), Some(payload)) = (envelope.kind, envelope.topic, envelope.payload)
  else {
    bail!("Event stream message has unknown format: {}", data);
  };

  if IGNORED_EVENTS.contains(&kind.as_str()) {
    return Ok(Decoded::Ignored);
  }
  if !matches!(
    kind.as_str(),
    "ItemAddedEvent" | "ItemUpdatedEvent" | "ItemStateEvent" | "ItemRemovedEvent"
  ) {
    return Ok(Decoded::Unknown(kind));
  }

  let topic = Topic::parse(&topic).ok_or_else(|| eyre!("Malformed event topic '{}'", topic))?;
  let payload: Value = serde_json::from_str(&payload)
    .wrap_err_with(|| format!("Invalid payload for {} on {:?}", kind, topic))?;

  let event = match kind.as_str() {
    "ItemAddedEvent" => PushEvent::Added {
      collection: topic.collection,
      record: payload,
    },
    // Payload is [updated, previous]; only the updated record matters
    "ItemUpdatedEvent" => match payload {
      Value::Array(mut records) if !records.is_empty() => PushEvent::Updated {
        collection: topic.collection,
        record: records.swap_remove(0),
      },
      other => bail!("ItemUpdatedEvent payload is not [new, old]: {}", other),
    },
    "ItemStateEvent" => {
      let field = topic
        .field
        .ok_or_else(|| eyre!("ItemStateEvent topic has no field"))?;
      let value = payload
        .get("value")
        .cloned()
        .ok_or_else(|| eyre!("ItemStateEvent payload has no value: {}", payload))?;
      PushEvent::FieldChanged {
        collection: topic.collection,
        id: topic.entity_id,
        field,
        value,
      }
    }
    _ => PushEvent::Removed {
      collection: topic.collection,
      record: payload,
    },
  };

  Ok(Decoded::Event(event))
}

/// Consumes the push channel of one connection and feeds the cache engine.
///
/// Once the engine moves on to another connection, signals from this stream
/// are dropped.
pub struct Synchronizer<S, R> {
  engine: CacheEngine<S, R>,
  generation: u64,
}

impl<S: RecordStore, R: RemoteSource> Synchronizer<S, R> {
  pub fn new(engine: CacheEngine<S, R>, generation: u64) -> Self {
    Self { engine, generation }
  }

  /// Wait for the stream to open, then keep consuming it on a background task.
  pub async fn start(self, mut stream: SignalStream) -> Result<JoinHandle<()>> {
    loop {
      match stream.next().await {
        Some(StreamSignal::Open) => break,
        Some(StreamSignal::Message(data)) => self.handle_message(&data),
        Some(StreamSignal::Interrupted(reason)) => warn!("Event stream error: {}", reason),
        Some(StreamSignal::Closed { code, message }) => {
          return Err(
            Report::new(FetchError::Status(code))
              .wrap_err(format!("Event stream closed before opening: {}", message)),
          );
        }
        None => bail!("Event stream ended before opening"),
      }
    }

    self.engine.connection_established(self.generation);
    Ok(tokio::spawn(self.run(stream)))
  }

  async fn run(self, mut stream: SignalStream) {
    while let Some(signal) = stream.next().await {
      if !self.engine.is_current(self.generation) {
        debug!("Event stream replaced, stopping");
        return;
      }
      match signal {
        StreamSignal::Open => self.engine.connection_established(self.generation),
        StreamSignal::Message(data) => self.handle_message(&data),
        StreamSignal::Interrupted(reason) => warn!("Event stream error: {}", reason),
        StreamSignal::Closed { code, message } => {
          self.engine.connection_lost(self.generation, code, message);
          return;
        }
      }
    }

    self
      .engine
      .connection_lost(self.generation, 503, "event stream ended".to_string());
  }

  fn handle_message(&self, data: &str) {
    match decode(data) {
      Ok(Decoded::Event(event)) => {
        debug!("Applying {:?}", event);
        if let Err(err) = self.apply(event) {
          warn!("Failed to apply push event: {:#}", err);
        }
      }
      Ok(Decoded::Ignored) => trace!("Ignoring event {}", data),
      Ok(Decoded::Unknown(kind)) => warn!("Unhandled event type {}: {}", kind, data),
      Err(err) => warn!("Dropping event: {:#}", err),
    }
  }

  fn apply(&self, event: PushEvent) -> Result<()> {
    match event {
      PushEvent::Added { collection, record } | PushEvent::Updated { collection, record } => {
        self.engine.insert_or_update(&collection, record)?;
      }
      PushEvent::FieldChanged {
        collection,
        id,
        field,
        value,
      } => {
        self.engine.patch_field(&collection, &id, &field, value)?;
      }
      PushEvent::Removed { collection, record } => {
        self.engine.remove(&collection, record)?;
      }
    }
    Ok(())
  }
}
