use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::message::{parse_port, Reply, Request};
use crate::cache::{CacheEngine, GetOptions, RecordStore};
use crate::event::StoreEvent;
use crate::remote::RemoteSource;

/// Worker-side endpoint of the broker: serves requests from the engine and
/// relays engine events back to the connector.
pub struct StorageWorker {
  tasks: Vec<JoinHandle<()>>,
}

impl StorageWorker {
  pub fn spawn<S: RecordStore, R: RemoteSource>(
    engine: CacheEngine<S, R>,
    inbox: mpsc::UnboundedReceiver<Value>,
    port: mpsc::UnboundedSender<Value>,
  ) -> Self {
    let relay = tokio::spawn(relay(engine.events().subscribe(), port.clone()));
    let serve = tokio::spawn(serve(engine, inbox, port));
    Self {
      tasks: vec![relay, serve],
    }
  }
}

impl Drop for StorageWorker {
  fn drop(&mut self) {
    for task in &self.tasks {
      task.abort();
    }
  }
}

async fn relay(mut events: broadcast::Receiver<StoreEvent>, port: mpsc::UnboundedSender<Value>) {
  loop {
    match events.recv().await {
      Ok(event) => match serde_json::to_value(&event) {
        Ok(message) => {
          debug!("worker -> connector: {}", message);
          if port.send(message).is_err() {
            return;
          }
        }
        Err(err) => warn!("Failed to encode {} event: {}", event.name(), err),
      },
      Err(broadcast::error::RecvError::Lagged(skipped)) => {
        warn!("Event relay fell behind, {} events dropped", skipped);
      }
      Err(broadcast::error::RecvError::Closed) => return,
    }
  }
}

async fn serve<S: RecordStore, R: RemoteSource>(
  engine: CacheEngine<S, R>,
  mut inbox: mpsc::UnboundedReceiver<Value>,
  port: mpsc::UnboundedSender<Value>,
) {
  while let Some(message) = inbox.recv().await {
    debug!("worker <- connector: {}", message);
    match serde_json::from_value::<Request>(message.clone()) {
      Ok(Request::Connect { host, port: requested }) => connect(&engine, host, &requested),
      Ok(Request::Get {
        store_name,
        object_id,
        options,
        msg_id,
      }) => {
        tokio::spawn(answer(
          engine.clone(),
          port.clone(),
          store_name,
          object_id,
          options,
          msg_id,
        ));
      }
      Err(err) => reject(&port, &message, &err),
    }
  }
  debug!("Connector channel closed, worker stopping");
}

fn connect<S: RecordStore, R: RemoteSource>(
  engine: &CacheEngine<S, R>,
  host: Option<String>,
  requested: &Value,
) {
  let (Some(host), Some(port)) = (host.filter(|h| !h.is_empty()), parse_port(requested)) else {
    warn!("Invalid or unspecified host:port ({})", requested);
    return;
  };

  let engine = engine.clone();
  tokio::spawn(async move {
    if let Err(err) = engine.connect(&host, port).await {
      warn!("Connection to {}:{} failed: {:#}", host, port, err);
    }
  });
}

async fn answer<S: RecordStore, R: RemoteSource>(
  engine: CacheEngine<S, R>,
  port: mpsc::UnboundedSender<Value>,
  store_name: String,
  object_id: Option<String>,
  options: GetOptions,
  msg_id: u32,
) {
  // Nested task so a panic inside the engine still produces a reply
  let read = tokio::spawn(async move {
    engine
      .get(&store_name, object_id.as_deref(), options)
      .await
  });

  let reply = match read.await {
    Ok(Ok(result)) => Reply::ok("get", result, msg_id),
    Ok(Err(err)) => {
      warn!("Get for message {} failed: {:#}", msg_id, err);
      Reply::error("get", format!("{:#}", err), msg_id)
    }
    Err(err) => {
      error!("Get task for message {} died: {}", msg_id, err);
      Reply::error("get", err.to_string(), msg_id)
    }
  };
  send(&port, &reply);
}

fn reject(port: &mpsc::UnboundedSender<Value>, message: &Value, err: &serde_json::Error) {
  let msg_id = message
    .get("msgID")
    .and_then(Value::as_u64)
    .and_then(|id| u32::try_from(id).ok());
  let Some(msg_id) = msg_id else {
    warn!("Dropping undecodable request {}: {}", message, err);
    return;
  };

  let kind = message
    .get("type")
    .and_then(Value::as_str)
    .unwrap_or("error");
  warn!("Rejecting request {}: {}", msg_id, err);
  send(port, &Reply::error(kind, format!("Invalid request: {}", err), msg_id));
}

fn send(port: &mpsc::UnboundedSender<Value>, reply: &Reply) {
  match serde_json::to_value(reply) {
    Ok(message) => {
      debug!("worker -> connector: {}", message);
      if port.send(message).is_err() {
        debug!("Connector gone, dropping reply {}", reply.msg_id);
      }
    }
    Err(err) => error!("Failed to encode reply {}: {}", reply.msg_id, err),
  }
}
