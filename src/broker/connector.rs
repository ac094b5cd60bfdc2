use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::message::{Reply, Request};
use super::queue::MessageQueue;
use super::BrokerError;
use crate::cache::GetOptions;
use crate::event::{EventBus, StoreEvent};

/// Notification relayed from the worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConnectorEvent {
  Store(StoreEvent),
  /// Relay with a type this client does not model
  Message(Value),
}

/// Client-side endpoint of the broker.
///
/// Requests go out over `port`; replies and relayed events come back on the
/// inbox and are consumed by a listener task.
pub struct StorageConnector {
  port: mpsc::UnboundedSender<Value>,
  queue: MessageQueue,
  events: EventBus<ConnectorEvent>,
  listener: JoinHandle<()>,
}

impl StorageConnector {
  pub fn new(
    port: mpsc::UnboundedSender<Value>,
    inbox: mpsc::UnboundedReceiver<Value>,
    call_timeout: Duration,
    event_capacity: usize,
  ) -> Self {
    let queue = MessageQueue::new(call_timeout);
    let events = EventBus::new(event_capacity);
    let listener = tokio::spawn(listen(inbox, queue.clone(), events.clone()));

    Self {
      port,
      queue,
      events,
      listener,
    }
  }

  pub fn events(&self) -> &EventBus<ConnectorEvent> {
    &self.events
  }

  /// Ask the worker to connect. No reply is expected.
  pub fn connect(&self, host: &str, port: u16) -> Result<(), BrokerError> {
    self.post(&Request::Connect {
      host: Some(host.to_string()),
      port: Value::from(port),
    })
  }

  /// Read a collection, or one record when `id` is given.
  ///
  /// The request is sent before this returns; the future only waits for the reply.
  pub fn get(
    &self,
    collection: &str,
    id: Option<&str>,
    options: GetOptions,
  ) -> impl Future<Output = Result<Value, BrokerError>> + Send + 'static {
    let call = self.queue.add("get").map(|(msg_id, receiver)| {
      let request = Request::Get {
        store_name: collection.to_string(),
        object_id: id.map(String::from),
        options,
        msg_id,
      };
      if let Err(err) = self.post(&request) {
        self.queue.accept(msg_id, Err(err));
      }
      receiver
    });

    async move {
      call?.await.unwrap_or(Err(BrokerError::Disconnected))
    }
  }

  fn post(&self, request: &Request) -> Result<(), BrokerError> {
    let message =
      serde_json::to_value(request).map_err(|e| BrokerError::Remote(e.to_string()))?;
    debug!("connector -> worker: {}", message);
    self
      .port
      .send(message)
      .map_err(|_| BrokerError::Disconnected)
  }
}

impl Drop for StorageConnector {
  fn drop(&mut self) {
    self.listener.abort();
  }
}

async fn listen(
  mut inbox: mpsc::UnboundedReceiver<Value>,
  queue: MessageQueue,
  events: EventBus<ConnectorEvent>,
) {
  while let Some(message) = inbox.recv().await {
    debug!("connector <- worker: {}", message);
    dispatch(&queue, &events, message);
  }

  warn!("Storage worker channel closed");
  queue.fail_all(BrokerError::Disconnected);
  events.publish(ConnectorEvent::Store(StoreEvent::ConnectionLost {
    code: 503,
    message: "storage worker stopped".to_string(),
  }));
}

fn dispatch(queue: &MessageQueue, events: &EventBus<ConnectorEvent>, message: Value) {
  if message.get("msgID").is_some() {
    match serde_json::from_value::<Reply>(message) {
      Ok(reply) => {
        let result = if reply.is_error {
          Err(BrokerError::Remote(match reply.result {
            Value::String(text) => text,
            other => other.to_string(),
          }))
        } else {
          Ok(reply.result)
        };
        queue.accept(reply.msg_id, result);
      }
      Err(err) => warn!("Malformed reply from storage worker: {}", err),
    }
    return;
  }

  if message.get("type").and_then(Value::as_str).is_none() {
    warn!("Message without type from storage worker: {}", message);
    return;
  }

  let event = match serde_json::from_value::<StoreEvent>(message.clone()) {
    Ok(event) => ConnectorEvent::Store(event),
    Err(_) => ConnectorEvent::Message(message),
  };
  events.publish(event);
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tokio::sync::broadcast;

  struct Wire {
    connector: StorageConnector,
    requests: mpsc::UnboundedReceiver<Value>,
    replies: mpsc::UnboundedSender<Value>,
  }

  fn wire(timeout: Duration) -> Wire {
    let (port, requests) = mpsc::unbounded_channel();
    let (replies, inbox) = mpsc::unbounded_channel();
    Wire {
      connector: StorageConnector::new(port, inbox, timeout, 16),
      requests,
      replies,
    }
  }

  async fn next_event(events: &mut broadcast::Receiver<ConnectorEvent>) -> ConnectorEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
      .await
      .expect("timed out waiting for event")
      .unwrap()
  }

  #[tokio::test]
  async fn test_connect_is_fire_and_forget() {
    let mut w = wire(Duration::from_secs(5));
    w.connector.connect("openhab.local", 8080).unwrap();

    assert_eq!(
      w.requests.recv().await.unwrap(),
      json!({"type": "connect", "host": "openhab.local", "port": 8080})
    );
  }

  #[tokio::test]
  async fn test_reply_resolves_call() {
    let mut w = wire(Duration::from_secs(5));
    let call = w.connector.get("items", Some("A"), GetOptions::default());

    let request = w.requests.recv().await.unwrap();
    assert_eq!(request["objectID"], json!("A"));
    let msg_id = request["msgID"].clone();

    w.replies
      .send(json!({"type": "get", "result": {"name": "A"}, "msgID": msg_id}))
      .unwrap();
    assert_eq!(call.await.unwrap(), json!({"name": "A"}));
  }

  #[tokio::test]
  async fn test_error_reply_rejects_call() {
    let mut w = wire(Duration::from_secs(5));
    let call = w.connector.get("nope", None, GetOptions::default());

    let msg_id = w.requests.recv().await.unwrap()["msgID"].clone();
    w.replies
      .send(json!({"type": "get", "result": "Unknown collection 'nope'", "isError": true, "msgID": msg_id}))
      .unwrap();

    assert_eq!(
      call.await,
      Err(BrokerError::Remote("Unknown collection 'nope'".to_string()))
    );
  }

  #[tokio::test]
  async fn test_timeout_then_late_reply_is_ignored() {
    let mut w = wire(Duration::from_millis(30));
    let call = w.connector.get("items", None, GetOptions::default());
    let msg_id = w.requests.recv().await.unwrap()["msgID"].clone();

    assert_eq!(call.await, Err(BrokerError::Timeout("get".to_string())));

    w.replies
      .send(json!({"type": "get", "result": [], "msgID": msg_id}))
      .unwrap();

    // The next call gets a fresh id and is unaffected by the late reply
    let call = w.connector.get("items", None, GetOptions::default());
    let next_id = w.requests.recv().await.unwrap()["msgID"].clone();
    assert_ne!(next_id, msg_id);
    w.replies
      .send(json!({"type": "get", "result": [{"name": "A"}], "msgID": next_id}))
      .unwrap();
    assert_eq!(call.await.unwrap(), json!([{"name": "A"}]));
  }

  #[tokio::test]
  async fn test_relayed_events() {
    let w = wire(Duration::from_secs(5));
    let mut events = w.connector.events().subscribe();

    w.replies
      .send(json!({"type": "storeItemAdded", "msg": {"value": {"name": "A"}, "storeName": "items"}}))
      .unwrap();
    w.replies.send(json!({"msg": "no type"})).unwrap();
    w.replies
      .send(json!({"type": "somethingElse", "msg": 1}))
      .unwrap();

    assert_eq!(
      next_event(&mut events).await,
      ConnectorEvent::Store(StoreEvent::added("items", json!({"name": "A"})))
    );
    assert_eq!(
      next_event(&mut events).await,
      ConnectorEvent::Message(json!({"type": "somethingElse", "msg": 1}))
    );
  }

  #[tokio::test]
  async fn test_closed_channel_reports_connection_lost() {
    let Wire {
      connector,
      requests: _requests,
      replies,
    } = wire(Duration::from_secs(5));
    let mut events = connector.events().subscribe();
    let call = connector.get("items", None, GetOptions::default());

    drop(replies);

    assert!(matches!(
      next_event(&mut events).await,
      ConnectorEvent::Store(StoreEvent::ConnectionLost { code: 503, .. })
    ));
    assert_eq!(call.await, Err(BrokerError::Disconnected));
  }
}
