//! Correlation table for calls awaiting a worker reply.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::BrokerError;

/// Ids wrap around at this bound.
const ID_SPACE: u32 = 1000;

pub type CallResult = Result<Value, BrokerError>;

struct PendingCall {
  generation: u64,
  reply: oneshot::Sender<CallResult>,
  timer: JoinHandle<()>,
}

#[derive(Default)]
struct QueueState {
  next_id: u32,
  generation: u64,
  pending: HashMap<u32, PendingCall>,
}

/// Outstanding calls keyed by message id, each expiring after a timeout.
#[derive(Clone)]
pub struct MessageQueue {
  state: Arc<Mutex<QueueState>>,
  timeout: Duration,
}

impl MessageQueue {
  pub fn new(timeout: Duration) -> Self {
    Self {
      state: Arc::new(Mutex::new(QueueState::default())),
      timeout,
    }
  }

  fn lock(&self) -> MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Register a call and return its id with the receiver for its result.
  pub fn add(&self, purpose: &str) -> Result<(u32, oneshot::Receiver<CallResult>), BrokerError> {
    let mut state = self.lock();

    let start = state.next_id;
    let id = (0..ID_SPACE)
      .map(|offset| (start + offset) % ID_SPACE)
      .find(|id| !state.pending.contains_key(id))
      .ok_or(BrokerError::QueueFull)?;
    state.next_id = (id + 1) % ID_SPACE;
    state.generation += 1;
    let generation = state.generation;

    let (reply, receiver) = oneshot::channel();
    let timer = tokio::spawn(expire(
      Arc::clone(&self.state),
      id,
      generation,
      purpose.to_string(),
      self.timeout,
    ));

    state.pending.insert(
      id,
      PendingCall {
        generation,
        reply,
        timer,
      },
    );
    Ok((id, receiver))
  }

  /// Settle the call with `id`. Returns false if no such call is pending.
  pub fn accept(&self, id: u32, result: CallResult) -> bool {
    let Some(call) = self.lock().pending.remove(&id) else {
      debug!("No pending call for message {}", id);
      return false;
    };
    call.timer.abort();
    // Receiver may already be gone
    let _ = call.reply.send(result);
    true
  }

  /// Reject every pending call with `error`.
  pub fn fail_all(&self, error: BrokerError) {
    let calls: Vec<_> = self.lock().pending.drain().collect();
    for (_, call) in calls {
      call.timer.abort();
      let _ = call.reply.send(Err(error.clone()));
    }
  }

  #[cfg(test)]
  pub fn pending(&self) -> usize {
    self.lock().pending.len()
  }
}

async fn expire(
  state: Arc<Mutex<QueueState>>,
  id: u32,
  generation: u64,
  purpose: String,
  timeout: Duration,
) {
  tokio::time::sleep(timeout).await;

  let call = {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    match state.pending.get(&id) {
      Some(call) if call.generation == generation => state.pending.remove(&id),
      _ => None,
    }
  };

  if let Some(call) = call {
    warn!("Call {} ('{}') timed out after {:?}", id, purpose, timeout);
    let _ = call.reply.send(Err(BrokerError::Timeout(purpose)));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_ids_wrap_and_skip_outstanding() {
    let queue = MessageQueue::new(Duration::from_secs(60));

    let (first, _rx0) = queue.add("get").unwrap();
    assert_eq!(first, 0);

    let mut receivers = Vec::new();
    for _ in 1..ID_SPACE {
      receivers.push(queue.add("get").unwrap());
    }
    assert_eq!(queue.pending(), ID_SPACE as usize);
    assert_eq!(queue.add("get").unwrap_err(), BrokerError::QueueFull);

    // Free id 5; the counter has wrapped to 0 which is still in use
    assert!(queue.accept(5, Ok(json!(null))));
    let (id, _rx) = queue.add("get").unwrap();
    assert_eq!(id, 5);
  }

  #[tokio::test]
  async fn test_accept_resolves_once() {
    let queue = MessageQueue::new(Duration::from_secs(60));
    let (id, rx) = queue.add("get").unwrap();

    assert!(queue.accept(id, Ok(json!({"name": "A"}))));
    assert!(!queue.accept(id, Ok(json!(null))));
    assert_eq!(rx.await.unwrap(), Ok(json!({"name": "A"})));
    assert_eq!(queue.pending(), 0);
  }

  #[tokio::test]
  async fn test_timeout_rejects_and_removes() {
    let queue = MessageQueue::new(Duration::from_millis(20));
    let (id, rx) = queue.add("get").unwrap();

    let result = rx.await.unwrap();
    assert_eq!(result, Err(BrokerError::Timeout("get".to_string())));
    assert_eq!(
      result.unwrap_err().to_string(),
      "StorageConnector queue item 'get' timed out"
    );
    assert_eq!(queue.pending(), 0);
    assert!(!queue.accept(id, Ok(json!(null))));
  }

  #[tokio::test]
  async fn test_fail_all() {
    let queue = MessageQueue::new(Duration::from_secs(60));
    let (_, a) = queue.add("get").unwrap();
    let (_, b) = queue.add("get").unwrap();

    queue.fail_all(BrokerError::Disconnected);
    assert_eq!(a.await.unwrap(), Err(BrokerError::Disconnected));
    assert_eq!(b.await.unwrap(), Err(BrokerError::Disconnected));
    assert_eq!(queue.pending(), 0);
  }
}
