//! Scripted [`RemoteSource`] for tests.

use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

use super::{FetchError, RemoteSource, SignalStream, StreamSignal};

#[derive(Default)]
struct MockState {
  responses: HashMap<String, Result<Value, FetchError>>,
  calls: Vec<String>,
  delay: Duration,
  subscribe_error: Option<FetchError>,
  push_rx: VecDeque<mpsc::UnboundedReceiver<StreamSignal>>,
}

/// Serves canned JSON keyed by `path?query` and records every request.
#[derive(Clone, Default)]
pub struct MockRemote {
  state: Arc<Mutex<MockState>>,
}

fn request_key(url: &Url) -> String {
  match url.query() {
    Some(query) => format!("{}?{}", url.path(), query),
    None => url.path().to_string(),
  }
}

impl MockRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, key: &str, response: Result<Value, FetchError>) -> &Self {
    self
      .state
      .lock()
      .unwrap()
      .responses
      .insert(key.to_string(), response);
    self
  }

  pub fn with_delay(&self, delay: Duration) -> &Self {
    self.state.lock().unwrap().delay = delay;
    self
  }

  pub fn fail_subscribe(&self, error: FetchError) -> &Self {
    self.state.lock().unwrap().subscribe_error = Some(error);
    self
  }

  /// Sender feeding one push-channel subscription. Channels are handed to
  /// subscribers in the order they were created.
  pub fn push_channel(&self) -> mpsc::UnboundedSender<StreamSignal> {
    let (tx, rx) = mpsc::unbounded_channel();
    self.state.lock().unwrap().push_rx.push_back(rx);
    tx
  }

  /// Number of fetches issued for `key`.
  pub fn calls(&self, key: &str) -> usize {
    self
      .state
      .lock()
      .unwrap()
      .calls
      .iter()
      .filter(|c| c.as_str() == key)
      .count()
  }
}

impl RemoteSource for MockRemote {
  async fn fetch(&self, url: &Url) -> Result<Value, FetchError> {
    let key = request_key(url);
    let (delay, response) = {
      let mut state = self.state.lock().unwrap();
      state.calls.push(key.clone());
      let response = state
        .responses
        .get(&key)
        .cloned()
        .unwrap_or(Err(FetchError::Status(404)));
      (state.delay, response)
    };

    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
    }
    response
  }

  async fn subscribe(&self, _url: &Url) -> Result<SignalStream, FetchError> {
    let rx = {
      let mut state = self.state.lock().unwrap();
      if let Some(err) = state.subscribe_error.clone() {
        return Err(err);
      }
      state.push_rx.pop_front()
    };

    match rx {
      Some(rx) => Ok(
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|s| (s, rx)) }).boxed(),
      ),
      // Nobody scripted the channel: open and then stay silent.
      None => Ok(stream::once(async { StreamSignal::Open }).chain(stream::pending()).boxed()),
    }
  }
}
