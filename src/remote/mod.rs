//! Access to the remote source of truth.
//!
//! The cache engine only talks to the server through [`RemoteSource`], so it can
//! be driven by the real HTTP client or by a scripted source in tests.

mod client;
#[cfg(test)]
pub mod mock;
mod sse;

use futures::stream::BoxStream;
use serde_json::Value;
use std::future::Future;
use url::Url;

pub use client::HttpRemote;

/// Failure of a single remote request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
  #[error("request timed out")]
  Timeout,
  #[error("server responded with status {0}")]
  Status(u16),
  #[error("network error: {0}")]
  Network(String),
  #[error("invalid response body: {0}")]
  Decode(String),
}

impl FetchError {
  /// Numeric code reported in `connectionLost` events.
  pub fn code(&self) -> u16 {
    match self {
      FetchError::Timeout => 408,
      FetchError::Status(status) => *status,
      FetchError::Network(_) => 503,
      FetchError::Decode(_) => 502,
    }
  }
}

/// Signals produced by a push-channel subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamSignal {
  /// The channel is open and delivering events
  Open,
  /// Raw `data` of one server-sent event
  Message(String),
  /// A recoverable problem; the subscription stays alive
  Interrupted(String),
  /// The channel is gone and will not deliver anything else
  Closed { code: u16, message: String },
}

pub type SignalStream = BoxStream<'static, StreamSignal>;

/// HTTP capability used by the cache engine.
pub trait RemoteSource: Send + Sync + 'static {
  /// GET a JSON document.
  fn fetch(&self, url: &Url) -> impl Future<Output = Result<Value, FetchError>> + Send;

  /// Open the server push channel.
  ///
  /// Resolves once the server accepted the subscription. The first signal of a
  /// healthy stream is [`StreamSignal::Open`].
  fn subscribe(&self, url: &Url) -> impl Future<Output = Result<SignalStream, FetchError>> + Send;
}
