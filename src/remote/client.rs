use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::sse::SseReader;
use super::{FetchError, RemoteSource, SignalStream, StreamSignal};

/// openHAB REST client.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  fetch_timeout: Duration,
}

impl HttpRemote {
  pub fn new(fetch_timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .connect_timeout(fetch_timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      fetch_timeout,
    })
  }
}

fn request_error(err: reqwest::Error) -> FetchError {
  if err.is_timeout() {
    FetchError::Timeout
  } else if let Some(status) = err.status() {
    FetchError::Status(status.as_u16())
  } else {
    FetchError::Network(err.to_string())
  }
}

impl RemoteSource for HttpRemote {
  async fn fetch(&self, url: &Url) -> Result<Value, FetchError> {
    debug!("GET {}", url);

    let response = self
      .client
      .get(url.clone())
      .header(ACCEPT, "application/json")
      .header(CONTENT_TYPE, "application/json")
      .timeout(self.fetch_timeout)
      .send()
      .await
      .map_err(request_error)?;

    let status = response.status();
    if !status.is_success() {
      return Err(FetchError::Status(status.as_u16()));
    }

    response.json::<Value>().await.map_err(|e| {
      if e.is_timeout() {
        FetchError::Timeout
      } else {
        FetchError::Decode(e.to_string())
      }
    })
  }

  async fn subscribe(&self, url: &Url) -> Result<SignalStream, FetchError> {
    debug!("Subscribing to {}", url);

    // No request timeout here: it would also bound the lifetime of the stream body.
    let request = self
      .client
      .get(url.clone())
      .header(ACCEPT, "text/event-stream")
      .send();
    let response = tokio::time::timeout(self.fetch_timeout, request)
      .await
      .map_err(|_| FetchError::Timeout)?
      .map_err(request_error)?;

    let status = response.status();
    if !status.is_success() {
      return Err(FetchError::Status(status.as_u16()));
    }

    Ok(signal_stream(response.bytes_stream().boxed()))
  }
}

/// Turn an event-stream body into push-channel signals.
fn signal_stream<B>(body: BoxStream<'static, reqwest::Result<B>>) -> SignalStream
where
  B: AsRef<[u8]> + Send + 'static,
{
  let events = stream::unfold(
    Some((body, SseReader::default())),
    |state| async move {
      let (mut body, mut reader) = state?;
      loop {
        if let Some(event) = reader.next_event() {
          // Only unnamed or `message` events carry envelopes
          if let Some(kind) = event.event.as_deref().filter(|kind| *kind != "message") {
            debug!("Skipping '{}' event", kind);
            continue;
          }
          let signal = if event.lossy {
            StreamSignal::Interrupted(format!("event with invalid UTF-8 dropped: {}", event.data))
          } else {
            StreamSignal::Message(event.data)
          };
          return Some((signal, Some((body, reader))));
        }

        match body.next().await {
          Some(Ok(chunk)) => reader.push(chunk.as_ref()),
          Some(Err(err)) => {
            let signal = StreamSignal::Closed {
              code: err.status().map(|s| s.as_u16()).unwrap_or(503),
              message: err.to_string(),
            };
            return Some((signal, None));
          }
          None => {
            let signal = StreamSignal::Closed {
              code: 503,
              message: "event stream ended".to_string(),
            };
            return Some((signal, None));
          }
        }
      }
    },
  );

  stream::once(async { StreamSignal::Open })
    .chain(events)
    .boxed()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn body(chunks: Vec<reqwest::Result<&'static [u8]>>) -> BoxStream<'static, reqwest::Result<&'static [u8]>> {
    stream::iter(chunks).boxed()
  }

  #[tokio::test]
  async fn test_signal_stream_opens_then_relays_messages() {
    let chunks = vec![
      Ok(&b"data: {\"type\":\"ItemAddedEvent\"}\n\n"[..]),
      Ok(&b"data: second\n\n"[..]),
    ];
    let signals: Vec<StreamSignal> = signal_stream(body(chunks)).collect().await;

    assert_eq!(signals[0], StreamSignal::Open);
    assert_eq!(
      signals[1],
      StreamSignal::Message("{\"type\":\"ItemAddedEvent\"}".to_string())
    );
    assert_eq!(signals[2], StreamSignal::Message("second".to_string()));
    assert!(matches!(signals[3], StreamSignal::Closed { code: 503, .. }));
    assert_eq!(signals.len(), 4);
  }

  #[tokio::test]
  async fn test_invalid_utf8_is_not_fatal() {
    let chunks = vec![Ok(&b"data: \xff\n\n"[..]), Ok(&b"data: ok\n\n"[..])];
    let signals: Vec<StreamSignal> = signal_stream(body(chunks)).collect().await;

    assert!(matches!(signals[1], StreamSignal::Interrupted(_)));
    assert_eq!(signals[2], StreamSignal::Message("ok".to_string()));
  }

  #[tokio::test]
  async fn test_named_events_are_skipped() {
    let chunks = vec![
      Ok(&b"event: ping\ndata: keepalive\n\n"[..]),
      Ok(&b"event: message\ndata: kept\n\n"[..]),
    ];
    let signals: Vec<StreamSignal> = signal_stream(body(chunks)).collect().await;

    assert_eq!(signals[1], StreamSignal::Message("kept".to_string()));
    assert!(matches!(signals[2], StreamSignal::Closed { .. }));
    assert_eq!(signals.len(), 3);
  }

  #[test]
  fn test_fetch_error_codes() {
    assert_eq!(FetchError::Timeout.code(), 408);
    assert_eq!(FetchError::Status(404).code(), 404);
    assert_eq!(FetchError::Network("refused".into()).code(), 503);
  }
}
