//! Incremental parser for `text/event-stream` bodies.

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
  pub event: Option<String>,
  pub data: String,
  /// Set when a line of this event was not valid UTF-8 and had to be decoded lossily
  pub lossy: bool,
}

/// Buffers raw body chunks and yields complete events.
#[derive(Debug, Default)]
pub struct SseReader {
  buffer: Vec<u8>,
  event: Option<String>,
  data: Vec<String>,
  lossy: bool,
}

impl SseReader {
  pub fn push(&mut self, chunk: &[u8]) {
    self.buffer.extend_from_slice(chunk);
  }

  /// Next complete event, if the buffer holds one.
  pub fn next_event(&mut self) -> Option<SseEvent> {
    loop {
      let newline = self.buffer.iter().position(|&b| b == b'\n')?;
      let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
      line.pop();
      if line.last() == Some(&b'\r') {
        line.pop();
      }

      if line.is_empty() {
        if self.event.is_none() && self.data.is_empty() {
          continue;
        }
        let event = SseEvent {
          event: self.event.take(),
          data: std::mem::take(&mut self.data).join("\n"),
          lossy: std::mem::take(&mut self.lossy),
        };
        return Some(event);
      }

      // Comment / keep-alive
      if line.starts_with(b":") {
        continue;
      }

      let (field, value) = match line.iter().position(|&b| b == b':') {
        Some(pos) => (&line[..pos], &line[pos + 1..]),
        None => (&line[..], &[][..]),
      };
      let value = value.strip_prefix(b" ").unwrap_or(value);
      let value = match std::str::from_utf8(value) {
        Ok(text) => text.to_string(),
        Err(_) => {
          self.lossy = true;
          String::from_utf8_lossy(value).into_owned()
        }
      };

      match field {
        b"event" => self.event = Some(value.trim().to_string()),
        b"data" => self.data.push(value),
        _ => {}
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_single_event() {
    let mut reader = SseReader::default();
    reader.push(b"event: message\ndata: {\"type\":\"ItemStateEvent\"}\n\n");

    let event = reader.next_event().unwrap();
    assert_eq!(event.event.as_deref(), Some("message"));
    assert_eq!(event.data, "{\"type\":\"ItemStateEvent\"}");
    assert!(!event.lossy);
    assert!(reader.next_event().is_none());
  }

  #[test]
  fn test_event_split_across_chunks() {
    let mut reader = SseReader::default();
    reader.push(b"data: hel");
    assert!(reader.next_event().is_none());
    reader.push(b"lo\r\n\r\n");
    assert_eq!(reader.next_event().unwrap().data, "hello");
  }

  #[test]
  fn test_multiline_data_and_comments() {
    let mut reader = SseReader::default();
    reader.push(b": keep-alive\n\ndata: a\ndata: b\n\n");
    assert_eq!(reader.next_event().unwrap().data, "a\nb");
  }

  #[test]
  fn test_invalid_utf8_marks_event_lossy() {
    let mut reader = SseReader::default();
    reader.push(b"data: \xff\xfe\n\n");
    let event = reader.next_event().unwrap();
    assert!(event.lossy);
  }
}
