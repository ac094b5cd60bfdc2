use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::GetOptions;

/// Requests sent from the connector to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request {
  Connect {
    host: Option<String>,
    /// Number or numeric string
    #[serde(default)]
    port: Value,
  },
  Get {
    #[serde(rename = "storeName")]
    store_name: String,
    #[serde(rename = "objectID", default, skip_serializing_if = "Option::is_none")]
    object_id: Option<String>,
    #[serde(default)]
    options: GetOptions,
    #[serde(rename = "msgID")]
    msg_id: u32,
  },
}

/// Worker answer to a request that carried a `msgID`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(default)]
  pub result: Value,
  #[serde(rename = "isError", default, skip_serializing_if = "is_false")]
  pub is_error: bool,
  #[serde(rename = "msgID")]
  pub msg_id: u32,
}

fn is_false(value: &bool) -> bool {
  !*value
}

impl Reply {
  pub fn ok(kind: &str, result: Value, msg_id: u32) -> Self {
    Self {
      kind: kind.to_string(),
      result,
      is_error: false,
      msg_id,
    }
  }

  pub fn error(kind: &str, message: String, msg_id: u32) -> Self {
    Self {
      kind: kind.to_string(),
      result: Value::String(message),
      is_error: true,
      msg_id,
    }
  }
}

/// Accept a port given as a number or a numeric string.
pub fn parse_port(port: &Value) -> Option<u16> {
  let port = match port {
    Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
    Value::String(s) => s.trim().parse::<u16>().ok(),
    _ => None,
  }?;
  (port != 0).then_some(port)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_get_request_wire_shape() {
    let request = Request::Get {
      store_name: "items".to_string(),
      object_id: None,
      options: GetOptions::default(),
      msg_id: 7,
    };
    assert_eq!(
      serde_json::to_value(&request).unwrap(),
      json!({"type": "get", "storeName": "items", "options": {"forceRefresh": false}, "msgID": 7})
    );

    let parsed: Request =
      serde_json::from_value(json!({"type": "get", "storeName": "items", "objectID": "A", "msgID": 3}))
        .unwrap();
    assert_eq!(
      parsed,
      Request::Get {
        store_name: "items".to_string(),
        object_id: Some("A".to_string()),
        options: GetOptions::default(),
        msg_id: 3,
      }
    );
  }

  #[test]
  fn test_reply_error_flag() {
    let ok = serde_json::to_value(Reply::ok("get", json!([]), 1)).unwrap();
    assert!(ok.get("isError").is_none());

    let err = serde_json::to_value(Reply::error("get", "boom".to_string(), 1)).unwrap();
    assert_eq!(err["isError"], json!(true));
    assert_eq!(err["result"], json!("boom"));
  }

  #[test]
  fn test_parse_port() {
    assert_eq!(parse_port(&json!(8080)), Some(8080));
    assert_eq!(parse_port(&json!("18080")), Some(18080));
    assert_eq!(parse_port(&json!("http")), None);
    assert_eq!(parse_port(&json!(70000)), None);
    assert_eq!(parse_port(&json!(0)), None);
    assert_eq!(parse_port(&Value::Null), None);
  }
}
