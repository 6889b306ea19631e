use std::collections::HashMap;

/// A decoded domain value carried by a message key or payload.
///
/// The codec registered for a topic decides which variant it produces and
/// which variant it accepts for encoding. A mismatch between the variant a
/// user supplies and the codec registered for the output topic is a
/// serialization error and fatal to the container.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(json) => Some(json),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::Json(json)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

/// A message consumed from an input topic, after decoding through the
/// topic's registered serde.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Value,
    pub value: Value,
    /// Broker timestamp in milliseconds since the epoch, when available.
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, Vec<u8>>,
}

/// A message produced by user code. The partition is chosen by the caller;
/// the library does not re-partition.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    pub partition: i32,
    pub key: Value,
    pub value: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_accessors_match_variant() {
        assert_eq!(Value::Text("hi".to_string()).as_text(), Some("hi"));
        assert_eq!(Value::Text("hi".to_string()).as_json(), None);

        let json = Value::Json(serde_json::json!({"count": 1}));
        assert_eq!(json.as_json().and_then(|v| v["count"].as_i64()), Some(1));
        assert_eq!(json.as_bytes(), None);

        let bytes = Value::Bytes(vec![1, 2, 3]);
        assert_eq!(bytes.as_bytes(), Some(&[1u8, 2, 3][..]));
        assert_eq!(bytes.as_text(), None);
    }

    #[test]
    fn value_from_conversions() {
        assert_eq!(Value::from("word"), Value::Text("word".to_string()));
        assert_eq!(
            Value::from(serde_json::json!(42)),
            Value::Json(serde_json::json!(42))
        );
        assert_eq!(Value::from(vec![0u8]), Value::Bytes(vec![0]));
    }
}
