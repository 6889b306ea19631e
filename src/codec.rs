use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::SerdeError;
use crate::message::Value;

/// A stateless byte codec for one side (key or value) of a topic.
///
/// Codecs must be deterministic and free of shared mutable state; the same
/// instance is used concurrently by every partition that touches the topic.
pub trait Codec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerdeError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, SerdeError>;
}

/// UTF-8 text codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringCodec;

impl Codec for StringCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerdeError> {
        match value {
            Value::Text(text) => Ok(text.as_bytes().to_vec()),
            other => Err(SerdeError::Encode {
                reason: format!("string codec expects a text value, got {other:?}"),
            }),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, SerdeError> {
        let text = std::str::from_utf8(bytes).map_err(|err| SerdeError::Decode {
            reason: format!("invalid utf-8: {err}"),
        })?;
        Ok(Value::Text(text.to_string()))
    }
}

/// JSON codec over `serde_json::Value`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerdeError> {
        match value {
            Value::Json(json) => serde_json::to_vec(json).map_err(|err| SerdeError::Encode {
                reason: err.to_string(),
            }),
            other => Err(SerdeError::Encode {
                reason: format!("json codec expects a json value, got {other:?}"),
            }),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, SerdeError> {
        let json = serde_json::from_slice(bytes).map_err(|err| SerdeError::Decode {
            reason: err.to_string(),
        })?;
        Ok(Value::Json(json))
    }
}

/// Pass-through codec for opaque binary payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerdeError> {
        match value {
            Value::Bytes(bytes) => Ok(bytes.clone()),
            other => Err(SerdeError::Encode {
                reason: format!("bytes codec expects a bytes value, got {other:?}"),
            }),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, SerdeError> {
        Ok(Value::Bytes(bytes.to_vec()))
    }
}

/// The key and value codecs registered for one topic.
#[derive(Clone)]
pub struct TopicSerde {
    pub key: Arc<dyn Codec>,
    pub value: Arc<dyn Codec>,
}

impl TopicSerde {
    pub fn new(key: Arc<dyn Codec>, value: Arc<dyn Codec>) -> Self {
        Self { key, value }
    }

    /// Text key and text value.
    pub fn strings() -> Self {
        Self::new(Arc::new(StringCodec), Arc::new(StringCodec))
    }

    /// Text key and JSON value.
    pub fn string_json() -> Self {
        Self::new(Arc::new(StringCodec), Arc::new(JsonCodec))
    }
}

/// Maps topics to their serdes. Every topic the container consumes or
/// produces must have an entry; a missing input topic fails validation at
/// startup, a missing output topic fails the first send.
#[derive(Clone, Default)]
pub struct SerdeRegistry {
    serdes: HashMap<String, TopicSerde>,
}

impl SerdeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, topic: impl Into<String>, serde: TopicSerde) -> &mut Self {
        self.serdes.insert(topic.into(), serde);
        self
    }

    pub fn lookup(&self, topic: &str) -> Option<&TopicSerde> {
        self.serdes.get(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.serdes.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.serdes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serdes.is_empty()
    }
}
