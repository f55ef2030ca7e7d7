//! Structured message payloads.
//!
//! A payload is a JSON object: string keys mapping to integers, strings,
//! arrays or nested objects.  On the wire it is carried as JSON text inside
//! the envelope with the JSON flag set.  A payload that is absent is
//! represented as `Option::None` by the envelope, never as an empty object.

use {
    crate::error::{OverlayError, Result},
    serde::{de::DeserializeOwned, Serialize},
    serde_json::{Map, Value},
};

/// A structured payload object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload(Map<String, Value>);

impl Payload {
    /// An empty object.  Distinct from "no payload".
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.to_string(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Integer value of `key`, if present and integral.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    /// Unsigned integer value of `key`, if present and non-negative.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    /// String value of `key`, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Encode as JSON text.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.0).map_err(OverlayError::Json)
    }

    /// Parse JSON text.  The top level must be an object.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(OverlayError::Protocol(format!(
                "payload is not an object: {}",
                json_kind(&other)
            ))),
            Err(e) => Err(OverlayError::Protocol(format!("malformed payload: {e}"))),
        }
    }

    /// Build a payload from any serializable struct or map.
    pub fn from_serialize<S: Serialize>(value: &S) -> Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(OverlayError::InvalidArgument(format!(
                "payload must serialize to an object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Decode the payload into a typed struct.
    pub fn to_typed<D: DeserializeOwned>(&self) -> Result<D> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| OverlayError::Protocol(format!("unexpected payload shape: {e}")))
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Self {
        Value::Object(payload.0)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
