//! Action parameters - the opaque structured value handed to `execute`.
//!
//! Capabilities read fields by dotted path (`"target.conn_id"`) with typed
//! accessors, take a field back as raw JSON bytes, or decode the whole value
//! into their own struct.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{HubError, HubResult};

/// Parameters for a named action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionParams {
    value: Value,
}

impl ActionParams {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    /// Parse parameters from a JSON request body. An empty body is `null`.
    pub fn from_slice(body: &[u8]) -> HubResult<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map(Self::new)
            .map_err(|e| HubError::validation(format!("invalid action params: {}", e)))
    }

    /// The underlying value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Look up a field by dotted path. Numeric segments index into arrays.
    pub fn get(&self, path: &str) -> Option<&Value> {
        if path.is_empty() {
            return Some(&self.value);
        }
        path.split('.').try_fold(&self.value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    /// String field, `None` when absent or not a string.
    pub fn str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Non-empty string field, else a validation error `"<path> is required"`.
    pub fn require_str(&self, path: &str) -> HubResult<&str> {
        match self.str(path) {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(HubError::validation(format!("{} is required", path))),
        }
    }

    pub fn i64(&self, path: &str) -> Option<i64> {
        self.get(path).and_then(Value::as_i64)
    }

    pub fn f64(&self, path: &str) -> Option<f64> {
        self.get(path).and_then(Value::as_f64)
    }

    pub fn bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    /// A field as a raw JSON value (cloned). Absent and `null` are both `None`.
    pub fn raw(&self, path: &str) -> Option<Value> {
        self.get(path).filter(|v| !v.is_null()).cloned()
    }

    /// The field re-encoded as JSON bytes.
    pub fn raw_bytes(&self, path: &str) -> Option<Bytes> {
        self.get(path)
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::to_vec(v).ok())
            .map(Bytes::from)
    }

    /// Decode the whole parameter value into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> HubResult<T> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| HubError::validation(format!("invalid action params: {}", e)))
    }
}

impl From<Value> for ActionParams {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn sample() -> ActionParams {
        ActionParams::new(json!({
            "topic": "news",
            "empty": "",
            "count": 3,
            "ratio": 0.5,
            "flag": true,
            "nested": {"conn": {"id": "c1"}},
            "list": ["a", "b"],
            "data": {"hello": "world"},
        }))
    }

    #[test]
    fn test_typed_accessors() {
        let p = sample();
        assert_eq!(p.str("topic"), Some("news"));
        assert_eq!(p.i64("count"), Some(3));
        assert_eq!(p.f64("ratio"), Some(0.5));
        assert_eq!(p.bool("flag"), Some(true));
        assert_eq!(p.str("count"), None);
    }

    #[test]
    fn test_dotted_path() {
        let p = sample();
        assert_eq!(p.str("nested.conn.id"), Some("c1"));
        assert_eq!(p.str("list.1"), Some("b"));
        assert_eq!(p.str("list.9"), None);
        assert_eq!(p.str("nested.missing.id"), None);
    }

    #[test]
    fn test_require_str() {
        let p = sample();
        assert_eq!(p.require_str("topic").unwrap(), "news");
        assert_eq!(p.require_str("empty").unwrap_err().to_string(), "empty is required");
        assert_eq!(p.require_str("nope").unwrap_err().to_string(), "nope is required");
    }

    #[test]
    fn test_raw_and_bytes() {
        let p = sample();
        assert_eq!(p.raw("data"), Some(json!({"hello": "world"})));
        assert_eq!(p.raw_bytes("topic").unwrap(), Bytes::from_static(b"\"news\""));
        assert!(ActionParams::new(json!({"data": null})).raw("data").is_none());
    }

    #[test]
    fn test_decode() {
        #[derive(Deserialize)]
        struct Sub {
            topic: String,
            count: u32,
        }
        let sub: Sub = sample().decode().unwrap();
        assert_eq!(sub.topic, "news");
        assert_eq!(sub.count, 3);
    }

    #[test]
    fn test_from_slice() {
        assert_eq!(ActionParams::from_slice(b"  ").unwrap().value(), &Value::Null);
        assert_eq!(ActionParams::from_slice(br#"{"a":1}"#).unwrap().i64("a"), Some(1));
        assert!(ActionParams::from_slice(b"{not json").is_err());
    }
}
