//! Message envelope.

use crate::storage::generate_id;
use crate::{Error, Result};
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

mod payload {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// A queued message with its routing metadata.
///
/// The JSON form carries the payload as base64 under `message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message id.
    pub message_id: String,
    /// Application-defined message type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    /// Trace id of the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Raw payload.
    #[serde(with = "payload", default)]
    pub message: Vec<u8>,
}

impl MessageEnvelope {
    /// Creates an envelope with a generated id.
    #[must_use]
    pub fn new(
        trace_id: Option<&str>,
        message_type: Option<&str>,
        message: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            message_id: generate_id(),
            message_type: message_type.map(ToString::to_string),
            trace_id: trace_id.map(ToString::to_string),
            message: message.into(),
        }
    }

    /// Creates an envelope whose payload is `value` as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if `value` does not serialize.
    pub fn from_json<T: Serialize>(
        trace_id: Option<&str>,
        message_type: Option<&str>,
        value: &T,
    ) -> Result<Self> {
        let bytes = serde_json::to_vec(value).map_err(|e| Error::OperationFailed {
            operation: "serialize_message".to_string(),
            cause: e.to_string(),
        })?;
        Ok(Self::new(trace_id, message_type, bytes))
    }

    /// Returns the payload as UTF-8 text, replacing invalid sequences.
    #[must_use]
    pub fn message_as_string(&self) -> String {
        String::from_utf8_lossy(&self.message).into_owned()
    }

    /// Parses the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the payload is not valid JSON
    /// for `T`.
    pub fn message_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.message).map_err(|e| Error::OperationFailed {
            operation: "deserialize_message".to_string(),
            cause: e.to_string(),
        })
    }

    /// Encodes the envelope as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if encoding fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::OperationFailed {
            operation: "serialize_envelope".to_string(),
            cause: e.to_string(),
        })
    }

    /// Decodes a JSON envelope, or `None` if `bytes` is not one.
    #[must_use]
    pub fn from_json_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice::<Self>(bytes)
            .ok()
            .filter(|e| !e.message_id.is_empty())
    }

    /// Returns the base64 form of the payload.
    #[must_use]
    pub fn message_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_form_uses_base64() {
        let envelope = MessageEnvelope {
            message_id: "123".into(),
            message_type: Some("Test".into()),
            trace_id: Some("t1".into()),
            message: b"hello".to_vec(),
        };
        let value: serde_json::Value =
            serde_json::from_slice(&envelope.to_json_bytes().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"message_id": "123", "message_type": "Test", "trace_id": "t1", "message": "aGVsbG8="})
        );
        assert_eq!(
            MessageEnvelope::from_json_bytes(&envelope.to_json_bytes().unwrap()),
            Some(envelope)
        );
    }

    #[test]
    fn test_raw_bytes_are_not_an_envelope() {
        assert!(MessageEnvelope::from_json_bytes(b"plain text").is_none());
        assert!(MessageEnvelope::from_json_bytes(br#"{"a": 1}"#).is_none());
    }

    #[test]
    fn test_json_payload() {
        let envelope = MessageEnvelope::from_json(None, None, &json!({"n": 1})).unwrap();
        assert_eq!(envelope.message_id.len(), 32);
        let value: serde_json::Value = envelope.message_as().unwrap();
        assert_eq!(value, json!({"n": 1}));
        assert_eq!(envelope.message_as_string(), r#"{"n":1}"#);
    }
}
