//! Wire format exchanged on both channels of a topic
//!
//! The envelope is the only bit-exact format of the protocol. It is internal in
//! the sense that no external consumer reads it, but every sender and receiver
//! on a topic must agree on it, so the compact single-letter field names are
//! part of the contract and must not change.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task or result body carried by an [`Envelope`]
///
/// The relay never needs to know the shape of a payload; it only distinguishes
/// raw text from structured data so both sides can round-trip structures
/// without loss.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPayload {
    /// Opaque text transmitted as-is
    Text(String),
    /// Structured data, JSON-encoded before transmission
    Structured(Value),
}

impl TaskPayload {
    /// Encodes the payload into its wire representation and structured flag
    pub(crate) fn to_wire(&self) -> Result<(String, bool), serde_json::Error> {
        match self {
            TaskPayload::Text(text) => Ok((text.clone(), false)),
            TaskPayload::Structured(value) => Ok((serde_json::to_string(value)?, true)),
        }
    }

    /// Decodes a wire payload according to its structured flag
    pub(crate) fn from_wire(payload: String, structured: bool) -> Result<Self, serde_json::Error> {
        if structured {
            Ok(TaskPayload::Structured(serde_json::from_str(&payload)?))
        } else {
            Ok(TaskPayload::Text(payload))
        }
    }
}

impl From<&str> for TaskPayload {
    fn from(text: &str) -> Self {
        TaskPayload::Text(text.to_owned())
    }
}

impl From<String> for TaskPayload {
    fn from(text: String) -> Self {
        TaskPayload::Text(text)
    }
}

impl From<Value> for TaskPayload {
    fn from(value: Value) -> Self {
        TaskPayload::Structured(value)
    }
}

/// Wire record correlating a task id with its payload and optional error
///
/// The id is generated by the sender and echoed verbatim by the receiver; the
/// sender's correlation table is the only authority matching responses back to
/// requests. On the response leg a present `error` voids the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id, unique for the lifetime of the pending call
    #[serde(rename = "i")]
    pub id: String,
    /// Serialized task or result body
    #[serde(rename = "p")]
    pub payload: String,
    /// Whether `payload` was JSON-encoded before transmission
    #[serde(rename = "o")]
    pub structured: bool,
    /// Failure reported by the processing receiver, response leg only
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Creates a request envelope for the given task
    pub fn request(id: String, payload: &TaskPayload) -> Result<Self, serde_json::Error> {
        let (payload, structured) = payload.to_wire()?;
        Ok(Self {
            id,
            payload,
            structured,
            error: None,
        })
    }

    /// Creates a successful response envelope echoing the request id
    pub fn success(id: String, payload: &TaskPayload) -> Result<Self, serde_json::Error> {
        Self::request(id, payload)
    }

    /// Creates a failed response envelope echoing the request id
    pub fn failure(id: String, error: String) -> Self {
        Self {
            id,
            payload: String::new(),
            structured: false,
            error: Some(error),
        }
    }

    /// Serializes the envelope for transmission
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses a received message, rejecting anything structurally incomplete
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Extracts the carried payload according to the structured flag
    pub fn decode_payload(&self) -> Result<TaskPayload, serde_json::Error> {
        TaskPayload::from_wire(self.payload.clone(), self.structured)
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn round_trip_text() {
        let payload = TaskPayload::from("hello");
        let envelope = Envelope::request("42".into(), &payload).unwrap();
        let parsed = Envelope::parse(&envelope.encode().unwrap()).unwrap();

        assert_eq!(parsed, envelope);
        assert!(!parsed.structured);
        assert_eq!(parsed.decode_payload().unwrap(), payload);
    }

    #[test]
    fn round_trip_structure() {
        let payload = TaskPayload::from(json!({ "some": "data", "count": 3 }));
        let envelope = Envelope::request("42".into(), &payload).unwrap();
        let parsed = Envelope::parse(&envelope.encode().unwrap()).unwrap();

        assert!(parsed.structured);
        assert_eq!(parsed.decode_payload().unwrap(), payload);
    }

    #[test]
    fn use_compact_field_names() {
        let envelope = Envelope::request("42".into(), &TaskPayload::from("x")).unwrap();
        let raw: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();

        assert_eq!(raw, json!({ "i": "42", "p": "x", "o": false }));
    }

    #[test]
    fn omit_absent_error() {
        let encoded = Envelope::request("1".into(), &TaskPayload::from("x"))
            .unwrap()
            .encode()
            .unwrap();
        assert!(!encoded.contains("\"e\""));

        let encoded = Envelope::failure("1".into(), "boom".into()).encode().unwrap();
        assert!(encoded.contains("\"e\":\"boom\""));
    }

    #[test]
    fn reject_incomplete_messages() {
        assert!(Envelope::parse("not json").is_err());
        assert!(Envelope::parse("{\"i\":\"1\"}").is_err());
        assert!(Envelope::parse("{\"i\":\"1\",\"p\":\"x\"}").is_err());
        assert!(Envelope::parse("42").is_err());
    }
}
