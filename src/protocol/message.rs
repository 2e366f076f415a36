//! Wire messages and line classification.
//!
//! Every message is one JSON object on one line. A line carrying `method` is
//! a call; a line carrying `id` without `method` is a reply to one of our
//! own calls.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::CorrelationId;
use crate::error::BridgeError;

/// Inbound or outbound call: `{"id", "method", "args", "kwargs"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMessage {
    pub id: CorrelationId,
    pub method: String,
    /// Positional arguments. Missing or null on receipt means none.
    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Vec<Value>,
    /// Named arguments. Missing or null on receipt means none.
    #[serde(default, deserialize_with = "null_as_default")]
    pub kwargs: Map<String, Value>,
}

impl CallMessage {
    pub fn new(
        id: CorrelationId,
        method: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Self {
        Self {
            id,
            method: method.into(),
            args,
            kwargs,
        }
    }

    /// Serialize to a single line (without the trailing newline).
    pub fn to_line(&self) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Reply to a call: `{"id", "success", "result"}` or `{"id", "success": false, "error"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub id: CorrelationId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReplyMessage {
    /// A successful reply. A `null` result is still written as `"result": null`.
    pub fn success(id: CorrelationId, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: CorrelationId, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn to_line(&self) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A classified inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Call(CallMessage),
    Reply(ReplyMessage),
}

/// A line that could not be classified.
///
/// `reply_to` is set only for call-shaped lines whose id could be read, so the
/// reader can answer the peer's call with an error instead of leaving it to
/// time out. Reply-shaped lines never get an answer: their id belongs to our
/// own namespace, and echoing it would resolve an unrelated call on the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolViolation {
    pub reply_to: Option<CorrelationId>,
    pub reason: String,
}

impl ProtocolViolation {
    fn new(reply_to: Option<CorrelationId>, reason: impl Into<String>) -> Self {
        Self {
            reply_to,
            reason: reason.into(),
        }
    }
}

impl From<ProtocolViolation> for BridgeError {
    fn from(violation: ProtocolViolation) -> Self {
        BridgeError::protocol(violation.reason)
    }
}

/// Classify one non-empty line read from the peer.
pub fn parse_line(line: &str) -> Result<InboundMessage, ProtocolViolation> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| ProtocolViolation::new(None, format!("invalid JSON: {}", e)))?;

    let Some(object) = value.as_object() else {
        return Err(ProtocolViolation::new(None, "message is not a JSON object"));
    };

    if object.contains_key("method") {
        let reply_to = CorrelationId::from_json(&value);
        return serde_json::from_value(value)
            .map(InboundMessage::Call)
            .map_err(|e| ProtocolViolation::new(reply_to, format!("malformed call: {}", e)));
    }

    if object.contains_key("id") {
        return serde_json::from_value(value)
            .map(InboundMessage::Reply)
            .map_err(|e| ProtocolViolation::new(None, format!("malformed reply: {}", e)));
    }

    Err(ProtocolViolation::new(
        None,
        "message has neither 'method' nor 'id'",
    ))
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
