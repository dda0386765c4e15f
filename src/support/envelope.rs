//! OCPP message envelope
//!
//! The wire format is a JSON object carrying the transport envelope:
//!
//! - **Call**       `{"message_type":"2","unique_id":"…","action":"…","payload":{…}}`
//! - **CallResult** `{"message_type":"3","unique_id":"…","payload":{…}}`
//! - **CallError**  `{"message_type":"4","unique_id":"…","payload":{"error_code":…}}`
//!
//! `action` is required on Call frames and forbidden on everything else.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// The three OCPP message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Request
    #[serde(rename = "2")]
    Call,
    /// Success response
    #[serde(rename = "3")]
    CallResult,
    /// Error response
    #[serde(rename = "4")]
    CallError,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// A decoded OCPP envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcppMessage {
    pub message_type: MessageType,
    pub unique_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

impl OcppMessage {
    /// Build a Call frame with a fresh unique id.
    pub fn call(action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: MessageType::Call,
            unique_id: Uuid::new_v4().to_string(),
            action: Some(action.into()),
            payload,
        }
    }

    /// Build a CallResult frame answering `unique_id`.
    pub fn call_result(unique_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: MessageType::CallResult,
            unique_id: unique_id.into(),
            action: None,
            payload,
        }
    }

    /// Build a CallError frame answering `unique_id`.
    pub fn call_error(unique_id: impl Into<String>, error: ErrorPayload) -> Self {
        Self {
            message_type: MessageType::CallError,
            unique_id: unique_id.into(),
            action: None,
            // ErrorPayload serialization cannot fail
            payload: serde_json::to_value(error).unwrap(),
        }
    }

    /// Decode a raw text frame, validating the envelope shape.
    pub fn decode(text: &str) -> Result<Self, MessageError> {
        let message: OcppMessage =
            serde_json::from_str(text).map_err(|e| MessageError::InvalidJson(e.to_string()))?;

        match message.message_type {
            MessageType::Call if message.action.is_none() => Err(MessageError::MissingAction),
            MessageType::CallResult | MessageType::CallError if message.action.is_some() => {
                Err(MessageError::UnexpectedAction)
            }
            _ => Ok(message),
        }
    }

    /// Encode to the wire representation.
    pub fn encode(&self) -> String {
        // serde_json::to_string on this shape never fails
        serde_json::to_string(self).unwrap()
    }

    /// Returns `true` if this is a Call frame.
    pub fn is_call(&self) -> bool {
        self.message_type == MessageType::Call
    }
}

/// Payload of a CallError frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error_code: String,
    pub error_description: String,
    #[serde(default = "empty_object")]
    pub error_details: Value,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            error_code: code.into(),
            error_description: description.into(),
            error_details: empty_object(),
        }
    }

    /// Extract an error payload from a decoded CallError frame, tolerating
    /// peers that omit fields.
    pub fn from_value(payload: &Value) -> Self {
        Self {
            error_code: payload["error_code"]
                .as_str()
                .unwrap_or("GenericError")
                .to_string(),
            error_description: payload["error_description"]
                .as_str()
                .unwrap_or("")
                .to_string(),
            error_details: payload
                .get("error_details")
                .cloned()
                .unwrap_or_else(empty_object),
        }
    }
}

/// Errors raised while decoding an envelope.
///
/// Handled by callers as a dropped message, never as a fatal condition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Call frame is missing an action")]
    MissingAction,
    #[error("non-Call frame must not carry an action")]
    UnexpectedAction,
}
