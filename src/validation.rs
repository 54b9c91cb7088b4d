//! Validation of `POST /send` request bodies.
//!
//! Everything here runs before the device is contacted, so a rejected request
//! never touches the radio.

use serde_json::Value;

use crate::meshtastic::{format_node_id, parse_node_id, BROADCAST_NUM};
use crate::protobuf::DATA_PAYLOAD_LEN;
use crate::relay::classify::MAX_CHANNEL_INDEX;

/// Reasons a send request is rejected with 400.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendRequestError {
    #[error("Request body is required")]
    EmptyBody,

    #[error("Request body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Request body must be a JSON object")]
    NotAnObject,

    #[error("Missing required field: text")]
    MissingText,

    #[error("Field 'text' must be a string")]
    TextNotString,

    #[error("Field 'text' must not be empty")]
    EmptyText,

    #[error("Text too long ({len} bytes, max {max})")]
    TextTooLong { len: usize, max: usize },

    #[error("Field 'channelIndex' must be an integer between 0 and 7")]
    InvalidChannel,

    #[error("Field 'to' is not a valid node id: {0}")]
    InvalidDestination(String),
}

/// A send request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub text: String,
    /// Canonical `!xxxxxxxx` id, or None for broadcast.
    pub destination: Option<String>,
    pub channel_index: u32,
}

pub fn parse_send_request(body: &[u8]) -> Result<SendRequest, SendRequestError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(SendRequestError::EmptyBody);
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| SendRequestError::InvalidJson(e.to_string()))?;
    let obj = value.as_object().ok_or(SendRequestError::NotAnObject)?;

    let text = match obj.get("text") {
        None | Some(Value::Null) => return Err(SendRequestError::MissingText),
        Some(Value::String(s)) => s,
        Some(_) => return Err(SendRequestError::TextNotString),
    };
    if text.is_empty() {
        return Err(SendRequestError::EmptyText);
    }
    if text.len() > DATA_PAYLOAD_LEN {
        return Err(SendRequestError::TextTooLong {
            len: text.len(),
            max: DATA_PAYLOAD_LEN,
        });
    }

    let channel_index = match obj.get("channelIndex") {
        None | Some(Value::Null) => 0,
        Some(v) => v
            .as_u64()
            .filter(|c| *c <= MAX_CHANNEL_INDEX as u64)
            .ok_or(SendRequestError::InvalidChannel)? as u32,
    };

    let destination = match obj.get("to") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => validate_destination(s)?,
        Some(Value::Number(n)) => {
            let num = n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| SendRequestError::InvalidDestination(n.to_string()))?;
            canonical_destination(num)
        }
        Some(other) => return Err(SendRequestError::InvalidDestination(other.to_string())),
    };

    Ok(SendRequest {
        text: text.clone(),
        destination,
        channel_index,
    })
}

/// Resolve a user-supplied id to a canonical one; broadcast aliases map to None.
pub fn validate_destination(raw: &str) -> Result<Option<String>, SendRequestError> {
    let num = parse_node_id(raw)
        .ok_or_else(|| SendRequestError::InvalidDestination(raw.trim().to_string()))?;
    Ok(canonical_destination(num))
}

fn canonical_destination(num: u32) -> Option<String> {
    (num != BROADCAST_NUM).then(|| format_node_id(num))
}
