//! Packet classification: raw driver packet to [`ClassifiedMessage`].
//!
//! Only text application packets survive; everything else (telemetry,
//! position, routing, node info, undecoded ciphertext) is ignored.

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

use crate::meshtastic::{NodeLookup, RawPacket};
use crate::protobuf::PortNum;

/// Recipient ids that mean "everyone on the channel".
pub const BROADCAST_ALIASES: [&str; 3] = ["broadcast", "^all", "!ffffffff"];

/// Highest channel slot a Meshtastic radio exposes.
pub const MAX_CHANNEL_INDEX: u32 = 7;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("text payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("channel index {0} out of range 0-7")]
    ChannelOutOfRange(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
}

/// Message as it is relayed to stream clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "from")]
    pub from_id: String,
    #[serde(rename = "fromName")]
    pub from_name: String,
    #[serde(rename = "to")]
    pub to_id: String,
    pub text: String,
    pub timestamp: i64,
    #[serde(rename = "channel")]
    pub channel_index: u32,
    #[serde(rename = "isDirect")]
    pub is_direct: bool,
}

pub fn is_broadcast(to_id: &str) -> bool {
    BROADCAST_ALIASES.contains(&to_id)
}

/// A message is direct only when it names a single node on the primary channel.
pub fn is_direct(to_id: &str, channel_index: u32) -> bool {
    !is_broadcast(to_id) && channel_index == 0
}

pub fn classify(
    packet: &RawPacket,
    registry: &dyn NodeLookup,
) -> Result<Option<ClassifiedMessage>, ClassifyError> {
    let decoded = match &packet.decoded {
        Some(d) if d.port() == PortNum::TextMessageApp => d,
        _ => return Ok(None),
    };

    let channel_index = packet.channel.unwrap_or(0);
    if channel_index > MAX_CHANNEL_INDEX {
        return Err(ClassifyError::ChannelOutOfRange(channel_index));
    }
    let text = std::str::from_utf8(&decoded.payload)?.to_string();

    let from_id = packet
        .from_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown")
        .to_string();
    let to_id = packet
        .to_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or("broadcast")
        .to_string();
    let timestamp = match packet.rx_time {
        Some(t) if t != 0 => t,
        _ => Utc::now().timestamp(),
    };
    let from_name = registry
        .lookup(&from_id)
        .and_then(|rec| rec.display_name().map(str::to_string))
        .unwrap_or_else(|| from_id.clone());

    Ok(Some(ClassifiedMessage {
        kind: MessageKind::Text,
        is_direct: is_direct(&to_id, channel_index),
        from_id,
        from_name,
        to_id,
        text,
        timestamp,
        channel_index,
    }))
}
