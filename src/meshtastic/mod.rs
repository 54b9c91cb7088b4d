//! # Meshtastic Device Boundary
//!
//! The bridge talks to a radio through two small traits:
//!
//! - [`MeshDriver`] opens a device session and attaches an inbound [`PacketSink`].
//! - [`MeshSession`] is an open session: identity probe, firmware metadata,
//!   read-only node registry, outbound text, and close.
//!
//! The driver owns its node registry and its receive thread. Packets are handed
//! to the sink as [`RawPacket`]s together with a [`NodeLookup`] view of the
//! registry; the sink must return quickly and never fails back into the driver.
//!
//! With the `serial` feature (default) [`serial::SerialDriver`] implements the
//! contract over a USB/UART link using the Meshtastic protobuf serial API.
//!
//! ## Configuration
//!
//! ```toml
//! [meshtastic]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! handshake_timeout_secs = 10
//! ```

pub mod framer;
#[cfg(feature = "serial")]
pub mod serial;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::protobuf::{self as proto, PortNum};

/// Node number meaning "all nodes".
pub const BROADCAST_NUM: u32 = 0xffff_ffff;
/// Id the driver reports for packets addressed to [`BROADCAST_NUM`].
pub const BROADCAST_ID: &str = "^all";

/// Errors raised by a driver implementation.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no response to config request within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("device session is closed")]
    Closed,

    #[error("device has not reported its node number yet")]
    NotReady,

    #[error("invalid destination '{0}'")]
    InvalidDestination(String),

    #[error("text payload too big ({len} bytes, max {max})")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Decoded application payload of a packet.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    pub portnum: i32,
    pub payload: Bytes,
}

impl DecodedPayload {
    pub fn port(&self) -> PortNum {
        PortNum::try_from(self.portnum).unwrap_or(PortNum::UnknownApp)
    }
}

/// Packet as delivered by the driver. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPacket {
    pub from_id: Option<String>,
    pub to_id: Option<String>,
    pub channel: Option<u32>,
    pub rx_time: Option<i64>,
    pub decoded: Option<DecodedPayload>,
}

impl RawPacket {
    pub fn from_mesh_packet(pkt: &proto::MeshPacket) -> Self {
        let decoded = match &pkt.payload_variant {
            Some(proto::mesh_packet::PayloadVariant::Decoded(data)) => Some(DecodedPayload {
                portnum: data.portnum,
                payload: data.payload.clone(),
            }),
            _ => None,
        };
        Self {
            from_id: (pkt.from != 0).then(|| format_node_id(pkt.from)),
            to_id: (pkt.to != 0).then(|| format_node_id(pkt.to)),
            channel: Some(pkt.channel),
            rx_time: (pkt.rx_time != 0).then_some(pkt.rx_time as i64),
            decoded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NodePosition {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<i32>,
}

/// Read-only view of one registry entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: String,
    pub num: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hw_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<NodePosition>,
    #[serde(rename = "lastHeard", skip_serializing_if = "Option::is_none")]
    pub last_heard: Option<u32>,
}

impl NodeRecord {
    pub fn from_node_info(info: &proto::NodeInfo) -> Self {
        let user = info.user.as_ref();
        let id = user
            .map(|u| u.id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format_node_id(info.num));
        let position = info.position.as_ref().map(|p| NodePosition {
            latitude: p.latitude_i.map(|v| v as f64 * 1e-7),
            longitude: p.longitude_i.map(|v| v as f64 * 1e-7),
            altitude: p.altitude,
        });
        Self {
            id,
            num: info.num,
            long_name: user.and_then(|u| non_blank(&u.long_name)),
            short_name: user.and_then(|u| non_blank(&u.short_name)),
            hw_model: user.map(|u| hw_model_name(u.hw_model)),
            position,
            last_heard: (info.last_heard != 0).then_some(info.last_heard),
        }
    }

    /// Best human label: non-empty long name, then non-empty short name.
    pub fn display_name(&self) -> Option<&str> {
        fn non_empty(s: &Option<String>) -> Option<&str> {
            s.as_deref().map(str::trim).filter(|s| !s.is_empty())
        }
        non_empty(&self.long_name).or_else(|| non_empty(&self.short_name))
    }
}

fn non_blank(name: &str) -> Option<String> {
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// "My node" descriptor of an open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MyNode {
    pub node_num: u32,
}

/// Firmware metadata reported during the config handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub firmware_version: Option<String>,
}

/// Lookup of registry entries by node id (`!xxxxxxxx`).
pub trait NodeLookup {
    fn lookup(&self, id: &str) -> Option<NodeRecord>;
}

impl NodeLookup for HashMap<String, NodeRecord> {
    fn lookup(&self, id: &str) -> Option<NodeRecord> {
        self.get(id).cloned()
    }
}

impl NodeLookup for HashMap<u32, NodeRecord> {
    fn lookup(&self, id: &str) -> Option<NodeRecord> {
        let num = parse_node_id(id)?;
        self.get(&num).cloned()
    }
}

/// Inbound callback; runs on the driver's receive thread.
pub type PacketSink = Arc<dyn Fn(&RawPacket, &dyn NodeLookup) + Send + Sync>;

/// Opens device sessions.
pub trait MeshDriver: Send + Sync {
    /// Device path or label reported to HTTP clients.
    fn device(&self) -> &str;

    fn open(&self, sink: PacketSink) -> Result<Box<dyn MeshSession>, DriverError>;
}

/// An open device session.
pub trait MeshSession: Send {
    /// Lightweight identity probe; fails once the link is gone.
    fn my_node(&self) -> Result<MyNode, DriverError>;

    fn metadata(&self) -> DeviceMetadata;

    fn nodes(&self) -> Vec<NodeRecord>;

    /// `destination` of None broadcasts.
    fn send_text(
        &self,
        text: &str,
        destination: Option<&str>,
        channel_index: u32,
    ) -> Result<(), DriverError>;

    fn close(&mut self) -> Result<(), DriverError>;
}

pub fn format_node_id(num: u32) -> String {
    if num == BROADCAST_NUM {
        BROADCAST_ID.to_string()
    } else {
        format!("!{:08x}", num)
    }
}

/// Parse `!xxxxxxxx`, `0x...`, decimal node numbers and broadcast aliases.
pub fn parse_node_id(id: &str) -> Option<u32> {
    let id = id.trim();
    match id {
        "^all" | "broadcast" => return Some(BROADCAST_NUM),
        _ => {}
    }
    if let Some(hex) = id.strip_prefix('!') {
        return u32::from_str_radix(hex, 16).ok();
    }
    if let Some(hex) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).ok();
    }
    id.parse::<u32>().ok()
}

/// Names for the hardware models seen most often on the mesh.
pub fn hw_model_name(model: i32) -> String {
    let name = match model {
        0 => "UNSET",
        1 => "TLORA_V2",
        2 => "TLORA_V1",
        3 => "TLORA_V2_1_1P6",
        4 => "TBEAM",
        5 => "HELTEC_V2_0",
        6 => "TBEAM_V0P7",
        7 => "T_ECHO",
        8 => "TLORA_V1_1P3",
        9 => "RAK4631",
        10 => "HELTEC_V2_1",
        11 => "HELTEC_V1",
        12 => "LILYGO_TBEAM_S3_CORE",
        13 => "RAK11200",
        14 => "NANO_G1",
        15 => "TLORA_V2_1_1P8",
        16 => "TLORA_T3_S3",
        17 => "NANO_G1_EXPLORER",
        43 => "HELTEC_V3",
        44 => "HELTEC_WSL_V3",
        48 => "HELTEC_WIRELESS_TRACKER",
        49 => "HELTEC_WIRELESS_PAPER",
        50 => "T_DECK",
        51 => "T_WATCH_S3",
        255 => "PRIVATE_HW",
        other => return format!("HW_MODEL_{}", other),
    };
    name.to_string()
}
