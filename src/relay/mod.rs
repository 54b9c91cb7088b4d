//! # Relay
//!
//! Inbound path from the radio to stream clients:
//!
//! ```text
//! driver rx thread -> inbound_sink -> classify -> RelayQueue -> /messages
//! ```
//!
//! The sink runs on the driver's thread. It never blocks on consumers and
//! never lets an error or panic escape back into the driver.

pub mod classify;
pub mod queue;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, error, warn};

use crate::logutil::preview;
use crate::meshtastic::{NodeLookup, PacketSink, RawPacket};

pub use classify::{classify, is_direct, ClassifiedMessage, ClassifyError, MessageKind};
pub use queue::{RelayQueue, RELAY_CAPACITY};

/// Classify one packet and push it if it is a text message.
pub fn relay_packet(relay: &RelayQueue, packet: &RawPacket, registry: &dyn NodeLookup) {
    match classify(packet, registry) {
        Ok(Some(msg)) => {
            debug!(
                "relay text from {} to {} ch{}: {}",
                msg.from_id,
                msg.to_id,
                msg.channel_index,
                preview(&msg.text, 80)
            );
            relay.push(msg);
        }
        Ok(None) => {}
        Err(e) => warn!(
            "dropping packet from {}: {}",
            packet.from_id.as_deref().unwrap_or("unknown"),
            e
        ),
    }
}

/// Sink handed to the driver when a session is opened.
pub fn inbound_sink(relay: Arc<RelayQueue>) -> PacketSink {
    Arc::new(move |packet: &RawPacket, registry: &dyn NodeLookup| {
        let outcome = catch_unwind(AssertUnwindSafe(|| relay_packet(&relay, packet, registry)));
        if outcome.is_err() {
            error!("panic while relaying inbound packet; packet dropped");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshtastic::{DecodedPayload, NodeRecord};
    use crate::protobuf::PortNum;
    use bytes::Bytes;
    use std::collections::HashMap;

    struct PanickingLookup;

    impl NodeLookup for PanickingLookup {
        fn lookup(&self, _id: &str) -> Option<NodeRecord> {
            panic!("registry exploded")
        }
    }

    fn packet(port: PortNum, body: &'static [u8]) -> RawPacket {
        RawPacket {
            from_id: Some("!00000001".into()),
            to_id: Some("^all".into()),
            channel: Some(0),
            rx_time: Some(1),
            decoded: Some(DecodedPayload {
                portnum: port as i32,
                payload: Bytes::from_static(body),
            }),
        }
    }

    #[test]
    fn sink_pushes_text_and_skips_other_ports() {
        let relay = Arc::new(RelayQueue::new());
        let sink = inbound_sink(Arc::clone(&relay));
        let reg: HashMap<String, NodeRecord> = HashMap::new();
        sink(&packet(PortNum::TelemetryApp, b"\x01"), &reg);
        assert!(relay.is_empty());
        sink(&packet(PortNum::TextMessageApp, b"hello"), &reg);
        assert_eq!(relay.len(), 1);
    }

    #[test]
    fn sink_swallows_classification_errors() {
        let relay = Arc::new(RelayQueue::new());
        let sink = inbound_sink(Arc::clone(&relay));
        let reg: HashMap<String, NodeRecord> = HashMap::new();
        sink(&packet(PortNum::TextMessageApp, b"\xc3\x28"), &reg);
        assert!(relay.is_empty());
    }

    #[test]
    fn sink_contains_panics() {
        let relay = Arc::new(RelayQueue::new());
        let sink = inbound_sink(Arc::clone(&relay));
        sink(&packet(PortNum::TextMessageApp, b"boom"), &PanickingLookup);
        assert!(relay.is_empty());
        // still usable afterwards
        sink(
            &packet(PortNum::TextMessageApp, b"after"),
            &HashMap::<String, NodeRecord>::new(),
        );
        assert_eq!(relay.len(), 1);
    }
}
