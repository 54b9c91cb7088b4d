//! Serial (USB/UART) implementation of the Meshtastic driver contract.
//!
//! Opening a session:
//! 1. open the port, raise DTR/RTS so the radio wakes, drop stale input;
//! 2. start the receive thread (`meshtastic-rx`) that decodes `FromRadio` frames;
//! 3. send `want_config_id` and wait for the matching `config_complete_id`.
//!
//! The receive thread owns the node registry updates and invokes the packet
//! sink for every decoded mesh packet. It sends a `ToRadio` heartbeat every few
//! minutes so the firmware keeps the serial API session open. A fatal read
//! error or a device reboot clears the session's liveness flag; the next
//! identity probe then fails and the caller reconnects.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use prost::Message;
use serialport::{ClearBuffer, SerialPort};

use super::framer::{encode_frame, FrameDecoder};
use super::{
    format_node_id, parse_node_id, DeviceMetadata, DriverError, MeshDriver, MeshSession, MyNode,
    NodeLookup, NodeRecord, PacketSink, RawPacket, BROADCAST_NUM,
};
use crate::config::MeshtasticConfig;
use crate::logutil::{escape_log, hex_snippet, preview};
use crate::protobuf::{self as proto, PortNum, DATA_PAYLOAD_LEN};

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);
const HANDSHAKE_POLL: Duration = Duration::from_millis(50);
const DEFAULT_HOP_LIMIT: u32 = 3;

/// Opens sessions on a serial device.
#[derive(Debug, Clone)]
pub struct SerialDriver {
    port: String,
    baud_rate: u32,
    handshake_timeout: Duration,
}

impl SerialDriver {
    pub fn new(port: &str, baud_rate: u32, handshake_timeout: Duration) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            handshake_timeout,
        }
    }

    pub fn from_config(cfg: &MeshtasticConfig) -> Self {
        Self::new(
            &cfg.port,
            cfg.baud_rate,
            Duration::from_secs(cfg.handshake_timeout_secs),
        )
    }

    fn open_port(&self) -> Result<Box<dyn SerialPort>, DriverError> {
        debug!("Opening serial port {} at {} baud", self.port, self.baud_rate);
        let mut builder = serialport::new(&self.port, self.baud_rate).timeout(READ_TIMEOUT);
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let mut port = builder.open().map_err(|e| DriverError::Open {
            port: self.port.clone(),
            reason: e.to_string(),
        })?;

        // Toggle DTR/RTS to ensure the device wakes, then drop boot chatter
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        std::thread::sleep(Duration::from_millis(150));
        let _ = port.clear(ClearBuffer::Input);
        Ok(port)
    }
}

impl MeshDriver for SerialDriver {
    fn device(&self) -> &str {
        &self.port
    }

    fn open(&self, sink: PacketSink) -> Result<Box<dyn MeshSession>, DriverError> {
        let port = self.open_port()?;
        let config_id = loop {
            let id: u32 = rand::random();
            if id != 0 {
                break id;
            }
        };
        let shared = Arc::new(Shared {
            port: Mutex::new(port),
            running: AtomicBool::new(true),
            tracker: RadioTracker::new(config_id),
        });

        let reader_shared = Arc::clone(&shared);
        let reader = std::thread::Builder::new()
            .name("meshtastic-rx".to_string())
            .spawn(move || read_loop(reader_shared, sink))?;
        let mut session = SerialSession {
            shared,
            reader: Some(reader),
        };

        debug!("Requesting config with want_config_id=0x{:08x}", config_id);
        if let Err(e) = session
            .shared
            .write_toradio(proto::to_radio::PayloadVariant::WantConfigId(config_id))
        {
            session.stop();
            return Err(e);
        }

        let deadline = Instant::now() + self.handshake_timeout;
        loop {
            if !session.shared.tracker.is_alive() {
                session.stop();
                return Err(DriverError::Closed);
            }
            let (complete, my_node) = {
                let radio = session.shared.tracker.radio();
                (radio.config_complete, radio.my_node)
            };
            if complete {
                break;
            }
            if Instant::now() >= deadline {
                if let Some(num) = my_node {
                    warn!(
                        "Config download from {} incomplete after {:?}; continuing with node {}",
                        self.port,
                        self.handshake_timeout,
                        format_node_id(num)
                    );
                    break;
                }
                session.stop();
                return Err(DriverError::HandshakeTimeout(self.handshake_timeout));
            }
            std::thread::sleep(HANDSHAKE_POLL);
        }

        {
            let radio = session.shared.tracker.radio();
            info!(
                "Serial session on {} ready: node={} firmware={} nodes={}",
                self.port,
                radio.my_node.map(format_node_id).unwrap_or_else(|| "?".into()),
                radio
                    .metadata
                    .firmware_version
                    .as_deref()
                    .unwrap_or("unknown"),
                radio.nodes.len()
            );
        }
        Ok(Box::new(session))
    }
}

#[derive(Debug, Default)]
struct RadioState {
    my_node: Option<u32>,
    metadata: DeviceMetadata,
    nodes: HashMap<u32, NodeRecord>,
    config_complete: bool,
}

/// Radio state learned from `FromRadio` frames, independent of the port.
struct RadioTracker {
    radio: RwLock<RadioState>,
    alive: AtomicBool,
    config_id: u32,
}

impl RadioTracker {
    fn new(config_id: u32) -> Self {
        Self {
            radio: RwLock::new(RadioState::default()),
            alive: AtomicBool::new(true),
            config_id,
        }
    }

    fn radio(&self) -> RwLockReadGuard<'_, RadioState> {
        self.radio.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn radio_mut(&self) -> RwLockWriteGuard<'_, RadioState> {
        self.radio.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    fn handle_frame(&self, frame: &[u8], sink: &PacketSink) {
        use proto::from_radio::PayloadVariant as FR;

        let msg = match proto::FromRadio::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(
                    "Undecodable FromRadio frame ({} bytes, {}): {}",
                    frame.len(),
                    hex_snippet(frame, 16),
                    e
                );
                return;
            }
        };
        match msg.payload_variant {
            Some(FR::MyInfo(info)) => {
                debug!("Got our node number: {}", format_node_id(info.my_node_num));
                self.radio_mut().my_node = Some(info.my_node_num);
            }
            Some(FR::NodeInfo(node)) => {
                let record = NodeRecord::from_node_info(&node);
                trace!(
                    "Node info {}: {}",
                    record.id,
                    escape_log(record.display_name().unwrap_or("-"))
                );
                self.radio_mut().nodes.insert(node.num, record);
            }
            Some(FR::Metadata(meta)) => {
                let fw = meta.firmware_version.trim().to_string();
                debug!("Firmware version {}", fw);
                self.radio_mut().metadata.firmware_version = (!fw.is_empty()).then_some(fw);
            }
            Some(FR::ConfigCompleteId(id)) => {
                if id == self.config_id {
                    debug!("Config download complete (id=0x{:08x})", id);
                    self.radio_mut().config_complete = true;
                } else {
                    debug!("Ignoring config_complete_id=0x{:08x} from another client", id);
                }
            }
            Some(FR::LogRecord(rec)) => {
                debug!("Device log [{}]: {}", rec.source, escape_log(&rec.message));
            }
            Some(FR::Rebooted(_)) => {
                warn!("Device reported a reboot; session must be re-established");
                self.mark_dead();
            }
            Some(FR::Packet(pkt)) => self.handle_packet(&pkt, sink),
            None => trace!("FromRadio frame without a known payload"),
        }
    }

    fn handle_packet(&self, pkt: &proto::MeshPacket, sink: &PacketSink) {
        if let Some(proto::mesh_packet::PayloadVariant::Decoded(data)) = &pkt.payload_variant {
            if data.portnum == PortNum::NodeinfoApp as i32 {
                if let Ok(user) = proto::User::decode(data.payload.clone()) {
                    let info = proto::NodeInfo {
                        num: pkt.from,
                        user: Some(user),
                        last_heard: pkt.rx_time,
                        ..Default::default()
                    };
                    let mut radio = self.radio_mut();
                    let mut record = NodeRecord::from_node_info(&info);
                    if let Some(prev) = radio.nodes.get(&pkt.from) {
                        record.position = prev.position;
                    }
                    radio.nodes.insert(pkt.from, record);
                }
            } else if pkt.rx_time != 0 {
                if let Some(node) = self.radio_mut().nodes.get_mut(&pkt.from) {
                    node.last_heard = Some(pkt.rx_time);
                }
            }
        }

        let raw = RawPacket::from_mesh_packet(pkt);
        let radio = self.radio();
        let lookup: &dyn NodeLookup = &radio.nodes;
        sink(&raw, lookup);
    }
}

struct Shared {
    port: Mutex<Box<dyn SerialPort>>,
    running: AtomicBool,
    tracker: RadioTracker,
}

impl Shared {
    fn port(&self) -> MutexGuard<'_, Box<dyn SerialPort>> {
        self.port.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_toradio(&self, payload: proto::to_radio::PayloadVariant) -> Result<(), DriverError> {
        let msg = proto::ToRadio {
            payload_variant: Some(payload),
        };
        let encoded = msg.encode_to_vec();
        let frame = encode_frame(&encoded).ok_or(DriverError::PayloadTooLarge {
            len: encoded.len(),
            max: u16::MAX as usize,
        })?;
        let mut port = self.port();
        port.write_all(&frame)?;
        port.flush()?;
        trace!("Sent ToRadio frame ({} bytes payload)", encoded.len());
        Ok(())
    }
}

fn read_loop(shared: Arc<Shared>, sink: PacketSink) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 1024];
    let mut last_heartbeat = Instant::now();

    while shared.running.load(Ordering::Acquire) {
        let read = {
            let mut port = shared.port();
            port.read(&mut buf)
        };
        match read {
            Ok(n) if n > 0 => {
                trace!("RAW {} bytes: {}", n, hex_snippet(&buf[..n], 64));
                decoder.push(&buf[..n]);
                while let Some(frame) = decoder.next_frame() {
                    shared.tracker.handle_frame(&frame, &sink);
                }
            }
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                error!("Serial read failed, stopping receive thread: {}", e);
                shared.tracker.mark_dead();
                break;
            }
        }

        if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
            let nonce = rand::random::<u32>();
            let hb = proto::to_radio::PayloadVariant::Heartbeat(proto::Heartbeat { nonce });
            if let Err(e) = shared.write_toradio(hb) {
                warn!("Failed to send heartbeat: {}", e);
            }
            last_heartbeat = Instant::now();
        }
    }
    debug!(
        "Receive thread exiting ({} noise bytes skipped)",
        decoder.noise_bytes()
    );
}

/// An open serial session.
pub struct SerialSession {
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
}

impl SerialSession {
    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                warn!("Receive thread panicked");
            }
        }
        self.shared.tracker.mark_dead();
    }

    fn ensure_alive(&self) -> Result<(), DriverError> {
        if self.shared.tracker.is_alive() {
            Ok(())
        } else {
            Err(DriverError::Closed)
        }
    }
}

impl MeshSession for SerialSession {
    fn my_node(&self) -> Result<MyNode, DriverError> {
        self.ensure_alive()?;
        self.shared
            .tracker
            .radio()
            .my_node
            .map(|node_num| MyNode { node_num })
            .ok_or(DriverError::NotReady)
    }

    fn metadata(&self) -> DeviceMetadata {
        self.shared.tracker.radio().metadata.clone()
    }

    fn nodes(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> =
            self.shared.tracker.radio().nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.num);
        nodes
    }

    fn send_text(
        &self,
        text: &str,
        destination: Option<&str>,
        channel_index: u32,
    ) -> Result<(), DriverError> {
        use proto::mesh_packet::{PayloadVariant as MP, PRIORITY_RELIABLE};

        self.ensure_alive()?;
        if text.len() > DATA_PAYLOAD_LEN {
            return Err(DriverError::PayloadTooLarge {
                len: text.len(),
                max: DATA_PAYLOAD_LEN,
            });
        }
        let to = match destination {
            None => BROADCAST_NUM,
            Some(d) => parse_node_id(d).ok_or_else(|| DriverError::InvalidDestination(d.into()))?,
        };
        let is_direct = to != BROADCAST_NUM;
        let id = loop {
            let id: u32 = rand::random();
            if id != 0 {
                break id;
            }
        };
        let pkt = proto::MeshPacket {
            to,
            channel: channel_index,
            payload_variant: Some(MP::Decoded(proto::Data {
                portnum: PortNum::TextMessageApp as i32,
                payload: Bytes::copy_from_slice(text.as_bytes()),
                ..Default::default()
            })),
            id,
            hop_limit: DEFAULT_HOP_LIMIT,
            want_ack: is_direct,
            priority: if is_direct { PRIORITY_RELIABLE } else { 0 },
            ..Default::default()
        };
        self.shared
            .write_toradio(proto::to_radio::PayloadVariant::Packet(pkt))?;
        debug!(
            "Sent text packet id={} to={} channel={} text='{}'",
            id,
            format_node_id(to),
            channel_index,
            preview(text, 80)
        );
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if self.reader.is_none() {
            return Ok(());
        }
        let result = self
            .shared
            .write_toradio(proto::to_radio::PayloadVariant::Disconnect(true));
        self.stop();
        result
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        self.stop();
    }
}
