//! Test utilities & fixtures.
//!
//! [`MockDriver`] stands in for a radio: it counts session opens, can be told
//! to fail or stall, records outbound text, and lets a test inject inbound
//! packets through whatever sink the bridge attached. [`spawn_bridge`] runs
//! the full HTTP gateway on an ephemeral localhost port.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use meshbridge::gateway::{self, BridgeContext};
use meshbridge::link::{ConnectionSupervisor, DeviceLink};
use meshbridge::meshtastic::{
    DecodedPayload, DeviceMetadata, DriverError, MeshDriver, MeshSession, MyNode, NodeRecord,
    PacketSink, RawPacket,
};
use meshbridge::protobuf::PortNum;
use meshbridge::relay::{inbound_sink, RelayQueue};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const MOCK_DEVICE: &str = "/dev/ttyMOCK0";
pub const MOCK_NODE_NUM: u32 = 0x0a0b0c0d;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentText {
    pub text: String,
    pub destination: Option<String>,
    pub channel: u32,
}

#[derive(Default)]
struct MockState {
    opens: AtomicUsize,
    failing_opens: AtomicUsize,
    open_delay: Mutex<Duration>,
    alive: AtomicBool,
    fail_sends: AtomicBool,
    sends: Mutex<Vec<SentText>>,
    sink: Mutex<Option<PacketSink>>,
    nodes: Mutex<Vec<NodeRecord>>,
    firmware: Mutex<Option<String>>,
}

pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(MockState::default()),
        })
    }

    /// Sessions opened so far, failed attempts included.
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Make the next `n` opens fail.
    pub fn fail_opens(&self, n: usize) {
        self.state.failing_opens.store(n, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.state.open_delay.lock().unwrap() = delay;
    }

    /// Simulate the radio being unplugged under an open session.
    pub fn kill_session(&self) {
        self.state.alive.store(false, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sends(&self) -> Vec<SentText> {
        self.state.sends.lock().unwrap().clone()
    }

    pub fn set_firmware(&self, version: &str) {
        *self.state.firmware.lock().unwrap() = Some(version.to_string());
    }

    pub fn add_node(&self, num: u32, long_name: &str, short_name: &str) {
        self.state.nodes.lock().unwrap().push(NodeRecord {
            id: format!("!{:08x}", num),
            num,
            long_name: Some(long_name.to_string()),
            short_name: Some(short_name.to_string()),
            hw_model: Some("RAK4631".to_string()),
            position: None,
            last_heard: Some(1_700_000_000),
        });
    }

    /// Deliver a packet the way the driver's rx thread would.
    pub fn inject(&self, packet: &RawPacket) {
        let sink = self.state.sink.lock().unwrap().clone();
        let registry: HashMap<String, NodeRecord> = self
            .state
            .nodes
            .lock()
            .unwrap()
            .iter()
            .map(|n| (n.id.clone(), n.clone()))
            .collect();
        if let Some(sink) = sink {
            sink(packet, &registry);
        }
    }
}

impl MeshDriver for MockDriver {
    fn device(&self) -> &str {
        MOCK_DEVICE
    }

    fn open(&self, sink: PacketSink) -> Result<Box<dyn MeshSession>, DriverError> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.open_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let failing = self.state.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.state.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(DriverError::Open {
                port: MOCK_DEVICE.to_string(),
                reason: "Permission denied".to_string(),
            });
        }
        *self.state.sink.lock().unwrap() = Some(sink);
        self.state.alive.store(true, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockSession {
    state: Arc<MockState>,
}

impl MeshSession for MockSession {
    fn my_node(&self) -> Result<MyNode, DriverError> {
        if self.state.alive.load(Ordering::SeqCst) {
            Ok(MyNode {
                node_num: MOCK_NODE_NUM,
            })
        } else {
            Err(DriverError::Closed)
        }
    }

    fn metadata(&self) -> DeviceMetadata {
        DeviceMetadata {
            firmware_version: self.state.firmware.lock().unwrap().clone(),
        }
    }

    fn nodes(&self) -> Vec<NodeRecord> {
        self.state.nodes.lock().unwrap().clone()
    }

    fn send_text(
        &self,
        text: &str,
        destination: Option<&str>,
        channel_index: u32,
    ) -> Result<(), DriverError> {
        if self.state.fail_sends.load(Ordering::SeqCst) {
            return Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "serial write failed",
            )));
        }
        self.state.sends.lock().unwrap().push(SentText {
            text: text.to_string(),
            destination: destination.map(str::to_string),
            channel: channel_index,
        });
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.state.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub fn text_packet(from: &str, to: &str, channel: u32, text: &str) -> RawPacket {
    RawPacket {
        from_id: Some(from.to_string()),
        to_id: Some(to.to_string()),
        channel: Some(channel),
        rx_time: Some(1_700_000_500),
        decoded: Some(DecodedPayload {
            portnum: PortNum::TextMessageApp as i32,
            payload: Bytes::copy_from_slice(text.as_bytes()),
        }),
    }
}

pub fn supervisor_for(driver: &Arc<MockDriver>, relay: &Arc<RelayQueue>) -> ConnectionSupervisor {
    let link = DeviceLink::new(driver.clone(), inbound_sink(Arc::clone(relay)));
    ConnectionSupervisor::new(link)
}

/// A running gateway bound to 127.0.0.1 on an ephemeral port.
pub struct Bridge {
    pub driver: Arc<MockDriver>,
    pub relay: Arc<RelayQueue>,
    pub supervisor: Arc<ConnectionSupervisor>,
    pub addr: SocketAddr,
    pub shutdown: watch::Sender<bool>,
    pub server: JoinHandle<anyhow::Result<()>>,
}

impl Bridge {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub async fn spawn_bridge(driver: Arc<MockDriver>, heartbeat: Duration) -> Bridge {
    let relay = Arc::new(RelayQueue::new());
    let supervisor = Arc::new(supervisor_for(&driver, &relay));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let ctx = BridgeContext::new(
        Arc::clone(&supervisor),
        Arc::clone(&relay),
        heartbeat,
        shutdown_rx,
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(gateway::serve(listener, ctx));
    Bridge {
        driver,
        relay,
        supervisor,
        addr,
        shutdown,
        server,
    }
}

/// Minimal Server-Sent Events reader over a reqwest response.
pub struct SseReader {
    resp: reqwest::Response,
    buf: String,
}

impl SseReader {
    pub fn new(resp: reqwest::Response) -> Self {
        Self {
            resp,
            buf: String::new(),
        }
    }

    /// Next raw event block without its trailing blank line; None at end of stream.
    pub async fn next_event(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.buf.find("\n\n") {
                let block = self.buf[..pos].to_string();
                self.buf.drain(..pos + 2);
                return Some(block);
            }
            match self.resp.chunk().await {
                Ok(Some(chunk)) => self.buf.push_str(&String::from_utf8_lossy(&chunk)),
                _ => return None,
            }
        }
    }

    /// Next event, or None if nothing arrives within `wait`.
    pub async fn next_event_within(&mut self, wait: Duration) -> Option<String> {
        tokio::time::timeout(wait, self.next_event()).await.ok().flatten()
    }
}

pub fn is_heartbeat(block: &str) -> bool {
    block.starts_with(':') && block.contains("heartbeat")
}

/// JSON payload of a `data:` event.
pub fn event_json(block: &str) -> Option<serde_json::Value> {
    let data = block.strip_prefix("data:")?.trim();
    serde_json::from_str(data).ok()
}

pub async fn open_stream(bridge: &Bridge) -> SseReader {
    let resp = reqwest::get(bridge.url("/messages")).await.expect("stream request");
    assert_eq!(resp.status(), 200);
    let mut reader = SseReader::new(resp);
    let first = reader
        .next_event_within(Duration::from_secs(2))
        .await
        .expect("connected event");
    assert_eq!(event_json(&first), Some(serde_json::json!({"type": "connected"})));
    reader
}
