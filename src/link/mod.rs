//! # Device Link
//!
//! [`DeviceLink`] owns the driver session handle and the inbound sink. It is
//! not synchronized on its own; [`supervisor::ConnectionSupervisor`] wraps it
//! in the single mutex that serializes every connect and reconnect.

pub mod supervisor;

use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::logutil::preview;
use crate::meshtastic::{
    format_node_id, DriverError, MeshDriver, MeshSession, NodeRecord, PacketSink,
};

pub use supervisor::{ConnectionSupervisor, LinkStatus};

#[derive(Debug, Error)]
#[error("failed to connect to {device}: {source}")]
pub struct ConnectError {
    pub device: String,
    #[source]
    pub source: DriverError,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("not connected to device")]
    NotConnected,
    #[error("send failed: {0}")]
    Driver(#[from] DriverError),
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("not connected to device")]
    NotConnected,
    #[error("device query failed: {0}")]
    Driver(#[from] DriverError),
}

/// Identity of the attached radio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub my_node_num: u32,
    pub firmware: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
}

pub struct DeviceLink {
    driver: Arc<dyn MeshDriver>,
    sink: PacketSink,
    session: Option<Box<dyn MeshSession>>,
}

impl DeviceLink {
    pub fn new(driver: Arc<dyn MeshDriver>, sink: PacketSink) -> Self {
        Self {
            driver,
            sink,
            session: None,
        }
    }

    pub fn device(&self) -> &str {
        self.driver.device()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Replace any existing session with a fresh one.
    pub fn connect(&mut self) -> Result<(), ConnectError> {
        self.close();
        info!("Connecting to Meshtastic device at {}", self.device());
        match self.driver.open(Arc::clone(&self.sink)) {
            Ok(session) => {
                match session.my_node() {
                    Ok(me) => info!(
                        "Connected to {} as {}",
                        self.device(),
                        format_node_id(me.node_num)
                    ),
                    Err(e) => debug!("connected, node number not yet known: {}", e),
                }
                self.session = Some(session);
                Ok(())
            }
            Err(source) => Err(ConnectError {
                device: self.device().to_string(),
                source,
            }),
        }
    }

    /// Cheap identity probe; any failure means the link is gone.
    pub fn is_alive(&self) -> bool {
        match &self.session {
            Some(session) => session.my_node().is_ok(),
            None => false,
        }
    }

    pub fn node_num(&self) -> Option<u32> {
        self.session
            .as_ref()
            .and_then(|s| s.my_node().ok())
            .map(|me| me.node_num)
    }

    pub fn send(
        &self,
        text: &str,
        destination: Option<&str>,
        channel_index: u32,
    ) -> Result<(), SendError> {
        let session = self.session.as_ref().ok_or(SendError::NotConnected)?;
        debug!(
            "send to {} ch{}: {}",
            destination.unwrap_or("broadcast"),
            channel_index,
            preview(text, 80)
        );
        session.send_text(text, destination, channel_index)?;
        Ok(())
    }

    pub fn query_info(&self) -> Result<DeviceInfo, LinkError> {
        let session = self.session.as_ref().ok_or(LinkError::NotConnected)?;
        let me = session.my_node()?;
        let firmware = session
            .metadata()
            .firmware_version
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let mine = session.nodes().into_iter().find(|n| n.num == me.node_num);
        Ok(DeviceInfo {
            my_node_num: me.node_num,
            firmware,
            long_name: mine.as_ref().and_then(|n| n.long_name.clone()),
            short_name: mine.and_then(|n| n.short_name),
        })
    }

    pub fn query_nodes(&self) -> Result<Vec<NodeRecord>, LinkError> {
        let session = self.session.as_ref().ok_or(LinkError::NotConnected)?;
        Ok(session.nodes())
    }

    /// Tear down the current session, if any. Close errors are logged only.
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close() {
                warn!("Error closing session on {}: {}", self.device(), e);
            }
        }
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.close();
    }
}
