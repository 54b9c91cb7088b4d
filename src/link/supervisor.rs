//! Single-flight connection supervision.
//!
//! One mutex guards the [`DeviceLink`] and `last_error`. Concurrent callers of
//! [`ConnectionSupervisor::ensure_connected`] queue on that mutex, so at most
//! one connect attempt runs at a time and the second caller sees the session
//! the first one opened. There is no background retry; a dead link is only
//! repaired when a request asks for it.
//!
//! All methods block (driver I/O happens under the lock). Async callers go
//! through `tokio::task::spawn_blocking`. The exception is
//! [`ConnectionSupervisor::status`]: while a connect holds the lock it returns
//! the last published [`LinkStatus`] instead of waiting out the handshake.

use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use log::{error, info, warn};

use super::{DeviceInfo, DeviceLink, LinkError, SendError};
use crate::meshtastic::NodeRecord;

/// Snapshot for `/health`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub connected: bool,
    pub last_error: Option<String>,
    pub node_num: Option<u32>,
}

struct LinkState {
    link: DeviceLink,
    last_error: Option<String>,
}

pub struct ConnectionSupervisor {
    state: Mutex<LinkState>,
    published: Mutex<LinkStatus>,
    device: String,
}

impl ConnectionSupervisor {
    pub fn new(link: DeviceLink) -> Self {
        let device = link.device().to_string();
        Self {
            state: Mutex::new(LinkState {
                link,
                last_error: None,
            }),
            published: Mutex::new(LinkStatus {
                connected: false,
                last_error: None,
                node_num: None,
            }),
            device,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, status: LinkStatus) -> LinkStatus {
        *self.published.lock().unwrap_or_else(PoisonError::into_inner) = status.clone();
        status
    }

    fn publish_state(&self, state: &LinkState) -> LinkStatus {
        self.publish(LinkStatus {
            connected: state.link.has_session(),
            last_error: state.last_error.clone(),
            node_num: state.link.node_num(),
        })
    }

    fn connect_locked(&self, state: &mut LinkState) -> bool {
        // the old session is torn down before the new one opens
        self.publish(LinkStatus {
            connected: false,
            last_error: state.last_error.clone(),
            node_num: None,
        });
        let connected = match state.link.connect() {
            Ok(()) => {
                state.last_error = None;
                true
            }
            Err(e) => {
                error!("{}", e);
                state.last_error = Some(e.to_string());
                false
            }
        };
        self.publish_state(state);
        connected
    }

    /// Forced (re)connect.
    pub fn connect(&self) -> bool {
        let mut state = self.lock();
        self.connect_locked(&mut state)
    }

    /// Make sure a usable session exists, reconnecting if the current one is dead.
    pub fn ensure_connected(&self) -> bool {
        let mut state = self.lock();
        if !state.link.has_session() {
            return self.connect_locked(&mut state);
        }
        if state.link.is_alive() {
            return true;
        }
        warn!("Lost connection to {}, reconnecting", self.device);
        self.connect_locked(&mut state)
    }

    /// Current link state, or the last published one while a connect is running.
    pub fn status(&self) -> LinkStatus {
        match self.state.try_lock() {
            Ok(state) => self.publish_state(&state),
            Err(TryLockError::Poisoned(poisoned)) => self.publish_state(&poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => self
                .published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn send(
        &self,
        text: &str,
        destination: Option<&str>,
        channel_index: u32,
    ) -> Result<(), SendError> {
        self.lock().link.send(text, destination, channel_index)
    }

    pub fn query_info(&self) -> Result<DeviceInfo, LinkError> {
        self.lock().link.query_info()
    }

    pub fn query_nodes(&self) -> Result<Vec<NodeRecord>, LinkError> {
        self.lock().link.query_nodes()
    }

    /// Close the session for process shutdown.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.link.has_session() {
            info!("Closing device session on {}", self.device);
        }
        state.link.close();
        self.publish_state(&state);
    }
}
