//! Bounded drop-oldest buffer between the driver's receive thread and the
//! stream endpoint.
//!
//! `push` never blocks and never rejects the newest item: when the buffer is
//! full the oldest entry is evicted under the same lock. All consumers share a
//! single drain, so each message reaches exactly one stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::{trace, warn};
use tokio::sync::Notify;

use super::ClassifiedMessage;

pub const RELAY_CAPACITY: usize = 100;

#[derive(Debug)]
pub struct RelayQueue {
    entries: Mutex<VecDeque<ClassifiedMessage>>,
    ready: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl Default for RelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayQueue {
    pub fn new() -> Self {
        Self::with_capacity(RELAY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, msg: ClassifiedMessage) {
        let evicted = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let evicted = if entries.len() >= self.capacity {
                entries.pop_front()
            } else {
                None
            };
            entries.push_back(msg);
            evicted
        };
        if let Some(old) = evicted {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "relay queue full ({}), dropped oldest message from {} (total dropped {})",
                self.capacity, old.from_id, total
            );
        }
        self.ready.notify_one();
    }

    fn try_pop(&self) -> Option<(ClassifiedMessage, bool)> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let msg = entries.pop_front()?;
        Some((msg, !entries.is_empty()))
    }

    /// Wait up to `timeout` for the next message. None means the wait timed out.
    pub async fn pop(&self, timeout: Duration) -> Option<ClassifiedMessage> {
        let wait = async {
            loop {
                // Register interest before checking so a push between the
                // check and the await is not lost.
                let notified = self.ready.notified();
                if let Some((msg, more)) = self.try_pop() {
                    if more {
                        self.ready.notify_one();
                    }
                    return msg;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(msg) => Some(msg),
            Err(_) => {
                trace!("relay pop timed out after {:?}", timeout);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages evicted by overflow since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
