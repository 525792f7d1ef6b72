//! Exchange traffic counters
//!
//! All counters live behind a single mutex so a snapshot never observes a
//! duplicate count without its matching receive.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficSnapshot {
    pub blocks_received: u64,
    pub dup_blks_received: u64,
    pub dup_data_received: u64,
    pub data_received: u64,
    pub blocks_sent: u64,
    pub data_sent: u64,
    pub messages_received: u64,
}

#[derive(Clone, Default)]
pub struct TrafficCounters {
    inner: Arc<Mutex<TrafficSnapshot>>,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// A block arrived from the network. `duplicate` means we already had it.
    pub fn record_received(&self, len: usize, duplicate: bool) {
        let mut c = self.inner.lock();
        c.blocks_received += 1;
        c.data_received += len as u64;
        if duplicate {
            c.dup_blks_received += 1;
            c.dup_data_received += len as u64;
        }
    }

    pub fn record_sent(&self, blocks: usize, bytes: u64) {
        let mut c = self.inner.lock();
        c.blocks_sent += blocks as u64;
        c.data_sent += bytes;
    }

    pub fn record_message(&self) {
        self.inner.lock().messages_received += 1;
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        *self.inner.lock()
    }
}
