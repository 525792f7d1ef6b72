//! Exchange statistics
//!
//! [`StatsAggregator`] reads each component under that component's own lock,
//! one after the other, so a [`Stat`] is a consistent view of each component
//! but not a global snapshot.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::decision::DecisionEngine;
use crate::provide_queue::ProvideQueue;
use crate::traffic::TrafficCounters;
use crate::wantlist::WantManager;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stat {
    pub provide_buf_len: usize,
    /// Our wanted CIDs, highest priority first
    pub wantlist: Vec<String>,
    /// Connected peers, sorted
    pub peers: Vec<String>,
    pub blocks_received: u64,
    pub dup_blks_received: u64,
    pub dup_data_received: u64,
    pub data_received: u64,
    pub blocks_sent: u64,
    pub data_sent: u64,
    pub messages_received: u64,
    pub provides_dropped: u64,
}

#[derive(Clone)]
pub struct StatsAggregator {
    wants: WantManager,
    engine: Arc<DecisionEngine>,
    traffic: TrafficCounters,
    provides: ProvideQueue,
    started: Instant,
}

impl StatsAggregator {
    pub fn new(
        wants: WantManager,
        engine: Arc<DecisionEngine>,
        traffic: TrafficCounters,
        provides: ProvideQueue,
    ) -> Self {
        Self {
            wants,
            engine,
            traffic,
            provides,
            started: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> Stat {
        let wantlist = self.wants.snapshot().iter().map(|c| c.to_string()).collect();
        let peers = self.engine.peers().iter().map(|p| p.to_string()).collect();
        let traffic = self.traffic.snapshot();

        Stat {
            provide_buf_len: self.provides.len(),
            wantlist,
            peers,
            blocks_received: traffic.blocks_received,
            dup_blks_received: traffic.dup_blks_received,
            dup_data_received: traffic.dup_data_received,
            data_received: traffic.data_received,
            blocks_sent: traffic.blocks_sent,
            data_sent: traffic.data_sent,
            messages_received: traffic.messages_received,
            provides_dropped: self.provides.dropped(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Prometheus text exposition of the current stats plus store totals
    pub fn to_prometheus(&self, block_count: u64, total_bytes: u64) -> String {
        self.snapshot()
            .to_prometheus(block_count, total_bytes, self.uptime_secs())
    }
}

impl Stat {
    pub fn to_prometheus(&self, block_count: u64, total_bytes: u64, uptime_secs: u64) -> String {
        format!(
            "# HELP blockswap_block_count Total number of blocks stored\n\
             # TYPE blockswap_block_count gauge\n\
             blockswap_block_count {}\n\
             \n\
             # HELP blockswap_block_bytes Total bytes of block data stored\n\
             # TYPE blockswap_block_bytes gauge\n\
             blockswap_block_bytes {}\n\
             \n\
             # HELP blockswap_uptime_seconds Time since node started in seconds\n\
             # TYPE blockswap_uptime_seconds counter\n\
             blockswap_uptime_seconds {}\n\
             \n\
             # HELP blockswap_peers Peers with an active ledger\n\
             # TYPE blockswap_peers gauge\n\
             blockswap_peers {}\n\
             \n\
             # HELP blockswap_wantlist_size CIDs we are currently looking for\n\
             # TYPE blockswap_wantlist_size gauge\n\
             blockswap_wantlist_size {}\n\
             \n\
             # HELP blockswap_provide_queue_len CIDs waiting to be announced\n\
             # TYPE blockswap_provide_queue_len gauge\n\
             blockswap_provide_queue_len {}\n\
             \n\
             # HELP blockswap_provides_dropped_total Announcements dropped on a full queue\n\
             # TYPE blockswap_provides_dropped_total counter\n\
             blockswap_provides_dropped_total {}\n\
             \n\
             # HELP blockswap_blocks_received_total Blocks received from peers\n\
             # TYPE blockswap_blocks_received_total counter\n\
             blockswap_blocks_received_total {}\n\
             \n\
             # HELP blockswap_dup_blocks_received_total Blocks received that we already had\n\
             # TYPE blockswap_dup_blocks_received_total counter\n\
             blockswap_dup_blocks_received_total {}\n\
             \n\
             # HELP blockswap_dup_bytes_received_total Bytes of duplicate blocks received\n\
             # TYPE blockswap_dup_bytes_received_total counter\n\
             blockswap_dup_bytes_received_total {}\n\
             \n\
             # HELP blockswap_bytes_received_total Block bytes received from peers\n\
             # TYPE blockswap_bytes_received_total counter\n\
             blockswap_bytes_received_total {}\n\
             \n\
             # HELP blockswap_blocks_sent_total Blocks sent to peers\n\
             # TYPE blockswap_blocks_sent_total counter\n\
             blockswap_blocks_sent_total {}\n\
             \n\
             # HELP blockswap_bytes_sent_total Block bytes sent to peers\n\
             # TYPE blockswap_bytes_sent_total counter\n\
             blockswap_bytes_sent_total {}\n\
             \n\
             # HELP blockswap_messages_received_total Exchange messages received\n\
             # TYPE blockswap_messages_received_total counter\n\
             blockswap_messages_received_total {}\n",
            block_count,
            total_bytes,
            uptime_secs,
            self.peers.len(),
            self.wantlist.len(),
            self.provide_buf_len,
            self.provides_dropped,
            self.blocks_received,
            self.dup_blks_received,
            self.dup_data_received,
            self.data_received,
            self.blocks_sent,
            self.data_sent,
            self.messages_received,
        )
    }
}
