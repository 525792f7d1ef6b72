//! Blockswap Core
//!
//! Content-addressed block exchange: want-lists, per-peer ledgers and
//! scheduling, provide announcements, and the block stores behind them.

pub mod advertiser;
pub mod api;
pub mod config;
pub mod content_id;
pub mod decision;
pub mod exchange;
pub mod filestore;
pub mod ledger;
pub mod message;
pub mod network;
pub mod provide_queue;
pub mod rocks_store;
pub mod runtime;
pub mod stats;
pub mod storage;
pub mod traffic;
pub mod wantlist;

pub use advertiser::{Advertiser, AdvertiserError};
pub use config::{Config, ConfigError, ExchangeConfig};
pub use content_id::{compute_cid, verify_cid, CidError, StreamingVerifier};
pub use decision::{DecisionEngine, EngineConfig, Envelope};
pub use exchange::{Exchange, ExchangeError};
pub use filestore::{FileBlock, FileManager, FileRef, FileRefStatus, FileStore};
pub use ledger::{PeerLedger, Receipt};
pub use message::{BlockPresence, Message, PresenceType, WantType, Wantlist, WantlistEntry};
pub use network::{ContentRouting, Network, NetworkError, NullNetwork, NullRouting, RoutingError};
pub use provide_queue::{provide_queue, EnqueueOutcome, FullQueuePolicy, ProvideQueue, ProvideReceiver};
pub use rocks_store::{BlockStoreStats, RocksBlockStore};
pub use runtime::{run_node, NodeError};
pub use stats::{Stat, StatsAggregator};
pub use storage::{Block, BlockStore, KeyStream, MemoryBlockStore, StorageError};
pub use traffic::{TrafficCounters, TrafficSnapshot};
pub use wantlist::{SessionId, WantManager};

// Re-export Cid for external use
pub use cid::Cid;
