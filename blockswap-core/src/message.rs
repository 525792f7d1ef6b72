//! Exchange protocol messages
//!
//! In-memory form of what peers send each other. Encoding these for a
//! transport is the job of the [`crate::network::Network`] implementation.

use cid::Cid;
use serde::Serialize;

use crate::storage::Block;

/// What the requesting peer wants back for an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WantType {
    /// Send the block itself
    Block,
    /// Only tell me whether you have it
    Have,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantlistEntry {
    pub cid: Cid,
    pub priority: i32,
    pub cancel: bool,
    pub want_type: WantType,
    /// Reply with DONT_HAVE when the block is absent
    pub send_dont_have: bool,
}

impl WantlistEntry {
    pub fn want_block(cid: Cid, priority: i32) -> Self {
        Self {
            cid,
            priority,
            cancel: false,
            want_type: WantType::Block,
            send_dont_have: false,
        }
    }

    pub fn want_have(cid: Cid, priority: i32) -> Self {
        Self {
            cid,
            priority,
            cancel: false,
            want_type: WantType::Have,
            send_dont_have: true,
        }
    }

    pub fn cancel(cid: Cid) -> Self {
        Self {
            cid,
            priority: 0,
            cancel: true,
            want_type: WantType::Block,
            send_dont_have: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Wantlist {
    pub entries: Vec<WantlistEntry>,
    /// Replaces the receiver's view of our want-list instead of amending it
    pub full: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceType {
    Have,
    DontHave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockPresence {
    pub cid: Cid,
    pub presence: PresenceType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub wantlist: Option<Wantlist>,
    pub blocks: Vec<Block>,
    pub presences: Vec<BlockPresence>,
}

impl Message {
    /// Message carrying want-list entries only
    pub fn wants(entries: Vec<WantlistEntry>, full: bool) -> Self {
        Self {
            wantlist: Some(Wantlist { entries, full }),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
            && self.presences.is_empty()
            && self.wantlist.as_ref().map_or(true, |w| w.entries.is_empty() && !w.full)
    }

    /// Payload bytes carried by this message, used for ledger accounting
    pub fn block_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.size() as u64).sum()
    }
}
