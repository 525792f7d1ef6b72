//! Per-peer exchange ledger
//!
//! Holds what a remote peer has asked us for and the byte balance between
//! us. Ledgers are created on first contact and discarded when the peer
//! disconnects; they are owned by the [`crate::decision::DecisionEngine`].

use cid::Cid;
use libp2p::PeerId;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

use crate::message::WantType;

/// One entry of a remote peer's want-list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub priority: i32,
    pub want_type: WantType,
    pub send_dont_have: bool,
}

#[derive(Debug)]
pub struct PeerLedger {
    peer: PeerId,
    wantlist: HashMap<Cid, LedgerEntry>,
    bytes_sent: u64,
    bytes_recv: u64,
    exchange_count: u64,
    created_at: Instant,
    last_exchange: Option<Instant>,
}

impl PeerLedger {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            wantlist: HashMap::new(),
            bytes_sent: 0,
            bytes_recv: 0,
            exchange_count: 0,
            created_at: Instant::now(),
            last_exchange: None,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Record a want; a repeated want updates priority and type in place
    pub fn wants(&mut self, cid: Cid, entry: LedgerEntry) {
        self.wantlist.insert(cid, entry);
    }

    pub fn cancel_want(&mut self, cid: &Cid) -> Option<LedgerEntry> {
        self.wantlist.remove(cid)
    }

    pub fn want_entry(&self, cid: &Cid) -> Option<&LedgerEntry> {
        self.wantlist.get(cid)
    }

    pub fn wantlist_contains(&self, cid: &Cid) -> bool {
        self.wantlist.contains_key(cid)
    }

    /// The peer's wanted CIDs, sorted by canonical string
    pub fn wanted(&self) -> Vec<Cid> {
        let mut cids: Vec<Cid> = self.wantlist.keys().copied().collect();
        cids.sort_by_cached_key(|c| c.to_string());
        cids
    }

    /// Drop wants not present in `keep`, returning the dropped CIDs
    pub fn retain_wants<F: FnMut(&Cid) -> bool>(&mut self, mut keep: F) -> Vec<Cid> {
        let mut dropped = Vec::new();
        self.wantlist.retain(|cid, _| {
            let k = keep(cid);
            if !k {
                dropped.push(*cid);
            }
            k
        });
        dropped
    }

    pub fn sent_bytes(&mut self, n: u64) {
        self.bytes_sent = self.bytes_sent.saturating_add(n);
        self.exchange_count += 1;
        self.last_exchange = Some(Instant::now());
    }

    pub fn received_bytes(&mut self, n: u64) {
        self.bytes_recv = self.bytes_recv.saturating_add(n);
        self.exchange_count += 1;
        self.last_exchange = Some(Instant::now());
    }

    /// How much this peer has given relative to what it has taken.
    ///
    /// `grace` is added to both sides so a peer with no history scores 1.0
    /// and small transfers do not swing the score. Strictly increasing in
    /// bytes received, strictly decreasing in bytes sent.
    pub fn reciprocity(&self, grace: u64) -> f64 {
        let grace = grace.max(1) as f64;
        (self.bytes_recv as f64 + grace) / (self.bytes_sent as f64 + grace)
    }

    /// Bytes sent per byte received
    pub fn debt_ratio(&self) -> f64 {
        self.bytes_sent as f64 / (self.bytes_recv as f64 + 1.0)
    }

    pub fn receipt(&self) -> Receipt {
        Receipt {
            peer: self.peer.to_string(),
            value: self.debt_ratio(),
            sent: self.bytes_sent,
            recv: self.bytes_recv,
            exchanged: self.exchange_count,
            wants: self.wantlist.len(),
            age_secs: self.created_at.elapsed().as_secs(),
            idle_secs: self.last_exchange.map(|t| t.elapsed().as_secs()),
        }
    }
}

/// Read-only summary of a ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Receipt {
    pub peer: String,
    /// Debt ratio: bytes sent per byte received
    pub value: f64,
    pub sent: u64,
    pub recv: u64,
    pub exchanged: u64,
    pub wants: usize,
    pub age_secs: u64,
    pub idle_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Block;
    use libp2p::identity::Keypair;

    fn test_peer() -> PeerId {
        PeerId::from(Keypair::generate_secp256k1().public())
    }

    fn entry(priority: i32) -> LedgerEntry {
        LedgerEntry {
            priority,
            want_type: WantType::Block,
            send_dont_have: false,
        }
    }

    #[test]
    fn test_wantlist_tracking() {
        let mut ledger = PeerLedger::new(test_peer());
        let a = Block::new(&b"a"[..]).unwrap().cid;
        let b = Block::new(&b"b"[..]).unwrap().cid;

        ledger.wants(a, entry(1));
        ledger.wants(b, entry(2));
        ledger.wants(a, entry(5));

        assert_eq!(ledger.wanted().len(), 2);
        assert_eq!(ledger.want_entry(&a).unwrap().priority, 5);

        assert!(ledger.cancel_want(&a).is_some());
        assert!(ledger.cancel_want(&a).is_none());
        assert!(!ledger.wantlist_contains(&a));
        assert!(ledger.wantlist_contains(&b));
    }

    #[test]
    fn test_retain_wants() {
        let mut ledger = PeerLedger::new(test_peer());
        let a = Block::new(&b"a"[..]).unwrap().cid;
        let b = Block::new(&b"b"[..]).unwrap().cid;
        ledger.wants(a, entry(1));
        ledger.wants(b, entry(1));

        let dropped = ledger.retain_wants(|c| *c == a);
        assert_eq!(dropped, vec![b]);
        assert_eq!(ledger.wanted(), vec![a]);
    }

    #[test]
    fn test_new_peer_reciprocity_is_neutral() {
        let ledger = PeerLedger::new(test_peer());
        assert_eq!(ledger.reciprocity(1024), 1.0);
        assert_eq!(ledger.debt_ratio(), 0.0);
    }

    #[test]
    fn test_reciprocity_is_monotonic() {
        let mut giver = PeerLedger::new(test_peer());
        let mut taker = PeerLedger::new(test_peer());
        let grace = 1024;

        giver.received_bytes(10_000);
        taker.sent_bytes(10_000);

        assert!(giver.reciprocity(grace) > 1.0);
        assert!(taker.reciprocity(grace) < 1.0);
        assert!(taker.reciprocity(grace) > 0.0);

        let before = giver.reciprocity(grace);
        giver.received_bytes(1);
        assert!(giver.reciprocity(grace) > before);
    }

    #[test]
    fn test_receipt() {
        let peer = test_peer();
        let mut ledger = PeerLedger::new(peer);
        ledger.sent_bytes(300);
        ledger.received_bytes(99);

        let receipt = ledger.receipt();
        assert_eq!(receipt.peer, peer.to_string());
        assert_eq!(receipt.sent, 300);
        assert_eq!(receipt.recv, 99);
        assert_eq!(receipt.exchanged, 2);
        assert_eq!(receipt.value, 3.0);
        assert!(receipt.idle_secs.is_some());
    }
}
