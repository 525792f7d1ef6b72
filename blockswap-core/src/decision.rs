//! Decision engine: who gets which block, and when
//!
//! The engine owns one [`PeerLedger`] per remote peer and a task queue of
//! pending sends. Incoming wants become tasks as soon as the block is
//! available locally; wants for blocks we lack stay in the ledger and are
//! turned into tasks when the block arrives ([`DecisionEngine::blocks_available`]).
//!
//! ## Scheduling
//!
//! Worker tasks pull [`Envelope`]s with [`DecisionEngine::next_envelope`].
//! The next peer served is the one with the highest reciprocity score
//! (see [`PeerLedger::reciprocity`]); ties go to the peer served least
//! recently. Within a peer, higher-priority wants go first and equal
//! priorities are FIFO.
//!
//! ## Locking
//!
//! The ledger map, each ledger and the task queue have separate locks and no
//! code path holds two of them at once. Store calls happen with no lock held.
//! Tasks can therefore go stale (cancelled or disconnected after being
//! queued); they are re-checked against the ledger when popped.

use cid::Cid;
use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

use crate::ledger::{LedgerEntry, PeerLedger, Receipt};
use crate::message::{BlockPresence, Message, PresenceType, WantType, Wantlist};
use crate::storage::{Block, BlockStore, StorageError};

/// Default payload size an envelope is filled up to
pub const DEFAULT_TARGET_ENVELOPE_BYTES: u64 = 256 * 1024;

/// Default reciprocity grace; see [`PeerLedger::reciprocity`]
pub const DEFAULT_RECIPROCITY_GRACE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub target_envelope_bytes: u64,
    pub reciprocity_grace_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_envelope_bytes: DEFAULT_TARGET_ENVELOPE_BYTES,
            reciprocity_grace_bytes: DEFAULT_RECIPROCITY_GRACE_BYTES,
        }
    }
}

/// What a queued task will send. Ordered weakest to strongest so a
/// stronger request for the same CID upgrades a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TaskKind {
    SendDontHave,
    SendHave,
    SendBlock,
}

#[derive(Debug, Clone)]
struct Task {
    cid: Cid,
    priority: i32,
    kind: TaskKind,
    seq: u64,
}

#[derive(Default)]
struct PeerTasks {
    tasks: HashMap<Cid, Task>,
    last_served: u64,
}

impl PeerTasks {
    fn pop(&mut self) -> Option<Task> {
        let next = self
            .tasks
            .values()
            .max_by(|a, b| a.priority.cmp(&b.priority).then_with(|| b.seq.cmp(&a.seq)))
            .map(|t| t.cid)?;
        self.tasks.remove(&next)
    }
}

#[derive(Default)]
struct TaskQueue {
    peers: HashMap<PeerId, PeerTasks>,
    seq: u64,
    serve_clock: u64,
}

impl TaskQueue {
    fn push(&mut self, peer: PeerId, cid: Cid, priority: i32, kind: TaskKind) {
        self.seq += 1;
        let seq = self.seq;
        let peer_tasks = self.peers.entry(peer).or_default();
        peer_tasks
            .tasks
            .entry(cid)
            .and_modify(|t| {
                t.priority = t.priority.max(priority);
                t.kind = t.kind.max(kind);
            })
            .or_insert(Task {
                cid,
                priority,
                kind,
                seq,
            });
    }

    fn remove(&mut self, peer: &PeerId, cid: &Cid) -> bool {
        self.peers
            .get_mut(peer)
            .map_or(false, |t| t.tasks.remove(cid).is_some())
    }

    fn pop(&mut self, peer: &PeerId) -> Option<Task> {
        self.peers.get_mut(peer).and_then(PeerTasks::pop)
    }

    fn mark_served(&mut self, peer: &PeerId) {
        self.serve_clock += 1;
        let clock = self.serve_clock;
        if let Some(t) = self.peers.get_mut(peer) {
            t.last_served = clock;
        }
    }

    fn candidates(&self) -> Vec<(PeerId, u64)> {
        self.peers
            .iter()
            .filter(|(_, t)| !t.tasks.is_empty())
            .map(|(peer, t)| (*peer, t.last_served))
            .collect()
    }
}

/// A batch of outbound data for one peer
#[derive(Debug, Clone)]
pub struct Envelope {
    pub peer: PeerId,
    pub blocks: Vec<Block>,
    pub presences: Vec<BlockPresence>,
}

impl Envelope {
    fn new(peer: PeerId) -> Self {
        Self {
            peer,
            blocks: Vec::new(),
            presences: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.presences.is_empty()
    }

    pub fn block_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.size() as u64).sum()
    }

    pub fn to_message(&self) -> Message {
        Message {
            wantlist: None,
            blocks: self.blocks.clone(),
            presences: self.presences.clone(),
        }
    }
}

type SharedLedger = Arc<Mutex<PeerLedger>>;

pub struct DecisionEngine {
    store: Arc<dyn BlockStore>,
    ledgers: RwLock<HashMap<PeerId, SharedLedger>>,
    tasks: Mutex<TaskQueue>,
    work_available: Notify,
    config: EngineConfig,
}

impl DecisionEngine {
    pub fn new(store: Arc<dyn BlockStore>, config: EngineConfig) -> Self {
        Self {
            store,
            ledgers: RwLock::new(HashMap::new()),
            tasks: Mutex::new(TaskQueue::default()),
            work_available: Notify::new(),
            config,
        }
    }

    fn existing_ledger(&self, peer: &PeerId) -> Option<SharedLedger> {
        self.ledgers.read().get(peer).cloned()
    }

    /// Ledger for `peer`, created on first contact
    fn ledger(&self, peer: &PeerId) -> SharedLedger {
        if let Some(ledger) = self.existing_ledger(peer) {
            return ledger;
        }
        let mut ledgers = self.ledgers.write();
        Arc::clone(ledgers.entry(*peer).or_insert_with(|| {
            debug!("Created ledger for {}", peer);
            Arc::new(Mutex::new(PeerLedger::new(*peer)))
        }))
    }

    fn current_want(&self, peer: &PeerId, cid: &Cid) -> Option<LedgerEntry> {
        self.existing_ledger(peer)?.lock().want_entry(cid).copied()
    }

    fn push_task(&self, peer: PeerId, cid: Cid, priority: i32, kind: TaskKind) {
        self.tasks.lock().push(peer, cid, priority, kind);
        trace!(peer = %peer, cid = %cid, ?kind, "Queued task");
        self.work_available.notify_one();
    }

    pub fn peer_connected(&self, peer: &PeerId) {
        self.ledger(peer);
        info!("Peer connected: {}", peer);
    }

    /// Discard the peer's ledger and every pending send for it
    pub fn peer_disconnected(&self, peer: &PeerId) -> bool {
        let removed = self.ledgers.write().remove(peer).is_some();
        let dropped = self
            .tasks
            .lock()
            .peers
            .remove(peer)
            .map_or(0, |t| t.tasks.len());
        if removed {
            info!("Peer disconnected: {} ({} pending tasks dropped)", peer, dropped);
        }
        removed
    }

    /// Record that `peer` wants `cid` and schedule a reply if we can give one
    pub async fn receive_want(
        &self,
        peer: &PeerId,
        cid: Cid,
        priority: i32,
        want_type: WantType,
        send_dont_have: bool,
    ) -> Result<(), StorageError> {
        self.ledger(peer).lock().wants(
            cid,
            LedgerEntry {
                priority,
                want_type,
                send_dont_have,
            },
        );

        let have = self.store.has(&cid).await?;
        let kind = match (have, want_type) {
            (true, WantType::Block) => Some(TaskKind::SendBlock),
            (true, WantType::Have) => Some(TaskKind::SendHave),
            (false, _) if send_dont_have => Some(TaskKind::SendDontHave),
            (false, _) => None,
        };

        match kind {
            // A cancel may have landed while we were checking the store
            Some(kind) if self.current_want(peer, &cid).is_some() => {
                self.push_task(*peer, cid, priority, kind)
            }
            Some(_) => {}
            None => trace!(peer = %peer, cid = %cid, "Want pending until block arrives"),
        }
        Ok(())
    }

    /// Forget a want. Sends already handed to a worker are not recalled.
    pub fn receive_cancel(&self, peer: &PeerId, cid: &Cid) -> bool {
        let in_ledger = self
            .existing_ledger(peer)
            .map_or(false, |l| l.lock().cancel_want(cid).is_some());
        let queued = self.tasks.lock().remove(peer, cid);
        trace!(peer = %peer, cid = %cid, in_ledger, queued, "Cancel");
        in_ledger || queued
    }

    /// Apply a want-list message from `peer`.
    ///
    /// Entries are applied in order. A storage error on one entry does not
    /// stop the rest; the first error is returned.
    pub async fn handle_wantlist(&self, peer: &PeerId, wantlist: &Wantlist) -> Result<(), StorageError> {
        if wantlist.full {
            let keep: std::collections::HashSet<Cid> = wantlist
                .entries
                .iter()
                .filter(|e| !e.cancel)
                .map(|e| e.cid)
                .collect();
            let dropped = self.ledger(peer).lock().retain_wants(|c| keep.contains(c));
            let mut tasks = self.tasks.lock();
            for cid in &dropped {
                tasks.remove(peer, cid);
            }
            debug!("Full want-list from {} replaced {} stale wants", peer, dropped.len());
        }

        let mut first_error = None;
        for entry in &wantlist.entries {
            if entry.cancel {
                self.receive_cancel(peer, &entry.cid);
                continue;
            }
            if let Err(e) = self
                .receive_want(peer, entry.cid, entry.priority, entry.want_type, entry.send_dont_have)
                .await
            {
                warn!("Failed to process want for {} from {}: {}", entry.cid, peer, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// New blocks are in the store: serve every peer already waiting for them
    pub fn blocks_available(&self, cids: &[Cid]) {
        let ledgers: Vec<SharedLedger> = self.ledgers.read().values().cloned().collect();

        for ledger in ledgers {
            let wanted: Vec<(PeerId, Cid, LedgerEntry)> = {
                let ledger = ledger.lock();
                cids.iter()
                    .filter_map(|cid| ledger.want_entry(cid).map(|e| (*ledger.peer(), *cid, *e)))
                    .collect()
            };
            for (peer, cid, entry) in wanted {
                let kind = match entry.want_type {
                    WantType::Block => TaskKind::SendBlock,
                    WantType::Have => TaskKind::SendHave,
                };
                self.push_task(peer, cid, entry.priority, kind);
            }
        }
    }

    pub fn message_sent(&self, peer: &PeerId, bytes: u64) {
        self.ledger(peer).lock().sent_bytes(bytes);
    }

    pub fn message_received(&self, peer: &PeerId, bytes: u64) {
        self.ledger(peer).lock().received_bytes(bytes);
    }

    /// An envelope reached its peer: account the bytes and retire the wants
    /// it satisfied. A later cancel for those CIDs is a no-op.
    pub fn envelope_sent(&self, envelope: &Envelope) {
        let Some(ledger) = self.existing_ledger(&envelope.peer) else {
            debug!("Envelope sent to {} after disconnect", envelope.peer);
            return;
        };

        let mut ledger = ledger.lock();
        ledger.sent_bytes(envelope.block_bytes());
        for block in &envelope.blocks {
            ledger.cancel_want(&block.cid);
        }
        for presence in &envelope.presences {
            if presence.presence == PresenceType::Have
                && ledger
                    .want_entry(&presence.cid)
                    .map_or(false, |e| e.want_type == WantType::Have)
            {
                ledger.cancel_want(&presence.cid);
            }
        }
    }

    /// Peers with an active ledger, sorted by canonical string
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.ledgers.read().keys().copied().collect();
        peers.sort_by_cached_key(|p| p.to_string());
        peers
    }

    pub fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<Cid> {
        self.existing_ledger(peer)
            .map(|l| l.lock().wanted())
            .unwrap_or_default()
    }

    pub fn ledger_for_peer(&self, peer: &PeerId) -> Option<Receipt> {
        self.existing_ledger(peer).map(|l| l.lock().receipt())
    }

    /// Tasks queued for `peer` and not yet handed to a worker
    pub fn pending_tasks(&self, peer: &PeerId) -> usize {
        self.tasks.lock().peers.get(peer).map_or(0, |t| t.tasks.len())
    }

    fn select_peer(&self) -> Option<PeerId> {
        let candidates = self.tasks.lock().candidates();
        let grace = self.config.reciprocity_grace_bytes;

        let mut best: Option<(PeerId, f64, u64)> = None;
        for (peer, last_served) in candidates {
            let Some(ledger) = self.existing_ledger(&peer) else {
                // Left over from a peer that disconnected mid-schedule
                self.tasks.lock().peers.remove(&peer);
                continue;
            };
            let score = ledger.lock().reciprocity(grace);
            let better = match best {
                None => true,
                Some((_, best_score, best_served)) => {
                    score > best_score || (score == best_score && last_served < best_served)
                }
            };
            if better {
                best = Some((peer, score, last_served));
            }
        }
        best.map(|(peer, _, _)| peer)
    }

    async fn build_envelope(&self, peer: PeerId) -> Envelope {
        let mut envelope = Envelope::new(peer);

        while envelope.block_bytes() < self.config.target_envelope_bytes {
            let Some(task) = self.tasks.lock().pop(&peer) else {
                break;
            };
            let Some(want) = self.current_want(&peer, &task.cid) else {
                trace!(peer = %peer, cid = %task.cid, "Dropping stale task");
                continue;
            };

            let kind = match (task.kind, want.want_type) {
                (TaskKind::SendBlock, WantType::Have) => TaskKind::SendHave,
                (kind, _) => kind,
            };
            let dont_have = BlockPresence {
                cid: task.cid,
                presence: PresenceType::DontHave,
            };

            match kind {
                TaskKind::SendBlock => match self.store.get(&task.cid).await {
                    Ok(block) => envelope.blocks.push(block),
                    Err(StorageError::NotFound(_)) => {
                        if want.send_dont_have {
                            envelope.presences.push(dont_have);
                        }
                    }
                    Err(e) if e.is_corruption() => {
                        error!("Not sending corrupt block {} to {}: {}", task.cid, peer, e)
                    }
                    Err(e) => warn!("Failed to load block {} for {}: {}", task.cid, peer, e),
                },
                TaskKind::SendHave => match self.store.has(&task.cid).await {
                    Ok(true) => envelope.presences.push(BlockPresence {
                        cid: task.cid,
                        presence: PresenceType::Have,
                    }),
                    Ok(false) => {
                        if want.send_dont_have {
                            envelope.presences.push(dont_have);
                        }
                    }
                    Err(e) => warn!("Failed to check block {} for {}: {}", task.cid, peer, e),
                },
                TaskKind::SendDontHave => envelope.presences.push(dont_have),
            }
        }

        self.tasks.lock().mark_served(&peer);
        envelope
    }

    /// Build the next envelope if any peer has work queued
    pub async fn try_next_envelope(&self) -> Option<Envelope> {
        while let Some(peer) = self.select_peer() {
            let envelope = self.build_envelope(peer).await;
            if !envelope.is_empty() {
                debug!(
                    "Envelope for {}: {} blocks ({} bytes), {} presences",
                    peer,
                    envelope.blocks.len(),
                    envelope.block_bytes(),
                    envelope.presences.len()
                );
                return Some(envelope);
            }
        }
        None
    }

    /// Wait until there is something to send and return it
    pub async fn next_envelope(&self) -> Envelope {
        loop {
            let notified = self.work_available.notified();
            if let Some(envelope) = self.try_next_envelope().await {
                return envelope;
            }
            notified.await;
        }
    }
}
