//! Local want-list: blocks this node is waiting for
//!
//! Tracks every CID we have asked the network for, its priority, the
//! sessions interested in it and any tasks awaiting its arrival via
//! oneshot channels. An entry lives from the first request until the block
//! arrives (`complete`), the want is cancelled, or every caller waiting on
//! it gives up (`abandon`).

use cid::Cid;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::message::WantlistEntry;
use crate::storage::Block;

/// Retrievals slower than this are logged
const SLOW_RETRIEVAL: Duration = Duration::from_millis(500);

/// Identifies a group of related requests (e.g. one file download)
pub type SessionId = u64;

struct WantEntry {
    priority: i32,
    /// Wanted outside of any session; survives session release
    global: bool,
    sessions: BTreeSet<SessionId>,
    waiters: Vec<oneshot::Sender<Block>>,
    added_at: Instant,
    last_broadcast: Option<Instant>,
}

impl WantEntry {
    fn new(priority: i32) -> Self {
        Self {
            priority,
            global: false,
            sessions: BTreeSet::new(),
            waiters: Vec::new(),
            added_at: Instant::now(),
            last_broadcast: None,
        }
    }

    /// Still wanted by someone: explicitly, by a session, or by a caller
    /// still waiting on the block
    fn is_live(&mut self) -> bool {
        self.waiters.retain(|w| !w.is_closed());
        self.global || !self.sessions.is_empty() || !self.waiters.is_empty()
    }
}

#[derive(Default)]
struct WantState {
    entries: HashMap<Cid, WantEntry>,
}

impl WantState {
    /// Insert or raise; returns true when the entry is new
    fn upsert(&mut self, cid: Cid, priority: i32) -> (&mut WantEntry, bool) {
        let mut created = false;
        let entry = self.entries.entry(cid).or_insert_with(|| {
            created = true;
            WantEntry::new(priority)
        });
        if priority > entry.priority {
            entry.priority = priority;
        }
        (entry, created)
    }

    fn ordered(&self) -> Vec<(Cid, i32)> {
        let mut out: Vec<(Cid, i32, String)> = self
            .entries
            .iter()
            .map(|(cid, e)| (*cid, e.priority, cid.to_string()))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.2.cmp(&b.2)));
        out.into_iter().map(|(cid, p, _)| (cid, p)).collect()
    }
}

/// Concurrency-safe local want-list
///
/// All operations take one mutex, so add/remove/snapshot are linearizable.
#[derive(Clone, Default)]
pub struct WantManager {
    state: Arc<Mutex<WantState>>,
}

impl WantManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Want `cid` outside any session. Returns true if it was not wanted before.
    pub fn add(&self, cid: Cid, priority: i32) -> bool {
        let mut state = self.state.lock();
        let (entry, created) = state.upsert(cid, priority);
        entry.global = true;
        trace!(cid = %cid, priority, created, "Added want");
        created
    }

    /// Want `cid` on behalf of `session`
    pub fn add_for_session(&self, cid: Cid, priority: i32, session: SessionId) -> bool {
        let mut state = self.state.lock();
        let (entry, created) = state.upsert(cid, priority);
        entry.sessions.insert(session);
        trace!(cid = %cid, priority, session, created, "Added session want");
        created
    }

    /// Want `cid` and get a receiver that resolves when it arrives.
    ///
    /// The receiver errors if the want is removed before the block arrives.
    /// A want held only by waiters goes away once every receiver is dropped
    /// (see [`WantManager::abandon`]).
    pub fn want_block(&self, cid: Cid, priority: i32) -> oneshot::Receiver<Block> {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.state.lock();
        let (entry, _) = state.upsert(cid, priority);
        entry.waiters.push(sender);
        receiver
    }

    /// Drop the want for `cid` if nobody is interested in it any more.
    ///
    /// Returns true when the entry was removed.
    pub fn abandon(&self, cid: &Cid) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(cid) else {
            return false;
        };
        if entry.is_live() {
            return false;
        }
        state.entries.remove(cid);
        trace!(cid = %cid, "Abandoned want");
        true
    }

    /// Drop the want entirely; waiters see a closed channel
    pub fn remove(&self, cid: &Cid) -> bool {
        if self.state.lock().entries.remove(cid).is_some() {
            trace!(cid = %cid, "Removed want");
            true
        } else {
            false
        }
    }

    /// Release every want held by `session`, returning the CIDs that are no
    /// longer wanted at all
    pub fn remove_session(&self, session: SessionId) -> Vec<Cid> {
        let mut state = self.state.lock();
        let mut released = Vec::new();

        state.entries.retain(|cid, entry| {
            if !entry.sessions.remove(&session) {
                return true;
            }
            let keep = entry.is_live();
            if !keep {
                released.push(*cid);
            }
            keep
        });

        trace!(session, released = released.len(), "Released session wants");
        released
    }

    /// A wanted block arrived: drop the entry and hand the block to waiters.
    ///
    /// Returns false if the block was not wanted.
    pub fn complete(&self, block: &Block) -> bool {
        let Some(entry) = self.state.lock().entries.remove(&block.cid) else {
            return false;
        };

        let elapsed = entry.added_at.elapsed();
        if elapsed > SLOW_RETRIEVAL {
            warn!(
                cid = %block.cid,
                duration_ms = elapsed.as_millis() as u64,
                "High block retrieval time"
            );
        }

        for waiter in entry.waiters {
            // Receiver may have given up
            let _ = waiter.send(block.clone());
        }

        trace!(cid = %block.cid, "Completed want");
        true
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.state.lock().entries.contains_key(cid)
    }

    pub fn priority(&self, cid: &Cid) -> Option<i32> {
        self.state.lock().entries.get(cid).map(|e| e.priority)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Point-in-time copy of the wanted CIDs, highest priority first and
    /// then by canonical CID string
    pub fn snapshot(&self) -> Vec<Cid> {
        self.state
            .lock()
            .ordered()
            .into_iter()
            .map(|(cid, _)| cid)
            .collect()
    }

    /// Full want-list as protocol entries, in snapshot order
    pub fn wantlist_entries(&self) -> Vec<WantlistEntry> {
        self.state
            .lock()
            .ordered()
            .into_iter()
            .map(|(cid, priority)| WantlistEntry::want_block(cid, priority))
            .collect()
    }

    /// Record that `cids` were just sent to peers
    pub fn mark_broadcast(&self, cids: &[Cid]) {
        let now = Instant::now();
        let mut state = self.state.lock();
        for cid in cids {
            if let Some(entry) = state.entries.get_mut(cid) {
                entry.last_broadcast = Some(now);
            }
        }
    }

    /// Entries not broadcast within `interval`, stamped as broadcast now.
    ///
    /// There is no retry limit: a want is rebroadcast until it is satisfied,
    /// cancelled or abandoned by all of its waiters. Abandoned entries are
    /// pruned here.
    pub fn due_for_rebroadcast(&self, interval: Duration) -> Vec<WantlistEntry> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.entries.retain(|_, e| e.is_live());

        let due: Vec<Cid> = state
            .entries
            .iter()
            .filter(|(_, e)| e.last_broadcast.map_or(true, |t| now.duration_since(t) >= interval))
            .map(|(cid, _)| *cid)
            .collect();

        let mut entries = Vec::with_capacity(due.len());
        for cid in due {
            if let Some(entry) = state.entries.get_mut(&cid) {
                entry.last_broadcast = Some(now);
                entries.push(WantlistEntry::want_block(cid, entry.priority));
            }
        }
        entries
    }
}
