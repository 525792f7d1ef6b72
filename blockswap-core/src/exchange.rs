//! Block exchange: the node-level facade
//!
//! Ties the local want-list, the decision engine, traffic counters and the
//! provide pipeline together and drives them from inbound messages.
//!
//! ```text
//! receive_message ──► blocks ──► TrafficCounters ─► verify ─► BlockStore::put
//!        │                         │                                │
//!        │                         ▼                                ▼
//!        │                    WantManager::complete          ProvideQueue ─► Advertiser
//!        │                                                          │
//!        └──────► want-list ──► DecisionEngine ◄── blocks_available ┘
//!                                    │
//!                              task workers ──► Network::send_message
//! ```

use cid::Cid;
use libp2p::PeerId;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::advertiser::{Advertiser, AdvertiserError};
use crate::config::{ConfigError, ExchangeConfig};
use crate::decision::DecisionEngine;
use crate::ledger::Receipt;
use crate::message::{Message, PresenceType, WantlistEntry};
use crate::network::{ContentRouting, Network, NetworkError};
use crate::provide_queue::{provide_queue, ProvideQueue, ProvideQueueError};
use crate::stats::{Stat, StatsAggregator};
use crate::storage::{Block, BlockStore, StorageError};
use crate::traffic::TrafficCounters;
use crate::wantlist::{SessionId, WantManager};

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Advertiser(#[from] AdvertiserError),

    #[error(transparent)]
    Queue(#[from] ProvideQueueError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Want for {0} was cancelled")]
    Cancelled(Cid),

    #[error("Exchange is already running")]
    AlreadyRunning,
}

type Result<T> = std::result::Result<T, ExchangeError>;

pub struct Exchange {
    local_peer: PeerId,
    config: ExchangeConfig,
    store: Arc<dyn BlockStore>,
    network: Arc<dyn Network>,
    wants: WantManager,
    engine: Arc<DecisionEngine>,
    traffic: TrafficCounters,
    provides: ProvideQueue,
    advertiser: Advertiser,
    stats: StatsAggregator,
    shutdown: watch::Sender<bool>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Exchange {
    pub fn new(
        config: ExchangeConfig,
        local_peer: PeerId,
        store: Arc<dyn BlockStore>,
        network: Arc<dyn Network>,
        routing: Arc<dyn ContentRouting>,
    ) -> Self {
        let wants = WantManager::new();
        let engine = Arc::new(DecisionEngine::new(Arc::clone(&store), config.engine()));
        let traffic = TrafficCounters::new();
        let (provides, receiver) =
            provide_queue(config.provide_queue_capacity, config.provide_full_policy);

        let mut advertiser = Advertiser::new(
            routing,
            provides.clone(),
            receiver,
            config.provide_concurrency,
            config.reprovide_interval().unwrap_or_default(),
        );
        if config.reprovide_interval().is_some() {
            advertiser.set_block_store(Arc::clone(&store));
        }

        let stats = StatsAggregator::new(
            wants.clone(),
            Arc::clone(&engine),
            traffic.clone(),
            provides.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            local_peer,
            config,
            store,
            network,
            wants,
            engine,
            traffic,
            provides,
            advertiser,
            stats,
            shutdown,
            workers: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the task workers, the rebroadcast loop and the advertiser
    pub async fn start(&self) -> Result<()> {
        self.config.validate()?;

        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return Err(ExchangeError::AlreadyRunning);
        }

        self.shutdown.send_replace(false);
        self.advertiser.start().await?;

        for id in 0..self.config.task_workers.max(1) {
            workers.push(self.spawn_task_worker(id));
        }
        workers.push(self.spawn_rebroadcast_loop());

        info!(
            "Exchange started for {} ({} task workers)",
            self.local_peer, self.config.task_workers
        );
        Ok(())
    }

    pub async fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        if handles.is_empty() {
            return;
        }

        self.shutdown.send_replace(true);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Exchange task failed: {}", e);
            }
        }
        self.advertiser.stop().await;
        info!("Exchange stopped");
    }

    fn spawn_task_worker(&self, id: usize) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let network = Arc::clone(&self.network);
        let traffic = self.traffic.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = shutdown.changed() => break,
                    envelope = engine.next_envelope() => envelope,
                };

                let peer = envelope.peer;
                let blocks = envelope.blocks.len();
                let bytes = envelope.block_bytes();
                match network.send_message(&peer, envelope.to_message()).await {
                    Ok(()) => {
                        engine.envelope_sent(&envelope);
                        traffic.record_sent(blocks, bytes);
                        trace!(worker = id, peer = %peer, blocks, bytes, "Envelope sent");
                    }
                    Err(e) => warn!("Failed to send {} blocks to {}: {}", blocks, peer, e),
                }
            }
            debug!("Task worker {} terminated", id);
        })
    }

    fn spawn_rebroadcast_loop(&self) -> JoinHandle<()> {
        let wants = self.wants.clone();
        let engine = Arc::clone(&self.engine);
        let network = Arc::clone(&self.network);
        let interval = self.config.rebroadcast_interval();
        let send_dont_have = self.config.send_dont_have;
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }

                let mut due = wants.due_for_rebroadcast(interval);
                if due.is_empty() {
                    continue;
                }
                debug!("Rebroadcasting {} wants", due.len());
                for entry in &mut due {
                    entry.send_dont_have = send_dont_have;
                }
                for peer in engine.peers() {
                    if let Err(e) = network.send_message(&peer, Message::wants(due.clone(), false)).await {
                        debug!("Rebroadcast to {} failed: {}", peer, e);
                    }
                }
            }
            debug!("Rebroadcast loop terminated");
        })
    }

    /// Outbound want for a block, flagged per `send_dont_have`
    fn want_entry(&self, cid: Cid, priority: i32) -> WantlistEntry {
        WantlistEntry {
            send_dont_have: self.config.send_dont_have,
            ..WantlistEntry::want_block(cid, priority)
        }
    }

    async fn broadcast_wants(&self, entries: Vec<WantlistEntry>) {
        let cids: Vec<Cid> = entries.iter().map(|e| e.cid).collect();
        for peer in self.engine.peers() {
            if let Err(e) = self
                .network
                .send_message(&peer, Message::wants(entries.clone(), false))
                .await
            {
                warn!("Failed to send want-list to {}: {}", peer, e);
            }
        }
        self.wants.mark_broadcast(&cids);
    }

    /// Fetch a block locally or from the network, waiting until it arrives
    pub async fn get_block(&self, cid: &Cid) -> Result<Block> {
        match self.store.get(cid).await {
            Ok(block) => return Ok(block),
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let priority = self.config.default_priority;
        // Declared before the receiver so the receiver is dropped first
        let _guard = AbandonOnDrop {
            cid: *cid,
            wants: self.wants.clone(),
            engine: Arc::clone(&self.engine),
            network: Arc::clone(&self.network),
        };
        let arrival = self.wants.want_block(*cid, priority);

        // Covers a block stored between the miss above and registering
        if self.store.has(cid).await? {
            let block = self.store.get(cid).await?;
            self.wants.complete(&block);
            return Ok(block);
        }

        self.broadcast_wants(vec![self.want_entry(*cid, priority)])
            .await;
        arrival.await.map_err(|_| ExchangeError::Cancelled(*cid))
    }

    /// Add `cid` to our want-list and tell connected peers
    pub async fn want(&self, cid: Cid, priority: i32) -> bool {
        let added = self.wants.add(cid, priority);
        if added {
            self.broadcast_wants(vec![self.want_entry(cid, priority)])
                .await;
        }
        added
    }

    /// Want `cid` on behalf of `session`; peers hear about it only if it was
    /// not already wanted
    pub async fn want_for_session(&self, cid: Cid, priority: i32, session: SessionId) -> bool {
        let added = self.wants.add_for_session(cid, priority, session);
        if added {
            self.broadcast_wants(vec![self.want_entry(cid, priority)])
                .await;
        }
        added
    }

    /// Release every want held by `session` and cancel the ones nobody else
    /// needs
    pub async fn release_session(&self, session: SessionId) -> Vec<Cid> {
        let released = self.wants.remove_session(session);
        if !released.is_empty() {
            debug!("Session {} released {} wants", session, released.len());
            let cancels: Vec<WantlistEntry> = released.iter().map(|cid| WantlistEntry::cancel(*cid)).collect();
            self.broadcast_wants(cancels).await;
        }
        released
    }

    /// Stop looking for `cid`; pending `get_block` callers see `Cancelled`
    pub async fn cancel_want(&self, cid: &Cid) -> bool {
        let removed = self.wants.remove(cid);
        if removed {
            self.broadcast_wants(vec![WantlistEntry::cancel(*cid)]).await;
        }
        removed
    }

    /// Store a locally created block, announce it and serve peers waiting on it
    pub async fn add_block(&self, block: Block) -> Result<()> {
        block.verify()?;
        let cid = block.cid;
        self.store.put(block.clone()).await?;
        self.wants.complete(&block);
        self.queue_provide(cid).await;
        self.engine.blocks_available(&[cid]);
        debug!("Added block {} ({} bytes)", cid, block.size());
        Ok(())
    }

    async fn queue_provide(&self, cid: Cid) {
        if let Err(e) = self.provides.enqueue(cid).await {
            warn!("Could not queue {} for provide: {}", cid, e);
        }
    }

    /// Process one inbound message.
    ///
    /// Every block and the want-list are processed even if some block fails;
    /// the first error is returned.
    pub async fn receive_message(&self, peer: &PeerId, message: Message) -> Result<()> {
        self.traffic.record_message();
        self.engine.message_received(peer, message.block_bytes());
        debug!(
            "Message from {}: {} blocks, {} presences, {} wants",
            peer,
            message.blocks.len(),
            message.presences.len(),
            message.wantlist.as_ref().map_or(0, |w| w.entries.len())
        );

        let mut first_error: Option<ExchangeError> = None;
        let mut arrived = Vec::new();

        for block in message.blocks {
            let cid = block.cid;
            match self.handle_block(peer, block).await {
                Ok(true) => arrived.push(cid),
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to handle block {} from {}: {}", cid, peer, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if !arrived.is_empty() {
            self.engine.blocks_available(&arrived);
        }

        for presence in &message.presences {
            match presence.presence {
                PresenceType::Have if self.wants.contains(&presence.cid) => {
                    let priority = self.wants.priority(&presence.cid).unwrap_or_default();
                    let ask = Message::wants(vec![self.want_entry(presence.cid, priority)], false);
                    if let Err(e) = self.network.send_message(peer, ask).await {
                        debug!("Failed to ask {} for {}: {}", peer, presence.cid, e);
                    }
                }
                PresenceType::Have => {}
                PresenceType::DontHave => trace!(peer = %peer, cid = %presence.cid, "DONT_HAVE"),
            }
        }

        if let Some(wantlist) = &message.wantlist {
            if let Err(e) = self.engine.handle_wantlist(peer, wantlist).await {
                first_error.get_or_insert(e.into());
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns true when the block was new and has been stored.
    ///
    /// Duplicates are hash-checked too; a corrupt copy is counted as
    /// received but never as a duplicate.
    async fn handle_block(&self, peer: &PeerId, block: Block) -> Result<bool> {
        let present = self.store.has(&block.cid).await;
        let verified = block.verify();
        self.traffic.record_received(
            block.size(),
            verified.is_ok() && matches!(present, Ok(true)),
        );

        if let Err(e) = verified {
            error!("Peer {} sent corrupt block {}", peer, block.cid);
            return Err(e.into());
        }

        if present? {
            trace!(peer = %peer, cid = %block.cid, "Duplicate block");
            self.wants.complete(&block);
            return Ok(false);
        }

        let cid = block.cid;
        self.store.put(block.clone()).await?;
        self.wants.complete(&block);
        self.queue_provide(cid).await;
        Ok(true)
    }

    /// New peer: record it and send our full want-list
    pub async fn peer_connected(&self, peer: &PeerId) -> Result<()> {
        self.engine.peer_connected(peer);

        let mut entries = self.wants.wantlist_entries();
        if entries.is_empty() {
            return Ok(());
        }
        for entry in &mut entries {
            entry.send_dont_have = self.config.send_dont_have;
        }
        self.network
            .send_message(peer, Message::wants(entries, true))
            .await?;
        Ok(())
    }

    pub fn peer_disconnected(&self, peer: &PeerId) {
        self.engine.peer_disconnected(peer);
    }

    pub fn stat(&self) -> Stat {
        self.stats.snapshot()
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    /// Our wanted CIDs, highest priority first
    pub fn wantlist(&self) -> Vec<Cid> {
        self.wants.snapshot()
    }

    pub fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<Cid> {
        self.engine.wantlist_for_peer(peer)
    }

    pub fn ledger_for_peer(&self, peer: &PeerId) -> Option<Receipt> {
        self.engine.ledger_for_peer(peer)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.engine.peers()
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }
}

/// Drops a want held only by a `get_block` caller that went away, and
/// tells peers to stop looking
struct AbandonOnDrop {
    cid: Cid,
    wants: WantManager,
    engine: Arc<DecisionEngine>,
    network: Arc<dyn Network>,
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        if !self.wants.abandon(&self.cid) {
            return;
        }
        debug!("Want for {} abandoned by its caller", self.cid);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cid = self.cid;
        let engine = Arc::clone(&self.engine);
        let network = Arc::clone(&self.network);
        runtime.spawn(async move {
            for peer in engine.peers() {
                let cancel = Message::wants(vec![WantlistEntry::cancel(cid)], false);
                if let Err(e) = network.send_message(&peer, cancel).await {
                    debug!("Failed to cancel {} at {}: {}", cid, peer, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Wantlist;
    use crate::network::NullRouting;
    use crate::provide_queue::FullQueuePolicy;
    use crate::storage::MemoryBlockStore;
    use async_trait::async_trait;
    use libp2p::identity::Keypair;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Records outbound messages instead of delivering them
    #[derive(Default)]
    struct RecordingNetwork {
        sent: Mutex<Vec<(PeerId, Message)>>,
    }

    #[async_trait]
    impl Network for RecordingNetwork {
        async fn send_message(&self, peer: &PeerId, message: Message) -> std::result::Result<(), NetworkError> {
            self.sent.lock().push((*peer, message));
            Ok(())
        }
    }

    fn test_peer() -> PeerId {
        PeerId::from(Keypair::generate_secp256k1().public())
    }

    fn exchange_with(config: ExchangeConfig) -> (Exchange, Arc<RecordingNetwork>, MemoryBlockStore) {
        let store = MemoryBlockStore::new();
        let network = Arc::new(RecordingNetwork::default());
        let exchange = Exchange::new(
            config,
            test_peer(),
            Arc::new(store.clone()),
            Arc::clone(&network) as Arc<dyn Network>,
            Arc::new(NullRouting),
        );
        (exchange, network, store)
    }

    fn test_exchange() -> (Exchange, Arc<RecordingNetwork>, MemoryBlockStore) {
        exchange_with(ExchangeConfig {
            task_workers: 2,
            reprovide_interval_secs: 0,
            ..Default::default()
        })
    }

    fn block_message(blocks: Vec<Block>) -> Message {
        Message {
            blocks,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_duplicate_block_counters() {
        let (exchange, _network, _store) = test_exchange();
        let peer = test_peer();
        let block = Block::new(vec![7u8; 10]).unwrap();

        exchange
            .receive_message(&peer, block_message(vec![block.clone()]))
            .await
            .unwrap();
        let stat = exchange.stat();
        assert_eq!((stat.blocks_received, stat.dup_blks_received, stat.dup_data_received), (1, 0, 0));

        exchange
            .receive_message(&peer, block_message(vec![block]))
            .await
            .unwrap();
        let stat = exchange.stat();
        assert_eq!((stat.blocks_received, stat.dup_blks_received, stat.dup_data_received), (2, 1, 10));
        assert_eq!(stat.messages_received, 2);
        // Only the first copy was queued for announcement
        assert_eq!(stat.provide_buf_len, 1);
    }

    #[tokio::test]
    async fn test_corrupt_block_does_not_stop_message() {
        let (exchange, _network, store) = test_exchange();
        let peer = test_peer();
        let good = Block::new(&b"good"[..]).unwrap();
        let bad = Block {
            cid: Block::new(&b"claimed"[..]).unwrap().cid,
            data: bytes::Bytes::from_static(b"actual"),
        };
        let want = Block::new(&b"wanted by peer"[..]).unwrap();

        let message = Message {
            wantlist: Some(Wantlist {
                entries: vec![WantlistEntry::want_block(want.cid, 1)],
                full: false,
            }),
            blocks: vec![bad.clone(), good.clone()],
            presences: vec![],
        };

        let err = exchange.receive_message(&peer, message).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Storage(ref e) if e.is_corruption()));

        assert!(store.has(&good.cid).await.unwrap());
        assert!(!store.has(&bad.cid).await.unwrap());
        assert_eq!(exchange.wantlist_for_peer(&peer), vec![want.cid]);
        assert_eq!(exchange.stat().blocks_received, 2);
    }

    #[tokio::test]
    async fn test_forged_duplicate_is_corruption() {
        let (exchange, _network, store) = test_exchange();
        let peer = test_peer();
        let good = Block::new(&b"held already"[..]).unwrap();
        exchange
            .receive_message(&peer, block_message(vec![good.clone()]))
            .await
            .unwrap();

        let forged = Block {
            cid: good.cid,
            data: bytes::Bytes::from_static(b"forged-bytes"),
        };
        let err = exchange
            .receive_message(&peer, block_message(vec![forged]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Storage(ref e) if e.is_corruption()));

        let stat = exchange.stat();
        assert_eq!(stat.blocks_received, 2);
        assert_eq!(stat.dup_blks_received, 0);
        assert_eq!(stat.dup_data_received, 0);
        assert_eq!(store.get(&good.cid).await.unwrap(), good);
    }

    #[tokio::test]
    async fn test_forged_duplicate_never_reaches_waiters() {
        let (exchange, _network, store) = test_exchange();
        let peer = test_peer();
        let good = Block::new(&b"stored behind the waiter"[..]).unwrap();

        let waiter = exchange.wants.want_block(good.cid, 1);
        store.put(good.clone()).await.unwrap();

        let forged = Block {
            cid: good.cid,
            data: bytes::Bytes::from_static(b"forged"),
        };
        assert!(exchange
            .receive_message(&peer, block_message(vec![forged]))
            .await
            .is_err());
        assert!(exchange.wantlist().contains(&good.cid));

        // The genuine copy still completes the waiter
        exchange
            .receive_message(&peer, block_message(vec![good.clone()]))
            .await
            .unwrap();
        assert_eq!(waiter.await.unwrap(), good);
        assert_eq!(exchange.stat().dup_blks_received, 1);
    }

    #[tokio::test]
    async fn test_get_block_given_up_leaves_no_want() {
        let (exchange, network, _store) = test_exchange();
        let remote = test_peer();
        exchange.peer_connected(&remote).await.unwrap();
        let cid = Block::new(&b"never arrives"[..]).unwrap().cid;

        let result = tokio::time::timeout(Duration::from_millis(50), exchange.get_block(&cid)).await;
        assert!(result.is_err());
        assert!(exchange.wantlist().is_empty());

        // Peers are told to stop looking
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let cancelled = network.sent.lock().iter().any(|(to, m)| {
                    *to == remote
                        && m.wantlist
                            .as_ref()
                            .is_some_and(|w| w.entries.contains(&WantlistEntry::cancel(cid)))
                });
                if cancelled {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_explicit_want_survives_abandoned_fetch() {
        let (exchange, _network, _store) = test_exchange();
        let cid = Block::new(&b"still wanted"[..]).unwrap().cid;
        exchange.want(cid, 2).await;

        let result = tokio::time::timeout(Duration::from_millis(20), exchange.get_block(&cid)).await;
        assert!(result.is_err());
        assert_eq!(exchange.wantlist(), vec![cid]);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let (exchange, _network, _store) = exchange_with(ExchangeConfig {
            rebroadcast_interval_secs: 0,
            reprovide_interval_secs: 0,
            ..Default::default()
        });
        assert!(matches!(
            exchange.start().await,
            Err(ExchangeError::Config(ConfigError::Invalid(_)))
        ));
        // Nothing was spawned
        assert!(exchange.workers.lock().await.is_empty());
        assert!(!exchange.advertiser.is_running().await);
    }

    #[tokio::test]
    async fn test_send_dont_have_flag_on_outbound_wants() {
        let (exchange, network, _store) = exchange_with(ExchangeConfig {
            send_dont_have: true,
            reprovide_interval_secs: 0,
            ..Default::default()
        });
        let early = Block::new(&b"wanted before connect"[..]).unwrap().cid;
        exchange.want(early, 1).await;

        let peer = test_peer();
        exchange.peer_connected(&peer).await.unwrap();
        let late = Block::new(&b"wanted after connect"[..]).unwrap().cid;
        exchange.want(late, 1).await;

        let sent = network.sent.lock();
        let entries: Vec<&WantlistEntry> = sent
            .iter()
            .filter_map(|(_, m)| m.wantlist.as_ref())
            .flat_map(|w| w.entries.iter())
            .collect();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.send_dont_have && !e.cancel));
    }

    #[tokio::test]
    async fn test_session_release_cancels_unshared_wants() {
        let (exchange, network, _store) = test_exchange();
        let peer = test_peer();
        exchange.peer_connected(&peer).await.unwrap();
        let shared = Block::new(&b"shared"[..]).unwrap().cid;
        let own = Block::new(&b"own"[..]).unwrap().cid;

        assert!(exchange.want_for_session(shared, 1, 1).await);
        assert!(!exchange.want_for_session(shared, 1, 2).await);
        assert!(exchange.want_for_session(own, 1, 1).await);

        assert_eq!(exchange.release_session(1).await, vec![own]);
        assert_eq!(exchange.wantlist(), vec![shared]);

        let sent = network.sent.lock();
        let (_, last) = sent.last().unwrap();
        assert_eq!(
            last.wantlist.as_ref().unwrap().entries,
            vec![WantlistEntry::cancel(own)]
        );
    }

    #[tokio::test]
    async fn test_get_block_local_hit() {
        let (exchange, network, _store) = test_exchange();
        let block = Block::new(&b"local"[..]).unwrap();
        exchange.add_block(block.clone()).await.unwrap();

        assert_eq!(exchange.get_block(&block.cid).await.unwrap(), block);
        assert!(network.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_get_block_waits_for_network() {
        let (exchange, network, _store) = test_exchange();
        let exchange = Arc::new(exchange);
        let remote = test_peer();
        exchange.peer_connected(&remote).await.unwrap();
        let block = Block::new(&b"remote"[..]).unwrap();

        let fetch = {
            let exchange = Arc::clone(&exchange);
            let cid = block.cid;
            tokio::spawn(async move { exchange.get_block(&cid).await })
        };

        // Wait for the want to go out
        tokio::time::timeout(Duration::from_secs(5), async {
            while network.sent.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(exchange.wantlist(), vec![block.cid]);
        {
            let sent = network.sent.lock();
            let (to, message) = &sent[0];
            assert_eq!(*to, remote);
            assert_eq!(message.wantlist.as_ref().unwrap().entries[0].cid, block.cid);
        }

        exchange
            .receive_message(&remote, block_message(vec![block.clone()]))
            .await
            .unwrap();
        let fetched = tokio::time::timeout(Duration::from_secs(5), fetch)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(fetched, block);
        assert!(exchange.wantlist().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_want_wakes_waiter() {
        let (exchange, _network, _store) = test_exchange();
        let exchange = Arc::new(exchange);
        let cid = Block::new(&b"never"[..]).unwrap().cid;

        let fetch = {
            let exchange = Arc::clone(&exchange);
            tokio::spawn(async move { exchange.get_block(&cid).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while exchange.wantlist().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(exchange.cancel_want(&cid).await);
        let result = tokio::time::timeout(Duration::from_secs(5), fetch)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ExchangeError::Cancelled(c)) if c == cid));
    }

    #[tokio::test]
    async fn test_peer_connected_sends_full_wantlist() {
        let (exchange, network, _store) = test_exchange();
        let cid = Block::new(&b"wanted"[..]).unwrap().cid;
        exchange.want(cid, 5).await;

        let peer = test_peer();
        exchange.peer_connected(&peer).await.unwrap();

        let sent = network.sent.lock();
        let (to, message) = sent.last().unwrap();
        assert_eq!(*to, peer);
        let wantlist = message.wantlist.as_ref().unwrap();
        assert!(wantlist.full);
        assert_eq!(wantlist.entries, vec![WantlistEntry::want_block(cid, 5)]);
        assert_eq!(exchange.peers(), vec![peer]);
    }

    #[tokio::test]
    async fn test_workers_serve_wants() {
        let (exchange, network, _store) = test_exchange();
        let block = Block::new(&b"served"[..]).unwrap();
        exchange.add_block(block.clone()).await.unwrap();
        exchange.start().await.unwrap();

        let peer = test_peer();
        exchange
            .receive_message(&peer, Message::wants(vec![WantlistEntry::want_block(block.cid, 1)], false))
            .await
            .unwrap();

        // Counters are bumped after the send returns
        tokio::time::timeout(Duration::from_secs(5), async {
            while exchange.stat().blocks_sent == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(network.sent.lock().iter().any(|(_, m)| m.blocks.contains(&block)));
        let stat = exchange.stat();
        assert_eq!(stat.blocks_sent, 1);
        assert_eq!(stat.data_sent, block.size() as u64);
        let receipt = exchange.ledger_for_peer(&peer).unwrap();
        assert_eq!(receipt.sent, block.size() as u64);
        assert_eq!(receipt.wants, 0);

        exchange.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (exchange, _network, _store) = test_exchange();
        exchange.start().await.unwrap();
        assert!(matches!(exchange.start().await, Err(ExchangeError::AlreadyRunning)));
        exchange.stop().await;
        exchange.stop().await;
    }

    #[tokio::test]
    async fn test_have_presence_triggers_block_request() {
        let (exchange, network, _store) = test_exchange();
        let peer = test_peer();
        let cid = Block::new(&b"somewhere"[..]).unwrap().cid;
        exchange.want(cid, 3).await;

        exchange
            .receive_message(
                &peer,
                Message {
                    presences: vec![crate::message::BlockPresence {
                        cid,
                        presence: PresenceType::Have,
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let sent = network.sent.lock();
        let (to, message) = sent.last().unwrap();
        assert_eq!(*to, peer);
        assert_eq!(
            message.wantlist.as_ref().unwrap().entries,
            vec![WantlistEntry::want_block(cid, 3)]
        );
    }

    #[tokio::test]
    async fn test_full_provide_queue_drops_and_counts() {
        let (exchange, _network, _store) = exchange_with(ExchangeConfig {
            provide_queue_capacity: 1,
            provide_full_policy: FullQueuePolicy::DropNewest,
            reprovide_interval_secs: 0,
            ..Default::default()
        });

        for i in 0..3u8 {
            exchange.add_block(Block::new(vec![i; 4]).unwrap()).await.unwrap();
        }
        let stat = exchange.stat();
        assert_eq!(stat.provide_buf_len, 1);
        assert_eq!(stat.provides_dropped, 2);
    }
}
