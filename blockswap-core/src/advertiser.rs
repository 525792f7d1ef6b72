//! Announces locally held blocks to content routing
//!
//! ## Architecture
//!
//! - **Queue-driven**: drains the [`ProvideReceiver`] in FIFO order
//! - **Concurrency limited**: at most `max_concurrent` announcements in flight
//! - **Periodic reprovide**: walks `BlockStore::all_keys` every
//!   `reprovide_interval`, which also recovers announcements the queue dropped
//! - **Lifecycle**: `start`/`stop`, restartable

use cid::Cid;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::network::ContentRouting;
use crate::provide_queue::{EnqueueOutcome, ProvideQueue, ProvideQueueError, ProvideReceiver};
use crate::storage::BlockStore;

pub const DEFAULT_PROVIDE_CONCURRENCY: usize = 10;
pub const DEFAULT_REPROVIDE_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, thiserror::Error)]
pub enum AdvertiserError {
    #[error("Advertiser is not running")]
    NotRunning,

    #[error("Advertiser is already running")]
    AlreadyRunning,

    #[error("Provide queue receiver is unavailable")]
    ReceiverUnavailable,

    #[error(transparent)]
    Queue(#[from] ProvideQueueError),
}

type Result<T> = std::result::Result<T, AdvertiserError>;

/// Shared by the queue loop and the reprovide sweep
#[derive(Clone)]
struct ProvideWorker {
    routing: Arc<dyn ContentRouting>,
    in_flight: Arc<Mutex<HashSet<Cid>>>,
    permits: Arc<Semaphore>,
    provided: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl ProvideWorker {
    /// Waits for a permit, then announces in the background
    async fn provide(&self, cid: Cid) {
        if !self.in_flight.lock().insert(cid) {
            debug!("Block {} already in-flight, skipping", cid);
            return;
        }

        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            self.in_flight.lock().remove(&cid);
            return;
        };

        let worker = self.clone();
        tokio::spawn(async move {
            match worker.routing.provide(&cid).await {
                Ok(()) => {
                    worker.provided.fetch_add(1, Ordering::Relaxed);
                    debug!("Provided {}", cid);
                }
                Err(e) => {
                    worker.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Failed to provide {}: {}", cid, e);
                }
            }
            worker.in_flight.lock().remove(&cid);
            drop(permit);
        });
    }
}

struct Running {
    advertise: JoinHandle<ProvideReceiver>,
    reprovide: Option<JoinHandle<()>>,
}

pub struct Advertiser {
    worker: ProvideWorker,
    queue: ProvideQueue,
    receiver: Mutex<Option<ProvideReceiver>>,
    block_store: Option<Arc<dyn BlockStore>>,
    max_concurrent: usize,
    reprovide_interval: Duration,
    shutdown: watch::Sender<bool>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Advertiser {
    /// `queue` and `receiver` are the two halves from
    /// [`crate::provide_queue::provide_queue`]
    pub fn new(
        routing: Arc<dyn ContentRouting>,
        queue: ProvideQueue,
        receiver: ProvideReceiver,
        max_concurrent: usize,
        reprovide_interval: Duration,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let (shutdown, _) = watch::channel(false);

        Self {
            worker: ProvideWorker {
                routing,
                in_flight: Arc::new(Mutex::new(HashSet::new())),
                permits: Arc::new(Semaphore::new(max_concurrent)),
                provided: Arc::new(AtomicU64::new(0)),
                failed: Arc::new(AtomicU64::new(0)),
            },
            queue,
            receiver: Mutex::new(Some(receiver)),
            block_store: None,
            max_concurrent,
            reprovide_interval,
            shutdown,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Enable the periodic sweep over every key in `block_store`
    pub fn set_block_store(&mut self, block_store: Arc<dyn BlockStore>) {
        self.block_store = Some(block_store);
    }

    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(AdvertiserError::AlreadyRunning);
        }
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or(AdvertiserError::ReceiverUnavailable)?;

        info!(
            "Starting advertiser (max_concurrent={}, reprovide_interval={:?})",
            self.max_concurrent, self.reprovide_interval
        );
        self.shutdown.send_replace(false);

        let advertise = self.spawn_advertise_loop(receiver);
        let reprovide = match &self.block_store {
            Some(store) => Some(self.spawn_reprovide_loop(Arc::clone(store))),
            None => {
                info!("No block store set, skipping reprovide sweep");
                None
            }
        };

        *running = Some(Running { advertise, reprovide });
        Ok(())
    }

    /// Stop both loops. Announcements already in flight run to completion.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        info!("Stopping advertiser");
        self.shutdown.send_replace(true);

        match running.advertise.await {
            Ok(receiver) => *self.receiver.lock() = Some(receiver),
            Err(e) => error!("Advertisement loop failed: {}", e),
        }
        if let Some(handle) = running.reprovide {
            if let Err(e) = handle.await {
                error!("Reprovide loop failed: {}", e);
            }
        }

        info!("Advertiser stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Queue a block for announcement
    pub async fn advertise_block(&self, cid: &Cid) -> Result<EnqueueOutcome> {
        if !self.is_running().await {
            return Err(AdvertiserError::NotRunning);
        }
        debug!("Queueing block for advertisement: {}", cid);
        Ok(self.queue.enqueue(*cid).await?)
    }

    pub fn in_flight_count(&self) -> usize {
        self.worker.in_flight.lock().len()
    }

    pub fn is_in_flight(&self, cid: &Cid) -> bool {
        self.worker.in_flight.lock().contains(cid)
    }

    /// Successful announcements since creation
    pub fn provided_count(&self) -> u64 {
        self.worker.provided.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.worker.failed.load(Ordering::Relaxed)
    }

    fn spawn_advertise_loop(&self, mut receiver: ProvideReceiver) -> JoinHandle<ProvideReceiver> {
        let worker = self.worker.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    next = receiver.recv() => match next {
                        Some(cid) => worker.provide(cid).await,
                        None => {
                            warn!("Provide queue closed");
                            break;
                        }
                    },
                }
            }
            info!("Advertisement loop terminated");
            receiver
        })
    }

    fn spawn_reprovide_loop(&self, block_store: Arc<dyn BlockStore>) -> JoinHandle<()> {
        let worker = self.worker.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.reprovide_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately
            ticker.tick().await;
            let mut cycle = 0u64;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }

                cycle += 1;
                info!("Starting reprovide cycle #{}", cycle);

                let mut keys = block_store.all_keys();
                let mut swept = 0u64;
                while let Some(next) = keys.next().await {
                    if *shutdown.borrow() {
                        break;
                    }
                    match next {
                        Ok(cid) => {
                            worker.provide(cid).await;
                            swept += 1;
                        }
                        Err(e) => {
                            warn!("Reprovide cycle #{} aborted: {}", cycle, e);
                            break;
                        }
                    }
                }

                info!("Reprovide cycle #{} complete - {} blocks", cycle, swept);
            }

            info!("Reprovide loop terminated");
        })
    }
}
