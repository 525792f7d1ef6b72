//! Bounded queue of CIDs waiting to be announced to content routing
//!
//! Producers are the message handlers; the single consumer is the
//! [`crate::advertiser::Advertiser`]. Announcing is slow, so the queue is
//! bounded and what happens when it fills up is configured explicitly.

use cid::Cid;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

pub const DEFAULT_PROVIDE_QUEUE_CAPACITY: usize = 2048;

/// Behaviour of [`ProvideQueue::enqueue`] when the queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullQueuePolicy {
    /// Drop the incoming CID and count it; the reprovide sweep picks it up later
    #[default]
    DropNewest,
    /// Wait for the consumer to make room
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    Dropped,
}

#[derive(Debug, thiserror::Error)]
pub enum ProvideQueueError {
    #[error("Provide queue is closed")]
    Closed,
}

/// Producer handle; cheap to clone
#[derive(Clone)]
pub struct ProvideQueue {
    tx: mpsc::Sender<Cid>,
    policy: FullQueuePolicy,
    dropped: Arc<AtomicU64>,
}

/// Consumer half of the queue
pub struct ProvideReceiver {
    rx: mpsc::Receiver<Cid>,
}

/// Create a queue holding at most `capacity` CIDs (minimum 1)
pub fn provide_queue(capacity: usize, policy: FullQueuePolicy) -> (ProvideQueue, ProvideReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ProvideQueue {
            tx,
            policy,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        ProvideReceiver { rx },
    )
}

impl ProvideQueue {
    pub async fn enqueue(&self, cid: Cid) -> Result<EnqueueOutcome, ProvideQueueError> {
        match self.policy {
            FullQueuePolicy::Block => {
                self.tx.send(cid).await.map_err(|_| ProvideQueueError::Closed)?;
            }
            FullQueuePolicy::DropNewest => match self.tx.try_send(cid) {
                Ok(()) => {}
                Err(TrySendError::Full(cid)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        "Provide queue full ({}), dropping announcement for {} ({} dropped so far)",
                        self.capacity(),
                        cid,
                        dropped
                    );
                    return Ok(EnqueueOutcome::Dropped);
                }
                Err(TrySendError::Closed(_)) => return Err(ProvideQueueError::Closed),
            },
        }
        trace!(cid = %cid, "Queued for provide");
        Ok(EnqueueOutcome::Queued)
    }

    /// CIDs currently buffered
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn policy(&self) -> FullQueuePolicy {
        self.policy
    }

    /// Announcements discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ProvideReceiver {
    /// Next CID in FIFO order; `None` once every producer is gone
    pub async fn recv(&mut self) -> Option<Cid> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Cid> {
        self.rx.try_recv().ok()
    }
}
