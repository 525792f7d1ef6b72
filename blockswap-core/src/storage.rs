//! Block storage capability
//!
//! Defines the [`Block`] type, the [`BlockStore`] trait the exchange engine
//! consumes, and an in-memory implementation. Persistent and file-backed
//! stores live in [`crate::rocks_store`] and [`crate::filestore`].

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, error, trace};

use crate::content_id::{compute_cid, verify_cid, CidError};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Block not found: {0}")]
    NotFound(Cid),

    #[error("Block {cid} is corrupt: {reason}")]
    Corruption { cid: Cid, reason: String },

    #[error("File reference for {cid} is no longer valid: {reason}")]
    ReferenceInvalid { cid: Cid, reason: String },

    #[error("Path {0} is outside the file store root")]
    OutsideRoot(String),

    #[error("Invalid CID: {0}")]
    InvalidCid(#[from] CidError),

    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage task failed: {0}")]
    Task(String),
}

impl StorageError {
    /// True for errors meaning "the bytes I read are wrong" rather than
    /// "I don't have it".
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::Corruption { .. } | StorageError::ReferenceInvalid { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::Task(e.to_string())
    }
}

/// An immutable block: content identifier plus raw bytes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub data: Bytes,
}

impl Block {
    /// Create a block from data, computing its CID
    pub fn new(data: impl Into<Bytes>) -> Result<Self, CidError> {
        let data = data.into();
        let cid = compute_cid(&data)?;
        Ok(Self { cid, data })
    }

    /// Create a block from data and verify it matches the expected CID
    pub fn from_cid_and_data(cid: Cid, data: impl Into<Bytes>) -> Result<Self, StorageError> {
        let block = Self {
            cid,
            data: data.into(),
        };
        block.verify()?;
        Ok(block)
    }

    /// Re-derive the CID from the bytes and compare
    pub fn verify(&self) -> Result<(), StorageError> {
        verify_cid(&self.data, &self.cid).map_err(|e| StorageError::Corruption {
            cid: self.cid,
            reason: e.to_string(),
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Lazy, single-pass sequence of every key in a store.
///
/// Each call to [`BlockStore::all_keys`] starts a fresh walk.
pub type KeyStream = BoxStream<'static, Result<Cid, StorageError>>;

/// Authoritative local block presence
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn has(&self, cid: &Cid) -> Result<bool, StorageError>;

    /// Fetch a block. Absent blocks yield [`StorageError::NotFound`].
    async fn get(&self, cid: &Cid) -> Result<Block, StorageError>;

    /// Store a block after verifying its CID. Storing a block twice is a no-op.
    async fn put(&self, block: Block) -> Result<(), StorageError>;

    async fn delete(&self, cid: &Cid) -> Result<(), StorageError>;

    fn all_keys(&self) -> KeyStream;
}

/// In-memory block store backed by an ordered map
#[derive(Clone, Default)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<BTreeMap<Cid, Bytes>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// Overwrite the bytes stored under `cid` without verification.
    #[cfg(test)]
    pub(crate) fn insert_unchecked(&self, cid: Cid, data: impl Into<Bytes>) {
        self.blocks.write().insert(cid, data.into());
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        Ok(self.blocks.read().contains_key(cid))
    }

    async fn get(&self, cid: &Cid) -> Result<Block, StorageError> {
        let data = self
            .blocks
            .read()
            .get(cid)
            .cloned()
            .ok_or(StorageError::NotFound(*cid))?;

        let block = Block { cid: *cid, data };
        if let Err(e) = block.verify() {
            error!("Corrupt block in memory store: {}", e);
            return Err(e);
        }
        Ok(block)
    }

    async fn put(&self, block: Block) -> Result<(), StorageError> {
        block.verify()?;

        let mut blocks = self.blocks.write();
        if blocks.contains_key(&block.cid) {
            trace!("Block already exists: {}", block.cid);
            return Ok(());
        }

        debug!("Stored block {}, size: {} bytes", block.cid, block.size());
        blocks.insert(block.cid, block.data);
        Ok(())
    }

    async fn delete(&self, cid: &Cid) -> Result<(), StorageError> {
        self.blocks
            .write()
            .remove(cid)
            .map(|_| ())
            .ok_or(StorageError::NotFound(*cid))
    }

    fn all_keys(&self) -> KeyStream {
        // Cursor walk: one short read lock per key, never a full copy.
        let blocks = Arc::clone(&self.blocks);
        stream::unfold(None::<Cid>, move |cursor| {
            let blocks = Arc::clone(&blocks);
            async move {
                let lower = match cursor {
                    Some(last) => Bound::Excluded(last),
                    None => Bound::Unbounded,
                };
                let next = blocks
                    .read()
                    .range((lower, Bound::Unbounded))
                    .next()
                    .map(|(cid, _)| *cid);
                next.map(|cid| (Ok(cid), Some(cid)))
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::collections::HashSet;

    #[test]
    fn test_block_new() {
        let data = b"hello world".to_vec();
        let block = Block::new(data.clone()).unwrap();

        assert_eq!(block.data, Bytes::from(data.clone()));
        assert_eq!(block.size(), data.len());
        assert!(block.verify().is_ok());
    }

    #[test]
    fn test_block_from_cid_and_data() {
        let block1 = Block::new(&b"hello world"[..]).unwrap();

        let block2 = Block::from_cid_and_data(block1.cid, &b"hello world"[..]).unwrap();
        assert_eq!(block1, block2);

        let result = Block::from_cid_and_data(block1.cid, &b"goodbye world"[..]);
        assert!(matches!(result, Err(StorageError::Corruption { .. })));
    }

    #[test]
    fn test_error_classification() {
        let cid = Block::new(&b"x"[..]).unwrap().cid;

        assert!(StorageError::NotFound(cid).is_not_found());
        assert!(!StorageError::NotFound(cid).is_corruption());
        assert!(StorageError::Corruption {
            cid,
            reason: "bad".into()
        }
        .is_corruption());
        assert!(StorageError::ReferenceInvalid {
            cid,
            reason: "moved".into()
        }
        .is_corruption());
    }

    #[tokio::test]
    async fn test_memory_put_get_has() {
        let store = MemoryBlockStore::new();
        let block = Block::new(&b"hello world"[..]).unwrap();

        assert!(!store.has(&block.cid).await.unwrap());
        store.put(block.clone()).await.unwrap();
        assert!(store.has(&block.cid).await.unwrap());

        let retrieved = store.get(&block.cid).await.unwrap();
        assert_eq!(retrieved, block);
        assert!(retrieved.verify().is_ok());
    }

    #[tokio::test]
    async fn test_memory_get_missing() {
        let store = MemoryBlockStore::new();
        let cid = Block::new(&b"missing"[..]).unwrap().cid;

        assert!(matches!(
            store.get(&cid).await,
            Err(StorageError::NotFound(c)) if c == cid
        ));
    }

    #[tokio::test]
    async fn test_memory_rejects_corrupt_put() {
        let store = MemoryBlockStore::new();
        let good = Block::new(&b"good"[..]).unwrap();
        let bad = Block {
            cid: good.cid,
            data: Bytes::from_static(b"evil"),
        };

        let err = store.put(bad).await.unwrap_err();
        assert!(err.is_corruption());
        assert!(!store.has(&good.cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_detects_corruption_on_read() {
        let store = MemoryBlockStore::new();
        let block = Block::new(&b"original"[..]).unwrap();
        store.insert_unchecked(block.cid, &b"tampered"[..]);

        let err = store.get(&block.cid).await.unwrap_err();
        assert!(err.is_corruption());
    }

    #[tokio::test]
    async fn test_memory_idempotent_put_and_delete() {
        let store = MemoryBlockStore::new();
        let block = Block::new(&b"hello"[..]).unwrap();

        store.put(block.clone()).await.unwrap();
        store.put(block.clone()).await.unwrap();
        assert_eq!(store.len(), 1);

        store.delete(&block.cid).await.unwrap();
        assert!(store.is_empty());
        assert!(store.delete(&block.cid).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_memory_all_keys_is_restartable() {
        let store = MemoryBlockStore::new();
        let mut expected = HashSet::new();
        for i in 0..25u32 {
            let block = Block::new(i.to_be_bytes().to_vec()).unwrap();
            expected.insert(block.cid);
            store.put(block).await.unwrap();
        }

        let first: Vec<Cid> = store.all_keys().try_collect().await.unwrap();
        let second: Vec<Cid> = store.all_keys().try_collect().await.unwrap();

        assert_eq!(first.len(), 25);
        assert_eq!(first, second);
        assert_eq!(first.into_iter().collect::<HashSet<_>>(), expected);
    }
}
