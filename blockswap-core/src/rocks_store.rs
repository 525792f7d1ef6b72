//! RocksDB-backed persistent block storage
//!
//! Blocks are keyed by the binary form of their CID. Reads re-verify the
//! content hash so on-disk corruption surfaces as
//! [`StorageError::Corruption`] instead of bad data.

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::stream::{self, StreamExt};
use rocksdb::{IteratorMode, Options, DB};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::storage::{Block, BlockStore, KeyStream, StorageError};

/// Keys buffered between the blocking RocksDB iterator and the consumer
const KEY_STREAM_BUFFER: usize = 256;

/// Open a RocksDB handle tuned for point lookups of content-addressed values
pub(crate) fn open_db(path: &Path) -> Result<DB, StorageError> {
    let mut opts = Options::default();
    opts.create_if_missing(true);

    // CID -> block lookups dominate
    opts.optimize_for_point_lookup(256);
    opts.set_enable_pipelined_write(true);

    // Blocks are usually already compressed content
    opts.set_compression_type(rocksdb::DBCompressionType::None);

    opts.increase_parallelism(num_cpus::get() as i32);
    opts.set_max_background_jobs(4);
    opts.set_write_buffer_size(64 * 1024 * 1024);
    opts.set_target_file_size_base(128 * 1024 * 1024);

    Ok(DB::open(&opts, path)?)
}

/// Walk every key of `db` on a blocking thread, handing CIDs through a
/// bounded channel so memory stays flat regardless of store size.
pub(crate) fn stream_keys(db: Arc<DB>) -> KeyStream {
    let (tx, rx) = mpsc::channel::<Result<Cid, StorageError>>(KEY_STREAM_BUFFER);

    tokio::task::spawn_blocking(move || {
        for item in db.iterator(IteratorMode::Start) {
            let next = match item {
                Ok((key, _)) => match Cid::try_from(&key[..]) {
                    Ok(cid) => Ok(cid),
                    Err(e) => {
                        warn!("Skipping undecodable key in block store: {}", e);
                        continue;
                    }
                },
                Err(e) => Err(StorageError::Database(e)),
            };
            let failed = next.is_err();
            // Receiver dropped: consumer stopped early
            if tx.blocking_send(next).is_err() || failed {
                break;
            }
        }
    });

    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// RocksDB-backed persistent block storage with CID-based indexing
pub struct RocksBlockStore {
    db: Arc<DB>,
}

impl RocksBlockStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = open_db(path.as_ref())?;
        info!("Opened RocksDB block store at {:?}", path.as_ref());
        Ok(Self { db: Arc::new(db) })
    }

    /// Number of stored blocks and their total size in bytes
    pub async fn stats(&self) -> Result<BlockStoreStats, StorageError> {
        let db = Arc::clone(&self.db);

        tokio::task::spawn_blocking(move || {
            let mut stats = BlockStoreStats::default();
            for item in db.iterator(IteratorMode::Start) {
                let (_, value) = item?;
                stats.block_count += 1;
                stats.total_size += value.len();
            }
            Ok::<_, StorageError>(stats)
        })
        .await?
    }
}

#[async_trait]
impl BlockStore for RocksBlockStore {
    async fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        let db = Arc::clone(&self.db);
        let key = cid.to_bytes();

        let found = tokio::task::spawn_blocking(move || db.get_pinned(&key).map(|v| v.is_some()))
            .await??;
        Ok(found)
    }

    async fn get(&self, cid: &Cid) -> Result<Block, StorageError> {
        let db = Arc::clone(&self.db);
        let key = cid.to_bytes();

        let data = tokio::task::spawn_blocking(move || db.get(&key))
            .await??
            .ok_or(StorageError::NotFound(*cid))?;

        let block = Block {
            cid: *cid,
            data: Bytes::from(data),
        };
        block.verify()?;
        Ok(block)
    }

    async fn put(&self, block: Block) -> Result<(), StorageError> {
        block.verify()?;

        let db = Arc::clone(&self.db);
        let key = block.cid.to_bytes();
        let cid = block.cid;
        let size = block.size();

        let written = tokio::task::spawn_blocking(move || {
            if db.get_pinned(&key)?.is_some() {
                return Ok::<bool, StorageError>(false);
            }
            db.put(&key, &block.data)?;
            Ok(true)
        })
        .await??;

        if written {
            debug!("Stored block {}, size: {} bytes", cid, size);
        } else {
            debug!("Block already exists: {}", cid);
        }
        Ok(())
    }

    async fn delete(&self, cid: &Cid) -> Result<(), StorageError> {
        let db = Arc::clone(&self.db);
        let key = cid.to_bytes();
        let missing = *cid;

        tokio::task::spawn_blocking(move || {
            if db.get_pinned(&key)?.is_none() {
                return Err(StorageError::NotFound(missing));
            }
            db.delete(&key)?;
            Ok(())
        })
        .await??;

        debug!("Deleted block {}", cid);
        Ok(())
    }

    fn all_keys(&self) -> KeyStream {
        stream_keys(Arc::clone(&self.db))
    }
}

/// Statistics about the block store
#[derive(Debug, Clone, Default)]
pub struct BlockStoreStats {
    pub block_count: usize,
    pub total_size: usize,
}
