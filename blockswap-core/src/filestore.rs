//! File-reference block storage
//!
//! A [`FileStore`] serves blocks whose bytes live inside ordinary files
//! under a configured root directory. Instead of copying the bytes, the
//! [`FileManager`] keeps a `(path, offset, size)` reference per CID in a
//! RocksDB index and re-reads the range on every `get`, re-deriving the CID
//! from what it read. A file that was truncated, moved or edited after
//! being indexed yields [`StorageError::ReferenceInvalid`], never stale data.
//!
//! Regular blocks written with [`BlockStore::put`] go to the wrapped store.

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::StreamExt;
use rocksdb::DB;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::content_id::{compute_cid, CidError, StreamingVerifier};
use crate::rocks_store::{open_db, stream_keys};
use crate::storage::{Block, BlockStore, KeyStream, StorageError};

/// Location of a block's bytes inside a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub path: PathBuf,
    pub offset: u64,
    pub size: u64,
}

/// A block together with where its bytes can be found on disk
#[derive(Debug, Clone)]
pub struct FileBlock {
    pub block: Block,
    pub file_ref: FileRef,
}

/// Result of re-checking a reference against the file it points into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRefStatus {
    Ok,
    /// The file exists but the referenced range no longer hashes to the CID
    Changed,
    /// The file is gone
    Missing,
}

/// Index of CID -> file reference, persisted in RocksDB
pub struct FileManager {
    db: Arc<DB>,
    root: PathBuf,
}

impl FileManager {
    /// Open (or create) the reference index at `index_path`. Only files
    /// below `root` may be referenced.
    pub fn open<P: AsRef<Path>, R: AsRef<Path>>(index_path: P, root: R) -> Result<Self, StorageError> {
        let root = std::fs::canonicalize(root.as_ref())?;
        let db = open_db(index_path.as_ref())?;
        info!(
            "Opened file reference index at {:?} (root {:?})",
            index_path.as_ref(),
            root
        );
        Ok(Self {
            db: Arc::new(db),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path relative to the root, or an error for files outside it
    fn relative_path(&self, path: &Path) -> Result<PathBuf, StorageError> {
        let full = std::fs::canonicalize(path)?;
        full.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .map_err(|_| StorageError::OutsideRoot(path.display().to_string()))
    }

    /// Record where the bytes of `cid` live
    pub async fn put(&self, cid: &Cid, file_ref: &FileRef) -> Result<(), StorageError> {
        let stored = FileRef {
            path: self.relative_path(&file_ref.path)?,
            offset: file_ref.offset,
            size: file_ref.size,
        };
        let value = bincode::serialize(&stored)?;
        let db = Arc::clone(&self.db);
        let key = cid.to_bytes();

        tokio::task::spawn_blocking(move || db.put(key, value)).await??;

        debug!(
            "Indexed {} -> {:?}@{}+{}",
            cid, stored.path, stored.offset, stored.size
        );
        Ok(())
    }

    pub async fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        let db = Arc::clone(&self.db);
        let key = cid.to_bytes();
        let found =
            tokio::task::spawn_blocking(move || db.get_pinned(&key).map(|v| v.is_some())).await??;
        Ok(found)
    }

    /// The stored reference for `cid`, with its path resolved against the root
    pub async fn lookup(&self, cid: &Cid) -> Result<FileRef, StorageError> {
        let db = Arc::clone(&self.db);
        let key = cid.to_bytes();

        let raw = tokio::task::spawn_blocking(move || db.get(&key))
            .await??
            .ok_or(StorageError::NotFound(*cid))?;

        let mut file_ref: FileRef = bincode::deserialize(&raw)?;
        file_ref.path = self.root.join(&file_ref.path);
        Ok(file_ref)
    }

    /// Read the referenced range and check it still hashes to `cid`
    pub async fn get(&self, cid: &Cid) -> Result<Block, StorageError> {
        let file_ref = self.lookup(cid).await?;
        let cid = *cid;

        let data = tokio::task::spawn_blocking(move || read_range(&cid, &file_ref)).await??;

        match Block::from_cid_and_data(cid, data) {
            Ok(block) => Ok(block),
            Err(StorageError::Corruption { reason, .. }) => {
                warn!("File reference for {} no longer matches: {}", cid, reason);
                Err(StorageError::ReferenceInvalid {
                    cid,
                    reason: format!("referenced bytes changed ({})", reason),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Re-hash the referenced range without buffering it
    pub async fn verify(&self, cid: &Cid) -> Result<FileRefStatus, StorageError> {
        let file_ref = self.lookup(cid).await?;
        let cid = *cid;

        tokio::task::spawn_blocking(move || {
            let mut file = match File::open(&file_ref.path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileRefStatus::Missing),
                Err(e) => return Err(StorageError::Io(e)),
            };
            if file.metadata()?.len() < file_ref.offset + file_ref.size {
                return Ok(FileRefStatus::Changed);
            }
            file.seek(SeekFrom::Start(file_ref.offset))?;

            let mut verifier = StreamingVerifier::new_with_cid(cid);
            verifier.update_from_reader(&mut file.take(file_ref.size))?;
            match verifier.finalize_and_verify() {
                Ok(_) => Ok(FileRefStatus::Ok),
                Err(CidError::HashMismatch { .. }) => Ok(FileRefStatus::Changed),
                Err(e) => Err(StorageError::InvalidCid(e)),
            }
        })
        .await?
    }

    pub async fn delete(&self, cid: &Cid) -> Result<(), StorageError> {
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
        .await?
    }

    /// Stream every referenced CID; file contents are never touched
    pub fn all_keys(&self) -> KeyStream {
        stream_keys(Arc::clone(&self.db))
    }
}

fn read_range(cid: &Cid, file_ref: &FileRef) -> Result<Bytes, StorageError> {
    let invalid = |reason: String| StorageError::ReferenceInvalid { cid: *cid, reason };

    let mut file = match File::open(&file_ref.path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(invalid(format!("{} is missing", file_ref.path.display())))
        }
        Err(e) => return Err(StorageError::Io(e)),
    };

    let file_len = file.metadata()?.len();
    let end = file_ref.offset + file_ref.size;
    if file_len < end {
        return Err(invalid(format!(
            "{} is {} bytes, reference needs {}..{}",
            file_ref.path.display(),
            file_len,
            file_ref.offset,
            end
        )));
    }

    file.seek(SeekFrom::Start(file_ref.offset))?;
    let mut buf = vec![0u8; file_ref.size as usize];
    match file.read_exact(&mut buf) {
        Ok(()) => Ok(Bytes::from(buf)),
        // Shrunk between the length check and the read
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(invalid(format!("{} was truncated", file_ref.path.display())))
        }
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Block store that serves file-referenced blocks alongside a regular store
pub struct FileStore {
    blocks: Arc<dyn BlockStore>,
    files: FileManager,
}

impl FileStore {
    pub fn new(blocks: Arc<dyn BlockStore>, files: FileManager) -> Self {
        Self { blocks, files }
    }

    pub fn file_manager(&self) -> &FileManager {
        &self.files
    }

    /// Record a block by reference instead of copying its bytes
    pub async fn put_file_block(&self, file_block: &FileBlock) -> Result<(), StorageError> {
        let FileBlock { block, file_ref } = file_block;
        block.verify()?;

        if file_ref.size != block.size() as u64 {
            return Err(StorageError::ReferenceInvalid {
                cid: block.cid,
                reason: format!(
                    "reference covers {} bytes but block has {}",
                    file_ref.size,
                    block.size()
                ),
            });
        }

        if self.blocks.has(&block.cid).await? {
            debug!("Block {} already stored by value, skipping reference", block.cid);
            return Ok(());
        }

        self.files.put(&block.cid, file_ref).await
    }

    /// Index `path` by reference in `chunk_size` slices, returning the CIDs in
    /// file order
    pub async fn index_file(&self, path: &Path, chunk_size: usize) -> Result<Vec<FileBlock>, StorageError> {
        if chunk_size == 0 {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "chunk size must be non-zero",
            )));
        }

        let owned = path.to_path_buf();
        let chunks = tokio::task::spawn_blocking(move || -> Result<Vec<FileBlock>, StorageError> {
            let mut file = File::open(&owned)?;
            let mut chunks = Vec::new();
            let mut offset = 0u64;
            loop {
                let mut buf = Vec::with_capacity(chunk_size);
                let n = (&mut file).take(chunk_size as u64).read_to_end(&mut buf)?;
                if n == 0 {
                    break;
                }
                let cid = compute_cid(&buf)?;
                chunks.push(FileBlock {
                    block: Block {
                        cid,
                        data: Bytes::from(buf),
                    },
                    file_ref: FileRef {
                        path: owned.clone(),
                        offset,
                        size: n as u64,
                    },
                });
                offset += n as u64;
            }
            Ok(chunks)
        })
        .await??;

        for chunk in &chunks {
            self.put_file_block(chunk).await?;
        }

        info!("Indexed {:?} as {} referenced blocks", path, chunks.len());
        Ok(chunks)
    }
}

#[async_trait]
impl BlockStore for FileStore {
    async fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        if self.blocks.has(cid).await? {
            return Ok(true);
        }
        self.files.has(cid).await
    }

    async fn get(&self, cid: &Cid) -> Result<Block, StorageError> {
        match self.blocks.get(cid).await {
            Err(StorageError::NotFound(_)) => self.files.get(cid).await,
            other => other,
        }
    }

    async fn put(&self, block: Block) -> Result<(), StorageError> {
        self.blocks.put(block).await
    }

    async fn delete(&self, cid: &Cid) -> Result<(), StorageError> {
        match self.blocks.delete(cid).await {
            Err(StorageError::NotFound(_)) => self.files.delete(cid).await,
            other => other,
        }
    }

    fn all_keys(&self) -> KeyStream {
        self.blocks.all_keys().chain(self.files.all_keys()).boxed()
    }
}
