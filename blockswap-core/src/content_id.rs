//! Content identifiers for blocks
//!
//! Every block is addressed by a CIDv1 using the raw codec and a
//! sha2-256 multihash. Identifiers are re-derived whenever bytes cross a
//! trust boundary (network receipt, file-reference reads).

use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use std::io::{self, Read};
use thiserror::Error;

/// sha2-256 multihash code
const SHA256_CODE: u64 = 0x12;

/// Raw binary multicodec
pub const RAW_CODEC: u64 = 0x55;

#[derive(Debug, Error)]
pub enum CidError {
    #[error("Invalid CID: {0}")]
    InvalidCid(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Multihash error: {0}")]
    Multihash(String),
}

/// SHA-256 digest of `data`
pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

fn cid_from_digest(digest: &[u8]) -> Result<Cid, CidError> {
    let mh = Multihash::wrap(SHA256_CODE, digest)
        .map_err(|e| CidError::Multihash(format!("Failed to create multihash: {}", e)))?;
    Ok(Cid::new_v1(RAW_CODEC, mh))
}

/// Compute the content identifier for `data`
pub fn compute_cid(data: &[u8]) -> Result<Cid, CidError> {
    cid_from_digest(&sha256_digest(data))
}

/// Check that `data` hashes to `expected_cid`
pub fn verify_cid(data: &[u8], expected_cid: &Cid) -> Result<(), CidError> {
    let computed_cid = compute_cid(data)?;

    if &computed_cid != expected_cid {
        return Err(CidError::HashMismatch {
            expected: expected_cid.to_string(),
            actual: computed_cid.to_string(),
        });
    }

    Ok(())
}

/// Parse a CID from its canonical string form
pub fn parse_cid_str(s: &str) -> Result<Cid, CidError> {
    s.parse().map_err(|e| CidError::InvalidCid(format!("{}", e)))
}

/// Incremental hasher that derives a CID from data fed in pieces.
///
/// Used by the file-reference store to check a referenced byte range
/// without holding the whole range in memory.
pub struct StreamingVerifier {
    hasher: Sha256,
    expected_cid: Option<Cid>,
    bytes_processed: u64,
}

impl StreamingVerifier {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            expected_cid: None,
            bytes_processed: 0,
        }
    }

    pub fn new_with_cid(expected_cid: Cid) -> Self {
        Self {
            hasher: Sha256::new(),
            expected_cid: Some(expected_cid),
            bytes_processed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    /// Drain `reader` into the hasher, returning the number of bytes read
    pub fn update_from_reader<R: Read>(&mut self, reader: &mut R) -> Result<u64, io::Error> {
        let mut buffer = [0u8; 8192];
        let mut total_read = 0u64;

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }

            self.update(&buffer[..n]);
            total_read += n as u64;
        }

        Ok(total_read)
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    /// Finalize and verify against the expected CID, if one was given
    pub fn finalize_and_verify(self) -> Result<Cid, CidError> {
        let expected_cid = self.expected_cid;
        let computed_cid = cid_from_digest(self.hasher.finalize().as_slice())?;

        if let Some(expected) = expected_cid {
            if computed_cid != expected {
                return Err(CidError::HashMismatch {
                    expected: expected.to_string(),
                    actual: computed_cid.to_string(),
                });
            }
        }

        Ok(computed_cid)
    }
}

impl Default for StreamingVerifier {
    fn default() -> Self {
        Self::new()
    }
}
