//! Block header codec
//!
//! A header is the fixed 80-byte record identifying one block. Its identity
//! is the double SHA-256 of that record; [`ChainHeader`] adds the position
//! and cumulative work a header has once its parent is known.

use crate::core::pow::{self, Work};
use crate::crypto::Hash256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Block header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Header codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Malformed header: expected 80 bytes, got {len}")]
    MalformedHeader { len: usize },
    #[error("Invalid header hex: {0}")]
    InvalidHex(String),
}

/// Block header fields, serialized little-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub version: i32,
    pub previous_hash: Hash256,
    pub merkle_root: Hash256,
    /// Seconds since the unix epoch
    pub time: u32,
    /// Compact difficulty target
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Serialize to the 80-byte wire record
    pub fn encode(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut out = [0u8; BLOCK_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.previous_hash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Parse an 80-byte wire record
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() != BLOCK_HEADER_SIZE {
            return Err(HeaderError::MalformedHeader { len: bytes.len() });
        }

        Ok(Self {
            version: i32::from_le_bytes(le_word(&bytes[0..4])),
            previous_hash: Hash256::from_bytes(hash_bytes(&bytes[4..36])),
            merkle_root: Hash256::from_bytes(hash_bytes(&bytes[36..68])),
            time: u32::from_le_bytes(le_word(&bytes[68..72])),
            bits: u32::from_le_bytes(le_word(&bytes[72..76])),
            nonce: u32::from_le_bytes(le_word(&bytes[76..80])),
        })
    }

    /// Parse a hex-encoded 80-byte record
    pub fn from_hex(s: &str) -> Result<Self, HeaderError> {
        let bytes = hex::decode(s.trim()).map_err(|e| HeaderError::InvalidHex(e.to_string()))?;
        Self::decode(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.encode())
    }

    /// Decode a concatenation of 80-byte records
    pub fn decode_all(bytes: &[u8]) -> Result<Vec<Self>, HeaderError> {
        if bytes.len() % BLOCK_HEADER_SIZE != 0 {
            return Err(HeaderError::MalformedHeader { len: bytes.len() });
        }
        bytes.chunks_exact(BLOCK_HEADER_SIZE).map(Self::decode).collect()
    }

    /// Double SHA-256 of the encoded header
    pub fn hash(&self) -> Hash256 {
        Hash256::digest(&self.encode())
    }

    /// Whether the header hash satisfies its own `bits` target
    pub fn is_valid_pow(&self) -> bool {
        pow::meets_target(&self.hash(), self.bits)
    }

    /// Work contributed by this header alone
    pub fn work(&self) -> Work {
        pow::work_from_bits(self.bits)
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::from(self.time), 0)
    }
}

fn le_word(bytes: &[u8]) -> [u8; 4] {
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);
    word
}

fn hash_bytes(bytes: &[u8]) -> [u8; 32] {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(bytes);
    hash
}

/// A header placed in the chain.
///
/// Created once its parent is known and never mutated afterwards; reorgs
/// change which chain headers are active, not their contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainHeader {
    #[serde(flatten)]
    pub header: BlockHeader,
    pub height: u32,
    pub hash: Hash256,
    #[serde(with = "pow::serde_work_hex")]
    pub chain_work: Work,
}

impl ChainHeader {
    /// Place a genesis header (no parent)
    pub fn genesis(header: BlockHeader) -> Self {
        Self {
            chain_work: header.work(),
            hash: header.hash(),
            height: 0,
            header,
        }
    }

    /// Place `header` on top of `parent`
    pub fn child_of(parent: &ChainHeader, header: BlockHeader) -> Self {
        Self::with_parent_work(header, parent.height + 1, &parent.chain_work)
    }

    /// Place `header` at `height` given its parent's cumulative work
    pub fn with_parent_work(header: BlockHeader, height: u32, parent_work: &Work) -> Self {
        Self {
            chain_work: parent_work + header.work(),
            hash: header.hash(),
            height,
            header,
        }
    }

    pub fn previous_hash(&self) -> &Hash256 {
        &self.header.previous_hash
    }

    pub fn merkle_root(&self) -> &Hash256 {
        &self.header.merkle_root
    }

    pub fn chain_work_hex(&self) -> String {
        pow::work_to_hex(&self.chain_work)
    }
}
