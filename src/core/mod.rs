//! Core chain tracking components
//!
//! - Header codec and proof-of-work arithmetic
//! - Chain index (fork choice, reorg detection)
//! - The tracker service tying the index to storage and subscribers

pub mod chain_state;
pub mod header;
pub mod pow;
pub mod tracker;

pub use chain_state::{
    AppliedChange, ChainError, ChainIndex, ChainPolicy, ChainResult, ReorgEvent, StagedChange,
};
pub use header::{BlockHeader, ChainHeader, HeaderError, BLOCK_HEADER_SIZE};
pub use pow::{Work, REGTEST_BITS};
pub use tracker::{ChainTracker, ChainUpdate, Chaintracks, CompactionReport, TrackerInfo};
