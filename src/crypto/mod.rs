//! Cryptographic utilities for the header chain
//!
//! This module provides:
//! - SHA-256 and double SHA-256 hashing
//! - The 32-byte hash identifier type

pub mod hash;

pub use hash::{double_sha256, sha256, sha256_hex, Hash256, HASH_SIZE};
