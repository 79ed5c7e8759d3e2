//! Bulk archive manifest
//!
//! The archive publishes one JSON manifest per chain listing its chunk files
//! in ascending height order. Each chunk is a raw concatenation of 80-byte
//! header records.

use crate::core::pow::{serde_work_hex, Work};
use crate::crypto::Hash256;
use serde::{Deserialize, Serialize};

/// One chunk file of the archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub chain: String,
    pub file_name: String,
    pub first_height: u32,
    pub count: u32,
    /// Hex SHA-256 of the chunk bytes
    #[serde(default)]
    pub file_hash: Option<String>,
    /// Hash preceding the first header; zero for the genesis chunk
    pub prev_hash: Hash256,
    pub last_hash: Hash256,
    #[serde(with = "serde_work_hex")]
    pub prev_chain_work: Work,
    #[serde(with = "serde_work_hex")]
    pub last_chain_work: Work,
}

impl ManifestEntry {
    pub fn last_height(&self) -> u32 {
        self.first_height.saturating_add(self.count.saturating_sub(1))
    }

    /// Whether a local chain at `height` already holds every header here
    pub fn is_covered_by(&self, height: Option<u32>) -> bool {
        height.is_some_and(|h| self.last_height() <= h)
    }
}

/// Archive manifest; `sourceURL` and other unknown entry fields are ignored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub root_folder: String,
    pub headers_per_file: u32,
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    /// Entries for `chain`, in manifest order
    pub fn entries_for<'a>(&'a self, chain: &'a str) -> impl Iterator<Item = &'a ManifestEntry> {
        self.files.iter().filter(move |entry| entry.chain == chain)
    }

    /// Path of a chunk file relative to the archive root
    pub fn chunk_path(&self, entry: &ManifestEntry) -> String {
        let folder = self.root_folder.trim_matches('/');
        if folder.is_empty() {
            entry.file_name.clone()
        } else {
            format!("{folder}/{}", entry.file_name)
        }
    }

    /// Check that the entries for `chain` form one gap-free range from 0
    pub fn check_contiguous(&self, chain: &str) -> Result<(), String> {
        let mut next = 0u32;
        for entry in self.entries_for(chain) {
            if entry.first_height != next {
                return Err(format!(
                    "{} starts at {} but {} was expected",
                    entry.file_name, entry.first_height, next
                ));
            }
            if entry.count == 0 {
                return Err(format!("{} is empty", entry.file_name));
            }
            next = entry.first_height.checked_add(entry.count).ok_or_else(|| {
                format!(
                    "{} overflows the height range ({} + {})",
                    entry.file_name, entry.first_height, entry.count
                )
            })?;
        }
        Ok(())
    }
}
