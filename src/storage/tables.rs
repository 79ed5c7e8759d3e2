//! Live and bulk header tables
//!
//! Row layout and integrity rules shared by every store implementation:
//! - live rows are keyed by a surrogate id, unique by hash, and reference
//!   their parent row by id
//! - exactly one live row carries the tip flag once a tip exists
//! - bulk rows are unique per `(chain, first_height)`, contiguous, and never
//!   change after insertion
//! - archiving a range also drops inactive branches forking inside it, so
//!   every remaining live row links to a live parent or to the bulk zone

use crate::core::pow::{serde_work_hex, Work};
use crate::core::{ChainHeader, BLOCK_HEADER_SIZE};
use crate::crypto::{sha256_hex, Hash256};
use crate::storage::gateway::{
    resolve_parent, LiveInsert, ParentRef, StorageError, StorageResult, StoredHeaders,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Surrogate row identifier
pub type RowId = u64;

/// One recent header in the live zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveHeaderRow {
    pub header_id: RowId,
    pub previous_header_id: Option<RowId>,
    #[serde(flatten)]
    pub header: ChainHeader,
    pub is_active: bool,
    pub is_chain_tip: bool,
}

/// One archived, contiguous range of headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkHeaderRow {
    pub file_id: RowId,
    pub chain: String,
    pub first_height: u32,
    pub count: u32,
    pub prev_hash: Hash256,
    pub last_hash: Hash256,
    #[serde(with = "serde_work_hex")]
    pub prev_chain_work: Work,
    #[serde(with = "serde_work_hex")]
    pub last_chain_work: Work,
    /// Hex SHA-256 of `data`
    pub file_hash: String,
    pub validated: bool,
    /// Concatenated 80-byte header records, kept beside the row on disk
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl BulkHeaderRow {
    /// Height of the last header in the row
    pub fn last_height(&self) -> u32 {
        self.first_height.saturating_add(self.count.saturating_sub(1))
    }
}

/// Input of an archive operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkRange {
    pub first_height: u32,
    pub count: u32,
    pub prev_hash: Hash256,
    pub last_hash: Hash256,
    pub prev_chain_work: Work,
    pub last_chain_work: Work,
    pub data: Vec<u8>,
}

impl BulkRange {
    /// Build a range from consecutive chain headers, lowest first
    pub fn from_headers(headers: &[&ChainHeader]) -> Option<Self> {
        let first = headers.first()?;
        let last = headers.last()?;
        let mut data = Vec::with_capacity(headers.len() * BLOCK_HEADER_SIZE);
        for header in headers {
            data.extend_from_slice(&header.header.encode());
        }

        Some(Self {
            first_height: first.height,
            count: headers.len() as u32,
            prev_hash: *first.previous_hash(),
            last_hash: last.hash,
            prev_chain_work: &first.chain_work - first.header.work(),
            last_chain_work: last.chain_work.clone(),
            data,
        })
    }
}

/// In-memory form of both tables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderTables {
    chain: String,
    next_live_id: RowId,
    next_bulk_id: RowId,
    live: BTreeMap<RowId, LiveHeaderRow>,
    /// Written once per row by the store, outside the live document
    #[serde(skip)]
    bulk: Vec<BulkHeaderRow>,
    #[serde(skip)]
    live_by_hash: HashMap<Hash256, RowId>,
}

impl HeaderTables {
    pub fn new(chain: &str) -> Self {
        Self {
            chain: chain.to_string(),
            next_live_id: 1,
            next_bulk_id: 1,
            ..Default::default()
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Rebuild the hash index after deserialization
    pub fn reindex(&mut self) {
        self.live_by_hash = self
            .live
            .values()
            .map(|row| (row.header.hash, row.header_id))
            .collect();
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn bulk_rows(&self) -> &[BulkHeaderRow] {
        &self.bulk
    }

    pub fn live_row(&self, hash: &Hash256) -> Option<&LiveHeaderRow> {
        self.live_by_hash.get(hash).and_then(|id| self.live.get(id))
    }

    pub fn snapshot(&self) -> StoredHeaders {
        StoredHeaders {
            live: self.live.values().cloned().collect(),
            bulk: self.bulk.clone(),
        }
    }

    pub fn append_live(
        &mut self,
        header: &ChainHeader,
        previous_id: Option<RowId>,
    ) -> StorageResult<RowId> {
        self.check_insert(header, previous_id)?;
        Ok(self.insert_live(header, previous_id))
    }

    /// Insert a batch; nothing is written unless every row is acceptable
    pub fn append_live_batch(&mut self, batch: &[LiveInsert<'_>]) -> StorageResult<Vec<RowId>> {
        let mut seen = HashSet::with_capacity(batch.len());
        for (index, insert) in batch.iter().enumerate() {
            if !seen.insert(insert.header.hash) {
                return Err(StorageError::DuplicateHeader(insert.header.hash));
            }
            match insert.parent {
                ParentRef::Batch(parent) if parent >= index => {
                    return Err(StorageError::InvalidData(format!(
                        "batch row {index} references later row {parent}"
                    )));
                }
                ParentRef::Row(id) => self.check_insert(insert.header, Some(id))?,
                _ => self.check_insert(insert.header, None)?,
            }
        }

        let mut ids = Vec::with_capacity(batch.len());
        for insert in batch {
            let previous_id = resolve_parent(insert.parent, &ids)?;
            ids.push(self.insert_live(insert.header, previous_id));
        }
        Ok(ids)
    }

    fn check_insert(&self, header: &ChainHeader, previous_id: Option<RowId>) -> StorageResult<()> {
        if self.live_by_hash.contains_key(&header.hash) {
            return Err(StorageError::DuplicateHeader(header.hash));
        }
        if let Some(id) = previous_id {
            if !self.live.contains_key(&id) {
                return Err(StorageError::UnknownParent(id));
            }
        }
        Ok(())
    }

    fn insert_live(&mut self, header: &ChainHeader, previous_id: Option<RowId>) -> RowId {
        let header_id = self.next_live_id;
        self.next_live_id += 1;
        self.live.insert(
            header_id,
            LiveHeaderRow {
                header_id,
                previous_header_id: previous_id,
                header: header.clone(),
                is_active: false,
                is_chain_tip: false,
            },
        );
        self.live_by_hash.insert(header.hash, header_id);
        header_id
    }

    /// Flag update; every hash is resolved before any flag changes
    pub fn set_active_flags(
        &mut self,
        activate: &[Hash256],
        deactivate: &[Hash256],
        new_tip: &Hash256,
    ) -> StorageResult<()> {
        let lookup = |hash: &Hash256| {
            self.live_by_hash
                .get(hash)
                .copied()
                .ok_or(StorageError::UnknownHeader(*hash))
        };
        let activate_ids = activate.iter().map(lookup).collect::<StorageResult<Vec<_>>>()?;
        let deactivate_ids = deactivate
            .iter()
            .map(lookup)
            .collect::<StorageResult<Vec<_>>>()?;
        let tip_id = lookup(new_tip)?;

        for id in deactivate_ids {
            if let Some(row) = self.live.get_mut(&id) {
                row.is_active = false;
            }
        }
        for id in activate_ids {
            if let Some(row) = self.live.get_mut(&id) {
                row.is_active = true;
            }
        }
        for row in self.live.values_mut().filter(|row| row.is_chain_tip) {
            row.is_chain_tip = false;
        }
        if let Some(row) = self.live.get_mut(&tip_id) {
            row.is_active = true;
            row.is_chain_tip = true;
        }
        Ok(())
    }

    /// Append a bulk row and drop the live rows it supersedes.
    ///
    /// Inactive branches forking at or below the last archived height are
    /// dropped with it, so every surviving row still links to a parent row
    /// or to the bulk chain.
    pub fn archive_range(&mut self, range: BulkRange) -> StorageResult<RowId> {
        if self.bulk.iter().any(|row| row.first_height == range.first_height) {
            return Err(StorageError::DuplicateRange {
                chain: self.chain.clone(),
                first_height: range.first_height,
            });
        }
        let expected_first = self
            .bulk
            .last()
            .map_or(0, |row| row.last_height().saturating_add(1));
        if range.first_height != expected_first {
            return Err(StorageError::InvalidData(format!(
                "bulk range must start at height {expected_first}, got {}",
                range.first_height
            )));
        }
        if range.count == 0 || range.data.len() != range.count as usize * BLOCK_HEADER_SIZE {
            return Err(StorageError::InvalidData(format!(
                "bulk range of {} headers carries {} bytes",
                range.count,
                range.data.len()
            )));
        }

        let last_height = range
            .first_height
            .checked_add(range.count - 1)
            .ok_or_else(|| StorageError::InvalidData("bulk range overflows u32 heights".into()))?;
        self.drop_archived_live(last_height);

        let file_id = self.next_bulk_id;
        self.next_bulk_id += 1;
        self.bulk.push(BulkHeaderRow {
            file_id,
            chain: self.chain.clone(),
            first_height: range.first_height,
            count: range.count,
            prev_hash: range.prev_hash,
            last_hash: range.last_hash,
            prev_chain_work: range.prev_chain_work,
            last_chain_work: range.last_chain_work,
            file_hash: sha256_hex(&range.data),
            validated: true,
            data: range.data,
        });
        Ok(file_id)
    }

    /// Drop live rows at or below `last_height`, plus inactive branches
    /// forking there
    fn drop_archived_live(&mut self, last_height: u32) {
        // ids grow with insertion, so parents come before their children
        let mut removed: HashSet<RowId> = HashSet::new();
        for row in self.live.values() {
            let height = row.header.height;
            let stale_fork = !row.is_active
                && (height <= last_height.saturating_add(1)
                    || row.previous_header_id.is_some_and(|id| removed.contains(&id)));
            if height <= last_height || stale_fork {
                removed.insert(row.header_id);
            }
        }
        for id in &removed {
            if let Some(row) = self.live.remove(id) {
                self.live_by_hash.remove(&row.header.hash);
            }
        }
        for row in self.live.values_mut() {
            if row.previous_header_id.is_some_and(|id| removed.contains(&id)) {
                row.previous_header_id = None;
            }
        }
    }

    /// Install bulk rows read back from their own files.
    ///
    /// Live rows the bulk zone already covers are dropped, which finishes an
    /// archive interrupted between writing the bulk row and the live rows.
    pub fn restore_bulk(&mut self, mut rows: Vec<BulkHeaderRow>) -> StorageResult<()> {
        rows.sort_by_key(|row| row.first_height);
        let mut expected_first = 0u32;
        for row in &rows {
            if row.chain != self.chain {
                return Err(StorageError::InvalidData(format!(
                    "bulk row {} belongs to {}, not {}",
                    row.file_id, row.chain, self.chain
                )));
            }
            if row.first_height != expected_first {
                return Err(StorageError::InvalidData(format!(
                    "bulk row {} starts at {} but {} was expected",
                    row.file_id, row.first_height, expected_first
                )));
            }
            if row.count == 0 || row.data.len() != row.count as usize * BLOCK_HEADER_SIZE {
                return Err(StorageError::InvalidData(format!(
                    "bulk row {} declares {} headers but holds {} bytes",
                    row.file_id,
                    row.count,
                    row.data.len()
                )));
            }
            expected_first = row.last_height().saturating_add(1);
        }

        if let Some(last) = rows.last() {
            self.drop_archived_live(last.last_height());
        }
        let next_id = rows.iter().map(|row| row.file_id + 1).max().unwrap_or(1);
        self.next_bulk_id = self.next_bulk_id.max(next_id);
        self.bulk = rows;
        Ok(())
    }
}
