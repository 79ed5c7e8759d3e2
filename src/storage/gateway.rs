//! Persistence gateway contract
//!
//! The chain state writes every accepted header through a [`HeaderStore`]
//! before it lets the tip move. Two physical zones are kept: live rows (a
//! parent-linked graph of recent headers with active/tip flags) and bulk
//! rows (immutable archived ranges).

use crate::core::ChainHeader;
use crate::crypto::Hash256;
use crate::storage::tables::{BulkHeaderRow, BulkRange, HeaderTables, LiveHeaderRow, RowId};
use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::sync::Mutex;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Unknown parent row: {0}")]
    UnknownParent(RowId),
    #[error("Duplicate header: {0}")]
    DuplicateHeader(Hash256),
    #[error("Unknown header: {0}")]
    UnknownHeader(Hash256),
    #[error("Duplicate bulk range for {chain} at height {first_height}")]
    DuplicateRange { chain: String, first_height: u32 },
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Parent reference of a row inserted through [`HeaderStore::append_live_batch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentRef {
    /// Parent is not a live row (genesis or archived)
    None,
    /// Parent is an existing live row
    Row(RowId),
    /// Parent is an earlier entry of the same batch
    Batch(usize),
}

/// One row of a batch insert
#[derive(Debug, Clone, Copy)]
pub struct LiveInsert<'a> {
    pub header: &'a ChainHeader,
    pub parent: ParentRef,
}

/// Everything a store holds, as read back at startup
#[derive(Debug, Clone, Default)]
pub struct StoredHeaders {
    pub live: Vec<LiveHeaderRow>,
    pub bulk: Vec<BulkHeaderRow>,
}

/// Storage contract consumed by the chain state
#[async_trait]
pub trait HeaderStore: Send + Sync {
    /// Read back all persisted rows
    async fn load(&self) -> StorageResult<StoredHeaders>;

    /// Insert one live row, inactive until flagged
    async fn append_live(
        &self,
        header: &ChainHeader,
        previous_id: Option<RowId>,
    ) -> StorageResult<RowId>;

    /// Insert several live rows; ids are returned in batch order
    async fn append_live_batch(&self, batch: &[LiveInsert<'_>]) -> StorageResult<Vec<RowId>> {
        let mut ids: Vec<RowId> = Vec::with_capacity(batch.len());
        for insert in batch {
            let previous_id = resolve_parent(insert.parent, &ids)?;
            ids.push(self.append_live(insert.header, previous_id).await?);
        }
        Ok(ids)
    }

    /// Atomically move the active and tip markers
    async fn set_active_flags(
        &self,
        activate: &[Hash256],
        deactivate: &[Hash256],
        new_tip: &Hash256,
    ) -> StorageResult<()>;

    /// Move a final range of headers into an immutable bulk row
    async fn archive_range(&self, range: BulkRange) -> StorageResult<RowId>;

    /// Number of live rows currently stored
    async fn live_row_count(&self) -> StorageResult<usize>;
}

/// Resolve a batch parent reference against ids already assigned
pub(crate) fn resolve_parent(parent: ParentRef, ids: &[RowId]) -> StorageResult<Option<RowId>> {
    match parent {
        ParentRef::None => Ok(None),
        ParentRef::Row(id) => Ok(Some(id)),
        ParentRef::Batch(index) => ids.get(index).copied().map(Some).ok_or_else(|| {
            StorageError::InvalidData(format!("batch parent {index} not yet inserted"))
        }),
    }
}

/// Volatile store keeping both zones in memory
#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<HeaderTables>,
}

impl MemoryStore {
    pub fn new(chain: &str) -> Self {
        Self {
            tables: Mutex::new(HeaderTables::new(chain)),
        }
    }
}

#[async_trait]
impl HeaderStore for MemoryStore {
    async fn load(&self) -> StorageResult<StoredHeaders> {
        Ok(self.tables.lock().await.snapshot())
    }

    async fn append_live(
        &self,
        header: &ChainHeader,
        previous_id: Option<RowId>,
    ) -> StorageResult<RowId> {
        self.tables.lock().await.append_live(header, previous_id)
    }

    async fn append_live_batch(&self, batch: &[LiveInsert<'_>]) -> StorageResult<Vec<RowId>> {
        self.tables.lock().await.append_live_batch(batch)
    }

    async fn set_active_flags(
        &self,
        activate: &[Hash256],
        deactivate: &[Hash256],
        new_tip: &Hash256,
    ) -> StorageResult<()> {
        self.tables
            .lock()
            .await
            .set_active_flags(activate, deactivate, new_tip)
    }

    async fn archive_range(&self, range: BulkRange) -> StorageResult<RowId> {
        self.tables.lock().await.archive_range(range)
    }

    async fn live_row_count(&self) -> StorageResult<usize> {
        Ok(self.tables.lock().await.live_len())
    }
}
