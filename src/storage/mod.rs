//! Storage module for header persistence

pub mod gateway;
pub mod persistence;
pub mod tables;

pub use gateway::{
    HeaderStore, LiveInsert, MemoryStore, ParentRef, StorageError, StorageResult, StoredHeaders,
};
pub use persistence::{JsonFileStore, StorageConfig};
pub use tables::{BulkHeaderRow, BulkRange, HeaderTables, LiveHeaderRow, RowId};
