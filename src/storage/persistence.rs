//! Header store persistence layer
//!
//! File-backed [`HeaderStore`]: both tables live in memory. Live rows are
//! written as one JSON document through a temp-file rename after every
//! mutation. Bulk rows never change, so each one is written once to its own
//! pair of files (`<chain>-bulk-<first height>.json` with the row and
//! `.headers` with the raw records). Backups of the live document are
//! rotated before each archive operation.

use crate::config::TrackerConfig;
use crate::core::ChainHeader;
use crate::crypto::{sha256_hex, Hash256};
use crate::storage::gateway::{HeaderStore, LiveInsert, StorageError, StorageResult, StoredHeaders};
use crate::storage::tables::{BulkHeaderRow, BulkRange, HeaderTables, RowId};
use async_trait::async_trait;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub headers_file: String,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".chaintracks_data"),
            headers_file: "headers.json".to_string(),
            backup_enabled: true,
            max_backups: 5,
        }
    }
}

impl StorageConfig {
    /// Storage settings for a tracker; one file per network
    pub fn from_tracker(config: &TrackerConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            headers_file: format!("{}-headers.json", config.network.archive_name()),
            backup_enabled: config.backup_enabled,
            max_backups: config.max_backups,
        }
    }
}

struct FileState {
    tables: HeaderTables,
    /// Set when a write failed and memory may be ahead of disk
    failed: Option<String>,
}

/// JSON file header store
pub struct JsonFileStore {
    config: StorageConfig,
    chain: String,
    state: Mutex<FileState>,
}

impl JsonFileStore {
    /// Open (or create) the store for `chain`
    pub fn open(config: StorageConfig, chain: &str) -> StorageResult<Self> {
        fs::create_dir_all(&config.data_dir)?;

        let path = config.data_dir.join(&config.headers_file);
        let mut tables = if path.exists() {
            let file = fs::File::open(&path)?;
            let tables: HeaderTables = serde_json::from_reader(BufReader::new(file))?;
            if tables.chain() != chain {
                return Err(StorageError::InvalidData(format!(
                    "{} holds headers for {}, not {}",
                    path.display(),
                    tables.chain(),
                    chain
                )));
            }
            tables
        } else {
            HeaderTables::new(chain)
        };
        tables.reindex();
        tables.restore_bulk(read_bulk_rows(&config.data_dir, chain)?)?;

        log::info!(
            "Loaded header store {} ({} live rows, {} bulk rows)",
            path.display(),
            tables.live_len(),
            tables.bulk_rows().len()
        );

        Ok(Self {
            config,
            chain: chain.to_string(),
            state: Mutex::new(FileState {
                tables,
                failed: None,
            }),
        })
    }

    fn headers_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.headers_file)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.backup.{}", self.config.headers_file, index))
    }

    /// Row file of the bulk row starting at `first_height`; the data file
    /// shares its stem
    fn bulk_row_path(&self, first_height: u32) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}{}.json", bulk_prefix(&self.chain), first_height))
    }

    /// Check if a saved store exists
    pub fn exists(&self) -> bool {
        self.headers_path().exists()
    }

    /// Write the live document and any bulk rows from `new_bulk` on
    async fn save(&self, tables: &HeaderTables, new_bulk: usize) -> StorageResult<()> {
        for row in tables.bulk_rows().iter().skip(new_bulk) {
            let row_path = self.bulk_row_path(row.first_height);
            write_atomic(&row_path.with_extension("headers"), &row.data).await?;
            write_atomic(&row_path, &serde_json::to_vec_pretty(row)?).await?;
        }
        write_atomic(&self.headers_path(), &serde_json::to_vec(tables)?).await
    }

    /// Rotate backup files and copy the current file into slot 0
    async fn rotate_backups(&self) -> StorageResult<()> {
        let path = self.headers_path();
        if !self.config.backup_enabled
            || self.config.max_backups == 0
            || !tokio::fs::try_exists(&path).await?
        {
            return Ok(());
        }

        let oldest = self.backup_path(self.config.max_backups - 1);
        if tokio::fs::try_exists(&oldest).await? {
            tokio::fs::remove_file(&oldest).await?;
        }
        for i in (0..self.config.max_backups - 1).rev() {
            let current = self.backup_path(i);
            if tokio::fs::try_exists(&current).await? {
                tokio::fs::rename(&current, self.backup_path(i + 1)).await?;
            }
        }
        tokio::fs::copy(&path, self.backup_path(0)).await?;
        Ok(())
    }

    /// List available backups
    pub fn list_backups(&self) -> Vec<usize> {
        (0..self.config.max_backups)
            .filter(|i| self.backup_path(*i).exists())
            .collect()
    }

    /// Apply `op` and write the result; a failed write poisons the store
    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut HeaderTables) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.failed {
            return Err(StorageError::Unavailable(reason.clone()));
        }

        let new_bulk = state.tables.bulk_rows().len();
        let value = op(&mut state.tables)?;
        if let Err(e) = self.save(&state.tables, new_bulk).await {
            log::error!("Failed to write {}: {}", self.headers_path().display(), e);
            state.failed = Some(e.to_string());
            return Err(StorageError::Unavailable(e.to_string()));
        }
        Ok(value)
    }
}

fn bulk_prefix(chain: &str) -> String {
    format!("{chain}-bulk-")
}

/// Write through a temp file so readers never see a partial file
async fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    tokio::fs::write(&temp, bytes).await?;
    tokio::fs::rename(&temp, path).await?;
    Ok(())
}

/// Read every bulk row of `chain` with its data, checking the file hash
fn read_bulk_rows(data_dir: &Path, chain: &str) -> StorageResult<Vec<BulkHeaderRow>> {
    let prefix = bulk_prefix(chain);
    let mut rows = Vec::new();
    for entry in fs::read_dir(data_dir)? {
        let path = entry?.path();
        let is_row = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".json"));
        if !is_row {
            continue;
        }

        let file = fs::File::open(&path)?;
        let mut row: BulkHeaderRow = serde_json::from_reader(BufReader::new(file))?;
        row.data = fs::read(path.with_extension("headers"))?;
        if sha256_hex(&row.data) != row.file_hash {
            return Err(StorageError::InvalidData(format!(
                "{} does not match its recorded file hash",
                path.display()
            )));
        }
        rows.push(row);
    }
    Ok(rows)
}

#[async_trait]
impl HeaderStore for JsonFileStore {
    async fn load(&self) -> StorageResult<StoredHeaders> {
        Ok(self.state.lock().await.tables.snapshot())
    }

    async fn append_live(
        &self,
        header: &ChainHeader,
        previous_id: Option<RowId>,
    ) -> StorageResult<RowId> {
        self.mutate(|tables| tables.append_live(header, previous_id))
            .await
    }

    async fn append_live_batch(&self, batch: &[LiveInsert<'_>]) -> StorageResult<Vec<RowId>> {
        self.mutate(|tables| tables.append_live_batch(batch)).await
    }

    async fn set_active_flags(
        &self,
        activate: &[Hash256],
        deactivate: &[Hash256],
        new_tip: &Hash256,
    ) -> StorageResult<()> {
        self.mutate(|tables| tables.set_active_flags(activate, deactivate, new_tip))
            .await
    }

    async fn archive_range(&self, range: BulkRange) -> StorageResult<RowId> {
        self.rotate_backups().await?;
        self.mutate(|tables| tables.archive_range(range)).await
    }

    async fn live_row_count(&self) -> StorageResult<usize> {
        Ok(self.state.lock().await.tables.live_len())
    }
}
