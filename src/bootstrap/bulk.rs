//! Bulk bootstrap
//!
//! Fills the tracker from the bulk archive before live sync starts. Each
//! chunk is fetched, checked against its manifest entry and applied as one
//! `extend` call, so an interrupted run leaves the chain at the last applied
//! chunk. Failures stop the run and are returned in the report; the caller
//! falls back to live sync.

use crate::bootstrap::archive::{ArchiveError, ArchiveSource, HttpArchive};
use crate::bootstrap::manifest::{Manifest, ManifestEntry};
use crate::config::TrackerConfig;
use crate::core::{BlockHeader, ChainError, Chaintracks, Work, BLOCK_HEADER_SIZE};
use crate::crypto::sha256_hex;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Bootstrap errors
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Manifest {file} unavailable: {reason}")]
    ManifestUnavailable { file: String, reason: String },
    #[error("Failed to fetch chunk {file}: {source}")]
    ChunkFetchFailed {
        file: String,
        #[source]
        source: ArchiveError,
    },
    #[error("Chunk {file} has {len} bytes, expected {expected}")]
    ChunkSizeInvalid {
        file: String,
        len: usize,
        expected: String,
    },
    #[error("Chunk {file} does not match its manifest entry: {reason}")]
    ChunkMismatch { file: String, reason: String },
    #[error("Chain rejected chunk: {0}")]
    Chain(#[from] ChainError),
}

/// What a bootstrap run did
#[derive(Debug, Default)]
pub struct BootstrapReport {
    pub start_height: Option<u32>,
    pub end_height: Option<u32>,
    pub chunks_applied: usize,
    pub chunks_skipped: usize,
    pub headers_added: usize,
    pub cancelled: bool,
    /// Failure that ended the run early
    pub error: Option<BootstrapError>,
}

impl BootstrapReport {
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.error.is_none()
    }
}

/// Loads archived headers into a tracker
pub struct BulkBootstrapper {
    source: Arc<dyn ArchiveSource>,
    manifest_file: String,
    chain: String,
    headers_per_file: u32,
}

impl BulkBootstrapper {
    pub fn new(config: &TrackerConfig, source: Arc<dyn ArchiveSource>) -> Self {
        Self {
            source,
            manifest_file: config.manifest_file(),
            chain: config.network.archive_name().to_string(),
            headers_per_file: config.headers_per_file,
        }
    }

    /// Bootstrapper over the configured CDN, if one is set
    pub fn from_config(config: &TrackerConfig) -> Option<Self> {
        let url = config.cdn_url.as_ref()?;
        Some(Self::new(config, Arc::new(HttpArchive::new(url.clone()))))
    }

    pub async fn fetch_manifest(&self) -> Result<Manifest, BootstrapError> {
        let unavailable = |reason: String| BootstrapError::ManifestUnavailable {
            file: self.manifest_file.clone(),
            reason,
        };
        let bytes = self
            .source
            .fetch(&self.manifest_file)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let manifest: Manifest =
            serde_json::from_slice(&bytes).map_err(|e| unavailable(e.to_string()))?;
        manifest.check_contiguous(&self.chain).map_err(unavailable)?;
        Ok(manifest)
    }

    /// Download one chunk; its length must be whole header records
    pub async fn fetch_chunk(&self, file_name: &str) -> Result<Bytes, BootstrapError> {
        let bytes = self
            .source
            .fetch(file_name)
            .await
            .map_err(|source| BootstrapError::ChunkFetchFailed {
                file: file_name.to_string(),
                source,
            })?;
        if bytes.len() % BLOCK_HEADER_SIZE != 0 {
            return Err(BootstrapError::ChunkSizeInvalid {
                file: file_name.to_string(),
                len: bytes.len(),
                expected: format!("a multiple of {BLOCK_HEADER_SIZE}"),
            });
        }
        Ok(bytes)
    }

    /// Decode a chunk and check it against its manifest entry.
    ///
    /// Cumulative work is carried from `prevChainWork`, zero at height 0.
    pub fn decode_chunk(
        entry: &ManifestEntry,
        bytes: &[u8],
    ) -> Result<Vec<BlockHeader>, BootstrapError> {
        let expected = entry.count as usize * BLOCK_HEADER_SIZE;
        if bytes.len() != expected {
            return Err(BootstrapError::ChunkSizeInvalid {
                file: entry.file_name.clone(),
                len: bytes.len(),
                expected: expected.to_string(),
            });
        }
        let mismatch = |reason: String| BootstrapError::ChunkMismatch {
            file: entry.file_name.clone(),
            reason,
        };

        if let Some(file_hash) = &entry.file_hash {
            let actual = sha256_hex(bytes);
            if !actual.eq_ignore_ascii_case(file_hash) {
                return Err(mismatch(format!("file hash {actual}, manifest says {file_hash}")));
            }
        }

        let headers = BlockHeader::decode_all(bytes).map_err(|e| mismatch(e.to_string()))?;

        let mut previous = entry.prev_hash;
        let mut work = if entry.first_height == 0 {
            Work::default()
        } else {
            entry.prev_chain_work.clone()
        };
        for (offset, header) in headers.iter().enumerate() {
            if header.previous_hash != previous {
                return Err(mismatch(format!(
                    "header at height {} does not link to {}",
                    entry.first_height as usize + offset,
                    previous
                )));
            }
            previous = header.hash();
            work += header.work();
        }

        if previous != entry.last_hash {
            return Err(mismatch(format!(
                "last hash {previous}, manifest says {}",
                entry.last_hash
            )));
        }
        if work != entry.last_chain_work {
            return Err(mismatch("computed chain work differs from lastChainWork".into()));
        }
        Ok(headers)
    }

    /// Load every archived chunk the tracker does not hold yet
    pub async fn bootstrap(
        &self,
        tracker: &Chaintracks,
        cancel: &CancellationToken,
    ) -> BootstrapReport {
        let current_height = tracker.current_height().await;
        let mut report = BootstrapReport {
            start_height: current_height,
            end_height: current_height,
            ..Default::default()
        };

        let manifest = match self.fetch_manifest().await {
            Ok(manifest) => manifest,
            Err(e) => {
                log::warn!("Bulk bootstrap from {} skipped: {}", self.source.location(), e);
                report.error = Some(e);
                return report;
            }
        };

        let per_file = if manifest.headers_per_file > 0 {
            manifest.headers_per_file
        } else {
            self.headers_per_file
        };
        let start_index = current_height.map_or(0, |h| (h / per_file) as usize);
        log::info!(
            "Bulk bootstrap from {}: local height {:?}, starting at chunk {}",
            self.source.location(),
            current_height,
            start_index
        );

        for entry in manifest.entries_for(&self.chain).skip(start_index) {
            if entry.is_covered_by(current_height) {
                report.chunks_skipped += 1;
                continue;
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let chunk_path = manifest.chunk_path(entry);
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                fetched = self.fetch_chunk(&chunk_path) => Some(fetched),
            };
            let Some(fetched) = fetched else {
                report.cancelled = true;
                break;
            };

            match self.apply_chunk(tracker, entry, fetched).await {
                Ok(added) => {
                    report.chunks_applied += 1;
                    report.headers_added += added;
                    log::info!(
                        "Applied chunk {} (heights {}..={}, {} new headers)",
                        entry.file_name,
                        entry.first_height,
                        entry.last_height(),
                        added
                    );
                }
                Err(e) => {
                    log::warn!(
                        "Bulk bootstrap stopped at chunk {} (first height {}, {} headers): {}",
                        entry.file_name,
                        entry.first_height,
                        entry.count,
                        e
                    );
                    report.error = Some(e);
                    break;
                }
            }
        }

        if report.cancelled {
            log::info!("Bulk bootstrap cancelled");
        }
        report.end_height = tracker.current_height().await;
        report
    }

    async fn apply_chunk(
        &self,
        tracker: &Chaintracks,
        entry: &ManifestEntry,
        fetched: Result<Bytes, BootstrapError>,
    ) -> Result<usize, BootstrapError> {
        let bytes = fetched?;
        let headers = Self::decode_chunk(entry, &bytes)?;

        if entry.first_height > 0 {
            if let Some(known) = tracker.chain_work_for_hash(&entry.prev_hash).await {
                if known != entry.prev_chain_work {
                    return Err(BootstrapError::ChunkMismatch {
                        file: entry.file_name.clone(),
                        reason: "prevChainWork differs from the local chain".into(),
                    });
                }
            }
        }

        let added = tracker.extend(&headers).await?.added();
        tracker.compact().await?;
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::manifest::test_utils::build_archive;
    use crate::core::header::test_utils::mine_chain;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const MANIFEST: &str = "mainNetBlockHeaders.json";

    /// Serves files from memory and records what was fetched
    #[derive(Default)]
    struct MemoryArchive {
        files: HashMap<String, Bytes>,
        fetched: Mutex<Vec<String>>,
        cancel_after: Option<(String, CancellationToken)>,
    }

    impl MemoryArchive {
        fn from_archive(manifest: &Manifest, chunks: Vec<(String, Vec<u8>)>) -> Self {
            let mut files: HashMap<String, Bytes> = chunks
                .into_iter()
                .map(|(name, data)| (name, Bytes::from(data)))
                .collect();
            files.insert(
                MANIFEST.to_string(),
                Bytes::from(serde_json::to_vec(manifest).unwrap()),
            );
            Self {
                files,
                ..Default::default()
            }
        }

        fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ArchiveSource for MemoryArchive {
        async fn fetch(&self, file_name: &str) -> Result<Bytes, ArchiveError> {
            self.fetched.lock().unwrap().push(file_name.to_string());
            if let Some((name, token)) = &self.cancel_after {
                if name == file_name {
                    token.cancel();
                }
            }
            self.files
                .get(file_name)
                .cloned()
                .ok_or_else(|| ArchiveError::Status {
                    url: file_name.to_string(),
                    status: 404,
                })
        }

        fn location(&self) -> String {
            "memory".to_string()
        }
    }

    fn config() -> TrackerConfig {
        TrackerConfig {
            headers_per_file: 4,
            live_height_threshold: 3,
            bulk_migration_chunk: 4,
            ..Default::default()
        }
    }

    async fn tracker() -> Chaintracks {
        Chaintracks::open(config(), Arc::new(MemoryStore::new("main")))
            .await
            .unwrap()
    }

    fn bootstrapper(archive: Arc<MemoryArchive>) -> BulkBootstrapper {
        BulkBootstrapper::new(&config(), archive)
    }

    #[tokio::test]
    async fn test_bootstrap_from_empty() {
        let chain = mine_chain(11);
        let (manifest, chunks) = build_archive(&chain, 4, "main");
        let archive = Arc::new(MemoryArchive::from_archive(&manifest, chunks));
        let tracker = tracker().await;

        let report = bootstrapper(archive.clone())
            .bootstrap(&tracker, &CancellationToken::new())
            .await;

        assert!(report.is_complete(), "{:?}", report.error);
        assert_eq!(report.chunks_applied, 3);
        assert_eq!(report.headers_added, 12);
        assert_eq!(report.end_height, Some(11));
        assert_eq!(tracker.find_chain_tip_hash().await, Some(chain[11].hash()));
        assert_eq!(archive.fetched().len(), 4);

        // deep headers were moved into bulk rows along the way
        assert!(tracker.info().await.unwrap().archived_through.is_some());
    }

    #[tokio::test]
    async fn test_bootstrap_resumes_past_local_height() {
        let chain = mine_chain(11);
        let (manifest, chunks) = build_archive(&chain, 4, "main");
        let archive = Arc::new(MemoryArchive::from_archive(&manifest, chunks));

        let tracker = tracker().await;
        tracker.extend(&chain[..6]).await.unwrap();

        let report = bootstrapper(archive.clone())
            .bootstrap(&tracker, &CancellationToken::new())
            .await;

        assert!(report.is_complete());
        assert_eq!(report.start_height, Some(5));
        assert_eq!(report.headers_added, 6);
        assert_eq!(
            archive.fetched(),
            vec![
                MANIFEST.to_string(),
                "mainNet_1.headers".to_string(),
                "mainNet_2.headers".to_string()
            ]
        );

        let fresh = tracker_from_scratch(&manifest, &archive).await;
        assert_eq!(
            tracker.find_chain_tip_hash().await,
            fresh.find_chain_tip_hash().await
        );
        assert_eq!(
            tracker.chain_work_for_hash(&chain[11].hash()).await,
            fresh.chain_work_for_hash(&chain[11].hash()).await
        );
    }

    async fn tracker_from_scratch(manifest: &Manifest, archive: &MemoryArchive) -> Chaintracks {
        let copy = MemoryArchive {
            files: archive.files.clone(),
            ..Default::default()
        };
        assert_eq!(copy.files.len(), manifest.files.len() + 1);
        let tracker = tracker().await;
        bootstrapper(Arc::new(copy))
            .bootstrap(&tracker, &CancellationToken::new())
            .await;
        tracker
    }

    #[tokio::test]
    async fn test_chunk_at_local_height_is_skipped() {
        let chain = mine_chain(11);
        let (manifest, chunks) = build_archive(&chain, 4, "main");
        let archive = Arc::new(MemoryArchive::from_archive(&manifest, chunks));
        let tracker = tracker().await;
        tracker.extend(&chain[..8]).await.unwrap();

        let report = bootstrapper(archive.clone())
            .bootstrap(&tracker, &CancellationToken::new())
            .await;

        assert_eq!(report.chunks_skipped, 1);
        assert_eq!(report.chunks_applied, 1);
        assert_eq!(archive.fetched().last().unwrap(), "mainNet_2.headers");
    }

    #[tokio::test]
    async fn test_bad_chunk_size_stops_bootstrap() {
        let chain = mine_chain(11);
        let (manifest, mut chunks) = build_archive(&chain, 4, "main");
        chunks[1].1.push(0);
        let archive = Arc::new(MemoryArchive::from_archive(&manifest, chunks));
        let tracker = tracker().await;

        let report = bootstrapper(archive)
            .bootstrap(&tracker, &CancellationToken::new())
            .await;

        assert!(matches!(
            report.error,
            Some(BootstrapError::ChunkSizeInvalid { len: 321, .. })
        ));
        assert_eq!(report.chunks_applied, 1);
        assert_eq!(tracker.current_height().await, Some(3));
        assert!(tracker.halted().await.is_none());
    }

    #[tokio::test]
    async fn test_chunk_with_wrong_work_is_rejected() {
        let chain = mine_chain(7);
        let (mut manifest, chunks) = build_archive(&chain, 4, "main");
        manifest.files[1].last_chain_work += 1u32;
        let archive = Arc::new(MemoryArchive::from_archive(&manifest, chunks));
        let tracker = tracker().await;

        let report = bootstrapper(archive)
            .bootstrap(&tracker, &CancellationToken::new())
            .await;

        assert!(matches!(report.error, Some(BootstrapError::ChunkMismatch { .. })));
        assert_eq!(tracker.current_height().await, Some(3));
    }

    #[tokio::test]
    async fn test_missing_manifest_is_reported() {
        let archive = Arc::new(MemoryArchive::default());
        let tracker = tracker().await;

        let report = bootstrapper(archive)
            .bootstrap(&tracker, &CancellationToken::new())
            .await;

        assert!(matches!(
            report.error,
            Some(BootstrapError::ManifestUnavailable { .. })
        ));
        assert_eq!(report.end_height, None);
    }

    #[tokio::test]
    async fn test_overflowing_manifest_is_unavailable() {
        let chain = mine_chain(3);
        let (mut manifest, chunks) = build_archive(&chain, 4, "main");
        manifest.files[0].count = u32::MAX;
        let mut next = manifest.files[0].clone();
        next.file_name = "mainNet_1.headers".to_string();
        next.first_height = u32::MAX;
        next.count = 1;
        manifest.files.push(next);
        let archive = Arc::new(MemoryArchive::from_archive(&manifest, chunks));
        let tracker = tracker().await;

        let report = bootstrapper(archive.clone())
            .bootstrap(&tracker, &CancellationToken::new())
            .await;

        assert!(matches!(
            report.error,
            Some(BootstrapError::ManifestUnavailable { .. })
        ));
        assert_eq!(archive.fetched(), vec![MANIFEST.to_string()]);
        assert_eq!(tracker.current_height().await, None);
    }

    #[tokio::test]
    async fn test_chunks_fetched_under_root_folder() {
        let chain = mine_chain(5);
        let (mut manifest, chunks) = build_archive(&chain, 4, "main");
        manifest.root_folder = "headers".to_string();
        let chunks = chunks
            .into_iter()
            .map(|(name, data)| (format!("headers/{name}"), data))
            .collect();
        let archive = Arc::new(MemoryArchive::from_archive(&manifest, chunks));
        let tracker = tracker().await;

        let report = bootstrapper(archive.clone())
            .bootstrap(&tracker, &CancellationToken::new())
            .await;

        assert!(report.is_complete(), "{:?}", report.error);
        assert_eq!(tracker.current_height().await, Some(5));
        assert_eq!(archive.fetched()[1], "headers/mainNet_0.headers");
    }

    #[tokio::test]
    async fn test_cancel_between_chunks() {
        let chain = mine_chain(11);
        let (manifest, chunks) = build_archive(&chain, 4, "main");
        let cancel = CancellationToken::new();
        let archive = Arc::new(MemoryArchive {
            cancel_after: Some(("mainNet_0.headers".to_string(), cancel.clone())),
            ..MemoryArchive::from_archive(&manifest, chunks)
        });
        let tracker = tracker().await;

        let report = bootstrapper(archive.clone()).bootstrap(&tracker, &cancel).await;

        assert!(report.cancelled);
        assert!(!report.is_complete());
        assert_eq!(report.chunks_applied, 1);
        assert_eq!(tracker.current_height().await, Some(3));
        assert_eq!(archive.fetched().len(), 2);
    }

    #[tokio::test]
    async fn test_other_chain_entries_ignored() {
        let chain = mine_chain(3);
        let (mut manifest, chunks) = build_archive(&chain, 4, "main");
        let mut foreign = manifest.files[0].clone();
        foreign.chain = "test".to_string();
        foreign.file_name = "testNet_0.headers".to_string();
        manifest.files.insert(0, foreign);
        let archive = Arc::new(MemoryArchive::from_archive(&manifest, chunks));
        let tracker = tracker().await;

        let report = bootstrapper(archive.clone())
            .bootstrap(&tracker, &CancellationToken::new())
            .await;

        assert!(report.is_complete());
        assert!(!archive.fetched().contains(&"testNet_0.headers".to_string()));
        assert_eq!(tracker.current_height().await, Some(3));
    }

    #[tokio::test]
    async fn test_bootstrap_from_directory() {
        use crate::bootstrap::archive::DirectoryArchive;

        let temp_dir = tempfile::tempdir().unwrap();
        let chain = mine_chain(5);
        let (manifest, chunks) = build_archive(&chain, 4, "main");
        std::fs::write(
            temp_dir.path().join(MANIFEST),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();
        for (name, data) in chunks {
            std::fs::write(temp_dir.path().join(name), data).unwrap();
        }

        let tracker = tracker().await;
        let source = Arc::new(DirectoryArchive::new(temp_dir.path()));
        let report = BulkBootstrapper::new(&config(), source)
            .bootstrap(&tracker, &CancellationToken::new())
            .await;

        assert!(report.is_complete());
        assert_eq!(tracker.current_height().await, Some(5));
    }
}
