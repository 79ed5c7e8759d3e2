//! Chain tracking service
//!
//! [`Chaintracks`] owns the chain index, the header store and the
//! subscription hub of one chain. Mutations are serialized by a writer lock;
//! every accepted change is persisted before the index is updated and
//! before any event is published. Queries only take the index read lock,
//! which is never held across a store call.

use crate::config::{Network, TrackerConfig};
use crate::core::chain_state::{
    ChainError, ChainIndex, ChainPolicy, ChainResult, ReorgEvent, StagedChange,
};
use crate::core::header::{BlockHeader, ChainHeader, BLOCK_HEADER_SIZE};
use crate::core::pow::{self, Work};
use crate::crypto::Hash256;
use crate::events::{Subscription, SubscriptionHub, SubscriptionId};
use crate::storage::{BulkRange, HeaderStore, LiveInsert};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Outcome of an `observe` or `extend` call
#[derive(Debug, Clone)]
pub enum ChainUpdate {
    /// Every submitted header was already known
    Unchanged,
    /// Headers were added to a branch that does not lead
    Added { added: usize },
    /// The active chain grew on top of the previous tip
    NewTip { added: usize, tip: Arc<ChainHeader> },
    /// The active chain switched branches
    Reorg { added: usize, event: Arc<ReorgEvent> },
}

impl ChainUpdate {
    pub fn added(&self) -> usize {
        match self {
            ChainUpdate::Unchanged => 0,
            ChainUpdate::Added { added }
            | ChainUpdate::NewTip { added, .. }
            | ChainUpdate::Reorg { added, .. } => *added,
        }
    }

    /// New tip, when the tip moved
    pub fn tip(&self) -> Option<&Arc<ChainHeader>> {
        match self {
            ChainUpdate::NewTip { tip, .. } => Some(tip),
            ChainUpdate::Reorg { event, .. } => Some(&event.new_tip),
            _ => None,
        }
    }
}

/// Range moved into the bulk zone by [`Chaintracks::compact`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub first_height: u32,
    pub count: u32,
    /// Inactive headers dropped because their branch forked below the line
    pub pruned: usize,
}

/// Snapshot of the tracker state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerInfo {
    pub network: String,
    pub height: Option<u32>,
    pub tip_hash: Option<Hash256>,
    pub chain_work: Option<String>,
    pub known_headers: usize,
    pub live_rows: usize,
    pub archived_through: Option<u32>,
    pub tip_subscribers: usize,
    pub reorg_subscribers: usize,
    pub halted: Option<String>,
}

/// Minimal chain view needed to verify merkle proofs
#[async_trait]
pub trait ChainTracker: Send + Sync {
    /// Whether `root` is the merkle root of the active header at `height`
    async fn is_valid_root_for_height(&self, root: &Hash256, height: u32) -> bool;

    async fn current_height(&self) -> Option<u32>;
}

/// Header chain tracker for one network
pub struct Chaintracks {
    config: TrackerConfig,
    store: Arc<dyn HeaderStore>,
    index: RwLock<ChainIndex>,
    writer: Mutex<()>,
    hub: SubscriptionHub,
    halted: RwLock<Option<String>>,
}

impl Chaintracks {
    /// Open a tracker over `store`, rebuilding the chain from its rows
    pub async fn open(config: TrackerConfig, store: Arc<dyn HeaderStore>) -> ChainResult<Self> {
        config.validate()?;

        let index = ChainIndex::from_stored(store.load().await?)?;
        match index.tip() {
            Some(tip) => log::info!(
                "Loaded {} chain: {} headers, tip {} at height {}",
                config.network,
                index.len(),
                tip.hash,
                tip.height
            ),
            None => log::info!("Starting empty {} chain", config.network),
        }

        Ok(Self {
            hub: SubscriptionHub::new(config.subscriber_capacity),
            config,
            store,
            index: RwLock::new(index),
            writer: Mutex::new(()),
            halted: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn network(&self) -> &Network {
        &self.config.network
    }

    fn policy(&self) -> ChainPolicy {
        ChainPolicy {
            tie_break: self.config.tie_break,
            max_reorg_depth: self.config.max_reorg_depth,
        }
    }

    /// Reason the tracker stopped accepting mutations, if it did
    pub async fn halted(&self) -> Option<String> {
        self.halted.read().await.clone()
    }

    async fn ensure_running(&self) -> ChainResult<()> {
        match self.halted.read().await.as_ref() {
            Some(reason) => Err(ChainError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    /// Record a fatal error; non-fatal errors pass through
    async fn fail(&self, error: ChainError) -> ChainError {
        if error.is_fatal() {
            log::error!("Chain tracker halted: {}", error);
            *self.halted.write().await = Some(error.to_string());
        }
        error
    }

    /// Submit one header from the live feed
    pub async fn observe(&self, header: BlockHeader) -> ChainResult<ChainUpdate> {
        self.extend(&[header]).await
    }

    /// Submit an ordered batch of headers; all-or-nothing
    pub async fn extend(&self, headers: &[BlockHeader]) -> ChainResult<ChainUpdate> {
        let _writer = self.writer.lock().await;
        self.ensure_running().await?;

        let staged = self.index.read().await.stage(headers, &self.policy());
        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => return Err(self.fail(e).await),
        };
        if staged.is_empty() {
            return Ok(ChainUpdate::Unchanged);
        }

        let staged = match self.persist(staged).await {
            Ok(staged) => staged,
            Err(e) => return Err(self.fail(e).await),
        };

        let applied = self.index.write().await.apply(staged);
        let applied = match applied {
            Ok(applied) => applied,
            Err(e) => return Err(self.fail(e).await),
        };

        let update = match (applied.reorg, applied.new_tip) {
            (Some(event), Some(tip)) => {
                log::warn!(
                    "Reorg of depth {} at common ancestor {} (height {}), new tip {} at height {}",
                    event.depth,
                    event.common_ancestor.hash,
                    event.common_ancestor.height,
                    tip.hash,
                    tip.height
                );
                self.hub.tips.publish(tip).await;
                self.hub.reorgs.publish(event.clone()).await;
                ChainUpdate::Reorg {
                    added: applied.added,
                    event,
                }
            }
            (_, Some(tip)) => {
                log::debug!("New tip {} at height {}", tip.hash, tip.height);
                self.hub.tips.publish(tip.clone()).await;
                ChainUpdate::NewTip {
                    added: applied.added,
                    tip,
                }
            }
            _ => {
                log::debug!("Added {} headers off the active chain", applied.added);
                ChainUpdate::Added {
                    added: applied.added,
                }
            }
        };
        Ok(update)
    }

    /// Write new rows and flag changes; only then may the index move
    async fn persist(&self, mut staged: StagedChange) -> ChainResult<StagedChange> {
        let parents = staged.parent_refs(&*self.index.read().await);
        let ids = {
            let batch: Vec<LiveInsert<'_>> = staged
                .new_headers()
                .zip(parents)
                .map(|(header, parent)| LiveInsert { header, parent })
                .collect();
            self.store.append_live_batch(&batch).await?
        };
        staged.set_row_ids(&ids);

        let flags = staged.flag_update(&*self.index.read().await);
        if let Some((activate, deactivate, tip)) = flags {
            self.store
                .set_active_flags(&activate, &deactivate, &tip)
                .await?;
        }
        Ok(staged)
    }

    /// Move final active headers into one bulk row.
    ///
    /// Headers more than `live_height_threshold` below the tip are eligible;
    /// nothing happens until at least `bulk_migration_chunk` of them are.
    pub async fn compact(&self) -> ChainResult<Option<CompactionReport>> {
        let _writer = self.writer.lock().await;
        self.ensure_running().await?;

        let range = {
            let index = self.index.read().await;
            let Some(last) = index
                .height()
                .and_then(|h| h.checked_sub(self.config.live_height_threshold))
            else {
                return Ok(None);
            };
            let first = index.archived_through().map_or(0, |h| h + 1);
            if last < first || last - first + 1 < self.config.bulk_migration_chunk {
                return Ok(None);
            }
            let headers = index.headers_in_range(first, last - first + 1);
            let refs: Vec<&ChainHeader> = headers.iter().map(|h| h.as_ref()).collect();
            BulkRange::from_headers(&refs)
        };
        let Some(range) = range else {
            return Ok(None);
        };

        let (first_height, count) = (range.first_height, range.count);
        let last_height = range.first_height + range.count - 1;
        if let Err(e) = self.store.archive_range(range).await {
            return Err(self.fail(e.into()).await);
        }
        let pruned = self.index.write().await.mark_archived(last_height);

        log::info!(
            "Archived {} headers from height {}, pruned {} stale fork headers",
            count,
            first_height,
            pruned
        );
        Ok(Some(CompactionReport {
            first_height,
            count,
            pruned,
        }))
    }

    pub async fn current_height(&self) -> Option<u32> {
        self.index.read().await.height()
    }

    pub async fn tip(&self) -> Option<Arc<ChainHeader>> {
        self.index.read().await.tip().cloned()
    }

    pub async fn find_chain_tip_hash(&self) -> Option<Hash256> {
        self.index.read().await.tip().map(|tip| tip.hash)
    }

    /// Active header at `height`
    pub async fn header_by_height(&self, height: u32) -> Option<Arc<ChainHeader>> {
        self.index.read().await.header_by_height(height).cloned()
    }

    /// Any known header, including ones off the active chain
    pub async fn header_by_hash(&self, hash: &Hash256) -> Option<Arc<ChainHeader>> {
        self.index.read().await.header_by_hash(hash).cloned()
    }

    pub async fn is_active(&self, hash: &Hash256) -> bool {
        self.index.read().await.is_active(hash)
    }

    /// Up to `count` active headers from `start`; shorter near the tip
    pub async fn headers_in_range(&self, start: u32, count: u32) -> Vec<Arc<ChainHeader>> {
        self.index.read().await.headers_in_range(start, count)
    }

    /// Active headers from `start` as concatenated 80-byte records
    pub async fn header_bytes_in_range(&self, start: u32, count: u32) -> Vec<u8> {
        let headers = self.headers_in_range(start, count).await;
        let mut bytes = Vec::with_capacity(headers.len() * BLOCK_HEADER_SIZE);
        for header in &headers {
            bytes.extend_from_slice(&header.header.encode());
        }
        bytes
    }

    pub async fn is_valid_merkle_root_for_height(&self, root: &Hash256, height: u32) -> bool {
        self.index
            .read()
            .await
            .header_by_height(height)
            .is_some_and(|header| header.merkle_root() == root)
    }

    pub async fn chain_work_for_hash(&self, hash: &Hash256) -> Option<Work> {
        self.index.read().await.chain_work_for_hash(hash).cloned()
    }

    pub async fn subscribe_tip(&self) -> Subscription<Arc<ChainHeader>> {
        self.hub.tips.subscribe().await
    }

    pub async fn unsubscribe_tip(&self, id: SubscriptionId) -> bool {
        self.hub.tips.unsubscribe(id).await
    }

    pub async fn subscribe_reorg(&self) -> Subscription<Arc<ReorgEvent>> {
        self.hub.reorgs.subscribe().await
    }

    pub async fn unsubscribe_reorg(&self, id: SubscriptionId) -> bool {
        self.hub.reorgs.unsubscribe(id).await
    }

    pub fn hub(&self) -> &SubscriptionHub {
        &self.hub
    }

    pub async fn info(&self) -> ChainResult<TrackerInfo> {
        let live_rows = self.store.live_row_count().await?;
        let index = self.index.read().await;
        let tip = index.tip();
        Ok(TrackerInfo {
            network: self.config.network.to_string(),
            height: tip.map(|t| t.height),
            tip_hash: tip.map(|t| t.hash),
            chain_work: tip.map(|t| pow::work_to_hex(&t.chain_work)),
            known_headers: index.len(),
            live_rows,
            archived_through: index.archived_through(),
            tip_subscribers: self.hub.tips.subscriber_count().await,
            reorg_subscribers: self.hub.reorgs.subscriber_count().await,
            halted: self.halted().await,
        })
    }
}

#[async_trait]
impl ChainTracker for Chaintracks {
    async fn is_valid_root_for_height(&self, root: &Hash256, height: u32) -> bool {
        self.is_valid_merkle_root_for_height(root, height).await
    }

    async fn current_height(&self) -> Option<u32> {
        Chaintracks::current_height(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TieBreak;
    use crate::core::header::test_utils::*;
    use crate::storage::{
        JsonFileStore, MemoryStore, RowId, StorageConfig, StorageError, StorageResult,
        StoredHeaders,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    fn test_config() -> TrackerConfig {
        TrackerConfig {
            max_reorg_depth: 10,
            subscriber_capacity: 4,
            live_height_threshold: 2,
            bulk_migration_chunk: 3,
            ..Default::default()
        }
    }

    async fn memory_tracker() -> Chaintracks {
        let store = Arc::new(MemoryStore::new("main"));
        Chaintracks::open(test_config(), store).await.unwrap()
    }

    /// Delegates to a memory store until told to fail
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> StorageResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(StorageError::Unavailable("disk full".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl HeaderStore for FlakyStore {
        async fn load(&self) -> StorageResult<StoredHeaders> {
            self.inner.load().await
        }

        async fn append_live(
            &self,
            header: &ChainHeader,
            previous_id: Option<RowId>,
        ) -> StorageResult<RowId> {
            self.check()?;
            self.inner.append_live(header, previous_id).await
        }

        async fn set_active_flags(
            &self,
            activate: &[Hash256],
            deactivate: &[Hash256],
            new_tip: &Hash256,
        ) -> StorageResult<()> {
            self.check()?;
            self.inner.set_active_flags(activate, deactivate, new_tip).await
        }

        async fn archive_range(&self, range: BulkRange) -> StorageResult<RowId> {
            self.check()?;
            self.inner.archive_range(range).await
        }

        async fn live_row_count(&self) -> StorageResult<usize> {
            self.inner.live_row_count().await
        }
    }

    #[tokio::test]
    async fn test_extend_and_query() {
        let tracker = memory_tracker().await;
        assert_eq!(tracker.current_height().await, None);

        let chain = mine_chain(4);
        let update = tracker.extend(&chain).await.unwrap();
        assert_eq!(update.added(), 5);
        assert_eq!(update.tip().unwrap().hash, chain[4].hash());

        assert_eq!(tracker.current_height().await, Some(4));
        assert_eq!(tracker.find_chain_tip_hash().await, Some(chain[4].hash()));
        assert_eq!(
            tracker.header_by_height(2).await.unwrap().hash,
            chain[2].hash()
        );
        assert_eq!(
            tracker.header_by_hash(&chain[3].hash()).await.unwrap().height,
            3
        );
        assert_eq!(tracker.headers_in_range(3, 10).await.len(), 2);
        assert!(tracker.headers_in_range(9, 1).await.is_empty());

        let bytes = tracker.header_bytes_in_range(1, 2).await;
        assert_eq!(bytes.len(), 2 * BLOCK_HEADER_SIZE);
        assert_eq!(BlockHeader::decode_all(&bytes).unwrap(), chain[1..3].to_vec());

        assert!(
            tracker
                .is_valid_merkle_root_for_height(&chain[2].merkle_root, 2)
                .await
        );
        assert!(
            !tracker
                .is_valid_merkle_root_for_height(&Hash256::digest(b"other"), 2)
                .await
        );
        assert!(
            !tracker
                .is_valid_merkle_root_for_height(&chain[2].merkle_root, 20)
                .await
        );

        let mut expected = Work::default();
        for header in &chain {
            expected += header.work();
        }
        assert_eq!(tracker.chain_work_for_hash(&chain[4].hash()).await, Some(expected));
    }

    #[tokio::test]
    async fn test_reorg_publishes_event() {
        let tracker = memory_tracker().await;
        let trunk = mine_chain(2);
        let fork_point = trunk[2].hash();
        tracker.extend(&trunk).await.unwrap();

        let mut tips = tracker.subscribe_tip().await;
        let mut reorgs = tracker.subscribe_reorg().await;

        let branch_a = mine_branch(fork_point, 5, 1);
        tracker.extend(&branch_a).await.unwrap();
        assert_eq!(tips.recv().await.unwrap().hash, branch_a[4].hash());

        let branch_b = mine_branch(fork_point, 7, 2);
        let update = tracker.extend(&branch_b).await.unwrap();
        assert!(matches!(update, ChainUpdate::Reorg { added: 7, .. }));

        let tip = tips.recv().await.unwrap();
        assert_eq!(tip.hash, branch_b[6].hash());
        assert_eq!(tip.height, 9);

        let event = reorgs.recv().await.unwrap();
        let mut orphaned: Vec<Hash256> = branch_a.iter().map(|h| h.hash()).collect();
        orphaned.reverse();
        assert_eq!(event.orphaned_hashes, orphaned);
        assert_eq!(event.depth, 5);
        assert_eq!(event.common_ancestor.hash, fork_point);
        assert_eq!(event.new_tip.hash, branch_b[6].hash());
        assert!(reorgs.try_recv().is_none());

        assert!(!tracker.is_active(&branch_a[0].hash()).await);
        assert!(tracker.header_by_hash(&branch_a[0].hash()).await.is_some());
    }

    #[tokio::test]
    async fn test_known_header_is_silent() {
        let tracker = memory_tracker().await;
        let chain = mine_chain(3);
        tracker.extend(&chain).await.unwrap();
        let mut tips = tracker.subscribe_tip().await;

        let update = tracker.observe(chain[2]).await.unwrap();
        assert!(matches!(update, ChainUpdate::Unchanged));
        assert_eq!(tracker.current_height().await, Some(3));
        assert!(tips.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_side_branch_emits_nothing() {
        let tracker = memory_tracker().await;
        let trunk = mine_chain(3);
        tracker.extend(&trunk).await.unwrap();
        let mut tips = tracker.subscribe_tip().await;

        let side = mine_branch(trunk[2].hash(), 1, 5);
        let update = tracker.observe(side[0]).await.unwrap();
        assert!(matches!(update, ChainUpdate::Added { added: 1 }));
        assert!(tips.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_consensus_errors_are_not_fatal() {
        let tracker = memory_tracker().await;
        let chain = mine_chain(2);
        tracker.extend(&chain[..2]).await.unwrap();

        let orphan = mine_branch(Hash256::digest(b"missing"), 1, 3);
        assert!(matches!(
            tracker.observe(orphan[0]).await,
            Err(ChainError::OrphanHeader { .. })
        ));
        assert!(matches!(
            tracker.observe(unmined(chain[1].hash(), 1)).await,
            Err(ChainError::InvalidProofOfWork { .. })
        ));

        assert!(tracker.halted().await.is_none());
        tracker.observe(chain[2]).await.unwrap();
        assert_eq!(tracker.current_height().await, Some(2));
    }

    #[tokio::test]
    async fn test_storage_failure_halts_without_moving_tip() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new("main"),
            failing: AtomicBool::new(false),
        });
        let tracker = Chaintracks::open(test_config(), store.clone()).await.unwrap();
        let chain = mine_chain(2);
        tracker.extend(&chain[..2]).await.unwrap();
        let mut tips = tracker.subscribe_tip().await;

        store.failing.store(true, Ordering::SeqCst);
        let err = tracker.observe(chain[2]).await.unwrap_err();
        assert!(matches!(err, ChainError::Storage(_)));
        assert_eq!(tracker.current_height().await, Some(1));
        assert!(tips.try_recv().is_none());

        store.failing.store(false, Ordering::SeqCst);
        assert!(matches!(
            tracker.observe(chain[2]).await,
            Err(ChainError::Halted(_))
        ));
        assert!(tracker.info().await.unwrap().halted.is_some());
    }

    #[tokio::test]
    async fn test_reorg_too_deep_halts() {
        let config = TrackerConfig {
            max_reorg_depth: 2,
            ..test_config()
        };
        let tracker = Chaintracks::open(config, Arc::new(MemoryStore::new("main")))
            .await
            .unwrap();
        let trunk = mine_chain(0);
        tracker.extend(&trunk).await.unwrap();
        tracker
            .extend(&mine_branch(trunk[0].hash(), 3, 1))
            .await
            .unwrap();

        let err = tracker
            .extend(&mine_branch(trunk[0].hash(), 4, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::ReorgDepthExceeded { max_depth: 2 }));
        assert!(tracker.halted().await.is_some());
        assert_eq!(tracker.current_height().await, Some(3));
    }

    #[tokio::test]
    async fn test_prefer_new_tie_break() {
        let config = TrackerConfig {
            tie_break: TieBreak::PreferNew,
            ..test_config()
        };
        let tracker = Chaintracks::open(config, Arc::new(MemoryStore::new("main")))
            .await
            .unwrap();
        let trunk = mine_chain(0);
        tracker.extend(&trunk).await.unwrap();
        tracker
            .extend(&mine_branch(trunk[0].hash(), 2, 1))
            .await
            .unwrap();

        let rival = mine_branch(trunk[0].hash(), 2, 2);
        let update = tracker.extend(&rival).await.unwrap();
        assert!(matches!(update, ChainUpdate::Reorg { .. }));
        assert_eq!(tracker.find_chain_tip_hash().await, Some(rival[1].hash()));
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block() {
        let tracker = memory_tracker().await;
        let chain = mine_chain(10);
        tracker.extend(&chain[..1]).await.unwrap();

        let stalled = tracker.subscribe_tip().await;
        let mut active = tracker.subscribe_tip().await;

        for header in &chain[1..] {
            tracker.observe(*header).await.unwrap();
            assert_eq!(active.recv().await.unwrap().hash, header.hash());
        }

        assert_eq!(tracker.current_height().await, Some(10));
        let dropped = tracker.hub().tips.dropped_count(stalled.id()).await;
        assert_eq!(dropped, Some(6));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let tracker = memory_tracker().await;
        let sub = tracker.subscribe_reorg().await;
        assert_eq!(tracker.info().await.unwrap().reorg_subscribers, 1);
        assert!(tracker.unsubscribe_reorg(sub.id()).await);
        assert!(!tracker.unsubscribe_tip(sub.id()).await);
        assert_eq!(tracker.info().await.unwrap().reorg_subscribers, 0);
    }

    #[tokio::test]
    async fn test_concurrent_branches_settle_on_most_work() {
        let tracker = Arc::new(memory_tracker().await);
        let trunk = mine_chain(0);
        tracker.extend(&trunk).await.unwrap();
        let short = mine_branch(trunk[0].hash(), 4, 1);
        let long = mine_branch(trunk[0].hash(), 6, 2);

        let mut tasks = Vec::new();
        for branch in [short, long.clone()] {
            let tracker = tracker.clone();
            tasks.push(tokio::spawn(async move {
                for header in branch {
                    tracker.observe(header).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(tracker.find_chain_tip_hash().await, Some(long[5].hash()));
    }

    #[tokio::test]
    async fn test_compact_moves_deep_headers() {
        let tracker = memory_tracker().await;
        let chain = mine_chain(3);
        tracker.extend(&chain).await.unwrap();
        // only heights 0 and 1 are eligible, below the chunk minimum
        assert_eq!(tracker.compact().await.unwrap(), None);

        tracker
            .extend(&mine_branch(chain[3].hash(), 3, 0))
            .await
            .unwrap();
        let report = tracker.compact().await.unwrap().unwrap();
        assert_eq!(
            report,
            CompactionReport {
                first_height: 0,
                count: 5,
                pruned: 0
            }
        );

        let info = tracker.info().await.unwrap();
        assert_eq!(info.archived_through, Some(4));
        assert_eq!(info.live_rows, 2);
        assert_eq!(tracker.header_by_height(0).await.unwrap().hash, chain[0].hash());

        // the next header links to a live row again
        let next = mine_branch(tracker.find_chain_tip_hash().await.unwrap(), 1, 0);
        tracker.observe(next[0]).await.unwrap();
        assert_eq!(tracker.current_height().await, Some(7));
    }

    #[tokio::test]
    async fn test_reopen_restores_chain() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = TrackerConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..test_config()
        };
        let open_store = || {
            Arc::new(JsonFileStore::open(StorageConfig::from_tracker(&config), "main").unwrap())
        };

        let trunk = mine_chain(6);
        let side = mine_branch(trunk[5].hash(), 1, 9);
        {
            let tracker = Chaintracks::open(config.clone(), open_store()).await.unwrap();
            tracker.extend(&trunk).await.unwrap();
            tracker.extend(&side).await.unwrap();
            assert!(tracker.compact().await.unwrap().is_some());
        }

        let tracker = Chaintracks::open(config.clone(), open_store()).await.unwrap();
        assert_eq!(tracker.current_height().await, Some(6));
        assert_eq!(tracker.find_chain_tip_hash().await, Some(trunk[6].hash()));
        assert_eq!(tracker.header_by_height(1).await.unwrap().hash, trunk[1].hash());
        assert!(!tracker.is_active(&side[0].hash()).await);

        let info = tracker.info().await.unwrap();
        assert_eq!(info.archived_through, Some(4));

        let next = mine_branch(trunk[6].hash(), 1, 0);
        tracker.observe(next[0]).await.unwrap();
        assert_eq!(tracker.current_height().await, Some(7));
    }

    #[tokio::test]
    async fn test_compact_with_side_branches_then_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = TrackerConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..test_config()
        };
        let open_store = || {
            Arc::new(JsonFileStore::open(StorageConfig::from_tracker(&config), "main").unwrap())
        };

        let trunk = mine_chain(8);
        let below = mine_branch(trunk[1].hash(), 1, 5);
        let crossing = mine_branch(trunk[2].hash(), 5, 6);
        let above = mine_branch(trunk[7].hash(), 1, 7);
        {
            let tracker = Chaintracks::open(config.clone(), open_store()).await.unwrap();
            tracker.extend(&trunk).await.unwrap();
            for branch in [&below, &crossing, &above] {
                assert!(matches!(
                    tracker.extend(branch).await.unwrap(),
                    ChainUpdate::Added { .. }
                ));
            }

            let report = tracker.compact().await.unwrap().unwrap();
            assert_eq!((report.first_height, report.count), (0, 7));
            assert_eq!(report.pruned, below.len() + crossing.len());
            assert!(tracker.header_by_hash(&crossing[4].hash()).await.is_none());
            assert!(tracker.header_by_hash(&above[0].hash()).await.is_some());
            assert_eq!(tracker.info().await.unwrap().known_headers, 10);
        }

        let tracker = Chaintracks::open(config.clone(), open_store()).await.unwrap();
        assert_eq!(tracker.find_chain_tip_hash().await, Some(trunk[8].hash()));
        assert_eq!(tracker.info().await.unwrap().known_headers, 10);
        assert!(tracker.header_by_hash(&below[0].hash()).await.is_none());
        assert!(!tracker.is_active(&above[0].hash()).await);

        // a header on the pruned branch no longer has a parent
        let late = mine_branch(crossing[4].hash(), 1, 6);
        assert!(matches!(
            tracker.observe(late[0]).await,
            Err(ChainError::OrphanHeader { .. })
        ));
        assert!(tracker.halted().await.is_none());

        // the surviving fork can still take over
        let takeover = mine_branch(above[0].hash(), 1, 7);
        assert!(matches!(
            tracker.observe(takeover[0]).await.unwrap(),
            ChainUpdate::Reorg { .. }
        ));
        drop(tracker);
        let tracker = Chaintracks::open(config.clone(), open_store()).await.unwrap();
        assert_eq!(tracker.find_chain_tip_hash().await, Some(takeover[0].hash()));
    }

    #[tokio::test]
    async fn test_chain_tracker_trait() {
        let tracker = memory_tracker().await;
        let chain = mine_chain(1);
        tracker.extend(&chain).await.unwrap();

        let verifier: &dyn ChainTracker = &tracker;
        assert_eq!(verifier.current_height().await, Some(1));
        assert!(
            verifier
                .is_valid_root_for_height(&chain[1].merkle_root, 1)
                .await
        );
    }
}
