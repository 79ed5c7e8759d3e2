//! Chain State Management
//!
//! Holds every known header in an arena indexed by hash and height, selects
//! the tip by greatest cumulative work and detects reorganizations. Mutation
//! is split in two steps so persistence can happen in between:
//! [`ChainIndex::stage`] validates a batch and plans the tip change without
//! touching the index, and [`ChainIndex::apply`] commits a plan.

use crate::config::{ConfigError, TieBreak};
use crate::core::header::{BlockHeader, ChainHeader, HeaderError};
use crate::core::pow::{self, Work};
use crate::crypto::Hash256;
use crate::storage::{BulkHeaderRow, ParentRef, RowId, StorageError, StoredHeaders};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Chain state errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),
    #[error("Orphan header {hash}: unknown parent {previous}")]
    OrphanHeader { hash: Hash256, previous: Hash256 },
    #[error("Invalid proof of work for header {hash}")]
    InvalidProofOfWork { hash: Hash256 },
    #[error("Header {hash} is a second genesis")]
    GenesisMismatch { hash: Hash256 },
    #[error("Reorg did not reach a common ancestor within {max_depth} headers")]
    ReorgDepthExceeded { max_depth: usize },
    #[error("Corrupt chain state: {0}")]
    Corrupt(String),
    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("Chain tracker halted: {0}")]
    Halted(String),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl ChainError {
    /// Errors after which the chain instance must stop accepting mutations
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChainError::ReorgDepthExceeded { .. } | ChainError::Corrupt(_) | ChainError::Storage(_)
        )
    }
}

/// Result type for chain state operations
pub type ChainResult<T> = Result<T, ChainError>;

/// Fork-choice settings
#[derive(Debug, Clone, Copy)]
pub struct ChainPolicy {
    pub tie_break: TieBreak,
    pub max_reorg_depth: usize,
}

/// A switch of the active chain to a branch that does not extend the old tip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgEvent {
    /// Superseded headers, old tip first, common ancestor excluded
    pub orphaned_hashes: Vec<Hash256>,
    pub common_ancestor: Arc<ChainHeader>,
    pub new_tip: Arc<ChainHeader>,
    pub depth: usize,
}

#[derive(Debug, Clone)]
struct ChainNode {
    header: Arc<ChainHeader>,
    parent: Option<usize>,
    /// Live row holding this header; `None` once archived
    row_id: Option<RowId>,
}

/// How the active chain moves when a plan is applied
#[derive(Debug, Clone)]
struct TipChange {
    tip: usize,
    /// Nodes joining the active chain, lowest first
    connected: Vec<usize>,
    /// Nodes leaving the active chain, old tip first
    disconnected: Vec<usize>,
    ancestor: Option<usize>,
}

/// Validated, not yet committed, result of [`ChainIndex::stage`]
#[derive(Debug, Clone)]
pub struct StagedChange {
    base_len: usize,
    new_nodes: Vec<ChainNode>,
    tip_change: Option<TipChange>,
}

impl StagedChange {
    /// Nothing new was submitted
    pub fn is_empty(&self) -> bool {
        self.new_nodes.is_empty()
    }

    pub fn added(&self) -> usize {
        self.new_nodes.len()
    }

    pub fn new_headers(&self) -> impl Iterator<Item = &ChainHeader> {
        self.new_nodes.iter().map(|node| node.header.as_ref())
    }

    /// Where each new header's parent lives, for a batch insert
    pub fn parent_refs(&self, index: &ChainIndex) -> Vec<ParentRef> {
        self.new_nodes
            .iter()
            .map(|node| match node.parent {
                Some(p) if p >= self.base_len => ParentRef::Batch(p - self.base_len),
                Some(p) => index.nodes[p].row_id.map_or(ParentRef::None, ParentRef::Row),
                None => ParentRef::None,
            })
            .collect()
    }

    /// Record the live row ids assigned to the new headers, in order
    pub fn set_row_ids(&mut self, ids: &[RowId]) {
        for (node, id) in self.new_nodes.iter_mut().zip(ids) {
            node.row_id = Some(*id);
        }
    }

    pub fn changes_tip(&self) -> bool {
        self.tip_change.is_some()
    }

    /// Flag update for the store: `(activate, deactivate, new_tip)`
    pub fn flag_update(&self, index: &ChainIndex) -> Option<(Vec<Hash256>, Vec<Hash256>, Hash256)> {
        let change = self.tip_change.as_ref()?;
        let live_hash = |idx: &usize| {
            let node = self.node(index, *idx);
            node.row_id.map(|_| node.header.hash)
        };
        Some((
            change.connected.iter().filter_map(live_hash).collect(),
            change.disconnected.iter().filter_map(live_hash).collect(),
            self.node(index, change.tip).header.hash,
        ))
    }

    fn node<'a>(&'a self, index: &'a ChainIndex, idx: usize) -> &'a ChainNode {
        if idx < self.base_len {
            &index.nodes[idx]
        } else {
            &self.new_nodes[idx - self.base_len]
        }
    }
}

/// Effect of applying a staged change
#[derive(Debug, Clone, Default)]
pub struct AppliedChange {
    pub added: usize,
    pub new_tip: Option<Arc<ChainHeader>>,
    pub reorg: Option<Arc<ReorgEvent>>,
}

/// Arena of known headers plus the active chain
#[derive(Debug, Default)]
pub struct ChainIndex {
    nodes: Vec<ChainNode>,
    by_hash: HashMap<Hash256, usize>,
    /// Every known header per height, active or not
    by_height: BTreeMap<u32, Vec<usize>>,
    /// Active chain, position = height
    active: Vec<usize>,
    tip: Option<usize>,
    /// Highest height held in bulk rows
    archived_through: Option<u32>,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted bulk and live rows
    pub fn from_stored(stored: StoredHeaders) -> ChainResult<Self> {
        let mut index = Self::new();

        let mut bulk = stored.bulk;
        bulk.sort_by_key(|row| row.first_height);
        for row in &bulk {
            index.load_bulk_row(row)?;
        }

        let mut live = stored.live;
        live.sort_by_key(|row| (row.header.height, row.header_id));
        let mut tip_hash = None;
        for row in &live {
            if row.is_chain_tip {
                if tip_hash.is_some() {
                    return Err(ChainError::Corrupt(
                        "more than one live row is the chain tip".into(),
                    ));
                }
                tip_hash = Some(row.header.hash);
            }
            if index.by_hash.contains_key(&row.header.hash) {
                continue;
            }
            let idx = index.insert_loaded(row.header.header)?;
            if index.nodes[idx].header.as_ref() != &row.header {
                return Err(ChainError::Corrupt(format!(
                    "stored position or work of {} disagrees with its parent",
                    row.header.hash
                )));
            }
            index.nodes[idx].row_id = Some(row.header_id);
        }

        let tip = match tip_hash {
            Some(hash) => Some(
                *index
                    .by_hash
                    .get(&hash)
                    .ok_or_else(|| ChainError::Corrupt(format!("tip {hash} not loaded")))?,
            ),
            None => index.max_work_node(),
        };
        if let Some(tip) = tip {
            index.activate_path_to(tip);
        }
        Ok(index)
    }

    fn load_bulk_row(&mut self, row: &BulkHeaderRow) -> ChainResult<()> {
        let expected_first = self.archived_through.map(|h| h + 1).unwrap_or(0);
        if row.first_height != expected_first {
            return Err(ChainError::Corrupt(format!(
                "bulk row starts at {} but {} was expected",
                row.first_height, expected_first
            )));
        }
        let headers = BlockHeader::decode_all(&row.data)?;
        if headers.len() != row.count as usize {
            return Err(ChainError::Corrupt(format!(
                "bulk row at {} declares {} headers but holds {}",
                row.first_height,
                row.count,
                headers.len()
            )));
        }

        let parent_work = match self.by_hash.get(&row.prev_hash) {
            Some(&p) => self.nodes[p].header.chain_work.clone(),
            None => Work::default(),
        };
        if parent_work != row.prev_chain_work {
            return Err(ChainError::Corrupt(format!(
                "bulk row at {} expects prior work {}, found {}",
                row.first_height,
                pow::work_to_hex(&row.prev_chain_work),
                pow::work_to_hex(&parent_work)
            )));
        }

        let mut last = None;
        for header in headers {
            last = Some(self.insert_loaded(header)?);
        }
        if let Some(last) = last {
            let last = &self.nodes[last].header;
            if last.hash != row.last_hash || last.chain_work != row.last_chain_work {
                return Err(ChainError::Corrupt(format!(
                    "bulk row at {} does not end at {}",
                    row.first_height, row.last_hash
                )));
            }
        }
        self.archived_through = Some(row.last_height());
        Ok(())
    }

    /// Link a persisted header without proof-of-work or tip processing
    fn insert_loaded(&mut self, header: BlockHeader) -> ChainResult<usize> {
        let hash = header.hash();
        let (chain_header, parent) = if header.previous_hash.is_zero() && self.nodes.is_empty() {
            (ChainHeader::genesis(header), None)
        } else {
            let parent = *self.by_hash.get(&header.previous_hash).ok_or_else(|| {
                ChainError::Corrupt(format!(
                    "stored header {hash} has unknown parent {}",
                    header.previous_hash
                ))
            })?;
            (ChainHeader::child_of(&self.nodes[parent].header, header), Some(parent))
        };
        Ok(self.push_node(ChainNode {
            header: Arc::new(chain_header),
            parent,
            row_id: None,
        }))
    }

    fn push_node(&mut self, node: ChainNode) -> usize {
        let idx = self.nodes.len();
        self.by_hash.insert(node.header.hash, idx);
        self.by_height.entry(node.header.height).or_default().push(idx);
        self.nodes.push(node);
        idx
    }

    fn max_work_node(&self) -> Option<usize> {
        // first-seen wins among equals
        self.nodes
            .iter()
            .enumerate()
            .fold(None, |best: Option<usize>, (idx, node)| match best {
                Some(b) if self.nodes[b].header.chain_work >= node.header.chain_work => Some(b),
                _ => Some(idx),
            })
    }

    fn activate_path_to(&mut self, tip: usize) {
        let mut path = Vec::new();
        let mut cursor = Some(tip);
        while let Some(idx) = cursor {
            path.push(idx);
            cursor = self.nodes[idx].parent;
        }
        path.reverse();
        self.active = path;
        self.tip = Some(tip);
    }

    /// Validate `headers` and plan the resulting tip change.
    ///
    /// All-or-nothing: any consensus failure rejects the whole batch.
    /// Already known headers are skipped.
    pub fn stage(
        &self,
        headers: &[BlockHeader],
        policy: &ChainPolicy,
    ) -> ChainResult<StagedChange> {
        let mut staged = StagedChange {
            base_len: self.nodes.len(),
            new_nodes: Vec::new(),
            tip_change: None,
        };
        let mut staged_by_hash: HashMap<Hash256, usize> = HashMap::new();
        let mut best: Option<usize> = None;

        for header in headers {
            let hash = header.hash();
            if self.by_hash.contains_key(&hash) || staged_by_hash.contains_key(&hash) {
                continue;
            }

            let parent = if header.previous_hash.is_zero() {
                if !self.nodes.is_empty() || !staged.new_nodes.is_empty() {
                    return Err(ChainError::GenesisMismatch { hash });
                }
                None
            } else {
                let parent = self
                    .by_hash
                    .get(&header.previous_hash)
                    .or_else(|| staged_by_hash.get(&header.previous_hash))
                    .copied();
                match parent {
                    Some(p) => Some(p),
                    None => {
                        return Err(ChainError::OrphanHeader {
                            hash,
                            previous: header.previous_hash,
                        })
                    }
                }
            };

            if !header.is_valid_pow() {
                return Err(ChainError::InvalidProofOfWork { hash });
            }

            let chain_header = match parent {
                Some(p) => ChainHeader::child_of(&staged.node(self, p).header, *header),
                None => ChainHeader::genesis(*header),
            };
            let idx = staged.base_len + staged.new_nodes.len();
            staged_by_hash.insert(hash, idx);
            staged.new_nodes.push(ChainNode {
                header: Arc::new(chain_header),
                parent,
                row_id: None,
            });

            let beats_best = match best {
                Some(b) => {
                    staged.node(self, idx).header.chain_work
                        > staged.node(self, b).header.chain_work
                }
                None => true,
            };
            if beats_best {
                best = Some(idx);
            }
        }

        let Some(candidate) = best else {
            return Ok(staged);
        };

        let switch = match self.tip {
            None => true,
            Some(tip) => {
                let candidate_work = &staged.node(self, candidate).header.chain_work;
                match candidate_work.cmp(&self.nodes[tip].header.chain_work) {
                    Ordering::Greater => true,
                    Ordering::Equal => policy.tie_break == TieBreak::PreferNew,
                    Ordering::Less => false,
                }
            }
        };

        if switch {
            let change = self.plan_tip_change(&staged, candidate, policy.max_reorg_depth)?;
            staged.tip_change = Some(change);
        }
        Ok(staged)
    }

    /// Walk both branches back to their common ancestor
    fn plan_tip_change(
        &self,
        staged: &StagedChange,
        new_tip: usize,
        max_depth: usize,
    ) -> ChainResult<TipChange> {
        let height = |idx: usize| staged.node(self, idx).header.height;
        let parent = |idx: usize| staged.node(self, idx).parent;
        let diverged = || ChainError::ReorgDepthExceeded {
            max_depth,
        };

        let mut connected = Vec::new();
        let mut disconnected = Vec::new();

        let Some(old_tip) = self.tip else {
            let mut cursor = Some(new_tip);
            while let Some(idx) = cursor {
                connected.push(idx);
                cursor = parent(idx);
            }
            connected.reverse();
            return Ok(TipChange {
                tip: new_tip,
                connected,
                disconnected,
                ancestor: None,
            });
        };

        let mut new_cursor = new_tip;
        let mut old_cursor = old_tip;

        while height(new_cursor) > height(old_cursor) {
            connected.push(new_cursor);
            new_cursor = parent(new_cursor).ok_or_else(diverged)?;
        }
        while height(old_cursor) > height(new_cursor) {
            disconnected.push(old_cursor);
            if disconnected.len() > max_depth {
                return Err(diverged());
            }
            old_cursor = parent(old_cursor).ok_or_else(diverged)?;
        }
        while new_cursor != old_cursor {
            connected.push(new_cursor);
            disconnected.push(old_cursor);
            if disconnected.len() > max_depth {
                return Err(diverged());
            }
            new_cursor = parent(new_cursor).ok_or_else(diverged)?;
            old_cursor = parent(old_cursor).ok_or_else(diverged)?;
        }

        connected.reverse();
        Ok(TipChange {
            tip: new_tip,
            connected,
            disconnected,
            ancestor: Some(new_cursor),
        })
    }

    /// Commit a staged change
    pub fn apply(&mut self, staged: StagedChange) -> ChainResult<AppliedChange> {
        if staged.base_len != self.nodes.len() {
            return Err(ChainError::Corrupt(
                "staged change does not match the current index".into(),
            ));
        }

        let added = staged.new_nodes.len();
        let reorg = staged.tip_change.as_ref().and_then(|change| {
            let ancestor = change.ancestor?;
            if change.disconnected.is_empty() {
                return None;
            }
            Some(Arc::new(ReorgEvent {
                orphaned_hashes: change
                    .disconnected
                    .iter()
                    .map(|idx| staged.node(self, *idx).header.hash)
                    .collect(),
                common_ancestor: staged.node(self, ancestor).header.clone(),
                new_tip: staged.node(self, change.tip).header.clone(),
                depth: change.disconnected.len(),
            }))
        });

        for node in staged.new_nodes {
            self.push_node(node);
        }

        let mut new_tip = None;
        if let Some(change) = staged.tip_change {
            let keep = change
                .ancestor
                .map(|a| self.nodes[a].header.height as usize + 1)
                .unwrap_or(0);
            self.active.truncate(keep);
            self.active.extend(change.connected);
            self.tip = Some(change.tip);
            new_tip = Some(self.nodes[change.tip].header.clone());
        }

        Ok(AppliedChange {
            added,
            new_tip,
            reorg,
        })
    }

    /// Forget the live rows of every header at or below `last_height`.
    ///
    /// Inactive branches forking at or below that height lose their rows in
    /// the store as well, so they are dropped from the index. Headers
    /// building on them become orphans. Returns the number of dropped
    /// headers.
    pub fn mark_archived(&mut self, last_height: u32) -> usize {
        let from = self.archived_through.map_or(0, |h| h.saturating_add(1));
        let candidates: Vec<usize> = self
            .by_height
            .range(from..)
            .flat_map(|(_, indexes)| indexes.iter().copied())
            .collect();

        let mut dropped = HashSet::new();
        for idx in candidates {
            let height = self.nodes[idx].header.height;
            if height <= last_height {
                self.nodes[idx].row_id = None;
            }
            if self.active.get(height as usize) == Some(&idx) {
                continue;
            }
            let stale = height <= last_height.saturating_add(1)
                || self.nodes[idx].parent.is_some_and(|p| dropped.contains(&p));
            if stale {
                dropped.insert(idx);
            }
        }

        for idx in &dropped {
            let header = &self.nodes[*idx].header;
            self.by_hash.remove(&header.hash);
            if let Some(indexes) = self.by_height.get_mut(&header.height) {
                indexes.retain(|i| i != idx);
                if indexes.is_empty() {
                    self.by_height.remove(&header.height);
                }
            }
        }
        self.archived_through = Some(last_height);
        dropped.len()
    }

    pub fn tip(&self) -> Option<&Arc<ChainHeader>> {
        self.tip.map(|idx| &self.nodes[idx].header)
    }

    pub fn height(&self) -> Option<u32> {
        self.tip().map(|tip| tip.height)
    }

    pub fn archived_through(&self) -> Option<u32> {
        self.archived_through
    }

    /// Headers reachable by hash
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Active header at `height`
    pub fn header_by_height(&self, height: u32) -> Option<&Arc<ChainHeader>> {
        self.active
            .get(height as usize)
            .map(|idx| &self.nodes[*idx].header)
    }

    /// Any known header, active or not
    pub fn header_by_hash(&self, hash: &Hash256) -> Option<&Arc<ChainHeader>> {
        self.by_hash.get(hash).map(|idx| &self.nodes[*idx].header)
    }

    /// Every known header at `height`, first seen first
    pub fn headers_at_height(&self, height: u32) -> Vec<&Arc<ChainHeader>> {
        self.by_height
            .get(&height)
            .map(|indexes| indexes.iter().map(|idx| &self.nodes[*idx].header).collect())
            .unwrap_or_default()
    }

    pub fn is_active(&self, hash: &Hash256) -> bool {
        self.by_hash.get(hash).is_some_and(|idx| {
            let height = self.nodes[*idx].header.height as usize;
            self.active.get(height) == Some(idx)
        })
    }

    /// Up to `count` active headers starting at `start`
    pub fn headers_in_range(&self, start: u32, count: u32) -> Vec<Arc<ChainHeader>> {
        let start = start as usize;
        let end = start.saturating_add(count as usize).min(self.active.len());
        if start >= end {
            return Vec::new();
        }
        self.active[start..end]
            .iter()
            .map(|idx| self.nodes[*idx].header.clone())
            .collect()
    }

    pub fn chain_work_for_hash(&self, hash: &Hash256) -> Option<&Work> {
        self.header_by_hash(hash).map(|header| &header.chain_work)
    }
}
