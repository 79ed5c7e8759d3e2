//! Chaintracks: a block header chain tracker
//!
//! This crate keeps the canonical header chain of a proof-of-work network:
//! - Bulk bootstrap from a CDN header archive (manifest plus chunk files)
//! - Cumulative-work fork choice with bounded reorg detection
//! - Tip and reorg subscriptions with one bounded queue per subscriber
//! - Persistence split into live rows and immutable bulk rows
//!
//! # Example
//!
//! ```no_run
//! use chaintracks::config::TrackerConfig;
//! use chaintracks::core::Chaintracks;
//! use chaintracks::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TrackerConfig::default();
//! let store = Arc::new(MemoryStore::new(config.network.archive_name()));
//! let tracker = Chaintracks::open(config, store).await?;
//!
//! let mut tips = tracker.subscribe_tip().await;
//! tokio::spawn(async move {
//!     while let Some(tip) = tips.recv().await {
//!         println!("New tip {} at height {}", tip.hash, tip.height);
//!     }
//! });
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod core;
pub mod crypto;
pub mod events;
pub mod storage;

// Re-export commonly used types
pub use bootstrap::{BootstrapReport, BulkBootstrapper};
pub use config::{Network, TieBreak, TrackerConfig};
pub use core::{
    BlockHeader, ChainError, ChainHeader, ChainTracker, ChainUpdate, Chaintracks, ReorgEvent,
};
pub use crypto::Hash256;
pub use storage::{HeaderStore, JsonFileStore, MemoryStore};
