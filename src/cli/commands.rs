//! CLI commands for the header tracker
//!
//! Implements all command handlers for the CLI interface.

use crate::bootstrap::{ArchiveSource, BulkBootstrapper, DirectoryArchive, HttpArchive};
use crate::config::TrackerConfig;
use crate::core::{BlockHeader, ChainHeader, ChainUpdate, Chaintracks};
use crate::crypto::Hash256;
use crate::storage::{JsonFileStore, StorageConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Application state
pub struct AppState {
    pub tracker: Arc<Chaintracks>,
    pub config: TrackerConfig,
}

impl AppState {
    /// Open the header store under the configured data directory
    pub async fn open(config: TrackerConfig) -> CliResult<Self> {
        let store = JsonFileStore::open(
            StorageConfig::from_tracker(&config),
            config.network.archive_name(),
        )?;
        let tracker = Chaintracks::open(config.clone(), Arc::new(store)).await?;
        Ok(Self {
            tracker: Arc::new(tracker),
            config,
        })
    }
}

fn print_header(header: &ChainHeader) {
    println!("   ├─ Height: {}", header.height);
    println!("   ├─ Hash: {}", header.hash);
    println!("   ├─ Previous: {}", header.previous_hash());
    println!("   ├─ Merkle root: {}", header.merkle_root());
    match header.header.timestamp() {
        Some(time) => println!("   ├─ Time: {}", time.format("%Y-%m-%d %H:%M:%S")),
        None => println!("   ├─ Time: {}", header.header.time),
    }
    println!("   ├─ Bits: {:#010x}", header.header.bits);
    println!("   └─ Chain work: {}", header.chain_work_hex());
}

/// Load archived headers from a CDN or a local mirror
pub async fn cmd_bootstrap(
    state: &AppState,
    archive_dir: Option<PathBuf>,
    cancel: CancellationToken,
) -> CliResult<()> {
    let source: Arc<dyn ArchiveSource> = match (archive_dir, &state.config.cdn_url) {
        (Some(dir), _) => Arc::new(DirectoryArchive::new(dir)),
        (None, Some(url)) => Arc::new(HttpArchive::new(url.clone())),
        (None, None) => {
            println!("⚠️  No archive configured. Pass --cdn-url or --archive-dir.");
            return Ok(());
        }
    };

    println!("📥 Bootstrapping from {}...", source.location());
    let report = BulkBootstrapper::new(&state.config, source)
        .bootstrap(&state.tracker, &cancel)
        .await;

    println!("   ├─ Chunks applied: {}", report.chunks_applied);
    println!("   ├─ Chunks skipped: {}", report.chunks_skipped);
    println!("   ├─ Headers added: {}", report.headers_added);
    println!(
        "   └─ Height: {:?} -> {:?}",
        report.start_height, report.end_height
    );

    if report.cancelled {
        println!("\n⏹️  Bootstrap cancelled; the chain stops at the last applied chunk.");
    } else if let Some(error) = &report.error {
        println!("\n⚠️  Bootstrap stopped early: {}", error);
        println!("   Continue with live header sync.");
    } else {
        println!("\n✅ Bootstrap complete");
    }
    Ok(())
}

/// Display tracker info
pub async fn cmd_info(state: &AppState, json: bool) -> CliResult<()> {
    let info = state.tracker.info().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("⛓️  Chain Info ({})", info.network);
    match (info.height, info.tip_hash) {
        (Some(height), Some(hash)) => {
            println!("   ├─ Height: {}", height);
            println!("   ├─ Tip: {}", hash);
        }
        _ => println!("   ├─ Chain is empty"),
    }
    if let Some(work) = &info.chain_work {
        println!("   ├─ Chain work: {}", work);
    }
    println!("   ├─ Known headers: {}", info.known_headers);
    println!("   ├─ Live rows: {}", info.live_rows);
    match info.archived_through {
        Some(height) => println!("   └─ Archived through: {}", height),
        None => println!("   └─ Archived through: -"),
    }
    Ok(())
}

/// Show one header by height or hash
pub async fn cmd_header(
    state: &AppState,
    height: Option<u32>,
    hash: Option<&str>,
) -> CliResult<()> {
    let header = match (height, hash) {
        (_, Some(hash)) => {
            let hash: Hash256 = hash.parse()?;
            state.tracker.header_by_hash(&hash).await
        }
        (Some(height), None) => state.tracker.header_by_height(height).await,
        (None, None) => state.tracker.tip().await,
    };

    match header {
        Some(header) => {
            let active = state.tracker.is_active(&header.hash).await;
            println!("🧱 Header{}", if active { "" } else { " (inactive)" });
            print_header(&header);
        }
        None => println!("❌ Header not found"),
    }
    Ok(())
}

/// List active headers
pub async fn cmd_range(state: &AppState, start: u32, count: u32, raw: bool) -> CliResult<()> {
    if raw {
        let bytes = state.tracker.header_bytes_in_range(start, count).await;
        println!("{}", hex::encode(bytes));
        return Ok(());
    }

    let headers = state.tracker.headers_in_range(start, count).await;
    if headers.is_empty() {
        println!("📭 No active headers from height {}", start);
        return Ok(());
    }
    for header in &headers {
        println!("   #{} | {} | {:#010x}", header.height, header.hash, header.header.bits);
    }
    Ok(())
}

/// Feed hex-encoded headers, one per line, from a file or stdin
pub async fn cmd_observe(state: &AppState, input: Option<&Path>) -> CliResult<()> {
    match input {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            observe_lines(state, BufReader::new(file)).await
        }
        None => observe_lines(state, BufReader::new(tokio::io::stdin())).await,
    }
}

async fn observe_lines<R: AsyncBufRead + Unpin>(state: &AppState, reader: R) -> CliResult<()> {
    let mut lines = reader.lines();
    let mut accepted = 0usize;
    let mut rejected = 0usize;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let header = match BlockHeader::from_hex(line) {
            Ok(header) => header,
            Err(e) => {
                println!("❌ {}", e);
                rejected += 1;
                continue;
            }
        };

        match state.tracker.observe(header).await {
            Ok(ChainUpdate::Unchanged) => {}
            Ok(ChainUpdate::Added { .. }) => {
                accepted += 1;
                println!("   + {} (side branch)", header.hash());
            }
            Ok(ChainUpdate::NewTip { tip, .. }) => {
                accepted += 1;
                println!("   ⬆️  Tip #{} {}", tip.height, tip.hash);
            }
            Ok(ChainUpdate::Reorg { event, .. }) => {
                accepted += 1;
                println!(
                    "   🔀 Reorg depth {} from #{} {}, new tip #{} {}",
                    event.depth,
                    event.common_ancestor.height,
                    event.common_ancestor.hash,
                    event.new_tip.height,
                    event.new_tip.hash
                );
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                println!("❌ {}", e);
                rejected += 1;
            }
        }
    }

    println!("\n✅ {} headers accepted, {} rejected", accepted, rejected);
    Ok(())
}

/// Move deep headers into bulk rows
pub async fn cmd_compact(state: &AppState) -> CliResult<()> {
    match state.tracker.compact().await? {
        Some(report) => {
            println!(
                "📦 Archived {} headers from height {}",
                report.count, report.first_height
            );
            if report.pruned > 0 {
                println!("   └─ Pruned {} stale fork headers", report.pruned);
            }
        }
        None => println!("ℹ️  Nothing to archive yet"),
    }
    Ok(())
}
