//! Per-run context and collaborator seams
//!
//! A sync run owns everything it touches through one explicit context
//! struct (root path, journal handle, remote store, collaborator traits)
//! passed by reference through the pipeline. There is no ambient global
//! sync state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use vela_journal::{IgnoreMatcher, ItemKind, Journal, NoIgnores, RelPath, ScannerConfig};
use vela_remote::{CancelFlag, ListerConfig, RemoteStore, TransferConfig};

use crate::outcome::ItemOutcome;

/// Remote subtrees excluded from local materialization.
pub trait SelectiveSync: Send + Sync {
    fn is_blacklisted(&self, path: &RelPath) -> bool;
}

/// Blacklist that excludes nothing.
pub struct NoBlacklist;

impl SelectiveSync for NoBlacklist {
    fn is_blacklisted(&self, _path: &RelPath) -> bool {
        false
    }
}

/// Static blacklist over a set of subtree roots.
pub struct SubtreeBlacklist {
    roots: Vec<RelPath>,
}

impl SubtreeBlacklist {
    pub fn new(roots: Vec<RelPath>) -> Self {
        Self { roots }
    }
}

impl SelectiveSync for SubtreeBlacklist {
    fn is_blacklisted(&self, path: &RelPath) -> bool {
        self.roots.iter().any(|root| path.is_within(root))
    }
}

/// A change the engine applied, reported to the placeholder layer.
#[derive(Debug, Clone)]
pub enum AppliedChange {
    Created { path: RelPath, kind: ItemKind },
    Updated { path: RelPath },
    Removed { path: RelPath },
    Renamed { from: RelPath, to: RelPath },
}

/// OS placeholder/virtual-file collaborator.
///
/// The engine only needs to know whether content must be materialized
/// before a transfer can read it, and to keep the projection informed of
/// applied changes.
#[async_trait]
pub trait PlaceholderLayer: Send + Sync {
    /// True when the item is placeholder-only and its bytes must be fetched
    /// before propagation can read them.
    async fn needs_materialization(&self, path: &RelPath) -> bool;

    /// Materialize content bytes for a placeholder-only item.
    async fn materialize(&self, path: &RelPath) -> std::io::Result<()>;

    /// Called after every applied create/update/delete/rename.
    async fn on_applied(&self, change: &AppliedChange);
}

/// Placeholder layer for setups without virtual files: everything is
/// materialized, notifications are dropped.
pub struct NoPlaceholders;

#[async_trait]
impl PlaceholderLayer for NoPlaceholders {
    async fn needs_materialization(&self, _path: &RelPath) -> bool {
        false
    }

    async fn materialize(&self, _path: &RelPath) -> std::io::Result<()> {
        Ok(())
    }

    async fn on_applied(&self, _change: &AppliedChange) {}
}

/// Free-space probe for the disk-floor download policy.
pub trait SpaceProbe: Send + Sync {
    /// Free bytes on the volume holding `root`, `None` when unknown.
    fn free_bytes(&self, root: &Path) -> Option<u64>;
}

/// Probe that reports unknown space; the floor policy then never skips.
pub struct UnknownSpace;

impl SpaceProbe for UnknownSpace {
    fn free_bytes(&self, _root: &Path) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Bounded worker count for independent subtrees.
    pub max_parallel: usize,
    /// Attempts per job for transient failures.
    pub retry_attempts: u32,
    /// Base backoff delay, doubled per attempt.
    pub retry_base_delay: Duration,
    /// Downloads are skipped when projected free space falls below this.
    pub disk_floor: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            disk_floor: 256 * 1024 * 1024,
        }
    }
}

/// Tunables for one run.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub scanner: ScannerConfig,
    pub lister: ListerConfig,
    pub transfer: TransferConfig,
    pub scheduler: SchedulerConfig,
}

/// Everything one sync run owns.
pub struct SyncContext {
    pub root: PathBuf,
    pub journal: Arc<Journal>,
    pub store: Arc<dyn RemoteStore>,
    pub ignores: Arc<dyn IgnoreMatcher>,
    pub selective: Arc<dyn SelectiveSync>,
    pub placeholders: Arc<dyn PlaceholderLayer>,
    pub space: Arc<dyn SpaceProbe>,
    pub options: SyncOptions,
    pub cancel: CancelFlag,
    /// Optional live outcome stream (retry countdowns included); the
    /// terminal outcomes always land in the run summary.
    pub progress: Option<mpsc::Sender<ItemOutcome>>,
}

impl SyncContext {
    /// Context with default collaborators: no ignores, no blacklist, no
    /// placeholders, unknown disk space.
    pub fn new(root: impl Into<PathBuf>, journal: Arc<Journal>, store: Arc<dyn RemoteStore>) -> Self {
        Self {
            root: root.into(),
            journal,
            store,
            ignores: Arc::new(NoIgnores),
            selective: Arc::new(NoBlacklist),
            placeholders: Arc::new(NoPlaceholders),
            space: Arc::new(UnknownSpace),
            options: SyncOptions::default(),
            cancel: CancelFlag::new(),
            progress: None,
        }
    }
}
