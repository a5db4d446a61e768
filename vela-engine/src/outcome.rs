//! Per-item outcomes and run summaries

use std::fmt;

use vela_journal::RelPath;

use crate::instruction::SyncInstruction;

/// Error taxonomy surfaced to presentation layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network timeout, 5xx, maintenance; retried with backoff.
    Transient,
    /// Missing rights; never retried, restore policy may apply.
    Permission,
    /// Checksum or size mismatch; the transfer resumed or restarted but
    /// never committed.
    DataIntegrity,
    /// Reserved or non-encodable name; skipped, never retried.
    NameConstraint,
    /// Quota or disk space; skipped without failing siblings.
    Capacity,
    /// Protocol breach or journal failure.
    Fatal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permission => "permission",
            ErrorCategory::DataIntegrity => "data-integrity",
            ErrorCategory::NameConstraint => "name-constraint",
            ErrorCategory::Capacity => "capacity",
            ErrorCategory::Fatal => "fatal",
        };
        f.write_str(text)
    }
}

/// Terminal or progress state of one item in a run.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemStatus {
    /// Instruction applied and journal committed.
    Applied,
    /// Deliberately not executed (ignored, quota, disk floor).
    Skipped { reason: String },
    /// Execution failed terminally for this run.
    Failed { category: ErrorCategory, message: String },
    /// Transient failure; another attempt starts after `delay`.
    Retrying {
        attempt: u32,
        delay: std::time::Duration,
    },
    /// A dependency failed, so this job never started.
    BlockedByDependency { dependency: RelPath },
    /// The run was cancelled before this job finished.
    Aborted,
}

impl ItemStatus {
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, ItemStatus::Failed { .. } | ItemStatus::BlockedByDependency { .. })
    }
}

/// One reported item state; `Retrying` entries stream through the progress
/// channel, everything else is terminal and lands in the summary.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub path: RelPath,
    pub instruction: SyncInstruction,
    pub status: ItemStatus,
}

/// Aggregate result of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    Success,
    SuccessWithErrors,
    Aborted,
    SetupError,
}

/// Transfer counters for presentation layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub files_uploaded: u64,
    pub files_downloaded: u64,
    pub items_deleted: u64,
    pub items_renamed: u64,
    pub conflicts_resolved: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

/// Everything a presentation layer needs about a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub result: RunResult,
    pub outcomes: Vec<ItemOutcome>,
    pub counters: RunCounters,
}

impl RunSummary {
    pub fn setup_error(message: String) -> Self {
        tracing::error!("Sync run setup failed: {message}");
        Self {
            result: RunResult::SetupError,
            outcomes: Vec::new(),
            counters: RunCounters::default(),
        }
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes.iter().filter(|o| o.status.is_terminal_failure())
    }
}
