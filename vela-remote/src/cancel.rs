//! Cooperative run-wide cancellation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{RemoteError, Result};

/// Cancel signal shared by the scheduler and the transfer manager.
///
/// Checked between jobs and at chunk boundaries; a set flag stops new work
/// immediately while letting in-flight steps finish cleanly.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Error out if the run was cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RemoteError::Cancelled)
        } else {
            Ok(())
        }
    }
}
