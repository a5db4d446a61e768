//! Run orchestration
//!
//! Wires one sync run end to end: scanner and lister as concurrent
//! producers, discovery joining them against the journal, reconciliation,
//! then dependency-ordered propagation. The journal handle in the context
//! was opened exclusively, so a second run against the same root has
//! already failed fast before reaching this point.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};
use vela_journal::{LocalTreeScanner, RelPath};
use vela_remote::{RemoteError, RemoteTreeLister, TransferManager};

use crate::context::SyncContext;
use crate::discovery::DiscoveryCoordinator;
use crate::outcome::{RunResult, RunSummary};
use crate::propagate::Propagator;
use crate::reconcile::ReconciliationEngine;
use crate::scheduler::PropagationScheduler;

/// One full Discovery → Reconciliation → Propagation cycle.
pub struct SyncRun {
    ctx: SyncContext,
}

impl SyncRun {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    pub async fn execute(self) -> RunSummary {
        let ctx = self.ctx;

        if !ctx.root.is_dir() {
            return RunSummary::setup_error(format!(
                "sync root {} is not a directory",
                ctx.root.display()
            ));
        }
        if ctx.journal.was_rebuilt() {
            info!("Journal was rebuilt; this run performs a full rediscovery");
        }

        // Scanner and lister run as independent producers; discovery joins
        // them per directory.
        let (scan_tx, scan_rx) = mpsc::channel(64);
        let (list_tx, list_rx) = mpsc::channel(64);

        let scanner = LocalTreeScanner::new(
            &ctx.root,
            ctx.journal.clone(),
            ctx.ignores.clone(),
            ctx.options.scanner.clone(),
        );
        let lister = RemoteTreeLister::new(ctx.store.clone(), ctx.options.lister.clone());

        let scan_task = tokio::spawn(async move { scanner.scan(RelPath::root(), scan_tx).await });
        let list_task = tokio::spawn(async move { lister.list(RelPath::root(), list_tx).await });

        let discovery = DiscoveryCoordinator::new(ctx.journal.clone());
        let candidates = match discovery.discover(scan_rx, list_rx).await {
            Ok(candidates) => candidates,
            Err(e) => return RunSummary::setup_error(format!("discovery failed: {e}")),
        };

        match scan_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return RunSummary::setup_error(format!("local scan failed: {e}")),
            Err(e) => return RunSummary::setup_error(format!("scanner task failed: {e}")),
        }
        match list_task.await {
            Ok(Ok(())) => {}
            Ok(Err(RemoteError::Unauthorized)) => {
                // Auth loss aborts the run; no item is marked in error.
                warn!("Remote store rejected credentials during discovery");
                return RunSummary {
                    result: RunResult::Aborted,
                    outcomes: Vec::new(),
                    counters: Default::default(),
                };
            }
            Ok(Err(e)) => return RunSummary::setup_error(format!("remote listing failed: {e}")),
            Err(e) => return RunSummary::setup_error(format!("lister task failed: {e}")),
        }

        let plan = ReconciliationEngine::new(ctx.selective.clone()).reconcile(candidates);

        let transfer = TransferManager::new(ctx.store.clone(), ctx.options.transfer.clone());
        let propagator = Arc::new(Propagator::new(
            ctx.root.clone(),
            ctx.journal.clone(),
            ctx.store.clone(),
            transfer,
            ctx.placeholders.clone(),
            ctx.space.clone(),
            ctx.cancel.clone(),
            ctx.options.scheduler.disk_floor,
        ));
        let scheduler = PropagationScheduler::new(
            propagator,
            ctx.options.scheduler.clone(),
            ctx.cancel.clone(),
            ctx.progress.clone(),
        );
        let report = scheduler.execute(plan).await;

        let result = if report.unauthorized || ctx.cancel.is_cancelled() {
            RunResult::Aborted
        } else if let Some(reason) = &report.fatal {
            warn!("Run stopped on fatal condition: {reason}");
            RunResult::Aborted
        } else if report
            .outcomes
            .iter()
            .any(|o| o.status.is_terminal_failure())
        {
            RunResult::SuccessWithErrors
        } else {
            RunResult::Success
        };

        info!(
            "Run finished: {:?} ({} outcomes, {} up / {} down bytes)",
            result,
            report.outcomes.len(),
            report.counters.bytes_uploaded,
            report.counters.bytes_downloaded
        );

        RunSummary {
            result,
            outcomes: report.outcomes,
            counters: report.counters,
        }
    }
}
