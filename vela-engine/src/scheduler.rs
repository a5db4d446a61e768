//! Propagation scheduler
//!
//! Turns the reconciled plan into dependency-ordered jobs and executes them
//! on a bounded worker pool. Jobs sharing an edge run strictly in order;
//! independent subtrees run in parallel. A job's journal commit happens
//! inside its executor, before dependents are released; that is the
//! durability point a crashed run resumes from.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use priority_queue::PriorityQueue;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use vela_journal::{ItemKind, RelPath};
use vela_remote::{CancelFlag, RemoteError};

use crate::context::SchedulerConfig;
use crate::errors::EngineError;
use crate::instruction::{ErrorReason, PlanItem, SyncInstruction};
use crate::outcome::{ErrorCategory, ItemOutcome, ItemStatus, RunCounters};
use crate::propagate::{Effect, Propagator};

/// Job lifecycle inside one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Pending,
    InFlight,
    Committed,
    Failed,
    Skipped,
    Aborted,
}

/// Deterministic execution order: directory creates flow top-down, deletes
/// bottom-up, transfers in between.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    class: u8,
    depth: i64,
    path: String,
}

fn order_key(item: &PlanItem) -> OrderKey {
    let depth = item.path.depth() as i64;
    let (class, depth) = match &item.instruction {
        SyncInstruction::New(_) if item.kind() == Some(ItemKind::Directory) => (0, depth),
        SyncInstruction::TypeChanged => (1, depth),
        SyncInstruction::Renamed { .. } => (2, depth),
        SyncInstruction::Removed(_) => (4, -depth),
        _ => (3, depth),
    };
    OrderKey {
        class,
        depth,
        path: item.path.as_str().to_string(),
    }
}

/// Result of scheduling one plan.
pub struct ScheduleReport {
    pub outcomes: Vec<ItemOutcome>,
    pub counters: RunCounters,
    /// Set when a run-fatal condition (journal failure, auth loss) stopped
    /// the scheduler early.
    pub fatal: Option<String>,
    pub unauthorized: bool,
}

/// Dependency-ordered executor over a reconciled plan.
pub struct PropagationScheduler {
    propagator: Arc<Propagator>,
    config: SchedulerConfig,
    cancel: CancelFlag,
    progress: Option<mpsc::Sender<ItemOutcome>>,
}

impl PropagationScheduler {
    pub fn new(
        propagator: Arc<Propagator>,
        config: SchedulerConfig,
        cancel: CancelFlag,
        progress: Option<mpsc::Sender<ItemOutcome>>,
    ) -> Self {
        Self {
            propagator,
            config,
            cancel,
            progress,
        }
    }

    pub async fn execute(&self, plan: Vec<PlanItem>) -> ScheduleReport {
        let mut outcomes = Vec::new();
        let mut counters = RunCounters::default();

        // Ignored and plain-error items never become jobs; they are reported
        // and left alone. An error item with a pending restore still runs.
        let mut jobs: Vec<PlanItem> = Vec::new();
        for item in plan {
            match &item.instruction {
                SyncInstruction::Ignored(reason) => {
                    outcomes.push(ItemOutcome {
                        path: item.path.clone(),
                        instruction: item.instruction.clone(),
                        status: ItemStatus::Skipped {
                            reason: reason.to_string(),
                        },
                    });
                }
                SyncInstruction::Error(reason) if !item.restore_download => {
                    outcomes.push(ItemOutcome {
                        path: item.path.clone(),
                        instruction: item.instruction.clone(),
                        status: ItemStatus::Failed {
                            category: error_reason_category(reason),
                            message: reason.to_string(),
                        },
                    });
                }
                _ => jobs.push(item),
            }
        }

        let (mut blocked_by, dependents) = build_graph(&jobs);
        let mut states = vec![JobState::Pending; jobs.len()];

        let mut ready: PriorityQueue<usize, Reverse<OrderKey>> = PriorityQueue::new();
        for (idx, job) in jobs.iter().enumerate() {
            if blocked_by[idx] == 0 {
                ready.push(idx, Reverse(order_key(job)));
            }
        }

        info!(
            "Scheduling {} jobs on {} workers",
            jobs.len(),
            self.config.max_parallel
        );

        let mut in_flight: JoinSet<(usize, Result<Effect, EngineError>)> = JoinSet::new();
        let mut fatal: Option<String> = None;
        let mut unauthorized = false;

        loop {
            // Fill the pool, unless the run is cancelled or dead.
            while fatal.is_none()
                && !self.cancel.is_cancelled()
                && in_flight.len() < self.config.max_parallel
            {
                let Some((idx, _)) = ready.pop() else {
                    break;
                };
                states[idx] = JobState::InFlight;
                let propagator = self.propagator.clone();
                let item = jobs[idx].clone();
                let retry_attempts = self.config.retry_attempts;
                let base_delay = self.config.retry_base_delay;
                let progress = self.progress.clone();
                let cancel = self.cancel.clone();
                in_flight.spawn(async move {
                    let result = run_with_retries(
                        &propagator,
                        &item,
                        retry_attempts,
                        base_delay,
                        progress,
                        cancel,
                    )
                    .await;
                    (idx, result)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                if self.cancel.is_cancelled() || fatal.is_some() {
                    break;
                }
                match ready.peek() {
                    Some(_) => continue,
                    None => break,
                }
            };

            let (idx, result) = match joined {
                Ok(done) => done,
                Err(join_err) => {
                    warn!("Propagation worker panicked: {join_err}");
                    fatal = Some(format!("propagation worker panicked: {join_err}"));
                    continue;
                }
            };

            let item = &jobs[idx];
            match result {
                Ok(effect) => {
                    states[idx] = JobState::Committed;
                    apply_effect(&mut counters, effect);
                    let status = if item.restore_download {
                        // The restore succeeded, but the item is still
                        // reported as the permission error it is.
                        ItemStatus::Failed {
                            category: ErrorCategory::Permission,
                            message: "read-only item was modified locally; server version restored"
                                .to_string(),
                        }
                    } else {
                        ItemStatus::Applied
                    };
                    self.report(&mut outcomes, item, status).await;

                    for &dependent in dependents.get(&idx).map(Vec::as_slice).unwrap_or(&[]) {
                        blocked_by[dependent] -= 1;
                        if blocked_by[dependent] == 0 && states[dependent] == JobState::Pending {
                            ready.push(dependent, Reverse(order_key(&jobs[dependent])));
                        }
                    }
                }
                Err(EngineError::Remote(RemoteError::Unauthorized)) => {
                    // Auth loss aborts the whole run without putting items
                    // in error.
                    warn!("Remote store rejected credentials, aborting run");
                    unauthorized = true;
                    self.cancel.cancel();
                    states[idx] = JobState::Aborted;
                    self.report(&mut outcomes, item, ItemStatus::Aborted).await;
                }
                Err(EngineError::Remote(RemoteError::Cancelled)) | Err(EngineError::Cancelled) => {
                    states[idx] = JobState::Aborted;
                    self.report(&mut outcomes, item, ItemStatus::Aborted).await;
                }
                Err(EngineError::Journal(e)) => {
                    // A journal that cannot commit makes every further
                    // result unrecordable; stop in the last committed state.
                    warn!("Journal failure during propagation: {e}");
                    fatal = Some(format!("journal failure: {e}"));
                    states[idx] = JobState::Failed;
                    self.report(
                        &mut outcomes,
                        item,
                        ItemStatus::Failed {
                            category: ErrorCategory::Fatal,
                            message: e.to_string(),
                        },
                    )
                    .await;
                }
                Err(e) => {
                    let category = categorize(&e);
                    let status = if category == ErrorCategory::Capacity {
                        states[idx] = JobState::Skipped;
                        ItemStatus::Skipped {
                            reason: e.to_string(),
                        }
                    } else {
                        states[idx] = JobState::Failed;
                        ItemStatus::Failed {
                            category,
                            message: e.to_string(),
                        }
                    };
                    debug!("Job for {} ended: {e}", item.path);
                    self.report(&mut outcomes, item, status).await;
                    self.block_dependents(idx, &jobs, &dependents, &mut states, &mut outcomes)
                        .await;
                }
            }
        }

        // Everything still pending was never reached: cancelled run or
        // fatal stop.
        for (idx, state) in states.iter().enumerate() {
            if matches!(*state, JobState::Pending | JobState::InFlight) {
                self.report(&mut outcomes, &jobs[idx], ItemStatus::Aborted).await;
            }
        }

        ScheduleReport {
            outcomes,
            counters,
            fatal,
            unauthorized,
        }
    }

    /// Transitively mark dependents of a dead job.
    async fn block_dependents(
        &self,
        root: usize,
        jobs: &[PlanItem],
        dependents: &HashMap<usize, Vec<usize>>,
        states: &mut [JobState],
        outcomes: &mut Vec<ItemOutcome>,
    ) {
        let mut stack = vec![root];
        while let Some(idx) = stack.pop() {
            for &dependent in dependents.get(&idx).map(Vec::as_slice).unwrap_or(&[]) {
                if states[dependent] == JobState::Pending {
                    states[dependent] = JobState::Failed;
                    self.report(
                        outcomes,
                        &jobs[dependent],
                        ItemStatus::BlockedByDependency {
                            dependency: jobs[idx].path.clone(),
                        },
                    )
                    .await;
                    stack.push(dependent);
                }
            }
        }
    }

    async fn report(&self, outcomes: &mut Vec<ItemOutcome>, item: &PlanItem, status: ItemStatus) {
        let outcome = ItemOutcome {
            path: item.path.clone(),
            instruction: item.instruction.clone(),
            status,
        };
        if let Some(progress) = &self.progress {
            let _ = progress.send(outcome.clone()).await;
        }
        outcomes.push(outcome);
    }
}

async fn run_with_retries(
    propagator: &Propagator,
    item: &PlanItem,
    retry_attempts: u32,
    base_delay: std::time::Duration,
    progress: Option<mpsc::Sender<ItemOutcome>>,
    cancel: CancelFlag,
) -> Result<Effect, EngineError> {
    let mut attempt = 1;
    loop {
        match propagator.execute(item).await {
            Ok(effect) => return Ok(effect),
            Err(EngineError::Remote(RemoteError::Temporary(reason)))
                if attempt < retry_attempts && !cancel.is_cancelled() =>
            {
                let delay = base_delay * 2u32.saturating_pow(attempt - 1);
                debug!(
                    "Job for {} hit a temporary failure ({reason}), attempt {attempt}, retrying in {:?}",
                    item.path, delay
                );
                if let Some(progress) = &progress {
                    let _ = progress
                        .send(ItemOutcome {
                            path: item.path.clone(),
                            instruction: item.instruction.clone(),
                            status: ItemStatus::Retrying { attempt, delay },
                        })
                        .await;
                }
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Dependency edges from the item/parent relation:
/// creates flow parent→child, deletes child→parent, renames wait for their
/// destination directory, and a directory delete waits for entries renamed
/// out of it.
fn build_graph(jobs: &[PlanItem]) -> (Vec<usize>, HashMap<usize, Vec<usize>>) {
    let mut provides_dir: HashMap<RelPath, usize> = HashMap::new();
    let mut deletes_at: HashMap<RelPath, usize> = HashMap::new();

    for (idx, job) in jobs.iter().enumerate() {
        match &job.instruction {
            SyncInstruction::New(_) if job.kind() == Some(ItemKind::Directory) => {
                provides_dir.insert(job.path.clone(), idx);
            }
            SyncInstruction::TypeChanged => {
                if job.comparison.remote.as_ref().map(|r| r.kind) == Some(ItemKind::Directory) {
                    provides_dir.insert(job.path.clone(), idx);
                }
            }
            SyncInstruction::Renamed { to, .. } => {
                if job.kind() == Some(ItemKind::Directory) {
                    provides_dir.insert(to.clone(), idx);
                }
            }
            SyncInstruction::Removed(_) => {
                deletes_at.insert(job.path.clone(), idx);
            }
            _ => {}
        }
    }

    let mut blocked_by = vec![0usize; jobs.len()];
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut add_edge = |from: usize, to: usize| {
        if from != to {
            blocked_by[to] += 1;
            dependents.entry(from).or_default().push(to);
        }
    };

    for (idx, job) in jobs.iter().enumerate() {
        match &job.instruction {
            // Anything that materializes content at a path needs the parent
            // directory to exist first.
            SyncInstruction::New(_)
            | SyncInstruction::Updated(_)
            | SyncInstruction::TypeChanged
            | SyncInstruction::Conflict
            | SyncInstruction::NoOp
            | SyncInstruction::Error(_) => {
                if let Some(parent) = job.path.parent() {
                    if let Some(&provider) = provides_dir.get(&parent) {
                        add_edge(provider, idx);
                    }
                }
            }
            SyncInstruction::Renamed { from, to, .. } => {
                if let Some(parent) = to.parent() {
                    if let Some(&provider) = provides_dir.get(&parent) {
                        add_edge(provider, idx);
                    }
                }
                // Moving out of a dying directory must precede its delete.
                if let Some(old_parent) = from.parent() {
                    if let Some(&delete) = deletes_at.get(&old_parent) {
                        add_edge(idx, delete);
                    }
                }
            }
            // A directory delete waits for every child delete.
            SyncInstruction::Removed(_) => {
                if let Some(parent) = job.path.parent() {
                    if let Some(&parent_delete) = deletes_at.get(&parent) {
                        add_edge(idx, parent_delete);
                    }
                }
            }
            SyncInstruction::Ignored(_) => {}
        }
    }

    (blocked_by, dependents)
}

fn apply_effect(counters: &mut RunCounters, effect: Effect) {
    match effect {
        Effect::None => {}
        Effect::Uploaded { bytes } => {
            counters.files_uploaded += 1;
            counters.bytes_uploaded += bytes;
        }
        Effect::Downloaded { bytes } => {
            counters.files_downloaded += 1;
            counters.bytes_downloaded += bytes;
        }
        Effect::Deleted => counters.items_deleted += 1,
        Effect::Renamed => counters.items_renamed += 1,
        Effect::ConflictResolved {
            downloaded,
            uploaded,
        } => {
            counters.conflicts_resolved += 1;
            counters.files_downloaded += 1;
            counters.bytes_downloaded += downloaded;
            if let Some(bytes) = uploaded {
                counters.files_uploaded += 1;
                counters.bytes_uploaded += bytes;
            }
        }
    }
}

fn error_reason_category(reason: &ErrorReason) -> ErrorCategory {
    match reason {
        ErrorReason::PermissionDenied => ErrorCategory::Permission,
        ErrorReason::Unreadable => ErrorCategory::Permission,
        ErrorReason::Other(_) => ErrorCategory::Fatal,
    }
}

fn categorize(error: &EngineError) -> ErrorCategory {
    match error {
        EngineError::Remote(remote) => match remote {
            RemoteError::Temporary(_) => ErrorCategory::Transient,
            RemoteError::InsufficientStorage => ErrorCategory::Capacity,
            RemoteError::ChecksumMismatch { .. } | RemoteError::SourceChanged => {
                ErrorCategory::DataIntegrity
            }
            RemoteError::Unauthorized
            | RemoteError::Protocol(_)
            | RemoteError::PreconditionFailed(_)
            | RemoteError::NotFound(_)
            | RemoteError::Cancelled => ErrorCategory::Fatal,
            RemoteError::Io(_) => ErrorCategory::DataIntegrity,
        },
        EngineError::DiskFull { .. } => ErrorCategory::Capacity,
        EngineError::Io(_) => ErrorCategory::DataIntegrity,
        EngineError::Placeholder(_) => ErrorCategory::DataIntegrity,
        EngineError::Journal(_) | EngineError::Setup(_) => ErrorCategory::Fatal,
        EngineError::Cancelled => ErrorCategory::Fatal,
    }
}
