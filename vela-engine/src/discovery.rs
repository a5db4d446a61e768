//! Discovery coordinator
//!
//! Consumes the local scanner and the remote lister as two independent
//! producers, joins their per-directory output against the journal, and
//! turns every candidate item into exactly one raw instruction. Rename
//! inference and directory-delete promotion run over the whole candidate
//! set before removals become final.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use vela_journal::{
    reserved_name, DirectoryScan, ItemId, ItemKind, Journal, JournalRecord, LocalObservation,
    RelPath, ScanIssue,
};
use vela_remote::{DirectoryListing, RemoteObservation};

use crate::errors::Result;
use crate::instruction::{
    Comparison, Direction, ErrorReason, IgnoreReason, PlanItem, Side, SyncInstruction,
};

#[derive(Default)]
struct RawLegs {
    local: Option<LocalObservation>,
    remote: Option<RemoteObservation>,
}

/// Joins scanner and lister output into classified candidates.
pub struct DiscoveryCoordinator {
    journal: Arc<Journal>,
}

impl DiscoveryCoordinator {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self { journal }
    }

    /// Drain both producers and produce one [`PlanItem`] per candidate.
    ///
    /// A directory is only reconciled once both legs have reported it or a
    /// producer has terminally finished: the single mandatory
    /// synchronization point of discovery.
    pub async fn discover(
        &self,
        mut scans: mpsc::Receiver<DirectoryScan>,
        mut listings: mpsc::Receiver<DirectoryListing>,
    ) -> Result<Vec<PlanItem>> {
        let mut local_dirs: HashMap<RelPath, bool> = HashMap::new();
        let mut remote_dirs: HashMap<RelPath, bool> = HashMap::new();
        let mut non_deletable: HashSet<RelPath> = HashSet::new();
        let mut items: BTreeMap<RelPath, RawLegs> = BTreeMap::new();

        let mut scans_open = true;
        let mut listings_open = true;
        while scans_open || listings_open {
            tokio::select! {
                scan = scans.recv(), if scans_open => match scan {
                    Some(scan) => {
                        trace!("Discovery got local scan of {}", scan.dir);
                        local_dirs.insert(scan.dir.clone(), scan.complete);
                        non_deletable.extend(scan.non_deletable.iter().cloned());
                        for obs in scan.entries {
                            let path = obs.path.clone();
                            items.entry(path).or_default().local = Some(obs);
                        }
                    }
                    None => scans_open = false,
                },
                listing = listings.recv(), if listings_open => match listing {
                    Some(listing) => {
                        trace!("Discovery got remote listing of {}", listing.dir);
                        remote_dirs.insert(listing.dir.clone(), listing.authoritative);
                        for obs in listing.entries {
                            let path = obs.path.clone();
                            items.entry(path).or_default().remote = Some(obs);
                        }
                    }
                    None => listings_open = false,
                },
            }
        }

        let records = self.journal.all_records()?;
        info!(
            "Discovery merged {} candidate paths against {} journal records",
            items.len(),
            records.len()
        );

        let tree = TreeView {
            items,
            records_by_path: records.iter().map(|r| (r.path.clone(), r)).collect(),
            local_dirs,
            remote_dirs,
            non_deletable,
        };

        let mut consumed: HashSet<RelPath> = HashSet::new();
        let mut candidates = infer_renames(&records, &tree, &mut consumed);

        for (path, legs) in &tree.items {
            if consumed.contains(path) {
                continue;
            }
            let comparison = Comparison {
                record: tree.records_by_path.get(path).map(|r| (*r).clone()),
                local: legs.local.clone(),
                remote: legs.remote.clone(),
            };
            let instruction = classify(&comparison, path, &tree);
            candidates.push(PlanItem::new(path.clone(), comparison, instruction));
        }

        // Journal records that appeared on neither side: deleted everywhere,
        // or hidden behind an untrusted listing.
        for record in &records {
            if consumed.contains(&record.path) || tree.items.contains_key(&record.path) {
                continue;
            }
            let comparison = Comparison {
                record: Some(record.clone()),
                local: None,
                remote: None,
            };
            let instruction = classify(&comparison, &record.path, &tree);
            candidates.push(PlanItem::new(record.path.clone(), comparison, instruction));
        }

        promote_vetoed_removals(&mut candidates, &tree.non_deletable);

        debug!("Discovery produced {} candidates", candidates.len());
        Ok(candidates)
    }
}

/// Everything classification needs to look sideways at the run.
struct TreeView<'a> {
    items: BTreeMap<RelPath, RawLegs>,
    records_by_path: HashMap<RelPath, &'a JournalRecord>,
    /// Scanned local dirs → scan completeness.
    local_dirs: HashMap<RelPath, bool>,
    /// Listed remote dirs → authoritative flag.
    remote_dirs: HashMap<RelPath, bool>,
    non_deletable: HashSet<RelPath>,
}

impl TreeView<'_> {
    /// Absence of a local entry may only be read as deletion when the
    /// nearest scanned ancestor was read completely.
    fn local_absence_trusted(&self, path: &RelPath) -> bool {
        let Some(parent) = path.parent() else {
            return true;
        };
        match self.local_dirs.get(&parent) {
            Some(complete) => *complete,
            None => self.local_absence_trusted(&parent),
        }
    }

    /// Absence of a remote entry may only be read as deletion under an
    /// authoritative listing chain.
    fn remote_absence_trusted(&self, path: &RelPath) -> bool {
        let Some(parent) = path.parent() else {
            return true;
        };
        match self.remote_dirs.get(&parent) {
            Some(authoritative) => *authoritative,
            None => self.remote_absence_trusted(&parent),
        }
    }

    fn local_at(&self, path: &RelPath) -> Option<&LocalObservation> {
        self.items.get(path).and_then(|legs| legs.local.as_ref())
    }

    fn remote_at(&self, path: &RelPath) -> Option<&RemoteObservation> {
        self.items.get(path).and_then(|legs| legs.remote.as_ref())
    }
}

/// Classify one comparison into its raw instruction.
fn classify(cmp: &Comparison, path: &RelPath, tree: &TreeView<'_>) -> SyncInstruction {
    // Scanner-flagged problems come first: they are reported, never synced.
    if let Some(local) = &cmp.local {
        match local.issue {
            Some(ScanIssue::UnsupportedLink) => {
                return SyncInstruction::Ignored(IgnoreReason::UnsupportedLink)
            }
            Some(ScanIssue::ReservedName) => {
                return SyncInstruction::Ignored(IgnoreReason::ReservedName)
            }
            Some(ScanIssue::Unreadable) => return SyncInstruction::Error(ErrorReason::Unreadable),
            None => {}
        }
    }

    match (&cmp.record, &cmp.local, &cmp.remote) {
        (None, None, None) => SyncInstruction::NoOp,

        (None, Some(_), None) => SyncInstruction::New(Direction::Upload),

        (None, None, Some(remote)) => {
            if reserved_name(remote.path.name()) {
                // The local filesystem cannot represent this name.
                SyncInstruction::Ignored(IgnoreReason::ReservedName)
            } else {
                SyncInstruction::New(Direction::Download)
            }
        }

        // Appeared independently on both sides with no history.
        (None, Some(local), Some(remote)) => {
            if local.kind != remote.kind {
                SyncInstruction::TypeChanged
            } else if local.kind == ItemKind::Directory || cmp.checksums_match() {
                // Same tree on both sides; adopt it into the journal.
                SyncInstruction::NoOp
            } else {
                SyncInstruction::Conflict
            }
        }

        (Some(_), Some(local), Some(remote)) => {
            if local.kind != remote.kind {
                return SyncInstruction::TypeChanged;
            }
            if local.kind == ItemKind::Directory {
                // Directory metadata follows its children; the entry itself
                // only refreshes the journal.
                return SyncInstruction::NoOp;
            }
            match (cmp.local_changed(), cmp.remote_changed()) {
                (false, false) => SyncInstruction::NoOp,
                (true, false) => SyncInstruction::Updated(Direction::Upload),
                (false, true) => SyncInstruction::Updated(Direction::Download),
                (true, true) => {
                    if cmp.checksums_match() {
                        SyncInstruction::NoOp
                    } else {
                        SyncInstruction::Conflict
                    }
                }
            }
        }

        (Some(_), Some(local), None) => {
            if !tree.remote_absence_trusted(path) {
                // Partial listing; reconciling this as a deletion is exactly
                // what must never happen.
                SyncInstruction::NoOp
            } else if local.kind == ItemKind::Directory {
                // A directory's change state is its descendants'; the veto
                // pass decides whether this removal survives.
                SyncInstruction::Removed(Side::Remote)
            } else if cmp.local_changed() {
                // Deleted remotely but edited locally: the edit wins and the
                // item is restored to the server.
                SyncInstruction::New(Direction::Upload)
            } else {
                SyncInstruction::Removed(Side::Remote)
            }
        }

        (Some(_), None, Some(remote)) => {
            if !tree.local_absence_trusted(path) {
                SyncInstruction::NoOp
            } else if remote.kind == ItemKind::Directory {
                SyncInstruction::Removed(Side::Local)
            } else if cmp.remote_changed() {
                // Deleted locally but changed remotely: restore the newer
                // remote version instead of propagating the delete.
                SyncInstruction::Updated(Direction::Download)
            } else {
                SyncInstruction::Removed(Side::Local)
            }
        }

        (Some(_), None, None) => {
            if tree.remote_absence_trusted(path) && tree.local_absence_trusted(path) {
                // Gone everywhere; only the journal record remains.
                SyncInstruction::Removed(Side::Remote)
            } else {
                SyncInstruction::NoOp
            }
        }
    }
}

/// Move/rename inference over the whole candidate set.
///
/// Runs before per-item classification commits, because a matched pair must
/// not classify as `Removed` + `New`. An ambiguous match (several
/// candidates, or equal size with differing checksums) conservatively
/// falls back to the removal/addition pair; a wrong rename is worse than a
/// re-transfer.
fn infer_renames(
    records: &[JournalRecord],
    tree: &TreeView<'_>,
    consumed: &mut HashSet<RelPath>,
) -> Vec<PlanItem> {
    let mut renames = Vec::new();

    // Remote-issued ids are identity, so a remote move is an id showing up
    // at a path with no history.
    let mut remote_by_id: HashMap<&ItemId, Vec<&RemoteObservation>> = HashMap::new();
    for (path, legs) in &tree.items {
        if let Some(remote) = &legs.remote {
            if !tree.records_by_path.contains_key(path) {
                remote_by_id.entry(&remote.item_id).or_default().push(remote);
            }
        }
    }

    for record in records {
        if consumed.contains(&record.path) {
            continue;
        }
        let gone_here = tree.remote_at(&record.path).is_none()
            && tree.remote_absence_trusted(&record.path);
        if !gone_here {
            continue;
        }
        let Some(matches) = remote_by_id.get(&record.item_id) else {
            continue;
        };
        let candidates: Vec<&RemoteObservation> = matches
            .iter()
            .copied()
            .filter(|obs| {
                obs.path != record.path
                    && !consumed.contains(&obs.path)
                    && obs.kind == record.kind
                    && tree.local_at(&obs.path).is_none()
            })
            .collect();
        let [observation] = candidates.as_slice() else {
            continue;
        };
        let observation: &RemoteObservation = observation;

        let content_matches = match record.kind {
            ItemKind::Directory => true,
            ItemKind::File => {
                observation.size == record.size
                    && match (&observation.checksum, &record.checksum) {
                        (Some(a), Some(b)) => a == b,
                        _ => observation.etag == record.etag,
                    }
            }
        };
        if !content_matches {
            continue;
        }

        debug!(
            "Inferred remote rename {} -> {} (item {})",
            record.path, observation.path, record.item_id
        );
        consumed.insert(record.path.clone());
        consumed.insert(observation.path.clone());
        renames.push(PlanItem::new(
            observation.path.clone(),
            Comparison {
                record: Some(record.clone()),
                local: tree.local_at(&record.path).cloned(),
                remote: Some(observation.clone()),
            },
            SyncInstruction::Renamed {
                from: record.path.clone(),
                to: observation.path.clone(),
                direction: Direction::Download,
            },
        ));
    }

    // Local moves carry no id, so files pair up by size + checksum; without
    // a reliable identity hint, directories never pair.
    let mut local_new: Vec<&LocalObservation> = tree
        .items
        .iter()
        .filter(|(path, _)| !tree.records_by_path.contains_key(*path) && !consumed.contains(*path))
        .filter_map(|(_, legs)| legs.local.as_ref())
        .filter(|obs| obs.kind == ItemKind::File && obs.issue.is_none())
        .collect();
    local_new.sort_by(|a, b| a.path.cmp(&b.path));

    for observation in local_new {
        if tree.remote_at(&observation.path).is_some() {
            continue;
        }
        let Some(obs_sum) = &observation.checksum else {
            continue;
        };

        let matches: Vec<&JournalRecord> = records
            .iter()
            .filter(|record| {
                record.kind == ItemKind::File
                    && !consumed.contains(&record.path)
                    && tree.local_at(&record.path).is_none()
                    && tree.local_absence_trusted(&record.path)
                    && record.size == observation.size
                    && record.checksum.as_ref() == Some(obs_sum)
            })
            .collect();
        let [record] = matches.as_slice() else {
            continue;
        };
        // The remote side must still hold the old version; a concurrent
        // remote edit turns this into separate add/remove legs.
        let remote_unmoved = tree
            .remote_at(&record.path)
            .map(|remote| remote.etag == record.etag)
            .unwrap_or(false);
        if !remote_unmoved {
            continue;
        }

        debug!(
            "Inferred local rename {} -> {} (item {})",
            record.path, observation.path, record.item_id
        );
        consumed.insert(record.path.clone());
        consumed.insert(observation.path.clone());
        renames.push(PlanItem::new(
            observation.path.clone(),
            Comparison {
                record: Some((*record).clone()),
                local: Some(observation.clone()),
                remote: tree.remote_at(&record.path).cloned(),
            },
            SyncInstruction::Renamed {
                from: record.path.clone(),
                to: observation.path.clone(),
                direction: Direction::Upload,
            },
        ));
    }

    renames
}

/// Whole-subtree conflict promotion: a directory removal is only final once
/// every descendant resolved quietly. A changed, conflicted, erroring, or
/// non-deletable descendant reinstates the ancestor: the directory is
/// recreated on the side that deleted it while the descendant proceeds on
/// its own.
fn promote_vetoed_removals(candidates: &mut [PlanItem], non_deletable: &HashSet<RelPath>) {
    let mut removal_dirs: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, item)| {
            matches!(item.instruction, SyncInstruction::Removed(_))
                && item.kind() == Some(ItemKind::Directory)
        })
        .map(|(idx, _)| idx)
        .collect();
    // Deepest first, so a promoted child directory vetoes its ancestors.
    removal_dirs.sort_by_key(|idx| std::cmp::Reverse(candidates[*idx].path.depth()));

    for idx in removal_dirs {
        let dir = candidates[idx].path.clone();
        let veto = non_deletable.iter().any(|p| p.is_within(&dir))
            || candidates.iter().any(|item| {
                item.path != dir
                    && item.path.is_within(&dir)
                    && blocks_parent_removal(&item.instruction)
            });
        if !veto {
            continue;
        }

        let SyncInstruction::Removed(side) = candidates[idx].instruction.clone() else {
            continue;
        };
        let restored = match side {
            // Deleted remotely, but something below must survive: put the
            // directory back on the server.
            Side::Remote => SyncInstruction::New(Direction::Upload),
            // Deleted locally: bring the directory back from the server.
            Side::Local => SyncInstruction::New(Direction::Download),
        };
        info!(
            "Removal of {} vetoed by changed descendants, restoring instead",
            dir
        );
        candidates[idx].instruction = restored;
    }
}

fn blocks_parent_removal(instruction: &SyncInstruction) -> bool {
    match instruction {
        SyncInstruction::Updated(_)
        | SyncInstruction::New(_)
        | SyncInstruction::Conflict
        | SyncInstruction::TypeChanged
        | SyncInstruction::Error(_) => true,
        SyncInstruction::Renamed { .. } => true,
        SyncInstruction::NoOp
        | SyncInstruction::Removed(_)
        | SyncInstruction::Ignored(_) => false,
    }
}
