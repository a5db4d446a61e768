//! Sync instructions and comparisons
//!
//! One run produces exactly one [`SyncInstruction`] per known item. The
//! instruction set is a closed enum matched exhaustively by the scheduler;
//! new operation kinds extend the enum, not a class hierarchy.

use std::fmt;

use vela_journal::{same_mtime, JournalRecord, LocalObservation, RelPath, ScanIssue};
use vela_remote::RemoteObservation;

/// Which way content moves for an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local state wins; push to the remote store.
    Upload,
    /// Remote state wins; pull to the local tree.
    Download,
}

/// Which side originated a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

/// Why an item is excluded from synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UnsupportedLink,
    ReservedName,
    Blacklisted,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            IgnoreReason::UnsupportedLink => "unsupported-link",
            IgnoreReason::ReservedName => "reserved-name",
            IgnoreReason::Blacklisted => "blacklisted",
        };
        f.write_str(text)
    }
}

/// Why an item cannot be propagated this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorReason {
    PermissionDenied,
    Unreadable,
    Other(String),
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReason::PermissionDenied => f.write_str("permission-denied"),
            ErrorReason::Unreadable => f.write_str("unreadable"),
            ErrorReason::Other(reason) => f.write_str(reason),
        }
    }
}

/// What reconciliation decided for one item.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncInstruction {
    /// Nothing to transfer; may still refresh journal metadata.
    NoOp,
    /// Item exists on one side only and gets created on the other.
    New(Direction),
    /// Item was removed on `Side` and the removal propagates to the other.
    Removed(Side),
    /// Content changed on one side only.
    Updated(Direction),
    /// Item moved; identity is preserved.
    Renamed {
        from: RelPath,
        to: RelPath,
        direction: Direction,
    },
    /// File and directory swapped kinds between the legs.
    TypeChanged,
    /// Divergent edits on both sides; resolved keep-both.
    Conflict,
    /// Excluded from sync, surfaced as skipped.
    Ignored(IgnoreReason),
    /// Cannot be propagated; surfaced as an error.
    Error(ErrorReason),
}

impl SyncInstruction {
    /// Short name for logs and outcome reports.
    pub fn label(&self) -> &'static str {
        match self {
            SyncInstruction::NoOp => "no-op",
            SyncInstruction::New(Direction::Upload) => "new-upload",
            SyncInstruction::New(Direction::Download) => "new-download",
            SyncInstruction::Removed(Side::Local) => "removed-locally",
            SyncInstruction::Removed(Side::Remote) => "removed-remotely",
            SyncInstruction::Updated(Direction::Upload) => "updated-upload",
            SyncInstruction::Updated(Direction::Download) => "updated-download",
            SyncInstruction::Renamed { .. } => "renamed",
            SyncInstruction::TypeChanged => "type-changed",
            SyncInstruction::Conflict => "conflict",
            SyncInstruction::Ignored(_) => "ignored",
            SyncInstruction::Error(_) => "error",
        }
    }
}

/// The three-way comparison a classification decides on.
#[derive(Debug, Clone, Default)]
pub struct Comparison {
    pub record: Option<JournalRecord>,
    pub local: Option<LocalObservation>,
    pub remote: Option<RemoteObservation>,
}

impl Comparison {
    /// A local item counts as changed when no record exists, the recorded
    /// `(size, mtime)` no longer match, or the entry turned unreadable.
    pub fn local_changed(&self) -> bool {
        let Some(local) = &self.local else {
            return false;
        };
        if matches!(local.issue, Some(ScanIssue::Unreadable)) {
            return true;
        }
        match &self.record {
            None => true,
            Some(record) => record.size != local.size || !same_mtime(&record.mtime, &local.mtime),
        }
    }

    /// A remote item counts as changed when its etag moved past the record.
    pub fn remote_changed(&self) -> bool {
        match (&self.record, &self.remote) {
            (Some(record), Some(remote)) => record.etag != remote.etag,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    /// True when both legs carry checksums that agree: a double edit that
    /// converged on identical content.
    pub fn checksums_match(&self) -> bool {
        match (&self.local, &self.remote) {
            (Some(local), Some(remote)) => match (&local.checksum, &remote.checksum) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            _ => false,
        }
    }
}

/// One reconciled item, ready for scheduling.
#[derive(Debug, Clone)]
pub struct PlanItem {
    /// Canonical path this run (the rename target for renames).
    pub path: RelPath,
    pub comparison: Comparison,
    pub instruction: SyncInstruction,
    /// Where the divergent local version goes for keep-both conflicts.
    pub conflict_copy: Option<RelPath>,
    /// Whether the conflict copy is re-uploaded this run (requires create
    /// rights on the parent) or left local-only.
    pub upload_conflict_copy: bool,
    /// Overwrite the illegal local edit of a read-only item with the server
    /// version while the instruction itself reports the permission error.
    pub restore_download: bool,
}

impl PlanItem {
    pub fn new(path: RelPath, comparison: Comparison, instruction: SyncInstruction) -> Self {
        Self {
            path,
            comparison,
            instruction,
            conflict_copy: None,
            upload_conflict_copy: false,
            restore_download: false,
        }
    }

    pub fn kind(&self) -> Option<vela_journal::ItemKind> {
        self.comparison
            .local
            .as_ref()
            .map(|l| l.kind)
            .or_else(|| self.comparison.remote.as_ref().map(|r| r.kind))
            .or_else(|| self.comparison.record.as_ref().map(|r| r.kind))
    }
}

/// Build the conflict-copy sibling path: the marker lands before the
/// extension, `report.pdf` → `report (conflicted copy).pdf`.
pub fn conflict_copy_path(path: &RelPath) -> RelPath {
    let name = path.name();
    let renamed = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} (conflicted copy).{ext}"),
        _ => format!("{name} (conflicted copy)"),
    };
    match path.parent() {
        Some(parent) => parent.join(&renamed),
        None => RelPath::new(&renamed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vela_journal::{Checksum, ItemId, ItemKind, Permissions, PinState};

    fn record(etag: &str, size: u64) -> JournalRecord {
        JournalRecord {
            item_id: ItemId::new("I1"),
            path: RelPath::new("a.txt"),
            parent_id: None,
            etag: etag.to_string(),
            size,
            mtime: Utc::now(),
            permissions: Permissions::all(),
            checksum: None,
            kind: ItemKind::File,
            pin_state: PinState::Inherited,
            in_conflict: false,
        }
    }

    fn local(size: u64) -> LocalObservation {
        LocalObservation {
            path: RelPath::new("a.txt"),
            kind: ItemKind::File,
            size,
            mtime: Utc::now(),
            mode: None,
            inode: None,
            issue: None,
            checksum: None,
        }
    }

    fn remote(etag: &str) -> RemoteObservation {
        RemoteObservation {
            item_id: ItemId::new("I1"),
            path: RelPath::new("a.txt"),
            kind: ItemKind::File,
            etag: etag.to_string(),
            size: 10,
            permissions: Permissions::all(),
            checksum: None,
        }
    }

    #[test]
    fn change_predicates() {
        let rec = record("e1", 10);

        let unchanged = Comparison {
            local: Some(LocalObservation {
                size: 10,
                mtime: rec.mtime,
                ..local(10)
            }),
            remote: Some(remote("e1")),
            record: Some(rec.clone()),
        };
        assert!(!unchanged.local_changed());
        assert!(!unchanged.remote_changed());

        let edited = Comparison {
            local: Some(local(22)),
            remote: Some(remote("e2")),
            record: Some(rec),
        };
        assert!(edited.local_changed());
        assert!(edited.remote_changed());

        let no_record = Comparison {
            local: Some(local(5)),
            remote: None,
            record: None,
        };
        assert!(no_record.local_changed());
    }

    #[test]
    fn converged_double_edit() {
        let sum = Checksum::blake3_of(b"same");
        let cmp = Comparison {
            record: Some(record("e1", 4)),
            local: Some(LocalObservation {
                checksum: Some(sum.clone()),
                ..local(4)
            }),
            remote: Some(RemoteObservation {
                checksum: Some(sum),
                ..remote("e2")
            }),
        };
        assert!(cmp.checksums_match());
    }

    #[test]
    fn conflict_copy_naming() {
        assert_eq!(
            conflict_copy_path(&RelPath::new("docs/report.pdf")).as_str(),
            "docs/report (conflicted copy).pdf"
        );
        assert_eq!(
            conflict_copy_path(&RelPath::new("Makefile")).as_str(),
            "Makefile (conflicted copy)"
        );
        assert_eq!(
            conflict_copy_path(&RelPath::new(".hidden")).as_str(),
            ".hidden (conflicted copy)"
        );
    }
}
