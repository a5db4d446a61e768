//! Reconciliation engine
//!
//! Applies policy on top of discovery's raw classification: selective-sync
//! exclusion, permission downgrades with restore synthesis, read-only
//! protection, and the keep-both conflict policy. Exactly one instruction
//! per item leaves this stage; ordering is decided later by the scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};
use vela_journal::{ItemKind, Permissions, RelPath};

use crate::context::SelectiveSync;
use crate::instruction::{
    conflict_copy_path, Direction, ErrorReason, IgnoreReason, PlanItem, Side, SyncInstruction,
};

/// Policy pass over the discovered candidates.
pub struct ReconciliationEngine {
    selective: Arc<dyn SelectiveSync>,
}

impl ReconciliationEngine {
    pub fn new(selective: Arc<dyn SelectiveSync>) -> Self {
        Self { selective }
    }

    pub fn reconcile(&self, mut candidates: Vec<PlanItem>) -> Vec<PlanItem> {
        // Remote permissions per path, for parent lookups. The remote leg is
        // current truth; the journal record fills in for items the listing
        // missed.
        let permissions: HashMap<RelPath, Permissions> = candidates
            .iter()
            .filter_map(|item| {
                item.comparison
                    .remote
                    .as_ref()
                    .map(|r| (r.path.clone(), r.permissions))
                    .or_else(|| {
                        item.comparison
                            .record
                            .as_ref()
                            .map(|r| (r.path.clone(), r.permissions))
                    })
            })
            .collect();

        let mut conflicts = 0usize;
        for item in &mut candidates {
            self.apply_policy(item, &permissions);
            if matches!(item.instruction, SyncInstruction::Conflict) {
                conflicts += 1;
            }
        }
        if conflicts > 0 {
            info!("Reconciliation kept both sides for {} conflicted items", conflicts);
        }
        candidates
    }

    fn apply_policy(&self, item: &mut PlanItem, permissions: &HashMap<RelPath, Permissions>) {
        // Selective-sync exclusion wins over everything, new descendants
        // included: a blacklisted subtree is neither created, changed, nor
        // deleted by the engine.
        if self.selective.is_blacklisted(&item.path) {
            debug!("{} is excluded by selective sync", item.path);
            item.instruction = SyncInstruction::Ignored(IgnoreReason::Blacklisted);
            return;
        }

        match &item.instruction {
            SyncInstruction::New(Direction::Upload) => {
                if !self.may_create(&item.path, item.kind(), permissions) {
                    item.instruction = SyncInstruction::Error(ErrorReason::PermissionDenied);
                }
            }

            SyncInstruction::Updated(Direction::Upload) => {
                // A read-only remote item that was locally modified cannot be
                // pushed; the server version is restored over the illegal
                // edit, and the item is reported as a permission error.
                if !self.may_write(item, permissions) {
                    debug!(
                        "{} is read-only on the server, restoring server version",
                        item.path
                    );
                    item.instruction = SyncInstruction::Error(ErrorReason::PermissionDenied);
                    item.restore_download = true;
                }
            }

            SyncInstruction::Removed(Side::Local) => {
                // The local delete of an undeletable item does not propagate;
                // the item is restored locally instead.
                let deletable = item
                    .comparison
                    .record
                    .as_ref()
                    .map(|r| r.permissions.can_delete())
                    .unwrap_or(true);
                if !deletable {
                    debug!("{} may not be deleted remotely, restoring locally", item.path);
                    item.instruction = match item.kind() {
                        Some(ItemKind::Directory) => SyncInstruction::New(Direction::Download),
                        _ => SyncInstruction::Updated(Direction::Download),
                    };
                }
            }

            SyncInstruction::Renamed {
                direction: Direction::Upload,
                to,
                ..
            } => {
                let renameable = item
                    .comparison
                    .record
                    .as_ref()
                    .map(|r| r.permissions.can_rename())
                    .unwrap_or(true);
                if !renameable || !self.may_create(to, item.kind(), permissions) {
                    item.instruction = SyncInstruction::Error(ErrorReason::PermissionDenied);
                }
            }

            SyncInstruction::Conflict => {
                // Keep-both: remote content takes the canonical path, the
                // divergent local version moves to a conflict-suffixed
                // sibling and is re-uploaded when rights allow. Nothing is
                // discarded either way.
                let copy = conflict_copy_path(&item.path);
                item.upload_conflict_copy =
                    self.may_create(&copy, Some(ItemKind::File), permissions);
                item.conflict_copy = Some(copy);
            }

            _ => {}
        }
    }

    /// Create rights on the target's parent directory. Unknown parents are
    /// assumed writable; the server still enforces the truth.
    fn may_create(
        &self,
        path: &RelPath,
        kind: Option<ItemKind>,
        permissions: &HashMap<RelPath, Permissions>,
    ) -> bool {
        let Some(parent) = path.parent() else {
            return true;
        };
        let Some(perms) = lookup_dir(&parent, permissions) else {
            return true;
        };
        match kind {
            Some(ItemKind::Directory) => perms.can_create_dir(),
            _ => perms.can_create_file(),
        }
    }

    fn may_write(&self, item: &PlanItem, permissions: &HashMap<RelPath, Permissions>) -> bool {
        if let Some(remote) = &item.comparison.remote {
            return remote.permissions.can_write();
        }
        permissions
            .get(&item.path)
            .map(|p| p.can_write())
            .unwrap_or(true)
    }
}

fn lookup_dir(path: &RelPath, permissions: &HashMap<RelPath, Permissions>) -> Option<Permissions> {
    if path.is_root() {
        return None;
    }
    permissions.get(path).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{NoBlacklist, SubtreeBlacklist};
    use crate::instruction::Comparison;
    use chrono::Utc;
    use vela_journal::{ItemId, JournalRecord, LocalObservation, PinState};
    use vela_remote::RemoteObservation;

    fn record(path: &str, perms: Permissions) -> JournalRecord {
        JournalRecord {
            item_id: ItemId::new(format!("id-{path}")),
            path: RelPath::new(path),
            parent_id: None,
            etag: "e1".to_string(),
            size: 10,
            mtime: Utc::now(),
            permissions: perms,
            checksum: None,
            kind: ItemKind::File,
            pin_state: PinState::Inherited,
            in_conflict: false,
        }
    }

    fn local(path: &str) -> LocalObservation {
        LocalObservation {
            path: RelPath::new(path),
            kind: ItemKind::File,
            size: 20,
            mtime: Utc::now(),
            mode: None,
            inode: None,
            issue: None,
            checksum: None,
        }
    }

    fn remote(path: &str, kind: ItemKind, perms: Permissions) -> RemoteObservation {
        RemoteObservation {
            item_id: ItemId::new(format!("id-{path}")),
            path: RelPath::new(path),
            kind,
            etag: "e2".to_string(),
            size: 10,
            permissions: perms,
            checksum: None,
        }
    }

    fn item(path: &str, instruction: SyncInstruction, comparison: Comparison) -> PlanItem {
        PlanItem::new(RelPath::new(path), comparison, instruction)
    }

    #[test]
    fn blacklisted_subtree_is_ignored_including_new_descendants() {
        let engine = ReconciliationEngine::new(Arc::new(SubtreeBlacklist::new(vec![
            RelPath::new("excluded"),
        ])));

        let items = engine.reconcile(vec![
            item(
                "excluded/new.txt",
                SyncInstruction::New(Direction::Download),
                Comparison::default(),
            ),
            item(
                "kept.txt",
                SyncInstruction::New(Direction::Download),
                Comparison::default(),
            ),
        ]);

        assert_eq!(
            items[0].instruction,
            SyncInstruction::Ignored(IgnoreReason::Blacklisted)
        );
        assert_eq!(items[1].instruction, SyncInstruction::New(Direction::Download));
    }

    #[test]
    fn read_only_remote_edit_downgrades_with_restore() {
        let engine = ReconciliationEngine::new(Arc::new(NoBlacklist));
        let comparison = Comparison {
            record: Some(record("a.txt", Permissions::all())),
            local: Some(local("a.txt")),
            remote: Some(remote("a.txt", ItemKind::File, Permissions::read_only())),
        };

        let items = engine.reconcile(vec![item(
            "a.txt",
            SyncInstruction::Updated(Direction::Upload),
            comparison,
        )]);

        assert_eq!(
            items[0].instruction,
            SyncInstruction::Error(ErrorReason::PermissionDenied)
        );
        assert!(items[0].restore_download);
    }

    #[test]
    fn undeletable_item_is_restored_not_removed() {
        let engine = ReconciliationEngine::new(Arc::new(NoBlacklist));
        let comparison = Comparison {
            record: Some(record("locked.txt", Permissions(Permissions::WRITE))),
            local: None,
            remote: Some(remote("locked.txt", ItemKind::File, Permissions(Permissions::WRITE))),
        };

        let items = engine.reconcile(vec![item(
            "locked.txt",
            SyncInstruction::Removed(Side::Local),
            comparison,
        )]);

        assert_eq!(
            items[0].instruction,
            SyncInstruction::Updated(Direction::Download)
        );
    }

    #[test]
    fn upload_into_unwritable_directory_errors() {
        let engine = ReconciliationEngine::new(Arc::new(NoBlacklist));
        let parent = item(
            "readonly",
            SyncInstruction::NoOp,
            Comparison {
                record: None,
                local: None,
                remote: Some(remote("readonly", ItemKind::Directory, Permissions::read_only())),
            },
        );
        let child = item(
            "readonly/new.txt",
            SyncInstruction::New(Direction::Upload),
            Comparison {
                record: None,
                local: Some(local("readonly/new.txt")),
                remote: None,
            },
        );

        let items = engine.reconcile(vec![parent, child]);
        assert_eq!(
            items[1].instruction,
            SyncInstruction::Error(ErrorReason::PermissionDenied)
        );
    }

    #[test]
    fn conflict_gets_copy_path_and_upload_decision() {
        let engine = ReconciliationEngine::new(Arc::new(NoBlacklist));
        let comparison = Comparison {
            record: Some(record("docs/r.pdf", Permissions::all())),
            local: Some(local("docs/r.pdf")),
            remote: Some(remote("docs/r.pdf", ItemKind::File, Permissions::all())),
        };

        let items = engine.reconcile(vec![item("docs/r.pdf", SyncInstruction::Conflict, comparison)]);

        assert_eq!(
            items[0].conflict_copy,
            Some(RelPath::new("docs/r (conflicted copy).pdf"))
        );
        assert!(items[0].upload_conflict_copy);
        assert_eq!(items[0].instruction, SyncInstruction::Conflict);
    }
}
