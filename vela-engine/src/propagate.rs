//! Per-instruction executors
//!
//! One method per instruction kind, shared by the scheduler's workers. Every
//! successful execution commits its journal mutation before returning; that
//! commit is what releases dependent jobs, and what a crashed run resumes
//! from.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use vela_journal::{
    Checksum, ItemId, ItemKind, Journal, JournalMutation, JournalRecord, PinState, RelPath,
};
use vela_remote::{
    CancelFlag, DownloadExpectation, RemoteEntry, RemoteObservation, RemoteStore, TransferManager,
};

use crate::context::{AppliedChange, PlaceholderLayer, SpaceProbe};
use crate::errors::{EngineError, Result};
use crate::instruction::{Direction, PlanItem, Side, SyncInstruction};

/// Counter-relevant effect of one applied job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    Uploaded { bytes: u64 },
    Downloaded { bytes: u64 },
    Deleted,
    Renamed,
    ConflictResolved { downloaded: u64, uploaded: Option<u64> },
}

/// Executes reconciled instructions against both sides.
pub struct Propagator {
    root: PathBuf,
    journal: Arc<Journal>,
    store: Arc<dyn RemoteStore>,
    transfer: TransferManager,
    placeholders: Arc<dyn PlaceholderLayer>,
    space: Arc<dyn SpaceProbe>,
    cancel: CancelFlag,
    disk_floor: u64,
}

impl Propagator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: PathBuf,
        journal: Arc<Journal>,
        store: Arc<dyn RemoteStore>,
        transfer: TransferManager,
        placeholders: Arc<dyn PlaceholderLayer>,
        space: Arc<dyn SpaceProbe>,
        cancel: CancelFlag,
        disk_floor: u64,
    ) -> Self {
        Self {
            root,
            journal,
            store,
            transfer,
            placeholders,
            space,
            cancel,
            disk_floor,
        }
    }

    pub async fn execute(&self, item: &PlanItem) -> Result<Effect> {
        self.cancel.check().map_err(EngineError::Remote)?;

        match &item.instruction {
            SyncInstruction::NoOp => self.refresh_journal(item).await,
            SyncInstruction::New(Direction::Upload) => self.push(item, false).await,
            SyncInstruction::Updated(Direction::Upload) => self.push(item, true).await,
            SyncInstruction::New(Direction::Download)
            | SyncInstruction::Updated(Direction::Download) => self.pull(item).await,
            SyncInstruction::Removed(Side::Local) => self.delete_remote(item).await,
            SyncInstruction::Removed(Side::Remote) => self.delete_local(item).await,
            SyncInstruction::Renamed {
                from,
                to,
                direction,
            } => self.rename(item, from, to, *direction).await,
            SyncInstruction::TypeChanged => self.replace_kind(item).await,
            SyncInstruction::Conflict => self.keep_both(item).await,
            SyncInstruction::Error(_) if item.restore_download => self.pull(item).await,
            SyncInstruction::Ignored(_) | SyncInstruction::Error(_) => Ok(Effect::None),
        }
    }

    /// NoOp with drift between journal and remote metadata: refresh or adopt
    /// the record without moving any content.
    async fn refresh_journal(&self, item: &PlanItem) -> Result<Effect> {
        let Some(remote) = &item.comparison.remote else {
            return Ok(Effect::None);
        };
        let needs_refresh = match &item.comparison.record {
            None => true,
            Some(record) => record.etag != remote.etag || record.permissions != remote.permissions,
        };
        if !needs_refresh {
            return Ok(Effect::None);
        }

        let mtime = item
            .comparison
            .local
            .as_ref()
            .map(|l| l.mtime)
            .or_else(|| item.comparison.record.as_ref().map(|r| r.mtime))
            .unwrap_or_else(Utc::now);
        let checksum = item
            .comparison
            .local
            .as_ref()
            .and_then(|l| l.checksum.clone())
            .or_else(|| remote.checksum.clone());

        debug!("Refreshing journal metadata for {}", item.path);
        let record = self.record_from_remote(item, remote, mtime, checksum)?;
        self.journal.apply(&JournalMutation::Upsert(record))?;
        Ok(Effect::None)
    }

    /// Create or update the remote side from local content.
    async fn push(&self, item: &PlanItem, overwrite: bool) -> Result<Effect> {
        if item.kind() == Some(ItemKind::Directory) {
            let entry = self.store.create_directory(&item.path).await?;
            let record = self.record_from_entry(item, &entry, ItemKind::Directory, 0, None)?;
            self.journal.apply(&JournalMutation::Upsert(record))?;
            return Ok(Effect::None);
        }

        let local_path = item.path.to_fs_path(&self.root);
        if self.placeholders.needs_materialization(&item.path).await {
            self.placeholders
                .materialize(&item.path)
                .await
                .map_err(|e| EngineError::Placeholder(e.to_string()))?;
        }

        let snapshot = self.transfer.snapshot_file(&local_path).await?;
        let expected_etag = if overwrite {
            item.comparison.record.as_ref().map(|r| r.etag.clone())
        } else {
            None
        };
        let entry = self
            .transfer
            .upload(
                &local_path,
                &item.path,
                &snapshot,
                expected_etag.as_deref(),
                &self.cancel,
            )
            .await?;

        info!("Uploaded {} ({} bytes)", item.path, snapshot.size);
        let mut record = self.record_from_entry(
            item,
            &entry,
            ItemKind::File,
            snapshot.size,
            Some(snapshot.checksum.clone()),
        )?;
        record.mtime = snapshot.mtime;
        self.journal.apply(&JournalMutation::Upsert(record))?;
        Ok(Effect::Uploaded {
            bytes: snapshot.size,
        })
    }

    /// Create or update the local side from remote content.
    async fn pull(&self, item: &PlanItem) -> Result<Effect> {
        let Some(remote) = item.comparison.remote.clone() else {
            return Err(EngineError::Setup(format!(
                "download of {} has no remote leg",
                item.path
            )));
        };

        if remote.kind == ItemKind::Directory {
            let local_path = item.path.to_fs_path(&self.root);
            match tokio::fs::create_dir(&local_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
            let record = self.record_from_remote(item, &remote, Utc::now(), None)?;
            self.journal.apply(&JournalMutation::Upsert(record))?;
            self.placeholders
                .on_applied(&AppliedChange::Created {
                    path: item.path.clone(),
                    kind: ItemKind::Directory,
                })
                .await;
            return Ok(Effect::None);
        }

        // Placeholder-only items keep their bytes remote; only the journal
        // and the projection learn about the new version.
        let pin = item
            .comparison
            .record
            .as_ref()
            .map(|r| r.pin_state)
            .unwrap_or(PinState::Inherited);
        if pin == PinState::OnlineOnly {
            debug!("{} is online-only, recording metadata without content", item.path);
            let record =
                self.record_from_remote(item, &remote, Utc::now(), remote.checksum.clone())?;
            self.journal.apply(&JournalMutation::Upsert(record))?;
            self.placeholders
                .on_applied(&AppliedChange::Updated {
                    path: item.path.clone(),
                })
                .await;
            return Ok(Effect::None);
        }

        if let Some(free) = self.space.free_bytes(&self.root) {
            let projected = free.saturating_sub(remote.size);
            if projected < self.disk_floor {
                return Err(EngineError::DiskFull {
                    free,
                    floor: self.disk_floor,
                });
            }
        }

        let final_path = item.path.to_fs_path(&self.root);
        let temp_path = part_file_path(&final_path);
        let expectation = DownloadExpectation {
            etag: remote.etag.clone(),
            size: remote.size,
            checksum: remote.checksum.clone(),
        };
        let downloaded = match self
            .transfer
            .download_to(&item.path, &temp_path, &expectation, &self.cancel)
            .await
        {
            Ok(downloaded) => downloaded,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(e.into());
            }
        };
        tokio::fs::rename(&temp_path, &final_path).await?;

        let mtime = tokio::fs::metadata(&final_path)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        info!("Downloaded {} ({} bytes)", item.path, downloaded.size);
        let mut record =
            self.record_from_remote(item, &remote, mtime, Some(downloaded.checksum.clone()))?;
        record.etag = downloaded.etag.clone();
        record.size = downloaded.size;
        self.journal.apply(&JournalMutation::Upsert(record))?;

        let change = if item.comparison.record.is_some() {
            AppliedChange::Updated {
                path: item.path.clone(),
            }
        } else {
            AppliedChange::Created {
                path: item.path.clone(),
                kind: ItemKind::File,
            }
        };
        self.placeholders.on_applied(&change).await;
        Ok(Effect::Downloaded {
            bytes: downloaded.size,
        })
    }

    async fn delete_remote(&self, item: &PlanItem) -> Result<Effect> {
        let record = item.comparison.record.as_ref().ok_or_else(|| {
            EngineError::Setup(format!("remote delete of {} has no record", item.path))
        })?;
        match self.store.delete(&item.path, Some(record.etag.as_str())).await {
            Ok(()) => {}
            // Already gone on the server; the journal just catches up.
            Err(vela_remote::RemoteError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.journal
            .apply(&JournalMutation::Delete(record.item_id.clone()))?;
        info!("Deleted {} on the server", item.path);
        Ok(Effect::Deleted)
    }

    async fn delete_local(&self, item: &PlanItem) -> Result<Effect> {
        let local_path = item.path.to_fs_path(&self.root);
        match tokio::fs::metadata(&local_path).await {
            Ok(metadata) => {
                if metadata.is_dir() {
                    tokio::fs::remove_dir_all(&local_path).await?;
                } else {
                    tokio::fs::remove_file(&local_path).await?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(record) = &item.comparison.record {
            self.journal
                .apply(&JournalMutation::Delete(record.item_id.clone()))?;
        }
        self.placeholders
            .on_applied(&AppliedChange::Removed {
                path: item.path.clone(),
            })
            .await;
        info!("Deleted {} locally", item.path);
        Ok(Effect::Deleted)
    }

    async fn rename(
        &self,
        item: &PlanItem,
        from: &RelPath,
        to: &RelPath,
        direction: Direction,
    ) -> Result<Effect> {
        let record = item.comparison.record.as_ref().ok_or_else(|| {
            EngineError::Setup(format!("rename of {} has no record", item.path))
        })?;

        let new_etag = match direction {
            Direction::Upload => {
                let entry = self.store.move_item(from, to).await?;
                entry.etag
            }
            Direction::Download => {
                let from_fs = from.to_fs_path(&self.root);
                let to_fs = to.to_fs_path(&self.root);
                if tokio::fs::metadata(&from_fs).await.is_ok() {
                    tokio::fs::rename(&from_fs, &to_fs).await?;
                } else if tokio::fs::metadata(&to_fs).await.is_ok() {
                    // Already in place: an ancestor directory rename moved
                    // this entry along with it.
                } else {
                    // The local copy is gone; restore content at the target.
                    warn!("Local file missing for rename {} -> {}, downloading", from, to);
                    let restored = PlanItem::new(
                        to.clone(),
                        item.comparison.clone(),
                        SyncInstruction::New(Direction::Download),
                    );
                    self.pull(&restored).await?;
                }
                item.comparison
                    .remote
                    .as_ref()
                    .map(|r| r.etag.clone())
                    .unwrap_or_else(|| record.etag.clone())
            }
        };

        self.journal.apply(&JournalMutation::Rename {
            item_id: record.item_id.clone(),
            to: to.clone(),
        })?;
        let mut refreshed = record.clone();
        refreshed.path = to.clone();
        refreshed.parent_id = self.parent_id(to)?;
        refreshed.etag = new_etag;
        self.journal.apply(&JournalMutation::Upsert(refreshed))?;

        self.placeholders
            .on_applied(&AppliedChange::Renamed {
                from: from.clone(),
                to: to.clone(),
            })
            .await;
        info!("Renamed {} -> {}", from, to);
        Ok(Effect::Renamed)
    }

    /// File and directory swapped kinds: the remote kind wins, and a locally
    /// modified file is preserved as a conflict copy before being replaced.
    async fn replace_kind(&self, item: &PlanItem) -> Result<Effect> {
        let local_path = item.path.to_fs_path(&self.root);
        let locally_modified = item.comparison.local_changed()
            && item
                .comparison
                .local
                .as_ref()
                .map(|l| l.kind == ItemKind::File)
                .unwrap_or(false);

        match tokio::fs::metadata(&local_path).await {
            Ok(metadata) if metadata.is_dir() => {
                tokio::fs::remove_dir_all(&local_path).await?;
            }
            Ok(_) => {
                if locally_modified {
                    let copy = free_conflict_path(&self.root, &item.path).await;
                    warn!(
                        "Type of {} changed remotely; keeping local edit as {}",
                        item.path, copy
                    );
                    tokio::fs::rename(&local_path, copy.to_fs_path(&self.root)).await?;
                } else {
                    tokio::fs::remove_file(&local_path).await?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // The old identity is gone either way.
        if let Some(record) = &item.comparison.record {
            self.journal
                .apply(&JournalMutation::Delete(record.item_id.clone()))?;
        }

        let replacement = PlanItem::new(
            item.path.clone(),
            crate::instruction::Comparison {
                record: None,
                local: None,
                remote: item.comparison.remote.clone(),
            },
            SyncInstruction::New(Direction::Download),
        );
        self.pull(&replacement).await
    }

    /// Keep-both conflict resolution: the remote version lands on the
    /// canonical path, the divergent local version survives as a conflict
    /// copy and is re-uploaded when permitted.
    async fn keep_both(&self, item: &PlanItem) -> Result<Effect> {
        let copy = match &item.conflict_copy {
            Some(copy) => copy.clone(),
            None => crate::instruction::conflict_copy_path(&item.path),
        };
        let copy = if tokio::fs::metadata(copy.to_fs_path(&self.root)).await.is_ok() {
            free_conflict_path(&self.root, &item.path).await
        } else {
            copy
        };

        let local_path = item.path.to_fs_path(&self.root);
        tokio::fs::rename(&local_path, copy.to_fs_path(&self.root)).await?;
        info!("Conflict on {}: local version preserved as {}", item.path, copy);

        // Remote content takes the canonical path.
        let canonical = PlanItem::new(
            item.path.clone(),
            item.comparison.clone(),
            SyncInstruction::Updated(Direction::Download),
        );
        let downloaded = match self.pull(&canonical).await? {
            Effect::Downloaded { bytes } => bytes,
            _ => 0,
        };
        if let Some(record) = &item.comparison.record {
            self.journal.apply(&JournalMutation::SetConflict {
                item_id: record.item_id.clone(),
                flag: false,
            })?;
        }

        // The preserved copy goes back up as a brand-new item when rights
        // allow; otherwise it stays local-only and the next run ignores it.
        let mut uploaded = None;
        if item.upload_conflict_copy {
            let copy_fs = copy.to_fs_path(&self.root);
            let snapshot = self.transfer.snapshot_file(&copy_fs).await?;
            let entry = self
                .transfer
                .upload(&copy_fs, &copy, &snapshot, None, &self.cancel)
                .await?;
            let record = JournalRecord {
                item_id: entry.id.clone(),
                path: copy.clone(),
                parent_id: self.parent_id(&copy)?,
                etag: entry.etag.clone(),
                size: snapshot.size,
                mtime: snapshot.mtime,
                permissions: entry.permissions,
                checksum: Some(snapshot.checksum.clone()),
                kind: ItemKind::File,
                pin_state: PinState::Inherited,
                in_conflict: false,
            };
            self.journal.apply(&JournalMutation::Upsert(record))?;
            uploaded = Some(snapshot.size);
        }

        Ok(Effect::ConflictResolved {
            downloaded,
            uploaded,
        })
    }

    fn parent_id(&self, path: &RelPath) -> Result<Option<ItemId>> {
        let Some(parent) = path.parent() else {
            return Ok(None);
        };
        if parent.is_root() {
            return Ok(None);
        }
        Ok(self.journal.get_by_path(&parent)?.map(|r| r.item_id))
    }

    fn record_from_remote(
        &self,
        item: &PlanItem,
        remote: &RemoteObservation,
        mtime: DateTime<Utc>,
        checksum: Option<Checksum>,
    ) -> Result<JournalRecord> {
        Ok(JournalRecord {
            item_id: remote.item_id.clone(),
            path: item.path.clone(),
            parent_id: self.parent_id(&item.path)?,
            etag: remote.etag.clone(),
            size: remote.size,
            mtime,
            permissions: remote.permissions,
            checksum,
            kind: remote.kind,
            pin_state: item
                .comparison
                .record
                .as_ref()
                .map(|r| r.pin_state)
                .unwrap_or(PinState::Inherited),
            in_conflict: false,
        })
    }

    fn record_from_entry(
        &self,
        item: &PlanItem,
        entry: &RemoteEntry,
        kind: ItemKind,
        size: u64,
        checksum: Option<Checksum>,
    ) -> Result<JournalRecord> {
        Ok(JournalRecord {
            item_id: entry.id.clone(),
            path: item.path.clone(),
            parent_id: self.parent_id(&item.path)?,
            etag: entry.etag.clone(),
            size,
            mtime: entry.mtime.unwrap_or_else(Utc::now),
            permissions: entry.permissions,
            checksum,
            kind,
            pin_state: item
                .comparison
                .record
                .as_ref()
                .map(|r| r.pin_state)
                .unwrap_or(PinState::Inherited),
            in_conflict: false,
        })
    }
}

/// Temp-file sibling used while a download is in flight.
fn part_file_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    final_path.with_file_name(format!(".{name}.vela-part"))
}

/// First conflict-copy name that does not collide on disk.
async fn free_conflict_path(root: &Path, path: &RelPath) -> RelPath {
    let base = crate::instruction::conflict_copy_path(path);
    if tokio::fs::metadata(base.to_fs_path(root)).await.is_err() {
        return base;
    }
    for n in 2..100 {
        let name = path.name();
        let renamed = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => {
                format!("{stem} (conflicted copy {n}).{ext}")
            }
            _ => format!("{name} (conflicted copy {n})"),
        };
        let candidate = match path.parent() {
            Some(parent) if !parent.is_root() => parent.join(&renamed),
            _ => RelPath::new(&renamed),
        };
        if tokio::fs::metadata(candidate.to_fs_path(root)).await.is_err() {
            return candidate;
        }
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_file_is_hidden_sibling() {
        let part = part_file_path(Path::new("/data/docs/report.pdf"));
        assert_eq!(part, Path::new("/data/docs/.report.pdf.vela-part"));
    }

    #[tokio::test]
    async fn conflict_path_skips_existing_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a (conflicted copy).txt"), b"x").unwrap();

        let free = free_conflict_path(dir.path(), &RelPath::new("a.txt")).await;
        assert_eq!(free.as_str(), "a (conflicted copy 2).txt");
    }
}
