//! Local tree scanner
//!
//! Walks the sync root depth-first and reports one [`DirectoryScan`] per
//! directory over a channel. The scanner is a pure producer: it never touches
//! the filesystem beyond reads, and its only expensive side computation is an
//! optional content checksum for files whose `(size, mtime)` no longer match
//! the journal.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::errors::Result;
use crate::journal::Journal;
use crate::types::{
    same_mtime, Checksum, DirectoryScan, ItemKind, LocalObservation, RelPath, ScanIssue,
};

/// Ignore decision for one relative path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreClass {
    NotIgnored,
    /// Ignored; may be silently deleted with its parent.
    Deletable,
    /// Ignored, but its presence blocks deleting the parent chain.
    NonDeletable,
}

/// External ignore-pattern collaborator.
pub trait IgnoreMatcher: Send + Sync {
    fn classify(&self, path: &RelPath) -> IgnoreClass;
}

/// Matcher that ignores nothing.
pub struct NoIgnores;

impl IgnoreMatcher for NoIgnores {
    fn classify(&self, _path: &RelPath) -> IgnoreClass {
        IgnoreClass::NotIgnored
    }
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Hash files whose `(size, mtime)` differ from the journal record. The
    /// hashes feed rename inference and upload retry verification.
    pub compute_checksums: bool,
    /// Read buffer for checksum computation.
    pub read_buffer: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            compute_checksums: true,
            read_buffer: 64 * 1024,
        }
    }
}

/// Depth-first scanner over one sync root.
pub struct LocalTreeScanner {
    root: std::path::PathBuf,
    journal: Arc<Journal>,
    ignores: Arc<dyn IgnoreMatcher>,
    config: ScannerConfig,
}

impl LocalTreeScanner {
    pub fn new(
        root: impl AsRef<Path>,
        journal: Arc<Journal>,
        ignores: Arc<dyn IgnoreMatcher>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            journal,
            ignores,
            config,
        }
    }

    /// Walk the subtree rooted at `start`, emitting one [`DirectoryScan`] per
    /// directory. Stops early (without error) if the receiver goes away.
    pub async fn scan(&self, start: RelPath, tx: mpsc::Sender<DirectoryScan>) -> Result<()> {
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            let (scan, subdirs) = self.scan_directory(&dir).await;
            trace!(
                "Scanned {}: {} entries, complete={}",
                dir,
                scan.entries.len(),
                scan.complete
            );
            if tx.send(scan).await.is_err() {
                debug!("Scan receiver dropped, stopping walk");
                return Ok(());
            }
            // LIFO order keeps the walk depth-first.
            pending.extend(subdirs.into_iter().rev());
        }

        Ok(())
    }

    async fn scan_directory(&self, dir: &RelPath) -> (DirectoryScan, Vec<RelPath>) {
        let fs_dir = dir.to_fs_path(&self.root);
        let mut entries = Vec::new();
        let mut non_deletable = Vec::new();
        let mut subdirs = Vec::new();

        let mut reader = match fs::read_dir(&fs_dir).await {
            Ok(reader) => reader,
            Err(e) => {
                warn!("Cannot read local directory {}: {}", dir, e);
                return (
                    DirectoryScan {
                        dir: dir.clone(),
                        entries,
                        non_deletable,
                        complete: false,
                    },
                    subdirs,
                );
            }
        };

        let mut complete = true;
        loop {
            let entry = match reader.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Directory read interrupted in {}: {}", dir, e);
                    complete = false;
                    break;
                }
            };

            let raw_name = entry.file_name();
            let Some(name) = raw_name.to_str() else {
                // Non-encodable name: observed, never synced, never fatal.
                entries.push(LocalObservation {
                    path: dir.join(&raw_name.to_string_lossy()),
                    kind: ItemKind::File,
                    size: 0,
                    mtime: DateTime::UNIX_EPOCH,
                    mode: None,
                    inode: None,
                    issue: Some(ScanIssue::ReservedName),
                    checksum: None,
                });
                continue;
            };
            let path = dir.join(name);

            match self.ignores.classify(&path) {
                IgnoreClass::NotIgnored => {}
                IgnoreClass::Deletable => {
                    trace!("Ignoring {}", path);
                    continue;
                }
                IgnoreClass::NonDeletable => {
                    trace!("Ignoring {} (blocks parent deletion)", path);
                    non_deletable.push(path);
                    continue;
                }
            }

            match self.observe_entry(&entry, path).await {
                Some(obs) => {
                    if obs.kind == ItemKind::Directory && obs.issue.is_none() {
                        subdirs.push(obs.path.clone());
                    }
                    entries.push(obs);
                }
                None => complete = false,
            }
        }

        (
            DirectoryScan {
                dir: dir.clone(),
                entries,
                non_deletable,
                complete,
            },
            subdirs,
        )
    }

    async fn observe_entry(&self, entry: &fs::DirEntry, path: RelPath) -> Option<LocalObservation> {
        let file_type = match entry.file_type().await {
            Ok(ft) => ft,
            Err(e) => {
                warn!("Cannot stat {}: {}", path, e);
                return Some(unreadable(path));
            }
        };

        if file_type.is_symlink() {
            return Some(LocalObservation {
                path,
                kind: ItemKind::File,
                size: 0,
                mtime: DateTime::UNIX_EPOCH,
                mode: None,
                inode: None,
                issue: Some(ScanIssue::UnsupportedLink),
                checksum: None,
            });
        }

        if reserved_name(path.name()) {
            return Some(LocalObservation {
                path,
                kind: if file_type.is_dir() {
                    ItemKind::Directory
                } else {
                    ItemKind::File
                },
                size: 0,
                mtime: DateTime::UNIX_EPOCH,
                mode: None,
                inode: None,
                issue: Some(ScanIssue::ReservedName),
                checksum: None,
            });
        }

        let metadata = match entry.metadata().await {
            Ok(md) => md,
            Err(e) => {
                warn!("Cannot read metadata for {}: {}", path, e);
                return Some(unreadable(path));
            }
        };

        let kind = if metadata.is_dir() {
            ItemKind::Directory
        } else {
            ItemKind::File
        };
        let size = if kind == ItemKind::File { metadata.len() } else { 0 };
        let mtime = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::UNIX_EPOCH);

        let mut obs = LocalObservation {
            path,
            kind,
            size,
            mtime,
            mode: file_mode(&metadata),
            inode: file_inode(&metadata),
            issue: None,
            checksum: None,
        };

        if kind == ItemKind::File && self.config.compute_checksums && self.looks_changed(&obs) {
            obs.checksum = self.hash_file(&obs.path).await;
        }

        Some(obs)
    }

    /// Cheap change test against the journal: no record, or `(size, mtime)`
    /// differ from the recorded values.
    fn looks_changed(&self, obs: &LocalObservation) -> bool {
        match self.journal.get_by_path(&obs.path) {
            Ok(Some(record)) => {
                record.size != obs.size || !same_mtime(&record.mtime, &obs.mtime)
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Journal lookup failed for {}: {}", obs.path, e);
                true
            }
        }
    }

    async fn hash_file(&self, path: &RelPath) -> Option<Checksum> {
        let fs_path = path.to_fs_path(&self.root);
        let mut file = match fs::File::open(&fs_path).await {
            Ok(file) => file,
            Err(e) => {
                warn!("Cannot hash {}: {}", path, e);
                return None;
            }
        };

        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; self.config.read_buffer];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    hasher.update(&buf[..n]);
                }
                Err(e) => {
                    warn!("Read failed while hashing {}: {}", path, e);
                    return None;
                }
            }
        }
        Some(Checksum::from_hasher(hasher))
    }
}

fn unreadable(path: RelPath) -> LocalObservation {
    LocalObservation {
        path,
        kind: ItemKind::File,
        size: 0,
        mtime: DateTime::UNIX_EPOCH,
        mode: None,
        inode: None,
        issue: Some(ScanIssue::Unreadable),
        checksum: None,
    }
}

/// Longest name component that round-trips through common filesystems.
const MAX_NAME_BYTES: usize = 255;

/// Names the filesystem or remote store cannot represent.
///
/// Covers the Windows device names, characters invalid on common
/// filesystems, over-long components, and trailing dot/space forms that
/// round-trip badly.
pub fn reserved_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_BYTES {
        return true;
    }
    if name.ends_with('.') || name.ends_with(' ') {
        return true;
    }
    if name
        .chars()
        .any(|c| matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*') || (c as u32) < 0x20)
    {
        return true;
    }

    let stem = name.split('.').next().unwrap_or(name);
    let upper = stem.to_ascii_uppercase();
    matches!(upper.as_str(), "CON" | "PRN" | "AUX" | "NUL")
        || (upper.len() == 4
            && (upper.starts_with("COM") || upper.starts_with("LPT"))
            && upper[3..].chars().all(|c| c.is_ascii_digit() && c != '0'))
}

fn file_mode(metadata: &std::fs::Metadata) -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Some(metadata.mode())
    }

    #[cfg(not(unix))]
    {
        None
    }
}

fn file_inode(metadata: &std::fs::Metadata) -> Option<u64> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Some(metadata.ino())
    }

    #[cfg(not(unix))]
    {
        let _ = metadata;
        None
    }
}
