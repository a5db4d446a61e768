//! Remote tree lister
//!
//! Enumerates the remote tree directory by directory, honoring server
//! pagination, and reports one [`DirectoryListing`] per directory over a
//! channel. Temporary failures retry in place; a protocol failure poisons
//! only the affected subtree: siblings keep listing, and the poisoned
//! directory is delivered as non-authoritative so discovery never turns a
//! partial listing into deletions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use vela_journal::{Checksum, ItemId, ItemKind, Permissions, RelPath};

use crate::errors::{RemoteError, Result};
use crate::store::{RemoteEntry, RemoteStore};

/// One remote item, placed at its full relative path.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObservation {
    pub item_id: ItemId,
    pub path: RelPath,
    pub kind: ItemKind,
    pub etag: String,
    pub size: u64,
    pub permissions: Permissions,
    pub checksum: Option<Checksum>,
}

impl RemoteObservation {
    pub fn from_entry(dir: &RelPath, entry: RemoteEntry) -> Self {
        Self {
            path: dir.join(&entry.name),
            item_id: entry.id,
            kind: entry.kind,
            etag: entry.etag,
            size: entry.size,
            permissions: entry.permissions,
            checksum: entry.checksum,
        }
    }
}

/// All observations for one remote directory.
#[derive(Debug, Clone)]
pub struct DirectoryListing {
    pub dir: RelPath,
    pub entries: Vec<RemoteObservation>,
    /// False when the server could not vouch for completeness or the listing
    /// failed; such directories are merged without deletion semantics.
    pub authoritative: bool,
}

#[derive(Debug, Clone)]
pub struct ListerConfig {
    /// Attempts per directory for temporary failures.
    pub retry_attempts: u32,
    /// Base delay between attempts, doubled each retry.
    pub retry_delay: Duration,
}

impl Default for ListerConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Recursive paginated lister over one remote subtree.
pub struct RemoteTreeLister {
    store: Arc<dyn RemoteStore>,
    config: ListerConfig,
}

impl RemoteTreeLister {
    pub fn new(store: Arc<dyn RemoteStore>, config: ListerConfig) -> Self {
        Self { store, config }
    }

    /// Walk the subtree rooted at `start`, emitting one [`DirectoryListing`]
    /// per directory. Only [`RemoteError::Unauthorized`] aborts the walk;
    /// everything else degrades to a non-authoritative listing.
    pub async fn list(&self, start: RelPath, tx: mpsc::Sender<DirectoryListing>) -> Result<()> {
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            let listing = match self.list_directory(&dir).await {
                Ok(listing) => listing,
                Err(RemoteError::Unauthorized) => return Err(RemoteError::Unauthorized),
                Err(e) => {
                    warn!("Remote listing of {} failed: {}", dir, e);
                    DirectoryListing {
                        dir: dir.clone(),
                        entries: Vec::new(),
                        authoritative: false,
                    }
                }
            };

            if listing.authoritative {
                pending.extend(
                    listing
                        .entries
                        .iter()
                        .filter(|obs| obs.kind == ItemKind::Directory)
                        .map(|obs| obs.path.clone())
                        .rev(),
                );
            }

            trace!(
                "Listed {}: {} entries, authoritative={}",
                listing.dir,
                listing.entries.len(),
                listing.authoritative
            );
            if tx.send(listing).await.is_err() {
                debug!("Listing receiver dropped, stopping walk");
                return Ok(());
            }
        }

        Ok(())
    }

    /// Fetch every page of one directory, retrying temporary failures.
    async fn list_directory(&self, dir: &RelPath) -> Result<DirectoryListing> {
        let mut entries = Vec::new();
        let mut authoritative = true;
        let mut page: Option<String> = None;

        loop {
            let result = self.fetch_page(dir, page.as_deref()).await?;
            authoritative &= result.complete;
            entries.extend(
                result
                    .entries
                    .into_iter()
                    .map(|entry| RemoteObservation::from_entry(dir, entry)),
            );

            match result.next_page {
                Some(token) => page = Some(token),
                None => break,
            }
        }

        Ok(DirectoryListing {
            dir: dir.clone(),
            entries,
            authoritative,
        })
    }

    async fn fetch_page(&self, dir: &RelPath, page: Option<&str>) -> Result<crate::store::ListPage> {
        let mut delay = self.config.retry_delay;
        let mut attempt = 0;

        loop {
            match self.store.list_page(dir, page).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_temporary() && attempt + 1 < self.config.retry_attempts => {
                    attempt += 1;
                    debug!(
                        "Listing {} attempt {} failed ({}), retrying in {:?}",
                        dir, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
