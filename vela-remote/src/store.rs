//! Remote store abstraction
//!
//! [`RemoteStore`] is the narrow seam between the sync engine and the remote
//! file store. The production implementation is the HTTP client in
//! [`crate::client`]; tests drive the engine against an in-memory fake.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use vela_journal::{Checksum, ItemId, ItemKind, Permissions, RelPath};

use crate::errors::Result;

/// One remote item as reported by a listing or mutation response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub id: ItemId,
    pub name: String,
    pub kind: ItemKind,
    pub etag: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<DateTime<Utc>>,
}

/// One page of a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPage {
    pub entries: Vec<RemoteEntry>,
    #[serde(default)]
    pub next_page: Option<String>,
    /// Whether the server vouches for this listing being complete once all
    /// pages are consumed. A non-authoritative listing must never be
    /// reconciled as deletions.
    #[serde(default = "default_true")]
    pub complete: bool,
}

fn default_true() -> bool {
    true
}

/// Handle for an in-progress chunked upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub id: String,
}

/// Result of finalizing a chunked upload.
#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    /// The server assembled the file synchronously.
    Done(RemoteEntry),
    /// Assembly continues server-side; poll the given URL until it resolves.
    Pending { poll_url: String },
}

/// State reported by the asynchronous-finalization poll endpoint.
#[derive(Debug, Clone)]
pub enum PollStatus {
    Pending,
    Done(RemoteEntry),
    Failed(String),
}

/// An open download: response metadata plus the body stream.
pub struct DownloadStream {
    /// Byte count the server declared for this response body.
    pub declared_len: Option<u64>,
    /// Version token of the content being served.
    pub etag: String,
    /// Optional whole-file checksum header.
    pub checksum: Option<Checksum>,
    /// Offset this response starts at (non-zero for range resumes).
    pub offset: u64,
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadStream")
            .field("declared_len", &self.declared_len)
            .field("etag", &self.etag)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

/// Operations the engine needs from the remote, versioned file store.
///
/// Mutating calls take an optional expected etag; implementations must fail
/// with [`crate::RemoteError::PreconditionFailed`] when the remote version no
/// longer matches, so stale discovery results never overwrite newer content.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List one page of a directory.
    async fn list_page(&self, dir: &RelPath, page: Option<&str>) -> Result<ListPage>;

    /// Metadata for a single path, `None` when absent.
    async fn metadata(&self, path: &RelPath) -> Result<Option<RemoteEntry>>;

    /// Create a directory; the server must answer "created".
    async fn create_directory(&self, path: &RelPath) -> Result<RemoteEntry>;

    /// Delete a file or directory subtree.
    async fn delete(&self, path: &RelPath, expected_etag: Option<&str>) -> Result<()>;

    /// Move/rename an item, preserving its identity.
    async fn move_item(&self, from: &RelPath, to: &RelPath) -> Result<RemoteEntry>;

    /// Open a download at `offset` (0 for the whole file).
    async fn download(&self, path: &RelPath, offset: u64) -> Result<DownloadStream>;

    /// Single-request upload for small files.
    async fn upload_file(
        &self,
        path: &RelPath,
        data: Bytes,
        checksum: &Checksum,
        expected_etag: Option<&str>,
    ) -> Result<RemoteEntry>;

    /// Start a chunked upload session.
    async fn begin_chunked_upload(&self, path: &RelPath, total_size: u64) -> Result<UploadSession>;

    /// Upload one chunk with its own checksum.
    async fn upload_chunk(
        &self,
        session: &UploadSession,
        index: u32,
        data: Bytes,
        checksum: &Checksum,
    ) -> Result<()>;

    /// Commit a chunked upload; may resolve asynchronously.
    async fn finalize_chunked_upload(
        &self,
        session: &UploadSession,
        expected_etag: Option<&str>,
    ) -> Result<FinalizeOutcome>;

    /// Poll an asynchronous finalization.
    async fn poll_upload(&self, poll_url: &str) -> Result<PollStatus>;

    /// Drop an unfinished chunked upload.
    async fn abort_chunked_upload(&self, session: &UploadSession) -> Result<()>;
}
