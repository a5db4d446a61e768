//! Chunked, resumable transfers
//!
//! Uploads snapshot the source file at job start and refuse to commit bytes
//! that no longer match that snapshot; downloads stream into a temporary
//! file and resume with range requests instead of restarting, unless the
//! remote version changed mid-transfer. Neither direction ever lets
//! unverified content reach its destination.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace, warn};
use vela_journal::{same_mtime, Checksum, ChecksumAlgo, RelPath};

use crate::cancel::CancelFlag;
use crate::errors::{RemoteError, Result};
use crate::store::{FinalizeOutcome, PollStatus, RemoteEntry, RemoteStore, UploadSession};

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Files at or above this size upload through a chunked session.
    pub chunk_threshold: u64,
    /// Chunk payload size.
    pub chunk_size: usize,
    /// Bounded retries for a single failed chunk.
    pub chunk_retry_attempts: u32,
    /// Delay between chunk retries.
    pub chunk_retry_delay: Duration,
    /// Polls allowed while waiting for asynchronous upload finalization;
    /// missing or invalid poll replies count against this bound too.
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    /// Range-request resumes allowed for one download.
    pub max_resumes: u32,
    /// Whole-download restarts allowed when the remote version changes or
    /// verification fails.
    pub max_restarts: u32,
    /// Read buffer for hashing and chunking.
    pub read_buffer: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: 8 * 1024 * 1024,
            chunk_size: 8 * 1024 * 1024,
            chunk_retry_attempts: 3,
            chunk_retry_delay: Duration::from_millis(500),
            poll_attempts: 30,
            poll_interval: Duration::from_secs(1),
            max_resumes: 5,
            max_restarts: 2,
            read_buffer: 64 * 1024,
        }
    }
}

/// Source state captured when an upload job starts.
///
/// Re-verified before finalize so a file mutated mid-transfer is never
/// committed; the item simply classifies as changed again next run.
#[derive(Debug, Clone)]
pub struct UploadSnapshot {
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub checksum: Checksum,
}

/// What discovery promised about the content being downloaded.
#[derive(Debug, Clone)]
pub struct DownloadExpectation {
    pub etag: String,
    pub size: u64,
    pub checksum: Option<Checksum>,
}

/// Verified result of a completed download.
#[derive(Debug, Clone)]
pub struct DownloadedContent {
    /// Version token actually served (may differ from the expectation if the
    /// remote changed and the download restarted).
    pub etag: String,
    pub size: u64,
    pub checksum: Checksum,
}

/// Uploads and downloads against a [`RemoteStore`].
pub struct TransferManager {
    store: Arc<dyn RemoteStore>,
    config: TransferConfig,
}

impl TransferManager {
    pub fn new(store: Arc<dyn RemoteStore>, config: TransferConfig) -> Self {
        Self { store, config }
    }

    /// Capture the `(size, mtime, checksum)` snapshot of a local file.
    pub async fn snapshot_file(&self, local: &Path) -> Result<UploadSnapshot> {
        let metadata = tokio::fs::metadata(local).await?;
        let mtime = metadata.modified().map(DateTime::<Utc>::from)?;

        let mut file = File::open(local).await?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; self.config.read_buffer];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(UploadSnapshot {
            size: metadata.len(),
            mtime,
            checksum: Checksum::from_hasher(hasher),
        })
    }

    /// Upload `local` to `remote`, verifying the content still matches
    /// `snapshot` before anything is committed.
    pub async fn upload(
        &self,
        local: &Path,
        remote: &RelPath,
        snapshot: &UploadSnapshot,
        expected_etag: Option<&str>,
        cancel: &CancelFlag,
    ) -> Result<RemoteEntry> {
        cancel.check()?;
        self.verify_snapshot(local, snapshot).await?;

        if snapshot.size < self.config.chunk_threshold {
            return self.upload_whole(local, remote, snapshot, expected_etag).await;
        }

        let session = self
            .store
            .begin_chunked_upload(remote, snapshot.size)
            .await?;
        match self
            .upload_chunks(local, snapshot, expected_etag, &session, cancel)
            .await
        {
            Ok(entry) => Ok(entry),
            Err(e) => {
                // Leave no half-assembled upload behind; the abort itself is
                // best effort.
                if let Err(abort_err) = self.store.abort_chunked_upload(&session).await {
                    warn!("Could not abort upload session {}: {}", session.id, abort_err);
                }
                Err(e)
            }
        }
    }

    async fn upload_whole(
        &self,
        local: &Path,
        remote: &RelPath,
        snapshot: &UploadSnapshot,
        expected_etag: Option<&str>,
    ) -> Result<RemoteEntry> {
        let data = tokio::fs::read(local).await?;
        if Checksum::blake3_of(&data) != snapshot.checksum {
            return Err(RemoteError::SourceChanged);
        }
        debug!("Uploading {} in one request ({} bytes)", remote, data.len());
        self.store
            .upload_file(remote, Bytes::from(data), &snapshot.checksum, expected_etag)
            .await
    }

    async fn upload_chunks(
        &self,
        local: &Path,
        snapshot: &UploadSnapshot,
        expected_etag: Option<&str>,
        session: &UploadSession,
        cancel: &CancelFlag,
    ) -> Result<RemoteEntry> {
        let mut file = File::open(local).await?;
        let mut whole = blake3::Hasher::new();
        let mut index: u32 = 0;
        let mut sent: u64 = 0;

        loop {
            cancel.check()?;
            let chunk = read_chunk(&mut file, self.config.chunk_size).await?;
            if chunk.is_empty() {
                break;
            }
            whole.update(&chunk);
            sent += chunk.len() as u64;

            let chunk_sum = Checksum::blake3_of(&chunk);
            self.send_chunk(session, index, Bytes::from(chunk), &chunk_sum)
                .await?;
            trace!("Session {}: chunk {} sent ({} bytes total)", session.id, index, sent);
            index += 1;
        }

        // The file must still be exactly what the job snapshotted, both by
        // content and by stat, or these bytes must not be committed.
        if sent != snapshot.size || Checksum::from_hasher(whole) != snapshot.checksum {
            return Err(RemoteError::SourceChanged);
        }
        self.verify_snapshot(local, snapshot).await?;

        match self
            .store
            .finalize_chunked_upload(session, expected_etag)
            .await?
        {
            FinalizeOutcome::Done(entry) => Ok(entry),
            FinalizeOutcome::Pending { poll_url } => self.await_finalization(&poll_url).await,
        }
    }

    async fn send_chunk(
        &self,
        session: &UploadSession,
        index: u32,
        data: Bytes,
        checksum: &Checksum,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self
                .store
                .upload_chunk(session, index, data.clone(), checksum)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_temporary() && attempt + 1 < self.config.chunk_retry_attempts => {
                    attempt += 1;
                    debug!("Chunk {} attempt {} failed ({}), retrying", index, attempt, e);
                    tokio::time::sleep(self.config.chunk_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn await_finalization(&self, poll_url: &str) -> Result<RemoteEntry> {
        let mut bad_polls = 0;
        for _ in 0..self.config.poll_attempts {
            tokio::time::sleep(self.config.poll_interval).await;
            match self.store.poll_upload(poll_url).await {
                Ok(PollStatus::Done(entry)) => return Ok(entry),
                Ok(PollStatus::Pending) => continue,
                Ok(PollStatus::Failed(message)) => {
                    return Err(RemoteError::Protocol(format!(
                        "server-side upload assembly failed: {message}"
                    )))
                }
                Err(e) => {
                    bad_polls += 1;
                    debug!("Invalid poll reply ({e}), {bad_polls} so far");
                    if bad_polls >= self.config.poll_attempts {
                        break;
                    }
                }
            }
        }
        // The upload may or may not have landed; next run's discovery will
        // see whichever state the server settled on.
        Err(RemoteError::Temporary(
            "chunked upload finalization did not resolve in time".to_string(),
        ))
    }

    async fn verify_snapshot(&self, local: &Path, snapshot: &UploadSnapshot) -> Result<()> {
        let metadata = tokio::fs::metadata(local).await?;
        let mtime = metadata.modified().map(DateTime::<Utc>::from)?;
        if metadata.len() != snapshot.size || !same_mtime(&mtime, &snapshot.mtime) {
            return Err(RemoteError::SourceChanged);
        }
        Ok(())
    }

    /// Download `remote` into `dest` (a temporary location chosen by the
    /// caller), resuming or restarting as needed, and verify byte count and
    /// checksum before reporting success.
    pub async fn download_to(
        &self,
        remote: &RelPath,
        dest: &Path,
        expected: &DownloadExpectation,
        cancel: &CancelFlag,
    ) -> Result<DownloadedContent> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dest)
            .await?;

        let mut current_etag = expected.etag.clone();
        let mut offset: u64 = 0;
        let mut resumes = 0;
        let mut restarts = 0;

        loop {
            cancel.check()?;

            let mut stream = match self.store.download(remote, offset).await {
                Ok(stream) => stream,
                Err(e) if e.is_temporary() => {
                    resumes = bump(resumes, self.config.max_resumes, e)?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if stream.etag != current_etag {
                // Remote version moved underneath us: resuming would splice
                // two versions together, so start over on the new one.
                debug!(
                    "ETag of {} changed mid-transfer ({} -> {}), restarting",
                    remote, current_etag, stream.etag
                );
                restarts = bump(
                    restarts,
                    self.config.max_restarts,
                    RemoteError::Temporary("remote content keeps changing".to_string()),
                )?;
                current_etag = stream.etag.clone();
                offset = 0;
                truncate(&mut file).await?;
                if stream.offset != 0 {
                    continue;
                }
            } else if stream.offset != offset {
                // Server ignored the range request; take the full body.
                trace!("Range not honored for {}, restarting body", remote);
                offset = 0;
                truncate(&mut file).await?;
            }

            let declared_total = stream.declared_len.map(|len| stream.offset + len);
            let received_before = offset;

            let mut failed: Option<RemoteError> = None;
            while let Some(chunk) = stream.body.next().await {
                cancel.check()?;
                match chunk {
                    Ok(data) => {
                        file.write_all(&data).await?;
                        offset += data.len() as u64;
                    }
                    Err(e) if e.is_temporary() => {
                        failed = Some(e);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(e) = failed {
                resumes = bump(resumes, self.config.max_resumes, e)?;
                continue;
            }

            if let Some(total) = declared_total {
                if offset == received_before && total > received_before {
                    // An empty body where bytes were declared is a transient
                    // server hiccup, never a successful empty file.
                    resumes = bump(
                        resumes,
                        self.config.max_resumes,
                        RemoteError::Temporary("empty download body".to_string()),
                    )?;
                    continue;
                }
                if offset < total {
                    trace!("Short body for {} ({}/{} bytes), resuming", remote, offset, total);
                    resumes = bump(
                        resumes,
                        self.config.max_resumes,
                        RemoteError::Temporary("truncated download body".to_string()),
                    )?;
                    continue;
                }
                if offset > total {
                    return Err(RemoteError::Protocol(format!(
                        "server sent {offset} bytes but declared {total}"
                    )));
                }
            }

            file.flush().await?;
            file.sync_all().await?;

            let computed = hash_local(dest, self.config.read_buffer).await?;
            if let Some(expected_sum) = expected_checksum(expected, &stream.checksum, &current_etag)
            {
                if !checksums_agree(&expected_sum, &computed) {
                    warn!(
                        "Checksum mismatch for {} (expected {}, got {}), restarting",
                        remote, expected_sum, computed
                    );
                    restarts = bump(
                        restarts,
                        self.config.max_restarts,
                        RemoteError::ChecksumMismatch {
                            expected: expected_sum.to_string(),
                            actual: computed.to_string(),
                        },
                    )?;
                    offset = 0;
                    truncate(&mut file).await?;
                    continue;
                }
            }

            debug!("Downloaded {} ({} bytes, etag {})", remote, offset, current_etag);
            return Ok(DownloadedContent {
                etag: current_etag,
                size: offset,
                checksum: computed,
            });
        }
    }
}

/// Count one retryable failure against its bound; when the bound is spent
/// the triggering error itself surfaces.
fn bump(count: u32, max: u32, err: RemoteError) -> Result<u32> {
    if count >= max {
        Err(err)
    } else {
        Ok(count + 1)
    }
}

async fn truncate(file: &mut File) -> Result<()> {
    file.set_len(0).await?;
    file.seek(std::io::SeekFrom::Start(0)).await?;
    Ok(())
}

async fn read_chunk(file: &mut File, chunk_size: usize) -> Result<Vec<u8>> {
    let mut chunk = vec![0u8; chunk_size];
    let mut filled = 0;
    while filled < chunk_size {
        let n = file.read(&mut chunk[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    chunk.truncate(filled);
    Ok(chunk)
}

async fn hash_local(path: &Path, buffer: usize) -> Result<Checksum> {
    let mut file = File::open(path).await?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; buffer];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Checksum::from_hasher(hasher))
}

/// Pick the checksum to verify against: the response header wins (it
/// describes the bytes actually served), falling back to the discovery-time
/// expectation only while the served etag still matches it.
fn expected_checksum(
    expected: &DownloadExpectation,
    header: &Option<Checksum>,
    served_etag: &str,
) -> Option<Checksum> {
    if let Some(sum) = header {
        return Some(sum.clone());
    }
    if served_etag == expected.etag {
        return expected.checksum.clone();
    }
    None
}

/// Compare checksums without recomputing foreign algorithms: differing
/// algorithms cannot disagree, they simply don't verify.
fn checksums_agree(expected: &Checksum, computed: &Checksum) -> bool {
    if expected.algo != computed.algo {
        !matches!(expected.algo, ChecksumAlgo::Blake3)
    } else {
        expected.value == computed.value
    }
}
