//! HTTP(S) implementation of the remote store protocol
//!
//! Speaks a JSON protocol against a versioned file store. Every operation
//! has exactly one expected success status; anything else is classified by
//! [`unexpected_status`]: temporary server trouble retries upstream, while
//! protocol violations fail the affected item or subtree.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, ETAG, IF_MATCH, RANGE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace};
use vela_journal::{Checksum, RelPath};

use crate::errors::{RemoteError, Result};
use crate::store::{
    DownloadStream, FinalizeOutcome, ListPage, PollStatus, RemoteEntry, RemoteStore, UploadSession,
};

/// Header carrying an algorithm-tagged content checksum.
pub const CHECKSUM_HEADER: &str = "x-checksum";

/// Request-signing collaborator supplied by the account layer.
pub trait Credentials: Send + Sync {
    /// Base URL of the remote store, without a trailing slash.
    fn base_url(&self) -> &str;

    /// Account the requests act for.
    fn user(&self) -> &str;

    /// Attach authentication to an outgoing request.
    fn sign(&self, request: RequestBuilder) -> RequestBuilder;
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Per-request timeout; every network call carries one.
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            user_agent: format!("vela/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Remote store client over reqwest.
pub struct HttpRemoteStore {
    http: reqwest::Client,
    creds: Arc<dyn Credentials>,
}

impl HttpRemoteStore {
    pub fn new(creds: Arc<dyn Credentials>, config: HttpConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| RemoteError::Protocol(format!("cannot construct HTTP client: {e}")))?;
        Ok(Self { http, creds })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.creds.base_url().trim_end_matches('/'), endpoint)
    }

    fn get(&self, endpoint: &str) -> RequestBuilder {
        self.creds.sign(self.http.get(self.url(endpoint)))
    }

    fn post(&self, endpoint: &str) -> RequestBuilder {
        self.creds.sign(self.http.post(self.url(endpoint)))
    }

    fn put(&self, endpoint: &str) -> RequestBuilder {
        self.creds.sign(self.http.put(self.url(endpoint)))
    }

    fn delete_req(&self, endpoint: &str) -> RequestBuilder {
        self.creds.sign(self.http.delete(self.url(endpoint)))
    }
}

/// Map a status that does not match the operation's expectation.
fn unexpected_status(op: &str, status: StatusCode) -> RemoteError {
    match status.as_u16() {
        401 | 403 => RemoteError::Unauthorized,
        404 => RemoteError::NotFound(op.to_string()),
        412 => RemoteError::PreconditionFailed(op.to_string()),
        507 => RemoteError::InsufficientStorage,
        408 | 429 => RemoteError::Temporary(format!("server throttled {op} ({status})")),
        s if s >= 500 => RemoteError::Temporary(format!("server failed {op} ({status})")),
        s => RemoteError::Protocol(format!("unexpected status {s} for {op}")),
    }
}

fn expect_status(op: &str, response: Response, expected: StatusCode) -> Result<Response> {
    if response.status() == expected {
        Ok(response)
    } else {
        Err(unexpected_status(op, response.status()))
    }
}

fn if_match(request: RequestBuilder, etag: Option<&str>) -> RequestBuilder {
    match etag {
        Some(etag) => request.header(IF_MATCH, format!("\"{etag}\"")),
        None => request,
    }
}

fn header_str(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"').to_string())
}

#[derive(Deserialize)]
struct SessionBody {
    session: String,
}

#[derive(Deserialize)]
struct PendingBody {
    poll: String,
}

#[derive(Deserialize)]
struct PollBody {
    status: String,
    #[serde(default)]
    entry: Option<RemoteEntry>,
    #[serde(default)]
    message: Option<String>,
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn list_page(&self, dir: &RelPath, page: Option<&str>) -> Result<ListPage> {
        trace!("Listing {} (page {:?})", dir, page);
        let mut request = self.get("v1/tree").query(&[("path", dir.as_str())]);
        if let Some(token) = page {
            request = request.query(&[("page", token)]);
        }
        let response = expect_status("list", request.send().await?, StatusCode::OK)?;
        Ok(response.json::<ListPage>().await?)
    }

    async fn metadata(&self, path: &RelPath) -> Result<Option<RemoteEntry>> {
        let response = self
            .get("v1/meta")
            .query(&[("path", path.as_str())])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = expect_status("metadata", response, StatusCode::OK)?;
        Ok(Some(response.json::<RemoteEntry>().await?))
    }

    async fn create_directory(&self, path: &RelPath) -> Result<RemoteEntry> {
        debug!("Creating remote directory {}", path);
        let response = self
            .post("v1/dirs")
            .json(&json!({ "path": path.as_str() }))
            .send()
            .await?;
        // A directory create must answer "created"; anything else is a
        // protocol breach even if it looks successful.
        let response = expect_status("mkdir", response, StatusCode::CREATED)?;
        Ok(response.json::<RemoteEntry>().await?)
    }

    async fn delete(&self, path: &RelPath, expected_etag: Option<&str>) -> Result<()> {
        debug!("Deleting remote item {}", path);
        let request = if_match(
            self.delete_req("v1/items").query(&[("path", path.as_str())]),
            expected_etag,
        );
        expect_status("delete", request.send().await?, StatusCode::NO_CONTENT)?;
        Ok(())
    }

    async fn move_item(&self, from: &RelPath, to: &RelPath) -> Result<RemoteEntry> {
        debug!("Moving remote item {} -> {}", from, to);
        let response = self
            .post("v1/move")
            .json(&json!({ "from": from.as_str(), "to": to.as_str() }))
            .send()
            .await?;
        let response = expect_status("move", response, StatusCode::CREATED)?;
        Ok(response.json::<RemoteEntry>().await?)
    }

    async fn download(&self, path: &RelPath, offset: u64) -> Result<DownloadStream> {
        let mut request = self.get("v1/content").query(&[("path", path.as_str())]);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await?;

        let granted_offset = match response.status() {
            StatusCode::OK => 0,
            StatusCode::PARTIAL_CONTENT if offset > 0 => offset,
            status => return Err(unexpected_status("download", status)),
        };

        let etag = header_str(&response, ETAG.as_str())
            .ok_or_else(|| RemoteError::Protocol(format!("download of {path} lacks an ETag")))?;
        let declared_len = header_str(&response, CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse::<u64>().ok());
        let checksum = header_str(&response, CHECKSUM_HEADER).map(|v| Checksum::parse(&v));

        let body = response
            .bytes_stream()
            .map_err(RemoteError::from)
            .boxed();

        Ok(DownloadStream {
            declared_len,
            etag,
            checksum,
            offset: granted_offset,
            body,
        })
    }

    async fn upload_file(
        &self,
        path: &RelPath,
        data: Bytes,
        checksum: &Checksum,
        expected_etag: Option<&str>,
    ) -> Result<RemoteEntry> {
        debug!("Uploading {} ({} bytes)", path, data.len());
        let request = if_match(
            self.put("v1/content")
                .query(&[("path", path.as_str())])
                .header(CHECKSUM_HEADER, checksum.to_string()),
            expected_etag,
        );
        let response = expect_status(
            "upload",
            request.body(data).send().await?,
            StatusCode::CREATED,
        )?;
        Ok(response.json::<RemoteEntry>().await?)
    }

    async fn begin_chunked_upload(&self, path: &RelPath, total_size: u64) -> Result<UploadSession> {
        debug!("Opening chunked upload for {} ({} bytes)", path, total_size);
        let response = self
            .post("v1/uploads")
            .json(&json!({ "path": path.as_str(), "size": total_size }))
            .send()
            .await?;
        let response = expect_status("upload-session", response, StatusCode::CREATED)?;
        let body = response.json::<SessionBody>().await?;
        Ok(UploadSession { id: body.session })
    }

    async fn upload_chunk(
        &self,
        session: &UploadSession,
        index: u32,
        data: Bytes,
        checksum: &Checksum,
    ) -> Result<()> {
        trace!("Uploading chunk {} of session {}", index, session.id);
        let request = self
            .put(&format!("v1/uploads/{}/{}", session.id, index))
            .header(CHECKSUM_HEADER, checksum.to_string());
        expect_status("chunk", request.body(data).send().await?, StatusCode::CREATED)?;
        Ok(())
    }

    async fn finalize_chunked_upload(
        &self,
        session: &UploadSession,
        expected_etag: Option<&str>,
    ) -> Result<FinalizeOutcome> {
        debug!("Finalizing upload session {}", session.id);
        let request = if_match(
            self.post(&format!("v1/uploads/{}/commit", session.id)),
            expected_etag,
        );
        let response = request.send().await?;
        match response.status() {
            StatusCode::CREATED => Ok(FinalizeOutcome::Done(response.json::<RemoteEntry>().await?)),
            StatusCode::ACCEPTED => {
                let body = response.json::<PendingBody>().await?;
                Ok(FinalizeOutcome::Pending { poll_url: body.poll })
            }
            status => Err(unexpected_status("finalize", status)),
        }
    }

    async fn poll_upload(&self, poll_url: &str) -> Result<PollStatus> {
        let response = self.creds.sign(self.http.get(poll_url)).send().await?;
        let response = expect_status("poll", response, StatusCode::OK)?;
        let body = response.json::<PollBody>().await?;
        match body.status.as_str() {
            "pending" => Ok(PollStatus::Pending),
            "done" => match body.entry {
                Some(entry) => Ok(PollStatus::Done(entry)),
                None => Err(RemoteError::Protocol(
                    "poll reported done without an entry".to_string(),
                )),
            },
            "error" => Ok(PollStatus::Failed(
                body.message.unwrap_or_else(|| "unspecified server error".to_string()),
            )),
            other => Err(RemoteError::Protocol(format!(
                "unknown poll status {other:?}"
            ))),
        }
    }

    async fn abort_chunked_upload(&self, session: &UploadSession) -> Result<()> {
        debug!("Aborting upload session {}", session.id);
        expect_status(
            "upload-abort",
            self.delete_req(&format!("v1/uploads/{}", session.id))
                .send()
                .await?,
            StatusCode::NO_CONTENT,
        )?;
        Ok(())
    }
}
