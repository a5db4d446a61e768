//! Shared harness for whole-run integration tests: an in-memory remote
//! store with fault injection, and a sync-root fixture.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use tempfile::TempDir;

use vela_engine::{RunSummary, SyncContext, SyncOptions, SyncRun};
use vela_journal::{Checksum, ItemId, ItemKind, Journal, Permissions, RelPath};
use vela_remote::{
    DownloadStream, FinalizeOutcome, ListPage, PollStatus, RemoteEntry, RemoteError, RemoteStore,
    UploadSession,
};

type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Injectable failure kinds, matched to the protocol taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Temporary,
    Protocol,
    Quota,
    Unauthorized,
}

fn fault_error(fault: Fault, op: &str) -> RemoteError {
    match fault {
        Fault::Temporary => RemoteError::Temporary(format!("injected 503 during {op}")),
        Fault::Protocol => RemoteError::Protocol(format!("injected malformed reply during {op}")),
        Fault::Quota => RemoteError::InsufficientStorage,
        Fault::Unauthorized => RemoteError::Unauthorized,
    }
}

#[derive(Debug, Clone)]
struct StoredItem {
    id: ItemId,
    kind: ItemKind,
    content: Vec<u8>,
    etag: String,
    permissions: Permissions,
}

#[derive(Default)]
struct RemoteState {
    items: HashMap<String, StoredItem>,
    sessions: HashMap<String, SessionState>,
    faults: HashMap<String, VecDeque<Fault>>,
    sticky_faults: HashMap<String, Fault>,
    unauthorized: bool,
    next_id: u64,
    next_etag: u64,
    next_session: u64,
    /// Successful content uploads per path, to prove nothing re-transfers.
    upload_counts: HashMap<String, u32>,
    /// Mutating operations in order, for dependency assertions.
    ops: Vec<String>,
    /// Page size for listings; `None` lists each directory in one page.
    page_size: Option<usize>,
    /// Finalize chunked uploads asynchronously via the poll endpoint.
    async_finalize: bool,
}

struct SessionState {
    path: String,
    chunks: Vec<Vec<u8>>,
    polls_left: u32,
    committed: Option<RemoteEntry>,
}

/// In-memory stand-in for the remote versioned file store.
#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
}

impl InMemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    pub fn set_page_size(&self, size: usize) {
        self.lock().page_size = Some(size);
    }

    pub fn set_async_finalize(&self, on: bool) {
        self.lock().async_finalize = on;
    }

    pub fn set_unauthorized(&self, on: bool) {
        self.lock().unauthorized = on;
    }

    /// Queue a one-shot fault for an op key such as `"upload:big.txt"` or
    /// `"list:docs"`.
    pub fn inject_fault(&self, key: &str, fault: Fault) {
        self.lock()
            .faults
            .entry(key.to_string())
            .or_default()
            .push_back(fault);
    }

    /// Make every call matching the key fail.
    pub fn inject_sticky_fault(&self, key: &str, fault: Fault) {
        self.lock().sticky_faults.insert(key.to_string(), fault);
    }

    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.faults.clear();
        state.sticky_faults.clear();
    }

    /// Seed a file without going through the protocol (parents implied).
    pub fn seed_file(&self, path: &str, content: &[u8]) {
        let mut state = self.lock();
        let mut dir = RelPath::new(path).parent();
        while let Some(d) = dir {
            if d.is_root() {
                break;
            }
            if !state.items.contains_key(d.as_str()) {
                let item = new_item(&mut state, ItemKind::Directory, Vec::new());
                state.items.insert(d.as_str().to_string(), item);
            }
            dir = d.parent();
        }
        let item = new_item(&mut state, ItemKind::File, content.to_vec());
        state.items.insert(RelPath::new(path).as_str().to_string(), item);
    }

    /// Server-side edit preserving identity, bumping the etag.
    pub fn edit_file(&self, path: &str, content: &[u8]) {
        let mut state = self.lock();
        let etag = bump_etag(&mut state);
        let item = state.items.get_mut(path).expect("edit of unknown path");
        item.content = content.to_vec();
        item.etag = etag;
    }

    /// Server-side move preserving identity and content.
    pub fn move_directly(&self, from: &str, to: &str) {
        let mut state = self.lock();
        let item = state.items.remove(from).expect("move of unknown path");
        state.items.insert(to.to_string(), item);
        let descendants: Vec<String> = state
            .items
            .keys()
            .filter(|k| k.starts_with(&format!("{from}/")))
            .cloned()
            .collect();
        for old in descendants {
            let new = format!("{to}{}", &old[from.len()..]);
            let item = state.items.remove(&old).unwrap();
            state.items.insert(new, item);
        }
    }

    pub fn delete_directly(&self, path: &str) {
        let mut state = self.lock();
        state.items.remove(path);
        let prefix = format!("{path}/");
        state.items.retain(|k, _| !k.starts_with(&prefix));
    }

    pub fn set_permissions(&self, path: &str, permissions: Permissions) {
        self.lock()
            .items
            .get_mut(path)
            .expect("permissions of unknown path")
            .permissions = permissions;
    }

    pub fn content_of(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().items.get(path).map(|i| i.content.clone())
    }

    pub fn etag_of(&self, path: &str) -> Option<String> {
        self.lock().items.get(path).map(|i| i.etag.clone())
    }

    pub fn id_of(&self, path: &str) -> Option<ItemId> {
        self.lock().items.get(path).map(|i| i.id.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().items.contains_key(path)
    }

    pub fn upload_count(&self, path: &str) -> u32 {
        self.lock().upload_counts.get(path).copied().unwrap_or(0)
    }

    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.lock().items.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn check_fault(state: &mut RemoteState, op: &str, path: &str) -> RemoteResult<()> {
        if state.unauthorized {
            return Err(RemoteError::Unauthorized);
        }
        let key = format!("{op}:{path}");
        if let Some(fault) = state.sticky_faults.get(&key) {
            return Err(fault_error(*fault, &key));
        }
        if let Some(queue) = state.faults.get_mut(&key) {
            if let Some(fault) = queue.pop_front() {
                return Err(fault_error(fault, &key));
            }
        }
        Ok(())
    }

    fn parent_exists(state: &RemoteState, path: &RelPath) -> bool {
        match path.parent() {
            None => true,
            Some(parent) if parent.is_root() => true,
            Some(parent) => state
                .items
                .get(parent.as_str())
                .map(|i| i.kind == ItemKind::Directory)
                .unwrap_or(false),
        }
    }

    fn entry_for(path: &RelPath, item: &StoredItem) -> RemoteEntry {
        RemoteEntry {
            id: item.id.clone(),
            name: path.name().to_string(),
            kind: item.kind,
            etag: item.etag.clone(),
            size: item.content.len() as u64,
            permissions: item.permissions,
            checksum: match item.kind {
                ItemKind::File => Some(Checksum::blake3_of(&item.content)),
                ItemKind::Directory => None,
            },
            mtime: None,
        }
    }
}

fn new_item(state: &mut RemoteState, kind: ItemKind, content: Vec<u8>) -> StoredItem {
    state.next_id += 1;
    let etag = bump_etag(state);
    StoredItem {
        id: ItemId::new(format!("srv-{}", state.next_id)),
        kind,
        content,
        etag,
        permissions: Permissions::all(),
    }
}

fn bump_etag(state: &mut RemoteState) -> String {
    state.next_etag += 1;
    format!("etag-{}", state.next_etag)
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn list_page(&self, dir: &RelPath, page: Option<&str>) -> RemoteResult<ListPage> {
        let mut state = self.lock();
        Self::check_fault(&mut state, "list", dir.as_str())?;

        let mut children: Vec<(RelPath, StoredItem)> = state
            .items
            .iter()
            .map(|(path, item)| (RelPath::new(path), item.clone()))
            .filter(|(path, _)| path.parent().as_ref() == Some(dir))
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));

        let start: usize = page.map(|p| p.parse().unwrap_or(0)).unwrap_or(0);
        let (slice, next_page) = match state.page_size {
            Some(size) => {
                let end = (start + size).min(children.len());
                let next = (end < children.len()).then(|| end.to_string());
                (&children[start..end], next)
            }
            None => (&children[..], None),
        };

        let entries = slice
            .iter()
            .map(|(path, item)| Self::entry_for(path, item))
            .collect();
        Ok(ListPage {
            entries,
            next_page,
            complete: true,
        })
    }

    async fn metadata(&self, path: &RelPath) -> RemoteResult<Option<RemoteEntry>> {
        let state = self.lock();
        Ok(state
            .items
            .get(path.as_str())
            .map(|item| Self::entry_for(path, item)))
    }

    async fn create_directory(&self, path: &RelPath) -> RemoteResult<RemoteEntry> {
        let mut state = self.lock();
        Self::check_fault(&mut state, "mkdir", path.as_str())?;
        if !Self::parent_exists(&state, path) {
            return Err(RemoteError::Protocol(format!(
                "mkdir {path} without parent directory"
            )));
        }
        let item = new_item(&mut state, ItemKind::Directory, Vec::new());
        state.items.insert(path.as_str().to_string(), item.clone());
        state.ops.push(format!("mkdir {path}"));
        Ok(Self::entry_for(path, &item))
    }

    async fn delete(&self, path: &RelPath, _expected_etag: Option<&str>) -> RemoteResult<()> {
        let mut state = self.lock();
        Self::check_fault(&mut state, "delete", path.as_str())?;
        if state.items.remove(path.as_str()).is_none() {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        let prefix = format!("{}/", path.as_str());
        state.items.retain(|k, _| !k.starts_with(&prefix));
        state.ops.push(format!("delete {path}"));
        Ok(())
    }

    async fn move_item(&self, from: &RelPath, to: &RelPath) -> RemoteResult<RemoteEntry> {
        let mut state = self.lock();
        Self::check_fault(&mut state, "move", from.as_str())?;
        if !Self::parent_exists(&state, to) {
            return Err(RemoteError::Protocol(format!(
                "move into missing directory {to}"
            )));
        }
        let mut item = state
            .items
            .remove(from.as_str())
            .ok_or_else(|| RemoteError::NotFound(from.to_string()))?;
        let etag = bump_etag(&mut state);
        item.etag = etag;
        state.items.insert(to.as_str().to_string(), item.clone());

        let descendants: Vec<String> = state
            .items
            .keys()
            .filter(|k| k.starts_with(&format!("{}/", from.as_str())))
            .cloned()
            .collect();
        for old in descendants {
            let new = format!("{}{}", to.as_str(), &old[from.as_str().len()..]);
            let moved = state.items.remove(&old).unwrap();
            state.items.insert(new, moved);
        }

        state.ops.push(format!("move {from} -> {to}"));
        Ok(Self::entry_for(to, &item))
    }

    async fn download(&self, path: &RelPath, offset: u64) -> RemoteResult<DownloadStream> {
        let mut state = self.lock();
        Self::check_fault(&mut state, "download", path.as_str())?;
        let item = state
            .items
            .get(path.as_str())
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))?;

        let offset = offset.min(item.content.len() as u64);
        let remainder = item.content[offset as usize..].to_vec();
        let declared = remainder.len() as u64;
        let chunks: Vec<RemoteResult<Bytes>> = remainder
            .chunks(16 * 1024)
            .map(|c| Ok(Bytes::from(c.to_vec())))
            .collect();

        Ok(DownloadStream {
            declared_len: Some(declared),
            etag: item.etag.clone(),
            checksum: Some(Checksum::blake3_of(&item.content)),
            offset,
            body: stream::iter(chunks).boxed(),
        })
    }

    async fn upload_file(
        &self,
        path: &RelPath,
        data: Bytes,
        _checksum: &Checksum,
        expected_etag: Option<&str>,
    ) -> RemoteResult<RemoteEntry> {
        let mut state = self.lock();
        Self::check_fault(&mut state, "upload", path.as_str())?;
        if !Self::parent_exists(&state, path) {
            return Err(RemoteError::Protocol(format!(
                "upload of {path} without parent directory"
            )));
        }
        if let (Some(expected), Some(existing)) = (expected_etag, state.items.get(path.as_str())) {
            if existing.etag != expected {
                return Err(RemoteError::PreconditionFailed(path.to_string()));
            }
        }

        let etag = bump_etag(&mut state);
        let item = match state.items.get(path.as_str()) {
            Some(existing) => StoredItem {
                id: existing.id.clone(),
                kind: ItemKind::File,
                content: data.to_vec(),
                etag,
                permissions: existing.permissions,
            },
            None => {
                let mut item = new_item(&mut state, ItemKind::File, data.to_vec());
                item.etag = etag;
                item
            }
        };
        state.items.insert(path.as_str().to_string(), item.clone());
        *state
            .upload_counts
            .entry(path.as_str().to_string())
            .or_default() += 1;
        state.ops.push(format!("upload {path}"));
        Ok(Self::entry_for(path, &item))
    }

    async fn begin_chunked_upload(
        &self,
        path: &RelPath,
        _total_size: u64,
    ) -> RemoteResult<UploadSession> {
        let mut state = self.lock();
        Self::check_fault(&mut state, "upload", path.as_str())?;
        if !Self::parent_exists(&state, path) {
            return Err(RemoteError::Protocol(format!(
                "chunked upload of {path} without parent directory"
            )));
        }
        state.next_session += 1;
        let id = format!("sess-{}", state.next_session);
        state.sessions.insert(
            id.clone(),
            SessionState {
                path: path.as_str().to_string(),
                chunks: Vec::new(),
                polls_left: 2,
                committed: None,
            },
        );
        Ok(UploadSession { id })
    }

    async fn upload_chunk(
        &self,
        session: &UploadSession,
        _index: u32,
        data: Bytes,
        _checksum: &Checksum,
    ) -> RemoteResult<()> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| RemoteError::Protocol("unknown upload session".to_string()))?;
        session.chunks.push(data.to_vec());
        Ok(())
    }

    async fn finalize_chunked_upload(
        &self,
        session: &UploadSession,
        expected_etag: Option<&str>,
    ) -> RemoteResult<FinalizeOutcome> {
        let mut state = self.lock();
        let assembled: Vec<u8> = state
            .sessions
            .get(&session.id)
            .ok_or_else(|| RemoteError::Protocol("unknown upload session".to_string()))?
            .chunks
            .iter()
            .flatten()
            .copied()
            .collect();
        let path = state.sessions[&session.id].path.clone();
        let rel = RelPath::new(&path);

        if let (Some(expected), Some(existing)) = (expected_etag, state.items.get(&path)) {
            if existing.etag != expected {
                return Err(RemoteError::PreconditionFailed(path));
            }
        }

        let etag = bump_etag(&mut state);
        let item = match state.items.get(&path) {
            Some(existing) => StoredItem {
                id: existing.id.clone(),
                kind: ItemKind::File,
                content: assembled,
                etag,
                permissions: existing.permissions,
            },
            None => {
                let mut item = new_item(&mut state, ItemKind::File, assembled);
                item.etag = etag;
                item
            }
        };
        state.items.insert(path.clone(), item.clone());
        *state.upload_counts.entry(path.clone()).or_default() += 1;
        state.ops.push(format!("upload {rel}"));
        let entry = Self::entry_for(&rel, &item);

        if state.async_finalize {
            let poll_url = format!("poll://{}", session.id);
            state.sessions.get_mut(&session.id).unwrap().committed = Some(entry);
            Ok(FinalizeOutcome::Pending { poll_url })
        } else {
            state.sessions.remove(&session.id);
            Ok(FinalizeOutcome::Done(entry))
        }
    }

    async fn poll_upload(&self, poll_url: &str) -> RemoteResult<PollStatus> {
        let mut state = self.lock();
        let id = poll_url.trim_start_matches("poll://").to_string();
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or_else(|| RemoteError::Protocol("unknown poll url".to_string()))?;
        if session.polls_left > 0 {
            session.polls_left -= 1;
            return Ok(PollStatus::Pending);
        }
        let entry = session
            .committed
            .clone()
            .ok_or_else(|| RemoteError::Protocol("poll before finalize".to_string()))?;
        state.sessions.remove(&id);
        Ok(PollStatus::Done(entry))
    }

    async fn abort_chunked_upload(&self, session: &UploadSession) -> RemoteResult<()> {
        self.lock().sessions.remove(&session.id);
        Ok(())
    }
}

/// One sync root with its journal file and fake remote.
pub struct TestEnv {
    pub tmp: TempDir,
    pub root: PathBuf,
    pub journal_path: PathBuf,
    pub remote: Arc<InMemoryRemote>,
}

/// Initialize tracing output for tests - call once per test process
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

impl TestEnv {
    pub fn new() -> Self {
        init_tracing();
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("root");
        std::fs::create_dir(&root).expect("sync root");
        let journal_path = tmp.path().join("journal.db");
        Self {
            tmp,
            root,
            journal_path,
            remote: InMemoryRemote::new(),
        }
    }

    /// Open the journal the way a fresh process would.
    pub fn open_journal(&self) -> Arc<Journal> {
        Arc::new(Journal::open(&self.journal_path).expect("journal open"))
    }

    pub fn context(&self, journal: Arc<Journal>) -> SyncContext {
        let mut ctx = SyncContext::new(self.root.clone(), journal, self.remote.clone());
        let mut options = SyncOptions::default();
        // Keep test retries fast.
        options.scheduler.retry_base_delay = std::time::Duration::from_millis(10);
        options.lister.retry_delay = std::time::Duration::from_millis(10);
        options.transfer.poll_interval = std::time::Duration::from_millis(5);
        options.transfer.chunk_retry_delay = std::time::Duration::from_millis(10);
        ctx.options = options;
        ctx
    }

    /// Run one full sync, opening and closing the journal like a process
    /// lifecycle would.
    pub async fn run(&self) -> RunSummary {
        let journal = self.open_journal();
        SyncRun::new(self.context(journal)).execute().await
    }

    pub async fn run_with<F>(&self, prepare: F) -> RunSummary
    where
        F: FnOnce(&mut SyncContext),
    {
        let journal = self.open_journal();
        let mut ctx = self.context(journal);
        prepare(&mut ctx);
        SyncRun::new(ctx).execute().await
    }

    pub fn write_local(&self, rel: &str, content: &[u8]) {
        let path = RelPath::new(rel).to_fs_path(&self.root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parent dirs");
        }
        std::fs::write(path, content).expect("write local file");
    }

    pub fn read_local(&self, rel: &str) -> Vec<u8> {
        std::fs::read(RelPath::new(rel).to_fs_path(&self.root)).expect("read local file")
    }

    pub fn local_exists(&self, rel: &str) -> bool {
        RelPath::new(rel).to_fs_path(&self.root).exists()
    }

    pub fn remove_local(&self, rel: &str) {
        let path = RelPath::new(rel).to_fs_path(&self.root);
        if path.is_dir() {
            std::fs::remove_dir_all(path).expect("remove local dir");
        } else {
            std::fs::remove_file(path).expect("remove local file");
        }
    }
}
