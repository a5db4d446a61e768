//! Core item types shared across the workspace

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier issued by the remote store.
///
/// Survives renames and moves; paths are never identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relative path inside a sync root.
///
/// Always forward-slash separated, never starts or ends with a slash. The
/// empty path is the sync root itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelPath(String);

impl RelPath {
    /// The sync root.
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Build from a raw string, normalizing separators and trimming slashes.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let norm = raw
            .as_ref()
            .replace('\\', "/")
            .trim_matches('/')
            .to_string();
        Self(norm)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path component, empty for the root.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// Parent path; `None` for the root.
    pub fn parent(&self) -> Option<RelPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(idx) => Some(RelPath(self.0[..idx].to_string())),
            None => Some(RelPath::root()),
        }
    }

    pub fn join(&self, name: &str) -> RelPath {
        if self.is_root() {
            RelPath::new(name)
        } else {
            RelPath(format!("{}/{}", self.0, name.trim_matches('/')))
        }
    }

    /// Number of components; the root has depth 0.
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.matches('/').count() + 1
        }
    }

    /// True if `self` equals `ancestor` or lies beneath it.
    pub fn is_within(&self, ancestor: &RelPath) -> bool {
        if ancestor.is_root() {
            return true;
        }
        self.0 == ancestor.0 || self.0.starts_with(&format!("{}/", ancestor.0))
    }

    /// Absolute filesystem path under `root`.
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        if self.is_root() {
            root.to_path_buf()
        } else {
            let mut out = root.to_path_buf();
            for comp in self.0.split('/') {
                out.push(comp);
            }
            out
        }
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Kind of a synchronized item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    #[serde(rename = "dir")]
    Directory,
}

/// Whether an item's content bytes are materialized locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinState {
    /// Content is always kept on disk.
    AlwaysLocal,
    /// Placeholder only; content stays remote.
    OnlineOnly,
    /// Follows the parent directory's pin state.
    Inherited,
}

/// Checksum algorithm tag.
///
/// Unknown algorithms reported by the server are carried opaquely and
/// compared byte-for-byte, never recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChecksumAlgo {
    Blake3,
    Other(String),
}

impl ChecksumAlgo {
    pub fn as_str(&self) -> &str {
        match self {
            ChecksumAlgo::Blake3 => "BLAKE3",
            ChecksumAlgo::Other(name) => name,
        }
    }
}

/// Algorithm-tagged content checksum, rendered as `"BLAKE3:<hex>"`.
///
/// Serializes as its string form so wire bodies and the journal share one
/// representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum {
    pub algo: ChecksumAlgo,
    pub value: String,
}

impl Serialize for Checksum {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Checksum::parse(&raw))
    }
}

impl Checksum {
    pub fn blake3_of(data: &[u8]) -> Self {
        Self {
            algo: ChecksumAlgo::Blake3,
            value: hex::encode(blake3::hash(data).as_bytes()),
        }
    }

    pub fn from_hasher(hasher: blake3::Hasher) -> Self {
        Self {
            algo: ChecksumAlgo::Blake3,
            value: hex::encode(hasher.finalize().as_bytes()),
        }
    }

    /// Parse a `"ALGO:value"` header; bare values default to BLAKE3.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((algo, value)) if algo.eq_ignore_ascii_case("blake3") => Self {
                algo: ChecksumAlgo::Blake3,
                value: value.to_ascii_lowercase(),
            },
            Some((algo, value)) => Self {
                algo: ChecksumAlgo::Other(algo.to_string()),
                value: value.to_string(),
            },
            None => Self {
                algo: ChecksumAlgo::Blake3,
                value: raw.to_ascii_lowercase(),
            },
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo.as_str(), self.value)
    }
}

/// Remote permission mask for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(pub u32);

impl Permissions {
    pub const WRITE: u32 = 1 << 0;
    pub const DELETE: u32 = 1 << 1;
    pub const RENAME: u32 = 1 << 2;
    pub const CREATE_FILE: u32 = 1 << 3;
    pub const CREATE_DIR: u32 = 1 << 4;

    pub fn all() -> Self {
        Self(Self::WRITE | Self::DELETE | Self::RENAME | Self::CREATE_FILE | Self::CREATE_DIR)
    }

    pub fn read_only() -> Self {
        Self(0)
    }

    pub fn can_write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub fn can_delete(&self) -> bool {
        self.0 & Self::DELETE != 0
    }

    pub fn can_rename(&self) -> bool {
        self.0 & Self::RENAME != 0
    }

    pub fn can_create_file(&self) -> bool {
        self.0 & Self::CREATE_FILE != 0
    }

    pub fn can_create_dir(&self) -> bool {
        self.0 & Self::CREATE_DIR != 0
    }
}

/// Last-known-synchronized state of one item, keyed by `item_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub item_id: ItemId,
    pub path: RelPath,
    pub parent_id: Option<ItemId>,
    pub etag: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub permissions: Permissions,
    pub checksum: Option<Checksum>,
    pub kind: ItemKind,
    pub pin_state: PinState,
    pub in_conflict: bool,
}

/// A single durable journal change, committed in its own transaction.
#[derive(Debug, Clone)]
pub enum JournalMutation {
    Upsert(JournalRecord),
    Delete(ItemId),
    Rename { item_id: ItemId, to: RelPath },
    SetConflict { item_id: ItemId, flag: bool },
}

/// Problem the scanner noticed for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanIssue {
    /// Symbolic links are not synchronized.
    UnsupportedLink,
    /// Reserved, non-encodable, or otherwise unsyncable name.
    ReservedName,
    /// Entry metadata or content could not be read.
    Unreadable,
}

/// One local filesystem entry as seen by the scanner.
#[derive(Debug, Clone)]
pub struct LocalObservation {
    pub path: RelPath,
    pub kind: ItemKind,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub mode: Option<u32>,
    pub inode: Option<u64>,
    pub issue: Option<ScanIssue>,
    pub checksum: Option<Checksum>,
}

impl LocalObservation {
    pub fn is_unreadable(&self) -> bool {
        matches!(self.issue, Some(ScanIssue::Unreadable))
    }
}

/// All observations for one local directory.
#[derive(Debug, Clone)]
pub struct DirectoryScan {
    pub dir: RelPath,
    pub entries: Vec<LocalObservation>,
    /// Ignored entries whose presence still blocks deleting the parent chain.
    pub non_deletable: Vec<RelPath>,
    /// False when the directory could not be fully read; an incomplete scan
    /// must not be reconciled as deletions.
    pub complete: bool,
}

/// Compare modification times at journal precision (whole seconds).
pub fn same_mtime(a: &DateTime<Utc>, b: &DateTime<Utc>) -> bool {
    a.timestamp() == b.timestamp()
}
