//! Durable sync journal and local tree scanner
//!
//! This crate holds the per-root journal (the last-known-synchronized state
//! of every item, backed by SQLite) and the local filesystem scanner that
//! feeds discovery. It also defines the item vocabulary shared by the rest
//! of the workspace: stable item identities, relative paths, checksums, and
//! observation types.

pub mod errors;
pub mod journal;
pub mod scanner;
pub mod schema;
pub mod types;

pub use errors::{JournalError, Result};
pub use journal::Journal;
pub use scanner::{
    reserved_name, IgnoreClass, IgnoreMatcher, LocalTreeScanner, NoIgnores, ScannerConfig,
};
pub use types::{
    same_mtime, Checksum, ChecksumAlgo, DirectoryScan, ItemId, ItemKind, JournalMutation,
    JournalRecord, LocalObservation, Permissions, PinState, RelPath, ScanIssue,
};
