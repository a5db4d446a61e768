//! Remote store access for vela
//!
//! This crate owns everything that talks to the remote, versioned file
//! store: the HTTP(S) client speaking the JSON protocol, the recursive tree
//! lister, and the chunked/resumable transfer manager. The engine consumes
//! all of it through the [`RemoteStore`] trait so tests can substitute an
//! in-memory store.

pub mod cancel;
pub mod client;
pub mod errors;
pub mod lister;
pub mod store;
pub mod transfer;

pub use cancel::CancelFlag;
pub use client::{Credentials, HttpConfig, HttpRemoteStore, CHECKSUM_HEADER};
pub use errors::{RemoteError, Result};
pub use lister::{DirectoryListing, ListerConfig, RemoteObservation, RemoteTreeLister};
pub use store::{
    DownloadStream, FinalizeOutcome, ListPage, PollStatus, RemoteEntry, RemoteStore, UploadSession,
};
pub use transfer::{
    DownloadExpectation, DownloadedContent, TransferConfig, TransferManager, UploadSnapshot,
};
