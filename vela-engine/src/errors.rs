//! Error types for the sync engine

use thiserror::Error;
use vela_journal::JournalError;
use vela_remote::RemoteError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Placeholder layer error: {0}")]
    Placeholder(String),

    #[error("Download would leave only {free} free bytes (floor is {floor})")]
    DiskFull { free: u64, floor: u64 },

    #[error("Sync run setup failed: {0}")]
    Setup(String),

    #[error("Run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EngineError>;
