use thiserror::Error;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal is locked by another running sync")]
    AlreadyLocked,

    #[error("Journal record is corrupt: {0}")]
    Corrupt(String),

    #[error("Scanner error: {0}")]
    Scanner(String),
}

pub type Result<T> = std::result::Result<T, JournalError>;
