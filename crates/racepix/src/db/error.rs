//! Errors of the job database.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Creating the database directory or file failed.
    #[error("Cannot prepare database at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Migration {version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// A JSON column (`item_errors`, `file_manifest`) did not decode.
    #[error("Corrupt '{column}' column for job {id}: {reason}")]
    CorruptColumn {
        id: String,
        column: &'static str,
        reason: String,
    },

    #[error("Database lock poisoned")]
    LockPoisoned,
}
