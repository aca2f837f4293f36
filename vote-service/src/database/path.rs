use std::path::{Component, Path};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};

use super::constants::BUSY_TIMEOUT_MS;

pub const MEMORY_PATH: &str = ":memory:";

/// Reject database paths that could escape the working tree or point at
/// something other than a regular file.
pub fn validate_db_path(db_path: &str) -> Result<()> {
    if db_path == MEMORY_PATH {
        return Ok(());
    }
    if db_path.is_empty() {
        bail!("Empty database path");
    }
    if db_path.contains(['\0', '\n', '\r', '\t']) {
        bail!("Invalid control characters in database path");
    }

    let path = Path::new(db_path);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        bail!("Parent directory traversal is not allowed in database path");
    }
    if path.file_name().is_none() {
        bail!("Database path must include a file name");
    }

    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.file_type().is_symlink() {
            bail!("Symlink path is not allowed for database path");
        }
        if meta.is_dir() {
            bail!("Database path points to a directory");
        }
    }
    Ok(())
}

/// Connection options for a validated path. Files use WAL with a busy
/// timeout so readers never block the writer.
pub fn connect_options(db_path: &str) -> Result<SqliteConnectOptions> {
    validate_db_path(db_path)?;

    if db_path == MEMORY_PATH {
        return Ok(SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true));
    }

    Ok(SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
        .foreign_keys(true))
}
