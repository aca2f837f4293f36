//! Database migration constants and metadata

/// Current database schema version
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Migration descriptions
pub const MIGRATION_DESCRIPTIONS: &[&str] = &["Voting schema with vote attempt journal"];

/// Default database file name
pub const DEFAULT_DB_PATH: &str = "votes.db";

/// Connections in the pool of a file-backed database
pub const FILE_POOL_SIZE: u32 = 8;

/// How long SQLite waits on a locked database before returning SQLITE_BUSY
pub const BUSY_TIMEOUT_MS: u64 = 5_000;
