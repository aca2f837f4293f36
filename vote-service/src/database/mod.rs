pub mod constants;
pub mod migrator;
pub mod models;
pub mod operations;
pub mod path;
pub mod sql;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

use constants::FILE_POOL_SIZE;
use path::MEMORY_PATH;

pub use migrator::run_migrations;

/// Database manager for the vote service
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: String,
}

impl Database {
    /// Open the pool and run migrations
    pub async fn connect(db_path: &str) -> Result<Self> {
        info!("Initializing database at {:?}", db_path);

        let options = path::connect_options(db_path)?;
        let pool = if db_path == MEMORY_PATH {
            // Every connection to :memory: is a separate database, so keep
            // exactly one alive for the lifetime of the pool.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(FILE_POOL_SIZE)
                .connect_with(options)
                .await?
        };

        run_migrations(&pool).await?;
        info!("Database initialized successfully");

        Ok(Database {
            pool,
            path: db_path.to_string(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_memory(&self) -> bool {
        self.path == MEMORY_PATH
    }
}

/// Which uniqueness rule an insert broke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueViolation {
    /// A vote record already carries this transaction hash
    TxHash,
    /// The voter already has a vote or voted-elections entry for the election
    VoterElection,
    /// Another attempt for the voter and election is still in flight
    InFlightAttempt,
}

pub fn unique_violation(err: &sqlx::Error) -> Option<UniqueViolation> {
    let sqlx::Error::Database(db) = err else {
        return None;
    };
    if !db.is_unique_violation() {
        return None;
    }
    let message = db.message();
    if message.contains("vote_records.tx_hash") {
        Some(UniqueViolation::TxHash)
    } else if message.contains("vote_attempts.") {
        Some(UniqueViolation::InFlightAttempt)
    } else if message.contains("voter_id") {
        Some(UniqueViolation::VoterElection)
    } else {
        None
    }
}

/// SQLITE_BUSY or SQLITE_LOCKED, including extended codes
pub fn is_busy(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = err else {
        return false;
    };
    let Some(code) = db.code() else {
        return false;
    };
    match code.parse::<i32>() {
        Ok(code) => matches!(code & 0xff, 5 | 6),
        Err(_) => false,
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(column: &str, millis: i64) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: format!("timestamp out of range: {}", millis).into(),
    })
}
