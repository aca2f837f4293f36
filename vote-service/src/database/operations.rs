use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::debug;
use uuid::Uuid;

use super::models::*;
use super::sql::*;
use super::{from_millis, to_millis};
use crate::ledger::{LedgerReceipt, TxHash};

fn parse_column<T>(column: &str, raw: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse().map_err(|e: T::Err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: e.to_string().into(),
    })
}

fn to_u64(column: &str, value: i64) -> Result<u64, sqlx::Error> {
    u64::try_from(value).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn opt_u64(row: &SqliteRow, column: &str) -> Result<Option<u64>, sqlx::Error> {
    row.try_get::<Option<i64>, _>(column)?
        .map(|v| to_u64(column, v))
        .transpose()
}

/// SQLite integers are signed
fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Database operations for voters
impl Voter {
    pub async fn insert(&self, conn: &mut SqliteConnection) -> sqlx::Result<()> {
        debug!("Inserting voter {}", self.id);
        sqlx::query(INSERT_VOTER_SQL)
            .bind(&self.id)
            .bind(&self.wallet_address)
            .bind(self.is_verified)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn get_by_id(conn: &mut SqliteConnection, id: &str) -> sqlx::Result<Option<Voter>> {
        let row = sqlx::query("SELECT * FROM voters WHERE id = ?")
            .bind(id)
            .fetch_optional(conn)
            .await?;
        row.map(|r| Self::from_row(&r)).transpose()
    }

    pub async fn set_verified(
        conn: &mut SqliteConnection,
        id: &str,
        verified: bool,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query("UPDATE voters SET is_verified = ? WHERE id = ?")
            .bind(verified)
            .bind(id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Voter {
            id: row.try_get("id")?,
            wallet_address: row.try_get("wallet_address")?,
            is_verified: row.try_get("is_verified")?,
        })
    }
}

/// Database operations for elections
impl Election {
    pub async fn insert(&self, conn: &mut SqliteConnection) -> sqlx::Result<()> {
        debug!("Inserting election {}", self.id);
        sqlx::query(INSERT_ELECTION_SQL)
            .bind(&self.id)
            .bind(&self.title)
            .bind(to_millis(self.start_date))
            .bind(to_millis(self.end_date))
            .bind(self.status.as_str())
            .bind(self.total_votes)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn get_by_id(
        conn: &mut SqliteConnection,
        id: &str,
    ) -> sqlx::Result<Option<Election>> {
        let row = sqlx::query("SELECT * FROM elections WHERE id = ?")
            .bind(id)
            .fetch_optional(conn)
            .await?;
        row.map(|r| Self::from_row(&r)).transpose()
    }

    /// Add `delta` to the total-vote counter
    pub async fn adjust_total_votes(
        conn: &mut SqliteConnection,
        id: &str,
        delta: i64,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query("UPDATE elections SET total_votes = total_votes + ? WHERE id = ?")
            .bind(delta)
            .bind(id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let status: String = row.try_get("status")?;
        Ok(Election {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            start_date: from_millis("start_date", row.try_get("start_date")?)?,
            end_date: from_millis("end_date", row.try_get("end_date")?)?,
            status: parse_column("status", &status)?,
            total_votes: row.try_get("total_votes")?,
        })
    }
}

/// Database operations for candidates
impl Candidate {
    pub async fn insert(&self, conn: &mut SqliteConnection) -> sqlx::Result<()> {
        debug!("Inserting candidate {} for election {}", self.id, self.election_id);
        sqlx::query(INSERT_CANDIDATE_SQL)
            .bind(&self.id)
            .bind(&self.election_id)
            .bind(&self.name)
            .bind(self.is_verified)
            .bind(self.is_active)
            .bind(self.vote_count)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn get_by_id(
        conn: &mut SqliteConnection,
        id: &str,
    ) -> sqlx::Result<Option<Candidate>> {
        let row = sqlx::query("SELECT * FROM candidates WHERE id = ?")
            .bind(id)
            .fetch_optional(conn)
            .await?;
        row.map(|r| Self::from_row(&r)).transpose()
    }

    /// Add `delta` to the candidate's vote counter
    pub async fn adjust_vote_count(
        conn: &mut SqliteConnection,
        id: &str,
        delta: i64,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query("UPDATE candidates SET vote_count = vote_count + ? WHERE id = ?")
            .bind(delta)
            .bind(id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_active(
        conn: &mut SqliteConnection,
        id: &str,
        active: bool,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query("UPDATE candidates SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Candidate {
            id: row.try_get("id")?,
            election_id: row.try_get("election_id")?,
            name: row.try_get("name")?,
            is_verified: row.try_get("is_verified")?,
            is_active: row.try_get("is_active")?,
            vote_count: row.try_get("vote_count")?,
        })
    }
}

/// Database operations for the voted-elections list
impl VotedElection {
    pub async fn insert(&self, conn: &mut SqliteConnection) -> sqlx::Result<()> {
        sqlx::query(INSERT_VOTED_ELECTION_SQL)
            .bind(&self.voter_id)
            .bind(&self.election_id)
            .bind(&self.candidate_id)
            .bind(self.tx_hash.to_string())
            .bind(to_millis(self.voted_at))
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn exists(
        conn: &mut SqliteConnection,
        voter_id: &str,
        election_id: &str,
    ) -> sqlx::Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM voted_elections WHERE voter_id = ? AND election_id = ?",
        )
        .bind(voter_id)
        .bind(election_id)
        .fetch_optional(conn)
        .await?;
        Ok(found.is_some())
    }

    pub async fn list_for_voter(
        conn: &mut SqliteConnection,
        voter_id: &str,
    ) -> sqlx::Result<Vec<VotedElection>> {
        let rows = sqlx::query("SELECT * FROM voted_elections WHERE voter_id = ? ORDER BY voted_at")
            .bind(voter_id)
            .fetch_all(conn)
            .await?;
        rows.iter().map(Self::from_row).collect()
    }

    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let tx_hash: String = row.try_get("tx_hash")?;
        Ok(VotedElection {
            voter_id: row.try_get("voter_id")?,
            election_id: row.try_get("election_id")?,
            candidate_id: row.try_get("candidate_id")?,
            tx_hash: parse_column("tx_hash", &tx_hash)?,
            voted_at: from_millis("voted_at", row.try_get("voted_at")?)?,
        })
    }
}

/// Database operations for vote records
impl VoteRecord {
    pub async fn insert(&self, conn: &mut SqliteConnection) -> sqlx::Result<()> {
        debug!(
            "Inserting vote record {} for voter {} in election {}",
            self.tx_hash, self.voter_id, self.election_id
        );
        sqlx::query(INSERT_VOTE_RECORD_SQL)
            .bind(&self.id)
            .bind(&self.voter_id)
            .bind(&self.candidate_id)
            .bind(&self.election_id)
            .bind(self.tx_hash.to_string())
            .bind(to_i64(self.block_number))
            .bind(to_i64(self.gas_used))
            .bind(to_millis(self.cast_at))
            .bind(self.is_valid)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn get_by_tx_hash(
        conn: &mut SqliteConnection,
        tx_hash: &TxHash,
    ) -> sqlx::Result<Option<VoteRecord>> {
        let row = sqlx::query("SELECT * FROM vote_records WHERE tx_hash = ?")
            .bind(tx_hash.to_string())
            .fetch_optional(conn)
            .await?;
        row.map(|r| Self::from_row(&r)).transpose()
    }

    pub async fn get_by_voter_election(
        conn: &mut SqliteConnection,
        voter_id: &str,
        election_id: &str,
    ) -> sqlx::Result<Option<VoteRecord>> {
        let row = sqlx::query("SELECT * FROM vote_records WHERE voter_id = ? AND election_id = ?")
            .bind(voter_id)
            .bind(election_id)
            .fetch_optional(conn)
            .await?;
        row.map(|r| Self::from_row(&r)).transpose()
    }

    /// Clear the validity flag. Returns false when the record is missing or
    /// already invalid.
    pub async fn invalidate(conn: &mut SqliteConnection, tx_hash: &TxHash) -> sqlx::Result<bool> {
        let result =
            sqlx::query("UPDATE vote_records SET is_valid = 0 WHERE tx_hash = ? AND is_valid = 1")
                .bind(tx_hash.to_string())
                .execute(conn)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn count(conn: &mut SqliteConnection) -> sqlx::Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM vote_records")
            .fetch_one(conn)
            .await
    }

    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let tx_hash: String = row.try_get("tx_hash")?;
        Ok(VoteRecord {
            id: row.try_get("id")?,
            voter_id: row.try_get("voter_id")?,
            candidate_id: row.try_get("candidate_id")?,
            election_id: row.try_get("election_id")?,
            tx_hash: parse_column("tx_hash", &tx_hash)?,
            block_number: to_u64("block_number", row.try_get("block_number")?)?,
            gas_used: to_u64("gas_used", row.try_get("gas_used")?)?,
            cast_at: from_millis("cast_at", row.try_get("cast_at")?)?,
            is_valid: row.try_get("is_valid")?,
        })
    }
}

/// Columns written alongside a state change. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptUpdate {
    pub tx_hash: Option<TxHash>,
    pub nonce: Option<u64>,
    pub from_block: Option<u64>,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub error: Option<String>,
}

impl AttemptUpdate {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn receipt(receipt: &LedgerReceipt) -> Self {
        Self {
            tx_hash: Some(receipt.transaction_hash),
            block_number: Some(receipt.block_number),
            gas_used: Some(receipt.gas_used),
            ..Default::default()
        }
    }
}

/// Database operations for the vote attempt journal
impl VoteAttempt {
    pub async fn insert(&self, conn: &mut SqliteConnection) -> sqlx::Result<()> {
        debug!(
            "Journaling attempt {} for voter {} in election {}",
            self.id, self.voter_id, self.election_id
        );
        sqlx::query(INSERT_VOTE_ATTEMPT_SQL)
            .bind(self.id.to_string())
            .bind(&self.voter_id)
            .bind(&self.candidate_id)
            .bind(&self.election_id)
            .bind(self.voter_wallet.to_string())
            .bind(self.state.as_str())
            .bind(self.tx_hash.map(|h| h.to_string()))
            .bind(self.nonce.map(to_i64))
            .bind(self.from_block.map(to_i64))
            .bind(self.block_number.map(to_i64))
            .bind(self.gas_used.map(to_i64))
            .bind(&self.last_error)
            .bind(to_millis(self.cast_at))
            .bind(to_millis(self.updated_at))
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn get_by_id(
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> sqlx::Result<Option<VoteAttempt>> {
        let row = sqlx::query("SELECT * FROM vote_attempts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(conn)
            .await?;
        row.map(|r| Self::from_row(&r)).transpose()
    }

    /// Attempts in `state` last touched at or before `updated_before`,
    /// oldest first
    pub async fn list_by_state(
        conn: &mut SqliteConnection,
        state: AttemptState,
        updated_before: DateTime<Utc>,
        limit: u32,
    ) -> sqlx::Result<Vec<VoteAttempt>> {
        let rows = sqlx::query(
            "SELECT * FROM vote_attempts WHERE state = ? AND updated_at <= ? \
             ORDER BY updated_at LIMIT ?",
        )
        .bind(state.as_str())
        .bind(to_millis(updated_before))
        .bind(i64::from(limit))
        .fetch_all(conn)
        .await?;
        rows.iter().map(Self::from_row).collect()
    }

    /// Most recent attempts, optionally restricted to one state
    pub async fn list_recent(
        conn: &mut SqliteConnection,
        state: Option<AttemptState>,
        limit: u32,
    ) -> sqlx::Result<Vec<VoteAttempt>> {
        let rows = match state {
            Some(state) => {
                sqlx::query(
                    "SELECT * FROM vote_attempts WHERE state = ? ORDER BY cast_at DESC LIMIT ?",
                )
                .bind(state.as_str())
                .bind(i64::from(limit))
                .fetch_all(conn)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM vote_attempts ORDER BY cast_at DESC LIMIT ?")
                    .bind(i64::from(limit))
                    .fetch_all(conn)
                    .await?
            }
        };
        rows.iter().map(Self::from_row).collect()
    }

    /// Record the nonce a `VALIDATED` attempt is about to be sent with.
    /// Returns false when the attempt is no longer `VALIDATED`.
    pub async fn reserve_nonce(
        conn: &mut SqliteConnection,
        id: Uuid,
        nonce: u64,
        from_block: u64,
        now: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        debug!("Attempt {} reserves nonce {}", id, nonce);
        let result = sqlx::query(
            "UPDATE vote_attempts SET nonce = ?, from_block = ?, updated_at = ? \
             WHERE id = ? AND state = ?",
        )
        .bind(to_i64(nonce))
        .bind(to_i64(from_block))
        .bind(to_millis(now))
        .bind(id.to_string())
        .bind(AttemptState::Validated.as_str())
        .execute(conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Move the attempt from `from` to `to` if it is still in `from`.
    /// Returns false when another writer moved it first.
    pub async fn transition(
        conn: &mut SqliteConnection,
        id: Uuid,
        from: AttemptState,
        to: AttemptState,
        update: &AttemptUpdate,
        now: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        if !from.can_transition_to(to) {
            return Err(sqlx::Error::Protocol(format!(
                "invalid attempt transition {} -> {}",
                from, to
            )));
        }
        debug!("Attempt {}: {} -> {}", id, from, to);

        let result = sqlx::query(
            "UPDATE vote_attempts SET state = ?, \
             tx_hash = COALESCE(?, tx_hash), \
             nonce = COALESCE(?, nonce), \
             from_block = COALESCE(?, from_block), \
             block_number = COALESCE(?, block_number), \
             gas_used = COALESCE(?, gas_used), \
             last_error = COALESCE(?, last_error), \
             updated_at = ? \
             WHERE id = ? AND state = ?",
        )
        .bind(to.as_str())
        .bind(update.tx_hash.map(|h| h.to_string()))
        .bind(update.nonce.map(to_i64))
        .bind(update.from_block.map(to_i64))
        .bind(update.block_number.map(to_i64))
        .bind(update.gas_used.map(to_i64))
        .bind(update.error.as_deref())
        .bind(to_millis(now))
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let id: String = row.try_get("id")?;
        let voter_wallet: String = row.try_get("voter_wallet")?;
        let state: String = row.try_get("state")?;
        let tx_hash: Option<String> = row.try_get("tx_hash")?;
        Ok(VoteAttempt {
            id: parse_column("id", &id)?,
            voter_id: row.try_get("voter_id")?,
            candidate_id: row.try_get("candidate_id")?,
            election_id: row.try_get("election_id")?,
            voter_wallet: parse_column("voter_wallet", &voter_wallet)?,
            state: parse_column("state", &state)?,
            tx_hash: tx_hash
                .map(|h| parse_column("tx_hash", &h))
                .transpose()?,
            nonce: opt_u64(row, "nonce")?,
            from_block: opt_u64(row, "from_block")?,
            block_number: opt_u64(row, "block_number")?,
            gas_used: opt_u64(row, "gas_used")?,
            last_error: row.try_get("last_error")?,
            cast_at: from_millis("cast_at", row.try_get("cast_at")?)?,
            updated_at: from_millis("updated_at", row.try_get("updated_at")?)?,
        })
    }
}

/// Database operations for counter audits
impl CounterMismatch {
    pub async fn for_candidates(conn: &mut SqliteConnection) -> sqlx::Result<Vec<CounterMismatch>> {
        Self::query(conn, CANDIDATE_COUNTER_MISMATCH_SQL).await
    }

    pub async fn for_elections(conn: &mut SqliteConnection) -> sqlx::Result<Vec<CounterMismatch>> {
        Self::query(conn, ELECTION_COUNTER_MISMATCH_SQL).await
    }

    async fn query(conn: &mut SqliteConnection, sql: &str) -> sqlx::Result<Vec<CounterMismatch>> {
        let rows = sqlx::query(sql).fetch_all(conn).await?;
        rows.iter()
            .map(|row| {
                Ok(CounterMismatch {
                    id: row.try_get("id")?,
                    counter: row.try_get("counter")?,
                    actual: row.try_get("actual")?,
                })
            })
            .collect()
    }
}
