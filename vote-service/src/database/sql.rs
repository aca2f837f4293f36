//! SQL statement constants for database operations
//!
//! Timestamps are unix milliseconds. Hashes and addresses are `0x`-prefixed
//! lowercase hex.

pub const CREATE_MIGRATIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL,
    description TEXT NOT NULL
)
"#;

pub const CREATE_VOTERS_TABLE_SQL: &str = r#"
CREATE TABLE voters (
    id TEXT PRIMARY KEY,
    wallet_address TEXT NOT NULL UNIQUE,
    is_verified INTEGER NOT NULL DEFAULT 0
)
"#;

pub const CREATE_ELECTIONS_TABLE_SQL: &str = r#"
CREATE TABLE elections (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    start_date INTEGER NOT NULL,
    end_date INTEGER NOT NULL,
    status TEXT NOT NULL,
    total_votes INTEGER NOT NULL DEFAULT 0 CHECK (total_votes >= 0)
)
"#;

pub const CREATE_CANDIDATES_TABLE_SQL: &str = r#"
CREATE TABLE candidates (
    id TEXT PRIMARY KEY,
    election_id TEXT NOT NULL REFERENCES elections(id),
    name TEXT NOT NULL,
    is_verified INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 0,
    vote_count INTEGER NOT NULL DEFAULT 0 CHECK (vote_count >= 0)
)
"#;

pub const CREATE_VOTED_ELECTIONS_TABLE_SQL: &str = r#"
CREATE TABLE voted_elections (
    voter_id TEXT NOT NULL REFERENCES voters(id),
    election_id TEXT NOT NULL REFERENCES elections(id),
    candidate_id TEXT NOT NULL REFERENCES candidates(id),
    tx_hash TEXT NOT NULL,
    voted_at INTEGER NOT NULL,
    PRIMARY KEY (voter_id, election_id)
)
"#;

pub const CREATE_VOTE_RECORDS_TABLE_SQL: &str = r#"
CREATE TABLE vote_records (
    id TEXT PRIMARY KEY,
    voter_id TEXT NOT NULL REFERENCES voters(id),
    candidate_id TEXT NOT NULL REFERENCES candidates(id),
    election_id TEXT NOT NULL REFERENCES elections(id),
    tx_hash TEXT NOT NULL CHECK (length(tx_hash) = 66),
    block_number INTEGER NOT NULL,
    gas_used INTEGER NOT NULL,
    cast_at INTEGER NOT NULL,
    is_valid INTEGER NOT NULL DEFAULT 1,
    -- SQLite reports the last declared constraint first; a replayed
    -- receipt must surface as a duplicate hash, not as a second vote
    CONSTRAINT uq_vote_records_voter_election UNIQUE (voter_id, election_id),
    CONSTRAINT uq_vote_records_tx_hash UNIQUE (tx_hash)
)
"#;

pub const CREATE_VOTE_ATTEMPTS_TABLE_SQL: &str = r#"
CREATE TABLE vote_attempts (
    id TEXT PRIMARY KEY,
    voter_id TEXT NOT NULL,
    candidate_id TEXT NOT NULL,
    election_id TEXT NOT NULL,
    voter_wallet TEXT NOT NULL,
    state TEXT NOT NULL,
    tx_hash TEXT,
    nonce INTEGER,
    from_block INTEGER,
    block_number INTEGER,
    gas_used INTEGER,
    last_error TEXT,
    cast_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

pub const CREATE_DB_INDEXES: &[&str] = &[
    // At most one in-flight attempt per voter and election
    "CREATE UNIQUE INDEX idx_attempts_in_flight ON vote_attempts(voter_id, election_id) \
     WHERE state IN ('VALIDATED', 'SUBMITTED_TO_LEDGER', 'LEDGER_CONFIRMED', 'LEDGER_TIMEOUT', 'RECONCILIATION_FAILED')",
    "CREATE INDEX idx_attempts_state ON vote_attempts(state, updated_at)",
    "CREATE INDEX idx_attempts_tx_hash ON vote_attempts(tx_hash)",
    "CREATE INDEX idx_candidates_election ON candidates(election_id)",
    "CREATE INDEX idx_vote_records_candidate ON vote_records(candidate_id, is_valid)",
];

pub const INSERT_VOTER_SQL: &str =
    "INSERT INTO voters (id, wallet_address, is_verified) VALUES (?, ?, ?)";

pub const INSERT_ELECTION_SQL: &str = "INSERT INTO elections \
     (id, title, start_date, end_date, status, total_votes) VALUES (?, ?, ?, ?, ?, ?)";

pub const INSERT_CANDIDATE_SQL: &str = "INSERT INTO candidates \
     (id, election_id, name, is_verified, is_active, vote_count) VALUES (?, ?, ?, ?, ?, ?)";

pub const INSERT_VOTED_ELECTION_SQL: &str = "INSERT INTO voted_elections \
     (voter_id, election_id, candidate_id, tx_hash, voted_at) VALUES (?, ?, ?, ?, ?)";

pub const INSERT_VOTE_RECORD_SQL: &str = "INSERT INTO vote_records \
     (id, voter_id, candidate_id, election_id, tx_hash, block_number, gas_used, cast_at, is_valid) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)";

pub const INSERT_VOTE_ATTEMPT_SQL: &str = "INSERT INTO vote_attempts \
     (id, voter_id, candidate_id, election_id, voter_wallet, state, tx_hash, nonce, from_block, \
      block_number, gas_used, last_error, cast_at, updated_at) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

/// Candidates whose counter disagrees with their valid records
pub const CANDIDATE_COUNTER_MISMATCH_SQL: &str = "SELECT id, counter, actual FROM ( \
     SELECT c.id AS id, c.vote_count AS counter, \
     (SELECT COUNT(*) FROM vote_records r WHERE r.candidate_id = c.id AND r.is_valid = 1) AS actual \
     FROM candidates c) WHERE counter != actual ORDER BY id";

/// Elections whose counter disagrees with their valid records
pub const ELECTION_COUNTER_MISMATCH_SQL: &str = "SELECT id, counter, actual FROM ( \
     SELECT e.id AS id, e.total_votes AS counter, \
     (SELECT COUNT(*) FROM vote_records r WHERE r.election_id = e.id AND r.is_valid = 1) AS actual \
     FROM elections e) WHERE counter != actual ORDER BY id";
