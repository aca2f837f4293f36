#![allow(dead_code)]

use std::process::{Command, Stdio};
use std::sync::Arc;
use std::{
    net::TcpListener,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{Duration as ChronoDuration, Utc};
use reqwest::Client;
use tokio::time::sleep;

use vote_service::config::{LedgerConfig, RepairConfig};
use vote_service::coordinator::{CastVoteRequest, VoteCoordinator};
use vote_service::database::models::{
    Candidate, Election, ElectionStatus, VoteAttempt, VoteRecord, Voter,
};
use vote_service::database::Database;
use vote_service::ledger::{Address, NullLedger, SubmissionClient};
use vote_service::repair::RepairJob;

pub const CONTRACT: Address = Address([0xc0; 20]);
pub const RELAYER: Address = Address([0x0e; 20]);

/// Coordinator wired to an in-memory store and a null ledger
pub struct Harness {
    pub db: Database,
    pub ledger: Arc<NullLedger>,
    pub client: Arc<SubmissionClient>,
    pub coordinator: VoteCoordinator,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_ledger_config(ledger_config()).await
    }

    pub async fn with_ledger_config(config: LedgerConfig) -> Self {
        let db = Database::connect(":memory:").await.unwrap();
        seed(&db).await;
        let ledger = Arc::new(NullLedger::new());
        let client = Arc::new(SubmissionClient::new(ledger.clone(), &config));
        let coordinator =
            VoteCoordinator::new(db.pool().clone(), client.clone(), Duration::from_secs(5));
        Harness {
            db,
            ledger,
            client,
            coordinator,
        }
    }

    pub fn repair_job(&self, config: RepairConfig) -> RepairJob {
        RepairJob::new(
            self.db.pool().clone(),
            self.client.clone(),
            self.coordinator.writer().clone(),
            config,
        )
    }

    pub async fn candidate_votes(&self, id: &str) -> i64 {
        let mut conn = self.db.pool().acquire().await.unwrap();
        Candidate::get_by_id(&mut conn, id).await.unwrap().unwrap().vote_count
    }

    pub async fn election_votes(&self, id: &str) -> i64 {
        let mut conn = self.db.pool().acquire().await.unwrap();
        Election::get_by_id(&mut conn, id).await.unwrap().unwrap().total_votes
    }

    pub async fn record_count(&self) -> i64 {
        let mut conn = self.db.pool().acquire().await.unwrap();
        VoteRecord::count(&mut conn).await.unwrap()
    }

    pub async fn attempt(&self, id: uuid::Uuid) -> VoteAttempt {
        self.coordinator.get_attempt(id).await.unwrap().unwrap()
    }

    /// Wait until the null ledger has accepted `count` transactions
    pub async fn wait_for_transactions(&self, count: usize) {
        for _ in 0..200 {
            if self.ledger.transactions().len() >= count {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("ledger never saw {} transactions", count);
    }
}

/// Short timeouts so ledger failure paths finish quickly
pub fn ledger_config() -> LedgerConfig {
    let mut config = LedgerConfig::new("http://127.0.0.1:8545", CONTRACT, RELAYER);
    config.receipt_timeout = Duration::from_millis(200);
    config.receipt_poll_interval = Duration::from_millis(5);
    config.backoff_base = Duration::from_millis(1);
    config.backoff_max = Duration::from_millis(5);
    config
}

/// Repair settings that treat every in-flight attempt as stale
pub fn eager_repair() -> RepairConfig {
    RepairConfig {
        stale_after: Duration::ZERO,
        ..Default::default()
    }
}

pub fn vote(voter: &str, candidate: &str, election: &str) -> CastVoteRequest {
    CastVoteRequest {
        voter_id: voter.to_string(),
        candidate_id: candidate.to_string(),
        election_id: election.to_string(),
    }
}

pub fn wallet(n: u8) -> Address {
    Address([n; 20])
}

/// Voters `v1`..`v5` (verified) and `unverified`; election `open` with
/// candidates `alpha` and `beta`; election `closed` (ended yesterday) with
/// candidate `gamma`.
pub async fn seed(db: &Database) {
    let mut conn = db.pool().acquire().await.unwrap();
    let now = Utc::now();

    for n in 1..=5u8 {
        Voter {
            id: format!("v{}", n),
            wallet_address: wallet(n).to_string(),
            is_verified: true,
        }
        .insert(&mut conn)
        .await
        .unwrap();
    }
    Voter {
        id: "unverified".into(),
        wallet_address: wallet(0x99).to_string(),
        is_verified: false,
    }
    .insert(&mut conn)
    .await
    .unwrap();

    for (id, start, end) in [
        ("open", now - ChronoDuration::days(1), now + ChronoDuration::days(1)),
        ("closed", now - ChronoDuration::days(3), now - ChronoDuration::days(1)),
    ] {
        Election {
            id: id.into(),
            title: format!("{} election", id),
            start_date: start,
            end_date: end,
            status: ElectionStatus::Active,
            total_votes: 0,
        }
        .insert(&mut conn)
        .await
        .unwrap();
    }

    for (id, election) in [("alpha", "open"), ("beta", "open"), ("gamma", "closed")] {
        Candidate {
            id: id.into(),
            election_id: election.into(),
            name: id.to_uppercase(),
            is_verified: true,
            is_active: true,
            vote_count: 0,
        }
        .insert(&mut conn)
        .await
        .unwrap();
    }
}

/// Get an available ephemeral port on localhost.
pub fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Resolve the vote-service binary path from env or common target dirs.
pub fn resolve_binary_path() -> String {
    if let Some(p) = option_env!("CARGO_BIN_EXE_vote-service") {
        return p.to_string();
    }

    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let workspace_root = manifest.parent().unwrap_or(&manifest).to_path_buf();
    let candidates = [
        manifest.join("target/debug/vote-service"),
        manifest.join("target/release/vote-service"),
        workspace_root.join("target/debug/vote-service"),
        workspace_root.join("target/release/vote-service"),
    ];
    for cand in candidates.iter() {
        if Path::new(&cand).exists() {
            return cand.to_string_lossy().to_string();
        }
    }

    "vote-service".to_string()
}

/// Poll /healthz until the server responds OK or timeout.
pub async fn wait_ready(base: &str, timeout_ms: u64) -> anyhow::Result<()> {
    let client = Client::new();
    let mut waited = 0u64;
    loop {
        if waited >= timeout_ms {
            anyhow::bail!("server not ready after {}ms", timeout_ms);
        }
        if let Ok(resp) = client.get(format!("{}/healthz", base)).send().await {
            if resp.status().is_success() {
                return Ok(());
            }
        }
        sleep(Duration::from_millis(50)).await;
        waited += 50;
    }
}

// Struct that ensures the child process is killed on drop
pub struct ChildGuard(std::process::Child);
impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
    }
}

/// Start the service binary on a file database. The ledger endpoint points
/// at a closed port, so anything that reaches the ledger fails.
pub async fn setup_server(db_path: &Path) -> anyhow::Result<(String, ChildGuard)> {
    let bin = resolve_binary_path();
    let bin_path = Path::new(&bin);
    assert!(bin_path.exists(), "binary not found at {}", bin);

    let port = find_free_port();
    let base_url = format!("http://127.0.0.1:{}", port);
    let rpc_port = find_free_port();

    let child = Command::new(&bin)
        .env("DB_PATH", db_path)
        .env("PORT", port.to_string())
        .env("RPC_URL", format!("http://127.0.0.1:{}", rpc_port))
        .env("CONTRACT_ADDRESS", CONTRACT.to_string())
        .env("RELAYER_ADDRESS", RELAYER.to_string())
        .env("SUBMIT_MAX_ATTEMPTS", "1")
        .env("RUST_LOG", "info")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    // Ensure we always try to kill the child on exit
    let guard = ChildGuard(child);

    wait_ready(&base_url, 10_000).await?;

    Ok((base_url, guard))
}
