use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use log::{info, warn};
use serde_json::json;
use tokio::runtime::Builder;
use vote_cli::cli_types::{CounterKind, OutputFormat};
use vote_cli::utils::*;
use vote_cli::{format_attempt, format_report, render, verify, AuditFinding};
use vote_service::config::{LedgerConfig, RepairConfig};
use vote_service::database::constants::DEFAULT_DB_PATH;
use vote_service::database::models::{AttemptState, CounterMismatch, VoteAttempt, VoteRecord};
use vote_service::database::Database;
use vote_service::ledger::{Address, JsonRpcClient, SubmissionClient, TxHash};
use vote_service::reconcile::{Invalidation, ReconciliationWriter};
use vote_service::repair::RepairJob;

#[derive(Clone, Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(long, env = "DB_PATH", default_value = DEFAULT_DB_PATH)]
    pub db_path: String,

    #[arg(long, env = "RPC_URL", default_value = "http://localhost:8545")]
    pub rpc_url: String,

    #[arg(long, env = "CONTRACT_ADDRESS", value_parser = parse_address)]
    pub contract_address: Option<Address>,

    #[arg(long, env = "RELAYER_ADDRESS", value_parser = parse_address)]
    pub relayer_address: Option<Address>,

    #[arg(long, env = "RPC_TIMEOUT_SECS", default_value = "5")]
    pub rpc_timeout_secs: u64,

    #[arg(long, default_value = "text", value_parser = parse_output_format)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    fn ledger_client(&self) -> Result<Arc<SubmissionClient>> {
        let contract = self
            .contract_address
            .ok_or_else(|| anyhow!("--contract-address is required for this command"))?;
        let relayer = self
            .relayer_address
            .ok_or_else(|| anyhow!("--relayer-address is required for this command"))?;
        let config = LedgerConfig::new(&self.rpc_url, contract, relayer);
        let rpc = JsonRpcClient::new(&self.rpc_url, Duration::from_secs(self.rpc_timeout_secs))?;
        Ok(Arc::new(SubmissionClient::new(Arc::new(rpc), &config)))
    }
}

#[derive(clap::Subcommand, Clone)]
pub enum Commands {
    /// Run one repair pass over unsettled vote attempts
    Reconcile {
        #[arg(long, default_value = "120", help = "Age in seconds before an in-flight attempt is repaired")]
        stale_after_secs: u64,

        #[arg(long, default_value = "3600", help = "Seconds after which an unresolved attempt is logged as overdue")]
        pending_expiry_secs: u64,

        #[arg(long, default_value = "100")]
        batch_size: u32,
    },
    /// List recent vote attempts
    Attempts {
        #[arg(long, value_parser = parse_attempt_state, help = "Only attempts in this state, e.g. ledger-timeout")]
        state: Option<AttemptState>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Invalidate a recorded vote and take it off the counters
    Invalidate {
        #[arg(long, value_parser = parse_tx_hash)]
        tx_hash: TxHash,
    },
    /// Compare a recorded vote with its ledger receipt
    Verify {
        #[arg(long, value_parser = parse_tx_hash)]
        tx_hash: TxHash,
    },
    /// Check candidate and election counters against the valid records
    Audit {},
}

fn main() -> Result<()> {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(false)
        .try_init();

    let cli = Cli::parse();
    let runtime = Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let db = Database::connect(&cli.db_path).await?;
    let format = cli.format;

    match cli.command.clone() {
        Commands::Reconcile {
            stale_after_secs,
            pending_expiry_secs,
            batch_size,
        } => {
            let client = cli.ledger_client()?;
            let pool = db.pool().clone();
            let config = RepairConfig {
                stale_after: Duration::from_secs(stale_after_secs),
                pending_expiry: Duration::from_secs(pending_expiry_secs),
                batch_size,
                ..RepairConfig::default()
            };
            let job = RepairJob::new(pool.clone(), client, ReconciliationWriter::new(pool), config);

            info!("Running repair pass against {}", cli.rpc_url);
            let report = job.run_once().await?;
            println!("{}", render(format, &report, || format_report(&report))?);
        }
        Commands::Attempts { state, limit } => {
            let mut conn = db.pool().acquire().await?;
            let attempts = VoteAttempt::list_recent(&mut conn, state, limit).await?;
            let text = || {
                if attempts.is_empty() {
                    return "no vote attempts".to_string();
                }
                attempts
                    .iter()
                    .map(format_attempt)
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            println!("{}", render(format, &attempts, text)?);
        }
        Commands::Invalidate { tx_hash } => {
            let writer = ReconciliationWriter::new(db.pool().clone());
            let (invalidated, record) = match writer.invalidate(&tx_hash).await? {
                Invalidation::Invalidated(record) => (true, record),
                Invalidation::AlreadyInvalid(record) => (false, record),
                Invalidation::NotFound => bail!("no vote recorded for {}", tx_hash),
            };
            let value = json!({ "invalidated": invalidated, "vote": record });
            let text = || {
                if invalidated {
                    format!(
                        "invalidated vote {} for candidate {} in election {}",
                        tx_hash, record.candidate_id, record.election_id
                    )
                } else {
                    format!("vote {} was already invalid", tx_hash)
                }
            };
            println!("{}", render(format, &value, text)?);
        }
        Commands::Verify { tx_hash } => {
            let client = cli.ledger_client()?;
            let record = {
                let mut conn = db.pool().acquire().await?;
                VoteRecord::get_by_tx_hash(&mut conn, &tx_hash).await?
            };
            let receipt = client.check_receipt(&tx_hash).await?;
            let verification = verify(record.as_ref(), receipt.as_ref());
            println!(
                "{}",
                render(format, &verification, || verification.to_string())?
            );
            if !verification.is_verified() {
                bail!("vote {} did not verify", tx_hash);
            }
        }
        Commands::Audit {} => {
            let mut conn = db.pool().acquire().await?;
            let tag = |kind: CounterKind| {
                move |mismatch: CounterMismatch| AuditFinding { kind, mismatch }
            };
            let mut findings: Vec<AuditFinding> = CounterMismatch::for_candidates(&mut conn)
                .await?
                .into_iter()
                .map(tag(CounterKind::Candidate))
                .collect();
            findings.extend(
                CounterMismatch::for_elections(&mut conn)
                    .await?
                    .into_iter()
                    .map(tag(CounterKind::Election)),
            );

            let text = || {
                if findings.is_empty() {
                    return "all counters match the valid vote records".to_string();
                }
                findings
                    .iter()
                    .map(|f| f.to_string())
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            println!("{}", render(format, &findings, text)?);
            if !findings.is_empty() {
                warn!("Audit found {} counter mismatches", findings.len());
                bail!("counter audit failed");
            }
        }
    }

    Ok(())
}
