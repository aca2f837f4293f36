pub mod cli_types;
pub mod utils;

use std::fmt;

use anyhow::Result;
use serde::Serialize;
use vote_service::database::models::{CounterMismatch, VoteAttempt, VoteRecord};
use vote_service::ledger::LedgerReceipt;
use vote_service::repair::RepairReport;

use crate::cli_types::{CounterKind, OutputFormat};

/// Local record compared with the chain receipt of the same transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Verification {
    Verified { block_number: u64 },
    NotRecorded,
    /// Mined successfully but never committed locally
    MinedNotRecorded { block_number: u64 },
    NotOnLedger,
    Reverted { block_number: u64 },
    BlockMismatch { local: u64, ledger: u64 },
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Verification::Verified { .. })
    }
}

impl fmt::Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verification::Verified { block_number } => {
                write!(f, "verified: recorded and mined in block {}", block_number)
            }
            Verification::NotRecorded => write!(f, "no local record for this transaction"),
            Verification::MinedNotRecorded { block_number } => write!(
                f,
                "mined in block {} but missing from the local records",
                block_number
            ),
            Verification::NotOnLedger => write!(f, "recorded locally but not mined on the ledger"),
            Verification::Reverted { block_number } => {
                write!(f, "recorded locally but reverted in block {}", block_number)
            }
            Verification::BlockMismatch { local, ledger } => write!(
                f,
                "block mismatch: recorded as block {}, mined in block {}",
                local, ledger
            ),
        }
    }
}

pub fn verify(record: Option<&VoteRecord>, receipt: Option<&LedgerReceipt>) -> Verification {
    let Some(record) = record else {
        return match receipt {
            Some(receipt) if receipt.success => Verification::MinedNotRecorded {
                block_number: receipt.block_number,
            },
            _ => Verification::NotRecorded,
        };
    };
    match receipt {
        None => Verification::NotOnLedger,
        Some(receipt) if !receipt.success => Verification::Reverted {
            block_number: receipt.block_number,
        },
        Some(receipt) if receipt.block_number != record.block_number => {
            Verification::BlockMismatch {
                local: record.block_number,
                ledger: receipt.block_number,
            }
        }
        Some(receipt) => Verification::Verified {
            block_number: receipt.block_number,
        },
    }
}

/// Counter disagreement found by an audit
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AuditFinding {
    pub kind: CounterKind,
    #[serde(flatten)]
    pub mismatch: CounterMismatch,
}

impl fmt::Display for AuditFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            CounterKind::Candidate => "candidate",
            CounterKind::Election => "election",
        };
        write!(
            f,
            "{} {}: counter={} valid_records={}",
            kind, self.mismatch.id, self.mismatch.counter, self.mismatch.actual
        )
    }
}

pub fn format_attempt(attempt: &VoteAttempt) -> String {
    let tx = attempt
        .tx_hash
        .map(|h| h.to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{} {:<21} voter={} election={} candidate={} tx={} cast_at={}",
        attempt.id,
        attempt.state.as_str(),
        attempt.voter_id,
        attempt.election_id,
        attempt.candidate_id,
        tx,
        attempt.cast_at.to_rfc3339()
    );
    if let Some(error) = &attempt.last_error {
        line.push_str(&format!(" error={:?}", error));
    }
    line
}

pub fn format_report(report: &RepairReport) -> String {
    format!(
        "committed={} reverted={} expired={} orphaned={} located={} failed={} pending={}",
        report.committed,
        report.reverted,
        report.expired,
        report.orphaned,
        report.located,
        report.failed,
        report.pending
    )
}

/// Render `value` as pretty JSON, or as the text produced by `text`
pub fn render<T: Serialize>(
    format: OutputFormat,
    value: &T,
    text: impl FnOnce() -> String,
) -> Result<String> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Text => text(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::str::FromStr;
    use vote_service::database::models::AttemptState;
    use vote_service::ledger::{Address, TxHash};

    fn record(block_number: u64) -> VoteRecord {
        VoteRecord {
            id: "r1".into(),
            voter_id: "v1".into(),
            candidate_id: "c1".into(),
            election_id: "e1".into(),
            tx_hash: TxHash([3; 32]),
            block_number,
            gas_used: 85_000,
            cast_at: Utc::now(),
            is_valid: true,
        }
    }

    fn receipt(block_number: u64, success: bool) -> LedgerReceipt {
        LedgerReceipt {
            transaction_hash: TxHash([3; 32]),
            block_number,
            gas_used: 85_000,
            success,
        }
    }

    #[test]
    fn verification_outcomes() {
        assert_eq!(verify(None, None), Verification::NotRecorded);
        assert_eq!(verify(None, Some(&receipt(5, false))), Verification::NotRecorded);
        assert_eq!(
            verify(None, Some(&receipt(5, true))),
            Verification::MinedNotRecorded { block_number: 5 }
        );
        assert_eq!(verify(Some(&record(5)), None), Verification::NotOnLedger);
        assert!(verify(Some(&record(5)), Some(&receipt(5, true))).is_verified());
        assert_eq!(
            verify(Some(&record(5)), Some(&receipt(5, false))),
            Verification::Reverted { block_number: 5 }
        );
        assert_eq!(
            verify(Some(&record(5)), Some(&receipt(7, true))),
            Verification::BlockMismatch { local: 5, ledger: 7 }
        );
    }

    #[test]
    fn json_output_is_tagged() {
        let json = render(OutputFormat::Json, &Verification::NotOnLedger, String::new).unwrap();
        assert!(json.contains("\"result\": \"not_on_ledger\""));
        let text = render(OutputFormat::Text, &Verification::NotOnLedger, || {
            Verification::NotOnLedger.to_string()
        })
        .unwrap();
        assert_eq!(text, "recorded locally but not mined on the ledger");
    }

    #[test]
    fn attempt_line_shows_missing_hash_and_error() {
        let mut attempt = VoteAttempt::new("v1", "c1", "e1", Address([1; 20]), Utc::now());
        attempt.state = AttemptState::LedgerTimeout;
        attempt.last_error = Some("receipt timed out".into());
        let line = format_attempt(&attempt);
        assert!(line.contains("LEDGER_TIMEOUT"));
        assert!(line.contains("tx=-"));
        assert!(line.ends_with("error=\"receipt timed out\""));
        assert!(OutputFormat::from_str("JSON").is_ok());
    }
}
