use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::OnceCell;
use serde_json::json;

use crate::error::VoteError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum VoteOutcome {
    Committed,
    Ineligible,
    AlreadyVoted,
    LedgerRejected,
    LedgerUnavailable,
    Pending,
    ReconciliationFailed,
    Internal,
}

impl VoteOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            VoteOutcome::Committed => "committed",
            VoteOutcome::Ineligible => "ineligible",
            VoteOutcome::AlreadyVoted => "already_voted",
            VoteOutcome::LedgerRejected => "ledger_rejected",
            VoteOutcome::LedgerUnavailable => "ledger_unavailable",
            VoteOutcome::Pending => "pending",
            VoteOutcome::ReconciliationFailed => "reconciliation_failed",
            VoteOutcome::Internal => "internal",
        }
    }
}

impl From<&VoteError> for VoteOutcome {
    fn from(err: &VoteError) -> Self {
        match err {
            VoteError::Ineligible(crate::error::Ineligible::AlreadyVoted) => VoteOutcome::AlreadyVoted,
            VoteError::Ineligible(_) => VoteOutcome::Ineligible,
            VoteError::LedgerRejected { .. } => VoteOutcome::LedgerRejected,
            VoteError::LedgerUnavailable { .. } => VoteOutcome::LedgerUnavailable,
            VoteError::Pending { .. } => VoteOutcome::Pending,
            VoteError::ReconciliationFailed { .. } => VoteOutcome::ReconciliationFailed,
            VoteError::Store(_) | VoteError::Internal(_) => VoteOutcome::Internal,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RepairOutcome {
    Committed,
    Reverted,
    Expired,
    Orphaned,
    Located,
    Failed,
}

impl RepairOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RepairOutcome::Committed => "committed",
            RepairOutcome::Reverted => "reverted",
            RepairOutcome::Expired => "expired",
            RepairOutcome::Orphaned => "orphaned",
            RepairOutcome::Located => "located",
            RepairOutcome::Failed => "failed",
        }
    }
}

#[derive(Default)]
pub struct Metrics {
    cast_vote_total: HashMap<VoteOutcome, u64>,
    repair_total: HashMap<RepairOutcome, u64>,
    repair_passes_total: u64,
}

static METRICS: OnceCell<Mutex<Metrics>> = OnceCell::new();

fn get() -> MutexGuard<'static, Metrics> {
    METRICS
        .get_or_init(|| Mutex::new(Metrics::default()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn record_vote_outcome(outcome: VoteOutcome) {
    *get().cast_vote_total.entry(outcome).or_insert(0) += 1;
}

pub fn record_repair_outcome(outcome: RepairOutcome) {
    *get().repair_total.entry(outcome).or_insert(0) += 1;
}

pub fn record_repair_pass() {
    get().repair_passes_total += 1;
}

pub fn snapshot_as_json(db_path: &str) -> serde_json::Value {
    let m = get();

    let mut votes: Vec<serde_json::Value> = m
        .cast_vote_total
        .iter()
        .map(|(outcome, count)| json!({ "outcome": outcome.as_str(), "count": count }))
        .collect();
    votes.sort_by(|a, b| a["outcome"].as_str().cmp(&b["outcome"].as_str()));

    let mut repairs: Vec<serde_json::Value> = m
        .repair_total
        .iter()
        .map(|(outcome, count)| json!({ "outcome": outcome.as_str(), "count": count }))
        .collect();
    repairs.sort_by(|a, b| a["outcome"].as_str().cmp(&b["outcome"].as_str()));

    let db_mb = db_size_bytes(db_path).map(|b| round2(bytes_to_mb(b)));

    json!({
        "cast_vote_total": votes,
        "repair_total": repairs,
        "repair_passes_total": m.repair_passes_total,
        "storage": {
            "db_path": db_path,
            "db_size_mb": db_mb,
        }
    })
}

fn db_size_bytes(db_path: &str) -> Option<u64> {
    std::fs::metadata(db_path)
        .ok()
        .and_then(|m| if m.is_file() { Some(m.len()) } else { None })
}

fn bytes_to_mb(bytes: u64) -> f64 {
    let mb = 1024.0 * 1024.0;
    (bytes as f64) / mb
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
