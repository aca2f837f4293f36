//! Vote submission coordinator: validates a vote, records it on the ledger
//! and reconciles the confirmed receipt into the local store.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod eligibility;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod reconcile;
pub mod repair;
pub mod state;
