//! Service configuration loaded from environment variables

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::database::constants::DEFAULT_DB_PATH;
use crate::ledger::{Address, MIN_GAS_MULTIPLIER_PCT};
use crate::logging::LogFormat;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Parse `key` with `FromStr`, falling back to `default` when unset
pub fn env_parse<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                message: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

fn env_required<T, F>(lookup: &F, key: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))?;
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        message: e.to_string(),
    })
}

fn env_millis<F>(lookup: &F, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    env_parse(lookup, key, default).map(Duration::from_millis)
}

fn env_secs<F>(lookup: &F, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    env_parse(lookup, key, default).map(Duration::from_secs)
}

/// Ledger node and submission settings
#[derive(Clone, Debug)]
pub struct LedgerConfig {
    pub rpc_url: String,
    pub contract_address: Address,
    /// Node-managed account that signs and pays for vote transactions
    pub relayer_address: Address,
    pub gas_price_wei: u128,
    pub gas_multiplier_pct: u64,
    pub rpc_timeout: Duration,
    pub receipt_timeout: Duration,
    pub receipt_poll_interval: Duration,
    pub max_submit_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_scan_blocks: u64,
}

impl LedgerConfig {
    /// Defaults for everything except the endpoint and the two accounts
    pub fn new(rpc_url: &str, contract_address: Address, relayer_address: Address) -> Self {
        Self {
            rpc_url: rpc_url.to_string(),
            contract_address,
            relayer_address,
            gas_price_wei: 20_000_000_000,
            gas_multiplier_pct: MIN_GAS_MULTIPLIER_PCT,
            rpc_timeout: Duration::from_millis(5_000),
            receipt_timeout: Duration::from_millis(30_000),
            receipt_poll_interval: Duration::from_millis(500),
            max_submit_attempts: 3,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_millis(5_000),
            max_scan_blocks: 256,
        }
    }

    fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::new("http://127.0.0.1:8545", Address::default(), Address::default());

        let gas_multiplier_pct = env_parse(lookup, "GAS_MULTIPLIER_PCT", defaults.gas_multiplier_pct)?;
        if gas_multiplier_pct < MIN_GAS_MULTIPLIER_PCT {
            return Err(ConfigError::Invalid {
                key: "GAS_MULTIPLIER_PCT",
                message: format!("must be at least {}", MIN_GAS_MULTIPLIER_PCT),
            });
        }
        let max_submit_attempts = env_parse(lookup, "SUBMIT_MAX_ATTEMPTS", defaults.max_submit_attempts)?;
        if max_submit_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "SUBMIT_MAX_ATTEMPTS",
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            rpc_url: env_parse(lookup, "RPC_URL", defaults.rpc_url)?,
            contract_address: env_required(lookup, "CONTRACT_ADDRESS")?,
            relayer_address: env_required(lookup, "RELAYER_ADDRESS")?,
            gas_price_wei: env_parse(lookup, "GAS_PRICE_WEI", defaults.gas_price_wei)?,
            gas_multiplier_pct,
            rpc_timeout: env_millis(lookup, "RPC_TIMEOUT_MS", 5_000)?,
            receipt_timeout: env_millis(lookup, "RECEIPT_TIMEOUT_MS", 30_000)?,
            receipt_poll_interval: env_millis(lookup, "RECEIPT_POLL_MS", 500)?,
            max_submit_attempts,
            backoff_base: env_millis(lookup, "BACKOFF_BASE_MS", 200)?,
            backoff_max: env_millis(lookup, "BACKOFF_MAX_MS", 5_000)?,
            max_scan_blocks: env_parse(lookup, "MAX_SCAN_BLOCKS", defaults.max_scan_blocks)?,
        })
    }
}

/// Repair job schedule and age thresholds
#[derive(Clone, Debug)]
pub struct RepairConfig {
    pub interval: Duration,
    /// In-flight attempts older than this are assumed abandoned by their task
    pub stale_after: Duration,
    /// Unresolved attempts older than this are logged as overdue
    pub pending_expiry: Duration,
    pub batch_size: u32,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(120),
            pending_expiry: Duration::from_secs(3_600),
            batch_size: 100,
        }
    }
}

impl RepairConfig {
    fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            interval: env_secs(lookup, "REPAIR_INTERVAL_SECS", 30)?,
            stale_after: env_secs(lookup, "REPAIR_STALE_AFTER_SECS", 120)?,
            pending_expiry: env_secs(lookup, "PENDING_EXPIRY_SECS", 3_600)?,
            batch_size: env_parse(lookup, "REPAIR_BATCH_SIZE", 100)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub db_path: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub log_level: String,
    /// Deadline for the local commit once the ledger has confirmed
    pub commit_timeout: Duration,
    pub ledger: LedgerConfig,
    pub repair: RepairConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            db_path: env_parse(&lookup, "DB_PATH", DEFAULT_DB_PATH.to_string())?,
            port: env_parse(&lookup, "PORT", 3000)?,
            log_format: env_parse(&lookup, "LOG_FORMAT", LogFormat::Human)?,
            log_level: env_parse(&lookup, "LOG_LEVEL", "info".to_string())?,
            commit_timeout: env_millis(&lookup, "COMMIT_TIMEOUT_MS", 10_000)?,
            ledger: LedgerConfig::from_lookup(&lookup)?,
            repair: RepairConfig::from_lookup(&lookup)?,
        })
    }
}
