use vote_service::database::models::AttemptState;
use vote_service::ledger::{Address, TxHash};

use crate::cli_types::OutputFormat;

pub fn parse_address(s: &str) -> Result<Address, String> {
    s.parse().map_err(|e| format!("invalid address: {e}"))
}

pub fn parse_tx_hash(s: &str) -> Result<TxHash, String> {
    s.parse().map_err(|e| format!("invalid transaction hash: {e}"))
}

pub fn parse_attempt_state(s: &str) -> Result<AttemptState, String> {
    s.replace('-', "_").parse()
}

pub fn parse_output_format(s: &str) -> Result<OutputFormat, String> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_states_accept_cli_spelling() {
        assert_eq!(
            parse_attempt_state("ledger-timeout").unwrap(),
            AttemptState::LedgerTimeout
        );
        assert_eq!(
            parse_attempt_state("RECONCILIATION_FAILED").unwrap(),
            AttemptState::ReconciliationFailed
        );
        assert!(parse_attempt_state("pending").is_err());
    }

    #[test]
    fn hashes_need_32_bytes() {
        let hash = format!("0x{}", "11".repeat(32));
        assert_eq!(parse_tx_hash(&hash).unwrap(), TxHash([0x11; 32]));
        assert!(parse_tx_hash("0x1234").is_err());
        assert!(parse_address(&format!("0x{}", "22".repeat(20))).is_ok());
    }
}
