//! Typed error kinds shared across components.
//!
//! Component-internal retry loops match on these variants directly; only errors that
//! escape a component's retry budget are ever logged at the component boundary, and
//! only `ConfigInvalid` terminates the process.

use ethers::types::H256;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("transient rpc error: {0}")]
    RpcTransient(String),

    #[error("nonce too low (local nonce was {local_nonce})")]
    NonceTooLow { local_nonce: u64 },

    #[error("replacement transaction underpriced at gas price {gas_price_wei} wei")]
    ReplacementUnderpriced { gas_price_wei: String },

    #[error("insufficient funds: balance {balance_wei} wei < required {required_wei} wei")]
    InsufficientFunds {
        balance_wei: String,
        required_wei: String,
    },

    #[error("transaction {tx_hash} mined with bad status (expected 1)")]
    ReceiptBad { tx_hash: H256 },

    #[error("index missing for request id {request_id}")]
    IndexMissing { request_id: String },

    #[error("stale data from currentVariables tracker: {0}")]
    DataStale(String),

    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    /// Classifies a raw provider error string the way the Transactor's retry loop does:
    /// by substring match against the two RPC error texts the contract's mempool rules
    /// are known to return, falling back to a generic transient error otherwise.
    pub fn from_broadcast_error(raw: &str) -> Self {
        if raw.contains("nonce too low") {
            // local_nonce is filled in by the caller, which knows the current value.
            CoreError::NonceTooLow { local_nonce: 0 }
        } else if raw.contains("replacement transaction underpriced") {
            CoreError::ReplacementUnderpriced {
                gas_price_wei: String::new(),
            }
        } else {
            CoreError::RpcTransient(raw.to_string())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }
}

/// Thin wrapper so callers can render a kind name without matching on the full variant,
/// useful for metrics labels.
impl CoreError {
    pub fn kind_name(&self) -> &'static str {
        match self {
            CoreError::ConfigInvalid(_) => "config_invalid",
            CoreError::RpcTransient(_) => "rpc_transient",
            CoreError::NonceTooLow { .. } => "nonce_too_low",
            CoreError::ReplacementUnderpriced { .. } => "replacement_underpriced",
            CoreError::InsufficientFunds { .. } => "insufficient_funds",
            CoreError::ReceiptBad { .. } => "receipt_bad",
            CoreError::IndexMissing { .. } => "index_missing",
            CoreError::DataStale(_) => "data_stale",
            CoreError::Cancelled => "cancelled",
        }
    }
}
