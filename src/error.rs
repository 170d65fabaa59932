//! Error types for the swap resolver

use crate::model::Side;
use thiserror::Error;

/// Main error type for order intake, resolvers and the orchestrator
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Chain {chain_id} is not supported")]
    UnsupportedChain { chain_id: i64 },

    #[error("Chain query error on chain {chain_id}: {message}")]
    ChainQuery { chain_id: i64, message: String },

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Secret does not match the hashlock of order {order_id}")]
    InvalidSecret { order_id: String },

    #[error("Order {order_id} is {status}, cannot {operation}")]
    InvalidState {
        order_id: String,
        status: String,
        operation: String,
    },

    #[error("{side} escrow is not withdrawable before {opens_at}")]
    NotYetWithdrawable { side: Side, opens_at: i64 },

    #[error("{side} escrow is not cancellable before {opens_at}")]
    TooEarly { side: Side, opens_at: i64 },

    #[error("{side} escrow window closed at {closed_at}")]
    WindowClosed { side: Side, closed_at: i64 },

    #[error("Funding verification failed for {side} escrow {address}: expected {expected}, found {actual}")]
    FundingVerification {
        side: Side,
        address: String,
        expected: String,
        actual: String,
    },

    #[error("A flow is already running for order {order_id}")]
    FlowInProgress { order_id: String },

    #[error("Order {order_id} not found")]
    OrderNotFound { order_id: String },

    #[error("Transaction {tx_hash} failed on chain {chain_id}: {reason}")]
    TransactionFailed {
        chain_id: i64,
        tx_hash: String,
        reason: String,
    },

    #[error("Finality not reached for tx {tx_hash} on chain {chain_id}")]
    FinalityNotReached { chain_id: i64, tx_hash: String },

    #[error("Reorg detected on chain {chain_id}: tx {tx_hash} is no longer included")]
    ReorgDetected { chain_id: i64, tx_hash: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwapError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwapError::ChainQuery { .. } | SwapError::FinalityNotReached { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            SwapError::ReorgDetected { .. }
                | SwapError::Credential(_)
                | SwapError::Database(_)
                | SwapError::Storage(_)
        )
    }

    /// Timelock policy violations; the caller re-evaluates the window instead of retrying
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            SwapError::NotYetWithdrawable { .. }
                | SwapError::TooEarly { .. }
                | SwapError::WindowClosed { .. }
        )
    }

    /// Stable label used in metrics and API responses
    pub fn kind(&self) -> &'static str {
        match self {
            SwapError::Validation(_) => "validation",
            SwapError::UnsupportedChain { .. } => "unsupported_chain",
            SwapError::ChainQuery { .. } => "chain_query",
            SwapError::Credential(_) => "credential",
            SwapError::InvalidSecret { .. } => "invalid_secret",
            SwapError::InvalidState { .. } => "invalid_state",
            SwapError::NotYetWithdrawable { .. } => "not_yet_withdrawable",
            SwapError::TooEarly { .. } => "too_early",
            SwapError::WindowClosed { .. } => "window_closed",
            SwapError::FundingVerification { .. } => "funding_verification",
            SwapError::FlowInProgress { .. } => "flow_in_progress",
            SwapError::OrderNotFound { .. } => "order_not_found",
            SwapError::TransactionFailed { .. } => "transaction_failed",
            SwapError::FinalityNotReached { .. } => "finality_not_reached",
            SwapError::ReorgDetected { .. } => "reorg_detected",
            SwapError::Database(_) => "database",
            SwapError::Storage(_) => "storage",
            SwapError::Config(_) => "config",
            SwapError::Internal(_) => "internal",
        }
    }

    pub(crate) fn chain(chain_id: i64, message: impl std::fmt::Display) -> Self {
        SwapError::ChainQuery {
            chain_id,
            message: message.to_string(),
        }
    }
}

/// Result type for swap operations
pub type SwapResult<T> = Result<T, SwapError>;
