//! Chain resolvers
//!
//! A resolver is the only component that talks to a chain. The orchestrator
//! drives every swap through this trait, so EVM and TON chains look the same
//! from above.

pub mod evm;
mod registry;
pub mod ton;

pub use registry::{ChainRegistry, ResolvedChain, ResolverFactory};

use crate::error::SwapResult;
use crate::model::{
    Asset, ChainFamily, EscrowDeployment, EscrowHandle, EscrowParams, Secret, Side,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::U256;

/// Receipt of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Known to the node but not yet in a block
    Pending,
    /// Included and executed successfully
    Included,
    /// Included but reverted or aborted
    Failed,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxStatus {
    pub state: TxState,
    pub block_number: Option<u64>,
    pub confirmations: u64,
    /// Enough confirmations under the chain's finality rule
    pub finalized: bool,
}

impl TxStatus {
    pub fn not_found() -> Self {
        Self {
            state: TxState::NotFound,
            block_number: None,
            confirmations: 0,
            finalized: false,
        }
    }

    pub fn pending() -> Self {
        Self {
            state: TxState::Pending,
            ..Self::not_found()
        }
    }
}

/// Uniform capability set over one chain.
///
/// Calls that create an escrow or move funds return only once the chain has
/// accepted the transaction; finality is checked separately through
/// `get_transaction_status`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Resolver: Send + Sync {
    fn family(&self) -> ChainFamily;

    fn chain_id(&self) -> i64;

    /// Load signing material and connect. Idempotent.
    async fn initialize(&self) -> SwapResult<()>;

    /// Resolver's own address on this chain
    async fn get_address(&self) -> SwapResult<String>;

    /// Native balance of the resolver
    async fn get_balance(&self) -> SwapResult<U256>;

    /// Resolver balance of `asset`
    async fn get_token_balance(&self, asset: &Asset) -> SwapResult<U256>;

    /// Create the escrow described by `params`.
    ///
    /// An escrow already created for the same order and side is returned
    /// instead of deploying a second one.
    async fn deploy_escrow(&self, params: &EscrowParams) -> SwapResult<EscrowDeployment>;

    /// Look up an escrow created through `factory` for an order and side
    async fn find_escrow(
        &self,
        factory: &str,
        order_id: &str,
        side: Side,
    ) -> SwapResult<Option<EscrowDeployment>>;

    /// Balance of `asset` held by the contract at `address`
    async fn get_contract_balance(&self, address: &str, asset: &Asset) -> SwapResult<U256>;

    /// Open the escrow with `secret`. Fails before submitting anything when
    /// the window is not open or the secret does not match.
    async fn withdraw(
        &self,
        escrow: &EscrowHandle,
        secret: &Secret,
        side: Side,
    ) -> SwapResult<TxReceipt>;

    /// Refund the escrow to its depositor once the cancellation window opens
    async fn cancel(&self, escrow: &EscrowHandle, side: Side) -> SwapResult<TxReceipt>;

    async fn get_transaction_status(&self, tx_hash: &str) -> SwapResult<TxStatus>;

    /// Timestamp of the chain's latest block
    async fn chain_time(&self) -> SwapResult<DateTime<Utc>>;
}
