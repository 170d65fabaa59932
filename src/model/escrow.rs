//! Escrow records and the parameters resolvers act on

use crate::error::{SwapError, SwapResult};
use crate::model::{decimal_u256, Asset, Hashlock, TimeLockConfig};

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which leg of the swap an escrow belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Holds the maker's asset on the source chain
    Src,
    /// Holds the resolver's asset on the destination chain
    Dst,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Src => "src",
            Side::Dst => "dst",
        }
    }

    /// Encoding used by the escrow factories
    pub fn as_u8(&self) -> u8 {
        match self {
            Side::Src => 0,
            Side::Dst => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    Deploying,
    Deployed,
    Funded,
    Withdrawn,
    Cancelled,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Deploying => "DEPLOYING",
            EscrowStatus::Deployed => "DEPLOYED",
            EscrowStatus::Funded => "FUNDED",
            EscrowStatus::Withdrawn => "WITHDRAWN",
            EscrowStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, EscrowStatus::Withdrawn | EscrowStatus::Cancelled)
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a resolver needs to create one escrow
#[derive(Debug, Clone, PartialEq)]
pub struct EscrowParams {
    pub order_id: String,
    pub side: Side,
    pub chain_id: i64,
    pub escrow_factory: String,
    pub hashlock: Hashlock,
    /// Party whose funds are locked
    pub depositor: String,
    /// Party paid on withdrawal
    pub beneficiary: String,
    pub asset: Asset,
    pub amount: U256,
    pub safety_deposit: U256,
    pub timelocks: TimeLockConfig,
    /// Absolute source cancellation time, carried by destination escrows
    pub src_cancellation_at: Option<DateTime<Utc>>,
}

/// Proof that a transaction was included in a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub chain_id: i64,
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
}

/// Outcome of a successful escrow deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowDeployment {
    pub address: String,
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub deployed_at: DateTime<Utc>,
    pub proof: InclusionProof,
}

/// A deployed escrow as seen by withdraw/cancel calls
#[derive(Debug, Clone, PartialEq)]
pub struct EscrowHandle {
    pub order_id: String,
    pub chain_id: i64,
    pub address: String,
    pub hashlock: Hashlock,
    pub deployed_at: DateTime<Utc>,
    pub timelocks: TimeLockConfig,
    pub asset: Asset,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRef {
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: EscrowStatus,
    pub at: DateTime<Utc>,
    pub tx_hash: Option<String>,
    pub note: Option<String>,
}

/// One escrow of an order. Only the orchestrator mutates it; every change is
/// appended to `history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowRecord {
    pub order_id: String,
    pub side: Side,
    pub chain_id: i64,
    pub address: Option<String>,
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub asset: String,
    #[serde(with = "decimal_u256")]
    pub amount: U256,
    #[serde(with = "decimal_u256")]
    pub safety_deposit: U256,
    pub hashlock: Hashlock,
    pub depositor: String,
    pub beneficiary: String,
    pub status: EscrowStatus,
    pub deployed_at: Option<DateTime<Utc>>,
    pub proof: Option<InclusionProof>,
    pub withdraw_tx: Option<TxRef>,
    pub cancel_tx: Option<TxRef>,
    /// Who received the locked funds and the safety deposit when the escrow closed
    pub funds_recipient: Option<String>,
    pub safety_deposit_recipient: Option<String>,
    pub history: Vec<StatusChange>,
}

impl EscrowRecord {
    /// Record written before a deployment is submitted
    pub fn deploying(params: &EscrowParams, now: DateTime<Utc>) -> Self {
        Self {
            order_id: params.order_id.clone(),
            side: params.side,
            chain_id: params.chain_id,
            address: None,
            tx_hash: None,
            block_number: None,
            asset: params.asset.to_string(),
            amount: params.amount,
            safety_deposit: params.safety_deposit,
            hashlock: params.hashlock,
            depositor: params.depositor.clone(),
            beneficiary: params.beneficiary.clone(),
            status: EscrowStatus::Deploying,
            deployed_at: None,
            proof: None,
            withdraw_tx: None,
            cancel_tx: None,
            funds_recipient: None,
            safety_deposit_recipient: None,
            history: vec![StatusChange {
                status: EscrowStatus::Deploying,
                at: now,
                tx_hash: None,
                note: None,
            }],
        }
    }

    pub fn set_status(
        &mut self,
        status: EscrowStatus,
        tx_hash: Option<String>,
        note: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        self.history.push(StatusChange {
            status,
            at: now,
            tx_hash,
            note,
        });
    }

    pub fn record_deployment(&mut self, deployment: &EscrowDeployment, now: DateTime<Utc>) {
        self.address = Some(deployment.address.clone());
        self.tx_hash = Some(deployment.tx_hash.clone());
        self.block_number = deployment.block_number;
        self.deployed_at = Some(deployment.deployed_at);
        self.proof = Some(deployment.proof.clone());
        self.set_status(
            EscrowStatus::Deployed,
            Some(deployment.tx_hash.clone()),
            None,
            now,
        );
    }

    pub fn asset(&self) -> Asset {
        Asset::parse(&self.asset)
    }

    /// Deployed or funded: the escrow may still hold value
    pub fn may_hold_funds(&self) -> bool {
        matches!(self.status, EscrowStatus::Deployed | EscrowStatus::Funded)
    }

    pub fn handle(&self, timelocks: &TimeLockConfig) -> SwapResult<EscrowHandle> {
        let (address, deployed_at) = match (&self.address, self.deployed_at) {
            (Some(address), Some(deployed_at)) => (address.clone(), deployed_at),
            _ => {
                return Err(SwapError::Internal(format!(
                    "{} escrow of order {} has not been deployed",
                    self.side, self.order_id
                )))
            }
        };

        Ok(EscrowHandle {
            order_id: self.order_id.clone(),
            chain_id: self.chain_id,
            address,
            hashlock: self.hashlock,
            deployed_at,
            timelocks: *timelocks,
            asset: self.asset(),
            amount: self.amount,
        })
    }
}
