//! Order and escrow data model shared by the resolvers, the policy and the orchestrator
//!
//! This module provides:
//! - Orders with their immutable terms and monotonic lifecycle status
//! - Per-side escrow records with an append-only status history
//! - Timelock schedules and hashlock commitments

mod asset;
mod chain;
mod escrow;
mod hashlock;
pub(crate) mod order;
pub(crate) mod timelock;

pub use asset::Asset;
pub use chain::ChainFamily;
pub use escrow::{
    EscrowDeployment, EscrowHandle, EscrowParams, EscrowRecord, EscrowStatus, InclusionProof,
    Side, StatusChange, TxRef,
};
pub use hashlock::{keccak256, Hashlock, Secret};
pub use order::{decimal_u256, Order, OrderInput, OrderStatus, SwapRecord};
pub use timelock::TimeLockConfig;
