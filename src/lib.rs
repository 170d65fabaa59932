//! Crosslock resolver - hashlock/timelock atomic swaps between EVM and TON chains
//!
//! The orchestrator locks funds on both chains under one secret commitment,
//! verifies both locks before the secret is revealed, and withdraws on the
//! destination chain before the source chain.

pub mod api;
pub mod config;
pub mod error;
pub mod intake;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod resolver;
pub mod store;

pub use error::{SwapError, SwapResult};
