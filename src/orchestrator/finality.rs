//! Finality waiting
//!
//! Polls `get_transaction_status` with exponential backoff until the
//! resolver reports the transaction final, the deadline passes, or the
//! transaction disappears after having been seen in a block.

use super::clock::Clock;
use super::retry::RetryPolicy;
use crate::error::{SwapError, SwapResult};
use crate::resolver::{ResolvedChain, TxState, TxStatus};

use chrono::{DateTime, Utc};
use std::cmp;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct FinalityWaiter<'a> {
    pub clock: &'a dyn Clock,
    pub retry: &'a RetryPolicy,
    pub poll_initial: Duration,
    pub poll_max: Duration,
}

impl FinalityWaiter<'_> {
    pub async fn wait(
        &self,
        chain: &ResolvedChain,
        tx_hash: &str,
        deadline: DateTime<Utc>,
    ) -> SwapResult<TxStatus> {
        let resolver = &chain.resolver;
        let mut delay = self.poll_initial;
        let mut included_at: Option<u64> = None;

        loop {
            if self.clock.now() >= deadline {
                warn!(
                    "Finality deadline {} passed for tx {} on chain {}",
                    deadline, tx_hash, chain.chain_id
                );
                return Err(SwapError::FinalityNotReached {
                    chain_id: chain.chain_id,
                    tx_hash: tx_hash.to_string(),
                });
            }

            let status = self
                .retry
                .read(chain.chain_id, "transaction status", move || {
                    resolver.get_transaction_status(tx_hash)
                })
                .await?;

            match status.state {
                TxState::Included if status.finalized => {
                    info!(
                        "Tx {} final on chain {} ({} confirmations)",
                        tx_hash, chain.chain_id, status.confirmations
                    );
                    return Ok(status);
                }
                TxState::Included => {
                    if included_at.is_some() && status.block_number != included_at {
                        warn!(
                            "Tx {} moved from block {:?} to {:?} on chain {}",
                            tx_hash, included_at, status.block_number, chain.chain_id
                        );
                    }
                    included_at = status.block_number;
                    debug!(
                        "Tx {} has {} confirmations on chain {}",
                        tx_hash, status.confirmations, chain.chain_id
                    );
                }
                TxState::Failed => {
                    return Err(SwapError::TransactionFailed {
                        chain_id: chain.chain_id,
                        tx_hash: tx_hash.to_string(),
                        reason: "reverted".to_string(),
                    })
                }
                TxState::NotFound | TxState::Pending if included_at.is_some() => {
                    warn!(
                        "Reorg detected: tx {} no longer included on chain {}",
                        tx_hash, chain.chain_id
                    );
                    return Err(SwapError::ReorgDetected {
                        chain_id: chain.chain_id,
                        tx_hash: tx_hash.to_string(),
                    });
                }
                TxState::NotFound | TxState::Pending => {
                    debug!("Tx {} not yet included on chain {}", tx_hash, chain.chain_id);
                }
            }

            tokio::time::sleep(delay).await;
            delay = cmp::min(delay.saturating_mul(2), self.poll_max);
        }
    }
}
