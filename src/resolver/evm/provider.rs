//! EVM RPC provider with multi-endpoint failover

use crate::config::ChainConfig;
use crate::error::{SwapError, SwapResult};

use chrono::{DateTime, TimeZone, Utc};
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    chain_id: i64,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Last known block number
    last_block: AtomicU64,
}

impl ChainProvider {
    pub fn new(config: &ChainConfig) -> SwapResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(500));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}", config.chain_id);
                }
                Err(e) => {
                    warn!(
                        "Failed to create provider for chain {}: {}",
                        config.chain_id, e
                    );
                }
            }
        }

        if http_providers.is_empty() {
            return Err(SwapError::Config(format!(
                "No valid RPC providers for chain {}",
                config.chain_id
            )));
        }

        Ok(Self {
            chain_id: config.chain_id,
            http_providers,
            current_provider: AtomicUsize::new(0),
            last_block: AtomicU64::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        if self.http_providers.len() < 2 {
            return;
        }
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    fn all_failed(&self, what: &str, last: Option<ProviderError>) -> SwapError {
        SwapError::chain(
            self.chain_id,
            match last {
                Some(e) => format!("all providers failed to {}: {}", what, e),
                None => format!("all providers failed to {}", what),
            },
        )
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> SwapResult<u64> {
        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => {
                    let block_num = block.as_u64();
                    self.last_block.store(block_num, Ordering::Relaxed);
                    return Ok(block_num);
                }
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.chain_id, e
                    );
                    last_error = Some(e);
                    self.failover();
                }
            }
        }
        Err(self.all_failed("get block number", last_error))
    }

    /// Timestamp of the latest block
    pub async fn latest_block_time(&self) -> SwapResult<DateTime<Utc>> {
        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match self.http().get_block(BlockNumber::Latest).await {
                Ok(Some(block)) => {
                    if let Some(number) = block.number {
                        self.last_block.store(number.as_u64(), Ordering::Relaxed);
                    }
                    return to_datetime(self.chain_id, block.timestamp);
                }
                Ok(None) => {
                    return Err(SwapError::chain(self.chain_id, "latest block not available"))
                }
                Err(e) => {
                    warn!("Failed to get latest block from chain {}: {}", self.chain_id, e);
                    last_error = Some(e);
                    self.failover();
                }
            }
        }
        Err(self.all_failed("get latest block", last_error))
    }

    /// Timestamp of a given block
    pub async fn block_time(&self, block_number: u64) -> SwapResult<DateTime<Utc>> {
        let block = self
            .http()
            .get_block(block_number)
            .await
            .map_err(|e| SwapError::chain(self.chain_id, e))?
            .ok_or_else(|| {
                SwapError::chain(self.chain_id, format!("block {} not found", block_number))
            })?;
        to_datetime(self.chain_id, block.timestamp)
    }

    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> SwapResult<Option<TransactionReceipt>> {
        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match self.http().get_transaction_receipt(tx_hash).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    last_error = Some(e);
                    self.failover();
                }
            }
        }
        Err(self.all_failed("get transaction receipt", last_error))
    }

    /// True when the node still knows the transaction (mempool or chain)
    pub async fn transaction_known(&self, tx_hash: H256) -> SwapResult<bool> {
        self.http()
            .get_transaction(tx_hash)
            .await
            .map(|tx| tx.is_some())
            .map_err(|e| SwapError::chain(self.chain_id, e))
    }

    pub async fn get_balance(&self, address: Address) -> SwapResult<U256> {
        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match self.http().get_balance(address, None).await {
                Ok(balance) => return Ok(balance),
                Err(e) => {
                    last_error = Some(e);
                    self.failover();
                }
            }
        }
        Err(self.all_failed("get balance", last_error))
    }

    /// Last block number observed by any call
    pub fn last_block(&self) -> u64 {
        self.last_block.load(Ordering::Relaxed)
    }
}

fn to_datetime(chain_id: i64, timestamp: U256) -> SwapResult<DateTime<Utc>> {
    let secs = i64::try_from(timestamp.low_u64())
        .map_err(|_| SwapError::chain(chain_id, "block timestamp out of range"))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| SwapError::chain(chain_id, "invalid block timestamp"))
}
