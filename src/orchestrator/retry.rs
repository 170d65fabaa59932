//! Deadlines and retries around chain calls

use crate::config::OrchestratorConfig;
use crate::error::{SwapError, SwapResult};
use crate::metrics;

use std::cmp;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Run `fut` under a deadline; expiry is a retryable chain error
pub async fn with_deadline<T, Fut>(
    chain_id: i64,
    what: &str,
    limit: Duration,
    fut: Fut,
) -> SwapResult<T>
where
    Fut: Future<Output = SwapResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SwapError::chain(
            chain_id,
            format!("{} timed out after {:?}", what, limit),
        )),
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
    pub submit_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            call_timeout: config.call_timeout(),
            submit_timeout: config.submit_timeout(),
        }
    }

    /// Exponential backoff capped at `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        cmp::min(self.base_delay.saturating_mul(factor), self.max_delay)
    }

    /// Read-only call under `call_timeout`, retried on retryable errors
    pub async fn read<T, F, Fut>(&self, chain_id: i64, what: &str, call: F) -> SwapResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SwapResult<T>>,
    {
        self.run(chain_id, what, self.call_timeout, call).await
    }

    /// Idempotent submission under `submit_timeout`, retried on retryable errors
    pub async fn submit_idempotent<T, F, Fut>(
        &self,
        chain_id: i64,
        what: &str,
        call: F,
    ) -> SwapResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SwapResult<T>>,
    {
        self.run(chain_id, what, self.submit_timeout, call).await
    }

    /// Single submission under `submit_timeout`; never repeated
    pub async fn submit_once<T, Fut>(&self, chain_id: i64, what: &str, fut: Fut) -> SwapResult<T>
    where
        Fut: Future<Output = SwapResult<T>>,
    {
        with_deadline(chain_id, what, self.submit_timeout, fut)
            .await
            .map_err(|e| {
                metrics::record_chain_error(chain_id, &e);
                e
            })
    }

    async fn run<T, F, Fut>(
        &self,
        chain_id: i64,
        what: &str,
        limit: Duration,
        mut call: F,
    ) -> SwapResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SwapResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match with_deadline(chain_id, what, limit, call()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    metrics::record_chain_error(chain_id, &e);
                    if !e.is_retryable() || attempt >= self.max_retries {
                        return Err(e);
                    }
                    let delay = self.backoff(attempt);
                    attempt += 1;
                    warn!(
                        "{} on chain {} failed (attempt {}/{}), retrying in {:?}: {}",
                        what,
                        chain_id,
                        attempt,
                        self.max_retries + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
