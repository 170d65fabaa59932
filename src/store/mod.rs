//! Swap record persistence
//!
//! One record per order id holding the order, both escrow records and the
//! settlement state. The orchestrator saves after every transition, so a
//! restarted service resumes from the last persisted step.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::config::DatabaseConfig;
use crate::error::SwapResult;
use crate::model::SwapRecord;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert a new record; `false` when the order id already exists
    async fn insert(&self, record: &SwapRecord) -> SwapResult<bool>;

    async fn get(&self, order_id: &str) -> SwapResult<Option<SwapRecord>>;

    /// Upsert the whole record
    async fn save(&self, record: &SwapRecord) -> SwapResult<()>;

    /// Records that are neither completed nor cancelled
    async fn list_open(&self) -> SwapResult<Vec<SwapRecord>>;

    async fn health_check(&self) -> SwapResult<()>;
}

/// PostgreSQL when a database URL is configured, memory otherwise
pub async fn connect(config: &DatabaseConfig) -> SwapResult<Arc<dyn OrderStore>> {
    if config.url.trim().is_empty() {
        warn!("No database URL configured - using the in-memory store, state is lost on restart");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let store = PgStore::new(config).await?;
    store.run_migrations().await?;
    Ok(Arc::new(store))
}
