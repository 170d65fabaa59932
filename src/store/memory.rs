use super::OrderStore;
use crate::error::SwapResult;
use crate::model::{OrderStatus, SwapRecord};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Development store; nothing survives a restart
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, SwapRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert(&self, record: &SwapRecord) -> SwapResult<bool> {
        match self.records.entry(record.id().to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }

    async fn get(&self, order_id: &str) -> SwapResult<Option<SwapRecord>> {
        Ok(self.records.get(order_id).map(|r| r.value().clone()))
    }

    async fn save(&self, record: &SwapRecord) -> SwapResult<()> {
        self.records
            .insert(record.id().to_string(), record.clone());
        Ok(())
    }

    async fn list_open(&self) -> SwapResult<Vec<SwapRecord>> {
        let mut open: Vec<SwapRecord> = self
            .records
            .iter()
            .filter(|r| {
                !matches!(
                    r.order.status,
                    OrderStatus::Completed | OrderStatus::Cancelled
                )
            })
            .map(|r| r.value().clone())
            .collect();
        open.sort_by_key(|r| r.order.created_at);
        Ok(open)
    }

    async fn health_check(&self) -> SwapResult<()> {
        Ok(())
    }
}
