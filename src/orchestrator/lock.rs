use crate::error::{SwapError, SwapResult};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One flow per order at a time
#[derive(Default)]
pub struct FlowLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of a flow; releases the order on drop
pub struct FlowGuard {
    order_id: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    _guard: OwnedMutexGuard<()>,
}

impl FlowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with `FlowInProgress` instead of waiting
    pub fn try_acquire(&self, order_id: &str) -> SwapResult<FlowGuard> {
        let lock = self
            .locks
            .entry(order_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = lock
            .try_lock_owned()
            .map_err(|_| SwapError::FlowInProgress {
                order_id: order_id.to_string(),
            })?;

        Ok(FlowGuard {
            order_id: order_id.to_string(),
            locks: self.locks.clone(),
            _guard: guard,
        })
    }

    pub fn is_locked(&self, order_id: &str) -> bool {
        self.locks
            .get(order_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        // map + this guard; anyone else still holds a clone
        self.locks
            .remove_if(&self.order_id, |_, lock| Arc::strong_count(lock) <= 2);
    }
}
