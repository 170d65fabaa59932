use super::clock::Clock;
use super::worker::FlowCommand;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Timers that re-enqueue a cancellation check when a window opens.
///
/// One timer per order; arming again replaces the previous one.
pub struct CancellationScheduler {
    clock: Arc<dyn Clock>,
    commands: mpsc::Sender<FlowCommand>,
    timers: Arc<DashMap<String, (DateTime<Utc>, JoinHandle<()>)>>,
}

impl CancellationScheduler {
    pub fn new(clock: Arc<dyn Clock>, commands: mpsc::Sender<FlowCommand>) -> Self {
        Self {
            clock,
            commands,
            timers: Arc::new(DashMap::new()),
        }
    }

    pub fn arm(&self, order_id: &str, at: DateTime<Utc>) {
        let clock = self.clock.clone();
        let commands = self.commands.clone();
        let timers = self.timers.clone();
        let id = order_id.to_string();

        let handle = tokio::spawn(async move {
            clock.sleep_until(at).await;
            timers.remove_if(&id, |_, (armed_at, _)| *armed_at == at);
            debug!("Cancellation timer fired for order {}", id);
            if commands
                .send(FlowCommand::RetryCancellation { order_id: id.clone() })
                .await
                .is_err()
            {
                warn!("Command queue closed, dropping cancellation retry for order {}", id);
            }
        });

        if let Some((_, (_, previous))) = self.timers.remove(order_id) {
            previous.abort();
        }
        self.timers.insert(order_id.to_string(), (at, handle));
        debug!("Cancellation check for order {} armed at {}", order_id, at);
    }

    pub fn disarm(&self, order_id: &str) {
        if let Some((_, (_, handle))) = self.timers.remove(order_id) {
            handle.abort();
        }
    }

    pub fn armed_at(&self, order_id: &str) -> Option<DateTime<Utc>> {
        self.timers.get(order_id).map(|entry| entry.0)
    }

    pub fn shutdown(&self) {
        self.timers.iter().for_each(|entry| entry.1.abort());
        self.timers.clear();
    }
}
