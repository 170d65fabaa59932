//! Command queue consumer
//!
//! Intake and the cancellation timers only enqueue commands. The worker runs
//! each one on its own task; the per-order lock serializes commands for the
//! same order and every handler is idempotent.

use super::engine::Orchestrator;
use crate::error::SwapError;
use crate::model::Secret;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum FlowCommand {
    /// Run or resume escrow setup
    Start { order_id: String },
    /// Settle with the revealed secret
    Complete { order_id: String, secret: Secret },
    /// Re-check cancellation windows of a failed order
    RetryCancellation { order_id: String },
    /// Continue a settlement interrupted by a restart
    Resume { order_id: String },
}

impl FlowCommand {
    pub fn order_id(&self) -> &str {
        match self {
            FlowCommand::Start { order_id }
            | FlowCommand::Complete { order_id, .. }
            | FlowCommand::RetryCancellation { order_id }
            | FlowCommand::Resume { order_id } => order_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FlowCommand::Start { .. } => "start",
            FlowCommand::Complete { .. } => "complete",
            FlowCommand::RetryCancellation { .. } => "retry_cancellation",
            FlowCommand::Resume { .. } => "resume",
        }
    }
}

/// Delay before a command that collided with a running flow is retried
const BUSY_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct FlowWorker {
    orchestrator: Arc<Orchestrator>,
    commands: mpsc::Receiver<FlowCommand>,
}

impl FlowWorker {
    pub fn new(orchestrator: Arc<Orchestrator>, commands: mpsc::Receiver<FlowCommand>) -> Self {
        Self {
            orchestrator,
            commands,
        }
    }

    /// Consume commands until every sender is dropped
    pub async fn run(mut self) {
        info!("Flow worker started");

        while let Some(command) = self.commands.recv().await {
            debug!("Received {} command for order {}", command.name(), command.order_id());
            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                handle(orchestrator, command).await;
            });
        }

        info!("Flow worker stopped");
    }
}

async fn handle(orchestrator: Arc<Orchestrator>, command: FlowCommand) {
    let order_id = command.order_id().to_string();
    let result = match &command {
        FlowCommand::Start { order_id } => orchestrator.start_flow(order_id).await.map(|_| ()),
        FlowCommand::Complete { order_id, secret } => orchestrator
            .complete_flow(order_id, secret.clone())
            .await
            .map(|_| ()),
        FlowCommand::RetryCancellation { order_id } => {
            orchestrator.retry_cancellation(order_id).await.map(|_| ())
        }
        FlowCommand::Resume { order_id } => {
            orchestrator.resume_settlement(order_id).await.map(|_| ())
        }
    };

    match result {
        Ok(()) => debug!("{} command for order {} done", command.name(), order_id),
        Err(SwapError::FlowInProgress { .. }) => {
            if matches!(
                command,
                FlowCommand::RetryCancellation { .. } | FlowCommand::Complete { .. }
            ) {
                // Neither is re-issued by the running flow
                debug!("Order {} busy, {} requeued in {:?}", order_id, command.name(), BUSY_RETRY_DELAY);
                tokio::time::sleep(BUSY_RETRY_DELAY).await;
                orchestrator.enqueue(command).await;
            } else {
                debug!("Order {} already has a running flow, {} skipped", order_id, command.name());
            }
        }
        Err(e @ SwapError::InvalidState { .. }) => {
            debug!("{} command for order {} is a no-op: {}", command.name(), order_id, e)
        }
        Err(e) if e.should_alert() => {
            error!("{} command for order {} failed: {}", command.name(), order_id, e)
        }
        Err(e) => warn!("{} command for order {} failed: {}", command.name(), order_id, e),
    }
}
