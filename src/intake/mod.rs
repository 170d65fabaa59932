//! Order intake
//!
//! Validates and stores orders, reports their status and accepts secrets.
//! Nothing here calls a chain: flows are handed to the orchestrator worker
//! through the command queue.

use crate::error::{SwapError, SwapResult};
use crate::model::{EscrowRecord, Order, OrderInput, OrderStatus, Secret, SwapRecord};
use crate::orchestrator::{FlowCommand, Orchestrator};
use crate::store::OrderStore;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Public view of one escrow
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EscrowView {
    pub chain_id: i64,
    pub status: String,
    pub address: Option<String>,
    pub deploy_tx_hash: Option<String>,
    pub withdraw_tx_hash: Option<String>,
    pub cancel_tx_hash: Option<String>,
}

impl From<&EscrowRecord> for EscrowView {
    fn from(escrow: &EscrowRecord) -> Self {
        Self {
            chain_id: escrow.chain_id,
            status: escrow.status.to_string(),
            address: escrow.address.clone(),
            deploy_tx_hash: escrow.tx_hash.clone(),
            withdraw_tx_hash: escrow.withdraw_tx.as_ref().map(|tx| tx.tx_hash.clone()),
            cancel_tx_hash: escrow.cancel_tx.as_ref().map(|tx| tx.tx_hash.clone()),
        }
    }
}

/// Public view of an order and its escrows
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusView {
    pub order_id: String,
    pub status: OrderStatus,
    pub src_chain_id: i64,
    pub dst_chain_id: i64,
    pub maker_amount: String,
    pub taker_amount: String,
    pub src_escrow: Option<EscrowView>,
    pub dst_escrow: Option<EscrowView>,
    pub secret_revealed: bool,
    pub attention: Option<String>,
    pub last_error: Option<String>,
    pub cancel_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&SwapRecord> for OrderStatusView {
    fn from(record: &SwapRecord) -> Self {
        let order = &record.order;
        Self {
            order_id: order.id.clone(),
            status: order.status,
            src_chain_id: order.src_chain_id,
            dst_chain_id: order.dst_chain_id,
            maker_amount: order.maker_amount.to_string(),
            taker_amount: order.taker_amount.to_string(),
            src_escrow: record.src_escrow.as_ref().map(EscrowView::from),
            dst_escrow: record.dst_escrow.as_ref().map(EscrowView::from),
            secret_revealed: record.revealed_secret.is_some(),
            attention: record.attention.clone(),
            last_error: record.last_error.clone(),
            cancel_retry_at: record.cancel_retry_at,
            created_at: order.created_at,
            updated_at: order.updated_at,
            expires_at: order.expires_at,
        }
    }
}

/// Result of `create_order`
#[derive(Debug, Clone)]
pub struct Created {
    pub view: OrderStatusView,
    /// False when an order with the supplied id already existed
    pub created: bool,
}

pub struct OrderService {
    store: Arc<dyn OrderStore>,
    orchestrator: Arc<Orchestrator>,
}

impl OrderService {
    pub fn new(store: Arc<dyn OrderStore>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    /// Validate, persist and start an order.
    ///
    /// Idempotent on a supplied id: the stored order is returned unchanged and
    /// no second flow is started.
    pub async fn create_order(&self, input: OrderInput) -> SwapResult<Created> {
        let now = self.orchestrator.clock().now();
        let order = Order::from_input(input, now, self.orchestrator.config().safety_margin_secs)?;
        let record = SwapRecord::new(order);

        if !self.store.insert(&record).await? {
            let existing = self.load(record.id()).await?;
            info!("Order {} already exists ({})", existing.id(), existing.order.status);
            return Ok(Created {
                view: OrderStatusView::from(&existing),
                created: false,
            });
        }

        info!(
            "Accepted order {}: chain {} -> chain {}, maker amount {}, taker amount {}",
            record.id(),
            record.order.src_chain_id,
            record.order.dst_chain_id,
            record.order.maker_amount,
            record.order.taker_amount
        );
        crate::metrics::record_transition(OrderStatus::Created);
        self.orchestrator
            .enqueue(FlowCommand::Start {
                order_id: record.id().to_string(),
            })
            .await;

        Ok(Created {
            view: OrderStatusView::from(&record),
            created: true,
        })
    }

    pub async fn get_status(&self, order_id: &str) -> SwapResult<OrderStatusView> {
        self.load(order_id).await.map(|record| OrderStatusView::from(&record))
    }

    /// Check the secret against the stored order and enqueue settlement.
    ///
    /// Returns before any chain call; progress is visible through `get_status`.
    pub async fn reveal_secret(&self, order_id: &str, secret_hex: &str) -> SwapResult<OrderStatusView> {
        let secret = Secret::from_hex(secret_hex)?;
        let record = self.load(order_id).await?;

        if record.order.status != OrderStatus::EscrowsReady {
            return Err(SwapError::InvalidState {
                order_id: order_id.to_string(),
                status: record.order.status.to_string(),
                operation: "reveal secret".to_string(),
            });
        }
        if self.orchestrator.is_running(order_id) {
            return Err(SwapError::FlowInProgress {
                order_id: order_id.to_string(),
            });
        }
        if !secret.matches(&record.order.secret_hash) {
            return Err(SwapError::InvalidSecret {
                order_id: order_id.to_string(),
            });
        }

        info!("Secret accepted for order {}, settlement queued", order_id);
        self.orchestrator
            .enqueue(FlowCommand::Complete {
                order_id: order_id.to_string(),
                secret,
            })
            .await;

        Ok(OrderStatusView::from(&record))
    }

    /// Store reachability, for readiness probes
    pub async fn health_check(&self) -> SwapResult<()> {
        self.store.health_check().await
    }

    async fn load(&self, order_id: &str) -> SwapResult<SwapRecord> {
        self.store
            .get(order_id)
            .await?
            .ok_or_else(|| SwapError::OrderNotFound {
                order_id: order_id.to_string(),
            })
    }
}
