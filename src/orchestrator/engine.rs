//! Atomic-swap orchestrator
//!
//! Phase one deploys the source escrow, waits for it to be final, deploys the
//! destination escrow and verifies both balances. Phase two withdraws on the
//! destination chain, waits for finality there, then withdraws on the source
//! chain. Every step is persisted before the next one starts.

use super::clock::Clock;
use super::finality::FinalityWaiter;
use super::lock::FlowLocks;
use super::retry::RetryPolicy;
use super::scheduler::CancellationScheduler;
use super::worker::FlowCommand;
use crate::config::OrchestratorConfig;
use crate::error::{SwapError, SwapResult};
use crate::metrics;
use crate::model::{
    Asset, EscrowParams, EscrowRecord, EscrowStatus, OrderStatus, Secret, Side, SwapRecord, TxRef,
};
use crate::policy::{self, CancelDecision, EscrowAction, EscrowStage};
use crate::resolver::{ResolvedChain, ResolverFactory};
use crate::store::OrderStore;

use chrono::{DateTime, Duration, Utc};
use ethers::types::U256;
use std::cmp;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct Orchestrator {
    store: Arc<dyn OrderStore>,
    chains: Arc<dyn ResolverFactory>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    retry: RetryPolicy,
    locks: FlowLocks,
    scheduler: CancellationScheduler,
    commands: mpsc::Sender<FlowCommand>,
}

/// What startup recovery found
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Recovery {
    /// Escrow setups enqueued again
    pub restarted: usize,
    /// Settlements enqueued again
    pub resumed: usize,
    /// Cancellation timers armed
    pub rearmed: usize,
    /// Failed orders waiting for an operator
    pub attention: usize,
}

fn escrow_of(record: &SwapRecord, side: Side) -> SwapResult<EscrowRecord> {
    record.escrow(side).cloned().ok_or_else(|| {
        SwapError::Internal(format!("order {} has no {} escrow", record.id(), side))
    })
}

/// The resolver's own address on the escrow: beneficiary of the source
/// escrow, depositor of the destination escrow
fn executor(escrow: &EscrowRecord) -> &str {
    match escrow.side {
        Side::Src => &escrow.beneficiary,
        Side::Dst => &escrow.depositor,
    }
}

/// A verified escrow that reads empty was withdrawn when the secret is out
/// or its cancellation window has not opened yet
fn emptied_by_withdrawal(record: &SwapRecord, escrow: &EscrowRecord, now: DateTime<Utc>) -> bool {
    if escrow.status != EscrowStatus::Funded {
        return false;
    }
    if record.revealed_secret.is_some() {
        return true;
    }
    match escrow.deployed_at {
        Some(deployed_at) => matches!(
            policy::evaluate(deployed_at, &record.order.time_locks, now, escrow.side),
            EscrowStage::TooEarly | EscrowStage::Withdrawable | EscrowStage::PublicWithdrawable
        ),
        None => false,
    }
}

fn verify_funding(escrow: &EscrowRecord, balance: U256) -> SwapResult<()> {
    if balance.is_zero() || balance < escrow.amount {
        return Err(SwapError::FundingVerification {
            side: escrow.side,
            address: escrow.address.clone().unwrap_or_default(),
            expected: escrow.amount.to_string(),
            actual: balance.to_string(),
        });
    }
    Ok(())
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn OrderStore>,
        chains: Arc<dyn ResolverFactory>,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
        commands: mpsc::Sender<FlowCommand>,
    ) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config),
            scheduler: CancellationScheduler::new(clock.clone(), commands.clone()),
            locks: FlowLocks::new(),
            store,
            chains,
            clock,
            config,
            commands,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn is_running(&self, order_id: &str) -> bool {
        self.locks.is_locked(order_id)
    }

    pub async fn enqueue(&self, command: FlowCommand) {
        let order_id = command.order_id().to_string();
        if self.commands.send(command).await.is_err() {
            warn!("Command queue closed, dropping command for order {}", order_id);
        }
    }

    /// Phase one: `CREATED` to `ESCROWS_READY`, or `FAILED` with the
    /// cancellation policy applied. Re-running resumes from persisted escrows.
    pub async fn start_flow(&self, order_id: &str) -> SwapResult<SwapRecord> {
        let _guard = self.locks.try_acquire(order_id)?;
        let mut record = self.load(order_id).await?;

        match record.order.status {
            OrderStatus::EscrowsReady => {
                debug!("Order {} already has both escrows funded", order_id);
                return Ok(record);
            }
            OrderStatus::Created
            | OrderStatus::SrcEscrowDeployed
            | OrderStatus::DstEscrowDeployed => {}
            status => {
                return Err(SwapError::InvalidState {
                    order_id: order_id.to_string(),
                    status: status.to_string(),
                    operation: "start flow".to_string(),
                })
            }
        }

        info!(
            "Starting escrow setup for order {} (chain {} -> chain {}, status {})",
            order_id, record.order.src_chain_id, record.order.dst_chain_id, record.order.status
        );
        let started = Instant::now();

        match self.setup_escrows(&mut record).await {
            Ok(()) => {
                metrics::record_flow_duration("start", "ready", started.elapsed().as_secs_f64());
                info!("Order {} escrows ready, waiting for the secret", order_id);
                Ok(record)
            }
            Err(e) => {
                error!("Escrow setup failed for order {}: {}", order_id, e);
                self.fail_and_cancel(&mut record, &e).await;
                metrics::record_flow_duration("start", "failed", started.elapsed().as_secs_f64());
                Err(e)
            }
        }
    }

    /// Phase two: settle an `ESCROWS_READY` order with its secret.
    ///
    /// State and secret are both checked before any chain call.
    pub async fn complete_flow(&self, order_id: &str, secret: Secret) -> SwapResult<SwapRecord> {
        let _guard = self.locks.try_acquire(order_id)?;
        let mut record = self.load(order_id).await?;

        if record.order.status != OrderStatus::EscrowsReady {
            return Err(SwapError::InvalidState {
                order_id: order_id.to_string(),
                status: record.order.status.to_string(),
                operation: "complete flow".to_string(),
            });
        }
        if !secret.matches(&record.order.secret_hash) {
            return Err(SwapError::InvalidSecret {
                order_id: order_id.to_string(),
            });
        }

        record.revealed_secret = Some(secret.clone());
        self.advance(&mut record, OrderStatus::SecretRevealed)?;
        self.store.save(&record).await?;
        info!("Secret revealed for order {}, settling", order_id);

        self.settle(&mut record, &secret).await?;
        Ok(record)
    }

    /// Continue a settlement interrupted after the secret was revealed
    pub async fn resume_settlement(&self, order_id: &str) -> SwapResult<SwapRecord> {
        let _guard = self.locks.try_acquire(order_id)?;
        let mut record = self.load(order_id).await?;

        match record.order.status {
            OrderStatus::SecretRevealed | OrderStatus::DstWithdrawn | OrderStatus::SrcWithdrawn => {}
            status => {
                return Err(SwapError::InvalidState {
                    order_id: order_id.to_string(),
                    status: status.to_string(),
                    operation: "resume settlement".to_string(),
                })
            }
        }
        let secret = record.revealed_secret.clone().ok_or_else(|| {
            SwapError::Internal(format!("order {} has no persisted secret", order_id))
        })?;

        info!("Resuming settlement of order {} from {}", order_id, record.order.status);
        self.settle(&mut record, &secret).await?;
        Ok(record)
    }

    /// Cancellation check of a failed order, run when a window opens
    pub async fn retry_cancellation(&self, order_id: &str) -> SwapResult<SwapRecord> {
        let _guard = self.locks.try_acquire(order_id)?;
        let mut record = self.load(order_id).await?;

        if record.order.status != OrderStatus::Failed {
            debug!(
                "Order {} is {}, nothing to cancel",
                order_id, record.order.status
            );
            return Ok(record);
        }
        if record.attention.is_some() {
            warn!("Order {} is waiting for an operator, not cancelling", order_id);
            return Ok(record);
        }

        info!("Re-checking cancellation windows of order {}", order_id);
        self.cancel_escrows(&mut record).await;
        Ok(record)
    }

    /// Re-enqueue interrupted flows and re-arm cancellation timers.
    ///
    /// The worker must already be consuming the queue.
    pub async fn resume_all(&self) -> SwapResult<Recovery> {
        let open = self.store.list_open().await?;
        let now = self.clock.now();
        let mut summary = Recovery::default();

        for record in open {
            let order_id = record.id().to_string();
            match record.order.status {
                OrderStatus::Created
                | OrderStatus::SrcEscrowDeployed
                | OrderStatus::DstEscrowDeployed => {
                    self.enqueue(FlowCommand::Start { order_id }).await;
                    summary.restarted += 1;
                }
                OrderStatus::SecretRevealed
                | OrderStatus::DstWithdrawn
                | OrderStatus::SrcWithdrawn => {
                    self.enqueue(FlowCommand::Resume { order_id }).await;
                    summary.resumed += 1;
                }
                OrderStatus::Failed if record.attention.is_some() => {
                    summary.attention += 1;
                }
                OrderStatus::Failed => {
                    // A crash during failure handling leaves escrows unreconciled
                    let unsettled = [Side::Src, Side::Dst].iter().any(|side| {
                        record
                            .escrow(*side)
                            .map(|e| !e.status.is_final())
                            .unwrap_or(false)
                    });
                    let at = record.cancel_retry_at.or(unsettled.then_some(now));
                    if let Some(at) = at {
                        self.scheduler.arm(&order_id, at);
                        summary.rearmed += 1;
                    }
                }
                OrderStatus::EscrowsReady | OrderStatus::Completed | OrderStatus::Cancelled => {}
            }
        }

        metrics::set_attention_orders(summary.attention);
        info!(
            "Recovery: {} setups restarted, {} settlements resumed, {} cancellation timers armed, {} orders need attention",
            summary.restarted, summary.resumed, summary.rearmed, summary.attention
        );
        Ok(summary)
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    async fn load(&self, order_id: &str) -> SwapResult<SwapRecord> {
        self.store
            .get(order_id)
            .await?
            .ok_or_else(|| SwapError::OrderNotFound {
                order_id: order_id.to_string(),
            })
    }

    /// Move forward to `next`; already at or past it is a no-op
    fn advance(&self, record: &mut SwapRecord, next: OrderStatus) -> SwapResult<()> {
        let previous = record.order.status;
        if previous.has_reached(next) {
            return Ok(());
        }
        record.order.transition(next, self.clock.now())?;
        metrics::record_transition(next);
        info!("Order {}: {} -> {}", record.id(), previous, next);
        Ok(())
    }

    fn resolve_pair(&self, record: &SwapRecord) -> SwapResult<(ResolvedChain, ResolvedChain)> {
        Ok((
            self.chains.resolve(record.order.src_chain_id)?,
            self.chains.resolve(record.order.dst_chain_id)?,
        ))
    }

    fn finality(&self) -> FinalityWaiter<'_> {
        FinalityWaiter {
            clock: self.clock.as_ref(),
            retry: &self.retry,
            poll_initial: std::time::Duration::from_millis(self.config.finality_poll_initial_ms),
            poll_max: std::time::Duration::from_millis(self.config.finality_poll_max_ms),
        }
    }

    fn finality_timeout(&self) -> Duration {
        let secs = cmp::min(self.config.finality_timeout_secs, u64::from(u32::MAX));
        Duration::seconds(secs as i64)
    }

    /// When a failed chain call should be looked at again
    fn later(&self) -> DateTime<Utc> {
        self.clock.now() + Duration::from_std(self.retry.max_delay).unwrap_or_else(|_| Duration::seconds(30))
    }

    async fn setup_escrows(&self, record: &mut SwapRecord) -> SwapResult<()> {
        let (src, dst) = self.resolve_pair(record)?;
        let (src_resolver, dst_resolver) = (&src.resolver, &dst.resolver);

        futures::try_join!(
            self.retry
                .read(src.chain_id, "initialize", move || src_resolver.initialize()),
            self.retry
                .read(dst.chain_id, "initialize", move || dst_resolver.initialize()),
        )?;
        let (src_address, dst_address) = futures::try_join!(
            self.retry
                .read(src.chain_id, "resolver address", move || src_resolver.get_address()),
            self.retry
                .read(dst.chain_id, "resolver address", move || dst_resolver.get_address()),
        )?;

        let order = record.order.clone();
        let timelocks = order.time_locks;

        let src_params = EscrowParams {
            order_id: order.id.clone(),
            side: Side::Src,
            chain_id: src.chain_id,
            escrow_factory: src.escrow_factory.clone(),
            hashlock: order.secret_hash,
            depositor: order.maker.clone(),
            beneficiary: src_address,
            asset: Asset::parse(&order.maker_asset),
            amount: order.maker_amount,
            safety_deposit: order.src_safety_deposit,
            timelocks,
            src_cancellation_at: None,
        };
        self.ensure_deployed(record, &src, &src_params).await?;
        self.advance(record, OrderStatus::SrcEscrowDeployed)?;
        self.store.save(record).await?;

        let src_escrow = escrow_of(record, Side::Src)?;
        let src_deployed_at = src_escrow.deployed_at.ok_or_else(|| {
            SwapError::Internal(format!("source escrow of order {} has no deploy time", order.id))
        })?;
        let src_cancellation = policy::cancellation_opens_at(src_deployed_at, &timelocks, Side::Src);

        let dst_deployed = record
            .escrow(Side::Dst)
            .map(|e| e.may_hold_funds())
            .unwrap_or(false);
        if !dst_deployed {
            if record.escrow(Side::Dst).is_none() {
                // Nothing is locked on the destination before the source is final
                let src_tx = src_escrow.tx_hash.clone().ok_or_else(|| {
                    SwapError::Internal(format!("source escrow of order {} has no tx", order.id))
                })?;
                let deadline = cmp::min(self.clock.now() + self.finality_timeout(), src_cancellation);
                self.finality().wait(&src, &src_tx, deadline).await?;
            }
            policy::check_destination_deadline(
                src_deployed_at,
                self.clock.now(),
                &timelocks,
                self.config.safety_margin_secs,
            )?;
        }

        let dst_params = EscrowParams {
            order_id: order.id.clone(),
            side: Side::Dst,
            chain_id: dst.chain_id,
            escrow_factory: dst.escrow_factory.clone(),
            hashlock: order.secret_hash,
            depositor: dst_address,
            beneficiary: order.receiver().to_string(),
            asset: Asset::parse(&order.taker_asset),
            amount: order.taker_amount,
            safety_deposit: order.dst_safety_deposit,
            timelocks,
            src_cancellation_at: Some(src_cancellation),
        };
        self.ensure_deployed(record, &dst, &dst_params).await?;
        self.advance(record, OrderStatus::DstEscrowDeployed)?;
        self.store.save(record).await?;

        let src_escrow = escrow_of(record, Side::Src)?;
        let dst_escrow = escrow_of(record, Side::Dst)?;
        let (src_balance, dst_balance) = futures::try_join!(
            self.balance_of(&src, &src_escrow),
            self.balance_of(&dst, &dst_escrow),
        )?;
        verify_funding(&src_escrow, src_balance)?;
        verify_funding(&dst_escrow, dst_balance)?;

        let now = self.clock.now();
        for side in [Side::Src, Side::Dst] {
            if let Some(escrow) = record.escrow_mut(side) {
                if escrow.status == EscrowStatus::Deployed {
                    escrow.set_status(EscrowStatus::Funded, None, None, now);
                }
            }
        }
        self.advance(record, OrderStatus::EscrowsReady)?;
        self.store.save(record).await?;
        Ok(())
    }

    /// Persist a `DEPLOYING` record, then deploy. The resolver's own lookup
    /// makes a repeated deployment return the existing escrow.
    async fn ensure_deployed(
        &self,
        record: &mut SwapRecord,
        chain: &ResolvedChain,
        params: &EscrowParams,
    ) -> SwapResult<()> {
        let side = params.side;
        match record.escrow(side).map(|e| e.status) {
            Some(EscrowStatus::Deployed | EscrowStatus::Funded) => return Ok(()),
            Some(EscrowStatus::Deploying) => {
                info!(
                    "Resuming interrupted {} escrow deployment for order {}",
                    side, params.order_id
                );
            }
            Some(status) => {
                return Err(SwapError::InvalidState {
                    order_id: params.order_id.clone(),
                    status: format!("{} escrow {}", side, status),
                    operation: "deploy escrow".to_string(),
                })
            }
            None => {
                record.set_escrow(EscrowRecord::deploying(params, self.clock.now()));
                self.store.save(record).await?;
            }
        }

        let resolver = &chain.resolver;
        let deployment = self
            .retry
            .submit_idempotent(chain.chain_id, "deploy escrow", move || {
                resolver.deploy_escrow(params)
            })
            .await?;

        let now = self.clock.now();
        if let Some(escrow) = record.escrow_mut(side) {
            escrow.record_deployment(&deployment, now);
        }
        metrics::record_escrow_deployed(chain.chain_id, side);
        info!(
            "Order {} {} escrow deployed at {} on chain {} (tx {})",
            params.order_id, side, deployment.address, chain.chain_id, deployment.tx_hash
        );
        Ok(())
    }

    async fn balance_of(&self, chain: &ResolvedChain, escrow: &EscrowRecord) -> SwapResult<U256> {
        let address = escrow.address.as_deref().ok_or_else(|| {
            SwapError::Internal(format!(
                "{} escrow of order {} has no address",
                escrow.side, escrow.order_id
            ))
        })?;
        let asset_owned = escrow.asset();
        let asset = &asset_owned;
        let resolver = &chain.resolver;
        self.retry
            .read(chain.chain_id, "escrow balance", move || {
                resolver.get_contract_balance(address, asset)
            })
            .await
    }

    async fn settle(&self, record: &mut SwapRecord, secret: &Secret) -> SwapResult<()> {
        let started = Instant::now();
        let (src, dst) = match self.resolve_pair(record) {
            Ok(pair) => pair,
            Err(e) => {
                self.fail_and_cancel(record, &e).await;
                return Err(e);
            }
        };

        if record.order.status == OrderStatus::SecretRevealed {
            if let Err(e) = self.withdraw(record, &dst, Side::Dst, secret).await {
                error!("Destination withdrawal failed for order {}: {}", record.id(), e);
                // The submission may have landed before the error surfaced
                match self.escrow_emptied(record, &dst, Side::Dst).await {
                    Ok(true) => {
                        warn!(
                            "Order {} destination escrow is empty after the failed withdrawal, treating it as withdrawn",
                            record.id()
                        );
                        self.mark_emptied(record, Side::Dst);
                    }
                    Ok(false) | Err(_) => {
                        self.fail_and_cancel(record, &e).await;
                        metrics::record_flow_duration(
                            "complete",
                            "failed",
                            started.elapsed().as_secs_f64(),
                        );
                        return Err(e);
                    }
                }
            }
            self.advance(record, OrderStatus::DstWithdrawn)?;
            self.store.save(record).await?;
        }

        if record.order.status == OrderStatus::DstWithdrawn {
            let result = async {
                self.await_destination_finality(record, &dst).await?;
                self.withdraw(record, &src, Side::Src, secret).await
            }
            .await;
            if let Err(e) = result {
                record.last_error = Some(e.to_string());
                self.raise_attention(
                    record,
                    format!("destination escrow withdrawn but source settlement failed: {}", e),
                )
                .await;
                metrics::record_flow_duration("complete", "attention", started.elapsed().as_secs_f64());
                return Err(e);
            }
            self.advance(record, OrderStatus::SrcWithdrawn)?;
            self.store.save(record).await?;
        }

        self.advance(record, OrderStatus::Completed)?;
        self.store.save(record).await?;
        metrics::record_flow_duration("complete", "completed", started.elapsed().as_secs_f64());
        info!("Order {} completed", record.id());
        Ok(())
    }

    /// Withdraw once the side's window is open; waits on the clock if early
    async fn withdraw(
        &self,
        record: &mut SwapRecord,
        chain: &ResolvedChain,
        side: Side,
        secret: &Secret,
    ) -> SwapResult<()> {
        let escrow = escrow_of(record, side)?;
        if escrow.status == EscrowStatus::Withdrawn {
            return Ok(());
        }
        let timelocks = record.order.time_locks;
        let handle = escrow.handle(&timelocks)?;

        let receipt = loop {
            match policy::evaluate(handle.deployed_at, &timelocks, self.clock.now(), side) {
                EscrowStage::TooEarly => {
                    let opens_at = policy::withdrawal_opens_at(handle.deployed_at, &timelocks, side);
                    info!(
                        "Order {} {} escrow opens for withdrawal at {}, waiting",
                        record.id(), side, opens_at
                    );
                    self.clock.sleep_until(opens_at).await;
                    continue;
                }
                EscrowStage::Cancellable | EscrowStage::PublicCancellable => {
                    return Err(SwapError::WindowClosed {
                        side,
                        closed_at: policy::cancellation_opens_at(handle.deployed_at, &timelocks, side)
                            .timestamp(),
                    });
                }
                EscrowStage::Withdrawable | EscrowStage::PublicWithdrawable => {}
            }

            match self
                .retry
                .submit_once(
                    chain.chain_id,
                    "withdraw",
                    chain.resolver.withdraw(&handle, secret, side),
                )
                .await
            {
                Ok(receipt) => break receipt,
                Err(SwapError::NotYetWithdrawable { opens_at, .. }) => {
                    // Chain time lags the local clock
                    debug!(
                        "Chain {} not yet at withdrawal window {} of order {}",
                        chain.chain_id, opens_at, record.id()
                    );
                    tokio::time::sleep(self.retry.base_delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        let now = self.clock.now();
        let payout = policy::payout(&escrow, EscrowAction::Withdraw, executor(&escrow));
        if let Some(escrow) = record.escrow_mut(side) {
            escrow.withdraw_tx = Some(TxRef {
                tx_hash: receipt.tx_hash.clone(),
                block_number: receipt.block_number,
                at: now,
            });
            escrow.funds_recipient = Some(payout.funds_to);
            escrow.safety_deposit_recipient = Some(payout.safety_deposit_to);
            escrow.set_status(EscrowStatus::Withdrawn, Some(receipt.tx_hash.clone()), None, now);
        }
        metrics::record_withdrawal(chain.chain_id, side);
        info!(
            "Order {} {} escrow withdrawn on chain {} (tx {})",
            record.id(), side, chain.chain_id, receipt.tx_hash
        );
        Ok(())
    }

    /// True when a funded escrow reads empty on chain
    async fn escrow_emptied(
        &self,
        record: &SwapRecord,
        chain: &ResolvedChain,
        side: Side,
    ) -> SwapResult<bool> {
        let escrow = escrow_of(record, side)?;
        if escrow.status != EscrowStatus::Funded {
            return Ok(false);
        }
        Ok(self.balance_of(chain, &escrow).await?.is_zero())
    }

    /// Record a withdrawal observed through the escrow balance, with no
    /// receipt of our own
    fn mark_emptied(&self, record: &mut SwapRecord, side: Side) {
        let now = self.clock.now();
        if let Some(escrow) = record.escrow_mut(side) {
            escrow.funds_recipient = Some(escrow.beneficiary.clone());
            escrow.set_status(
                EscrowStatus::Withdrawn,
                None,
                Some("escrow emptied by a withdrawal".to_string()),
                now,
            );
            metrics::record_withdrawal(escrow.chain_id, side);
        }
    }

    async fn await_destination_finality(
        &self,
        record: &SwapRecord,
        dst: &ResolvedChain,
    ) -> SwapResult<()> {
        let timelocks = record.order.time_locks;
        let dst_escrow = escrow_of(record, Side::Dst)?;
        let src_escrow = escrow_of(record, Side::Src)?;
        let tx_hash = match dst_escrow.withdraw_tx.as_ref() {
            Some(tx) => tx.tx_hash.clone(),
            None => {
                // Observed withdrawal: the escrow must still read empty
                let balance = self.balance_of(dst, &dst_escrow).await?;
                if balance.is_zero() {
                    return Ok(());
                }
                return Err(SwapError::ReorgDetected {
                    chain_id: dst.chain_id,
                    tx_hash: format!("withdrawal of {}", dst_escrow.address.unwrap_or_default()),
                });
            }
        };

        let mut deadline = self.clock.now() + self.finality_timeout();
        for escrow in [&dst_escrow, &src_escrow] {
            if let Some(deployed_at) = escrow.deployed_at {
                deadline = cmp::min(
                    deadline,
                    policy::cancellation_opens_at(deployed_at, &timelocks, escrow.side),
                );
            }
        }

        self.finality().wait(dst, &tx_hash, deadline).await.map(|_| ())
    }

    /// Mark the order failed and apply the cancellation policy
    async fn fail_and_cancel(&self, record: &mut SwapRecord, cause: &SwapError) {
        record.last_error = Some(cause.to_string());
        if let Err(e) = self.advance(record, OrderStatus::Failed) {
            error!("Cannot mark order {} failed: {}", record.id(), e);
        }
        if let Err(e) = self.store.save(record).await {
            error!("Failed to persist failure of order {}: {}", record.id(), e);
        }
        self.cancel_escrows(record).await;
    }

    /// Funds moved on one side only; leave the remaining escrow alone and
    /// hand the order to an operator
    async fn raise_attention(&self, record: &mut SwapRecord, note: String) {
        error!("Order {} needs manual intervention: {}", record.id(), note);
        record.attention = Some(note);
        record.cancel_retry_at = None;
        self.scheduler.disarm(record.id());
        if let Err(e) = self.advance(record, OrderStatus::Failed) {
            error!("Cannot mark order {} failed: {}", record.id(), e);
        }
        if let Err(e) = self.store.save(record).await {
            error!("Failed to persist failure of order {}: {}", record.id(), e);
        }
        metrics::record_attention_raised();
    }

    async fn hold_withdrawn(&self, record: &mut SwapRecord) {
        warn!(
            "Order {} has a withdrawn escrow, automatic cancellation disabled",
            record.id()
        );
        if record.attention.is_none() {
            let side = [Side::Dst, Side::Src]
                .into_iter()
                .find(|side| {
                    record
                        .escrow(*side)
                        .map(|e| e.status == EscrowStatus::Withdrawn)
                        .unwrap_or(false)
                })
                .unwrap_or(Side::Dst);
            self.raise_attention(
                record,
                format!("{} escrow withdrawn while the order failed, settle the other side manually", side),
            )
            .await;
        }
    }

    async fn cancel_escrows(&self, record: &mut SwapRecord) {
        if record.any_withdrawn() {
            self.hold_withdrawn(record).await;
            return;
        }

        let mut retry_at: Option<DateTime<Utc>> = None;
        // Destination first: its window opens earlier
        for side in [Side::Dst, Side::Src] {
            if record.escrow(side).is_none() {
                continue;
            }
            let next = match self.cancel_escrow(record, side).await {
                Ok(next) => next,
                Err(e) => {
                    warn!(
                        "Cancellation of order {} {} escrow failed, retrying later: {}",
                        record.id(),
                        side,
                        e
                    );
                    record.last_error = Some(e.to_string());
                    Some(self.later())
                }
            };
            if record.any_withdrawn() {
                self.hold_withdrawn(record).await;
                return;
            }
            retry_at = match (retry_at, next) {
                (Some(a), Some(b)) => Some(cmp::min(a, b)),
                (a, b) => a.or(b),
            };
        }

        record.cancel_retry_at = retry_at;
        match retry_at {
            Some(at) => self.scheduler.arm(record.id(), at),
            None => self.scheduler.disarm(record.id()),
        }

        if record.all_refunded() && record.order.status == OrderStatus::Failed {
            match self.advance(record, OrderStatus::Cancelled) {
                Ok(()) => info!("Order {} fully refunded", record.id()),
                Err(e) => error!("Cannot mark order {} cancelled: {}", record.id(), e),
            }
        }

        if let Err(e) = self.store.save(record).await {
            error!("Failed to persist cancellation state of order {}: {}", record.id(), e);
        }
    }

    /// Reconcile and, when the window is open, cancel one escrow.
    /// Returns when to look again.
    async fn cancel_escrow(
        &self,
        record: &mut SwapRecord,
        side: Side,
    ) -> SwapResult<Option<DateTime<Utc>>> {
        let timelocks = record.order.time_locks;
        let order_id = record.id().to_string();
        let escrow = escrow_of(record, side)?;
        let chain = self.chains.resolve(escrow.chain_id)?;
        let resolver = &chain.resolver;

        if escrow.status == EscrowStatus::Deploying {
            let factory = chain.escrow_factory.as_str();
            let id = order_id.as_str();
            let found = self
                .retry
                .read(chain.chain_id, "find escrow", move || {
                    resolver.find_escrow(factory, id, side)
                })
                .await?;
            let now = self.clock.now();
            if let Some(escrow) = record.escrow_mut(side) {
                match &found {
                    Some(deployment) => {
                        escrow.record_deployment(deployment, now);
                        info!(
                            "Order {} {} escrow found on chain at {}",
                            order_id, side, deployment.address
                        );
                    }
                    None => {
                        escrow.set_status(
                            EscrowStatus::Cancelled,
                            None,
                            Some("never deployed".to_string()),
                            now,
                        );
                        info!("Order {} {} escrow was never deployed", order_id, side);
                        return Ok(None);
                    }
                }
            }
        }

        let escrow = escrow_of(record, side)?;
        if !escrow.may_hold_funds() {
            return Ok(None);
        }

        let balance = self.balance_of(&chain, &escrow).await?;
        let now = self.clock.now();
        if balance.is_zero() {
            if emptied_by_withdrawal(record, &escrow, now) {
                warn!(
                    "Order {} {} escrow was funded and is now empty, recording a withdrawal",
                    order_id, side
                );
                self.mark_emptied(record, side);
            } else if let Some(escrow) = record.escrow_mut(side) {
                escrow.set_status(
                    EscrowStatus::Cancelled,
                    None,
                    Some("escrow holds no funds".to_string()),
                    now,
                );
                info!("Order {} {} escrow is empty, nothing to refund", order_id, side);
            }
            return Ok(None);
        }
        if let Some(escrow) = record.escrow_mut(side) {
            if escrow.status == EscrowStatus::Deployed {
                escrow.set_status(EscrowStatus::Funded, None, None, now);
            }
        }

        let escrow = escrow_of(record, side)?;
        match policy::cancellation_decision(&escrow, &timelocks, now) {
            CancelDecision::Nothing => Ok(None),
            CancelDecision::RetryAt(at) => {
                info!(
                    "Order {} {} escrow becomes cancellable at {}",
                    order_id, side, at
                );
                Ok(Some(at))
            }
            CancelDecision::CancelNow => {
                let handle = escrow.handle(&timelocks)?;
                match self
                    .retry
                    .submit_once(chain.chain_id, "cancel", resolver.cancel(&handle, side))
                    .await
                {
                    Ok(receipt) => {
                        let now = self.clock.now();
                        let payout = policy::payout(&escrow, EscrowAction::Cancel, executor(&escrow));
                        if let Some(escrow) = record.escrow_mut(side) {
                            escrow.cancel_tx = Some(TxRef {
                                tx_hash: receipt.tx_hash.clone(),
                                block_number: receipt.block_number,
                                at: now,
                            });
                            escrow.funds_recipient = Some(payout.funds_to);
                            escrow.safety_deposit_recipient = Some(payout.safety_deposit_to);
                            escrow.set_status(
                                EscrowStatus::Cancelled,
                                Some(receipt.tx_hash.clone()),
                                None,
                                now,
                            );
                        }
                        metrics::record_cancellation(chain.chain_id, side);
                        info!(
                            "Order {} {} escrow cancelled on chain {} (tx {})",
                            order_id, side, chain.chain_id, receipt.tx_hash
                        );
                        Ok(None)
                    }
                    Err(SwapError::TooEarly { opens_at, .. }) => {
                        debug!(
                            "Chain {} not yet at cancellation window {} of order {}",
                            chain.chain_id, opens_at, order_id
                        );
                        Ok(Some(self.later()))
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::order::tests::input;
    use crate::model::{ChainFamily, EscrowDeployment, InclusionProof, Order};
    use crate::orchestrator::clock::ManualClock;
    use crate::resolver::{ChainRegistry, MockResolver, TxReceipt, TxState, TxStatus};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SRC_CHAIN: i64 = 1;
    const DST_CHAIN: i64 = -239;

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            call_timeout_ms: 1_000,
            submit_timeout_ms: 1_000,
            max_retries: 1,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            finality_poll_initial_ms: 1,
            finality_poll_max_ms: 5,
            finality_timeout_secs: 600,
            safety_margin_secs: 600,
        }
    }

    fn deployment(params: &EscrowParams, at: DateTime<Utc>) -> EscrowDeployment {
        let tx_hash = format!("0x{}-deploy", params.side);
        EscrowDeployment {
            address: format!("{}-escrow", params.side),
            tx_hash: tx_hash.clone(),
            block_number: Some(10),
            deployed_at: at,
            proof: InclusionProof {
                chain_id: params.chain_id,
                tx_hash,
                block_number: Some(10),
                block_hash: None,
            },
        }
    }

    fn final_status() -> TxStatus {
        TxStatus {
            state: TxState::Included,
            block_number: Some(10),
            confirmations: 64,
            finalized: true,
        }
    }

    fn receipt(hash: &str) -> TxReceipt {
        TxReceipt {
            tx_hash: hash.to_string(),
            block_number: Some(11),
        }
    }

    /// Resolver whose deployments land at `t0` and hold `balance`
    fn funded_resolver(address: &'static str, t0: DateTime<Utc>, balance: U256) -> MockResolver {
        scripted_resolver(address, t0, move || balance)
    }

    /// Escrow balance reads full once, during setup, and empty afterwards
    fn drained_resolver(address: &'static str, t0: DateTime<Utc>) -> MockResolver {
        let reads = AtomicUsize::new(0);
        scripted_resolver(address, t0, move || {
            if reads.fetch_add(1, Ordering::SeqCst) == 0 {
                U256::exp10(19)
            } else {
                U256::zero()
            }
        })
    }

    fn scripted_resolver(
        address: &'static str,
        t0: DateTime<Utc>,
        mut balance: impl FnMut() -> U256 + Send + 'static,
    ) -> MockResolver {
        let mut r = MockResolver::new();
        r.expect_initialize().returning(|| Ok(()));
        r.expect_get_address()
            .returning(move || Ok(address.to_string()));
        r.expect_deploy_escrow()
            .returning(move |p| Ok(deployment(p, t0)));
        r.expect_get_transaction_status()
            .returning(|_| Ok(final_status()));
        r.expect_get_contract_balance()
            .returning(move |_, _| Ok(balance()));
        r
    }

    struct Harness {
        orchestrator: Orchestrator,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        commands: mpsc::Receiver<FlowCommand>,
        t0: DateTime<Utc>,
    }

    async fn harness(src: MockResolver, dst: MockResolver, t0: DateTime<Utc>) -> Harness {
        let registry = ChainRegistry::new();
        for (chain_id, family, resolver) in [
            (SRC_CHAIN, ChainFamily::Evm, src),
            (DST_CHAIN, ChainFamily::Ton, dst),
        ] {
            registry.insert(ResolvedChain {
                chain_id,
                family,
                escrow_factory: format!("factory-{}", chain_id),
                confirmations: 1,
                resolver: Arc::new(resolver),
            });
        }

        let store = Arc::new(MemoryStore::new());
        let order = Order::from_input(input(), t0, 600).unwrap();
        store.insert(&SwapRecord::new(order)).await.unwrap();

        let clock = Arc::new(ManualClock::new(t0));
        let (tx, rx) = mpsc::channel(16);
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(registry),
            clock.clone(),
            test_config(),
            tx,
        );
        Harness {
            orchestrator,
            store,
            clock,
            commands: rx,
            t0,
        }
    }

    fn secret() -> Secret {
        Secret::new([9u8; 32])
    }

    #[tokio::test]
    async fn test_start_flow_reaches_escrows_ready() {
        let t0 = Utc::now();
        let h = harness(
            funded_resolver("0xresolver", t0, U256::exp10(19)),
            funded_resolver("0:resolver", t0, U256::exp10(19)),
            t0,
        )
        .await;

        let record = h.orchestrator.start_flow("order-1").await.unwrap();
        assert_eq!(record.order.status, OrderStatus::EscrowsReady);

        let src = record.src_escrow.as_ref().unwrap();
        let dst = record.dst_escrow.as_ref().unwrap();
        assert_eq!(src.status, EscrowStatus::Funded);
        assert_eq!(dst.status, EscrowStatus::Funded);
        assert_eq!(src.beneficiary, "0xresolver");
        assert_eq!(dst.depositor, "0:resolver");
        assert_eq!(dst.beneficiary, record.order.receiver());
        assert_eq!(dst.hashlock, src.hashlock);

        let stored = h.store.get("order-1").await.unwrap().unwrap();
        assert_eq!(stored.order.status, OrderStatus::EscrowsReady);

        // no-op once ready
        let again = h.orchestrator.start_flow("order-1").await.unwrap();
        assert_eq!(again.order.status, OrderStatus::EscrowsReady);
    }

    #[tokio::test]
    async fn test_complete_flow_checks_state_and_secret_first() {
        let t0 = Utc::now();
        let mut src = funded_resolver("0xresolver", t0, U256::exp10(19));
        let mut dst = funded_resolver("0:resolver", t0, U256::exp10(19));
        src.expect_withdraw().never();
        dst.expect_withdraw().never();
        let h = harness(src, dst, t0).await;

        let err = h
            .orchestrator
            .complete_flow("order-1", secret())
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidState { .. }));

        h.orchestrator.start_flow("order-1").await.unwrap();
        let err = h
            .orchestrator
            .complete_flow("order-1", Secret::new([1u8; 32]))
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidSecret { .. }));

        let stored = h.store.get("order-1").await.unwrap().unwrap();
        assert_eq!(stored.order.status, OrderStatus::EscrowsReady);
        assert!(stored.revealed_secret.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_flow_is_rejected() {
        let t0 = Utc::now();
        let h = harness(MockResolver::new(), MockResolver::new(), t0).await;

        let _held = h.orchestrator.locks.try_acquire("order-1").unwrap();
        assert!(matches!(
            h.orchestrator.start_flow("order-1").await,
            Err(SwapError::FlowInProgress { .. })
        ));
        assert!(matches!(
            h.orchestrator.complete_flow("order-1", secret()).await,
            Err(SwapError::FlowInProgress { .. })
        ));
    }

    #[tokio::test]
    async fn test_settlement_withdraws_destination_first() {
        let t0 = Utc::now();
        let order_log = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut src = funded_resolver("0xresolver", t0, U256::exp10(19));
        let log = order_log.clone();
        src.expect_withdraw().times(1).returning(move |_, _, side| {
            log.lock().unwrap().push(side);
            Ok(receipt("0xsrc-withdraw"))
        });
        let mut dst = funded_resolver("0:resolver", t0, U256::exp10(19));
        let log = order_log.clone();
        dst.expect_withdraw().times(1).returning(move |_, _, side| {
            log.lock().unwrap().push(side);
            Ok(receipt("0xdst-withdraw"))
        });

        let h = harness(src, dst, t0).await;
        h.orchestrator.start_flow("order-1").await.unwrap();
        h.clock.advance(Duration::seconds(150));

        let record = h.orchestrator.complete_flow("order-1", secret()).await.unwrap();
        assert_eq!(record.order.status, OrderStatus::Completed);
        assert_eq!(*order_log.lock().unwrap(), vec![Side::Dst, Side::Src]);

        let dst = record.dst_escrow.unwrap();
        assert_eq!(dst.status, EscrowStatus::Withdrawn);
        assert_eq!(dst.funds_recipient.as_deref(), Some(dst.beneficiary.as_str()));
        assert_eq!(dst.safety_deposit_recipient.as_deref(), Some("0:resolver"));
        assert_eq!(record.src_escrow.unwrap().withdraw_tx.unwrap().tx_hash, "0xsrc-withdraw");
    }

    #[tokio::test]
    async fn test_destination_withdraw_failure_schedules_cancellation() {
        let t0 = Utc::now();
        let mut src = funded_resolver("0xresolver", t0, U256::exp10(19));
        src.expect_withdraw().never();
        src.expect_cancel()
            .times(1)
            .returning(|_, _| Ok(receipt("0xsrc-cancel")));
        let mut dst = funded_resolver("0:resolver", t0, U256::exp10(19));
        dst.expect_withdraw().times(1).returning(|_, _, _| {
            Err(SwapError::TransactionFailed {
                chain_id: DST_CHAIN,
                tx_hash: "0xdead".to_string(),
                reason: "aborted".to_string(),
            })
        });
        dst.expect_cancel()
            .times(1)
            .returning(|_, _| Ok(receipt("0xdst-cancel")));

        let mut h = harness(src, dst, t0).await;
        h.orchestrator.start_flow("order-1").await.unwrap();
        h.clock.advance(Duration::seconds(150));

        let err = h
            .orchestrator
            .complete_flow("order-1", secret())
            .await
            .unwrap_err();
        assert!(matches!(err, SwapError::TransactionFailed { .. }));

        let stored = h.store.get("order-1").await.unwrap().unwrap();
        assert_eq!(stored.order.status, OrderStatus::Failed);
        assert!(stored.attention.is_none());
        assert_eq!(stored.cancel_retry_at, Some(h.t0 + Duration::seconds(3_000)));

        // destination window opens first
        h.clock.set(h.t0 + Duration::seconds(3_000));
        let command = tokio::time::timeout(std::time::Duration::from_secs(1), h.commands.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(command.order_id(), "order-1");
        let record = h.orchestrator.retry_cancellation("order-1").await.unwrap();
        assert_eq!(record.dst_escrow.as_ref().unwrap().status, EscrowStatus::Cancelled);
        assert_eq!(record.order.status, OrderStatus::Failed);
        assert_eq!(record.cancel_retry_at, Some(h.t0 + Duration::seconds(7_200)));

        h.clock.set(h.t0 + Duration::seconds(7_200));
        let record = h.orchestrator.retry_cancellation("order-1").await.unwrap();
        assert_eq!(record.order.status, OrderStatus::Cancelled);
        let src = record.src_escrow.unwrap();
        assert_eq!(src.status, EscrowStatus::Cancelled);
        assert_eq!(src.funds_recipient.as_deref(), Some(src.depositor.as_str()));
    }

    #[tokio::test]
    async fn test_source_failure_after_destination_withdrawal_needs_operator() {
        let t0 = Utc::now();
        let mut src = funded_resolver("0xresolver", t0, U256::exp10(19));
        src.expect_withdraw().times(1).returning(|_, _, _| {
            Err(SwapError::TransactionFailed {
                chain_id: SRC_CHAIN,
                tx_hash: "0xbad".to_string(),
                reason: "reverted".to_string(),
            })
        });
        src.expect_cancel().never();
        let mut dst = funded_resolver("0:resolver", t0, U256::exp10(19));
        dst.expect_withdraw()
            .times(1)
            .returning(|_, _, _| Ok(receipt("0xdst-withdraw")));
        dst.expect_cancel().never();

        let h = harness(src, dst, t0).await;
        h.orchestrator.start_flow("order-1").await.unwrap();
        h.clock.advance(Duration::seconds(150));

        assert!(h.orchestrator.complete_flow("order-1", secret()).await.is_err());
        let stored = h.store.get("order-1").await.unwrap().unwrap();
        assert_eq!(stored.order.status, OrderStatus::Failed);
        assert!(stored.attention.is_some());
        assert_eq!(stored.dst_escrow.unwrap().status, EscrowStatus::Withdrawn);
        assert_eq!(stored.src_escrow.unwrap().status, EscrowStatus::Funded);

        // never retried automatically
        let record = h.orchestrator.retry_cancellation("order-1").await.unwrap();
        assert_eq!(record.order.status, OrderStatus::Failed);
    }

    #[tokio::test]
    async fn test_unfunded_destination_fails_setup() {
        let t0 = Utc::now();
        let src = funded_resolver("0xresolver", t0, U256::exp10(19));
        let dst = funded_resolver("0:resolver", t0, U256::zero());
        let h = harness(src, dst, t0).await;

        let err = h.orchestrator.start_flow("order-1").await.unwrap_err();
        assert!(matches!(
            err,
            SwapError::FundingVerification { side: Side::Dst, .. }
        ));

        let stored = h.store.get("order-1").await.unwrap().unwrap();
        assert_eq!(stored.order.status, OrderStatus::Failed);
        assert_eq!(stored.dst_escrow.unwrap().status, EscrowStatus::Cancelled);
        assert_eq!(stored.src_escrow.unwrap().status, EscrowStatus::Funded);
        assert_eq!(stored.cancel_retry_at, Some(t0 + Duration::seconds(7_200)));
    }

    #[tokio::test]
    async fn test_unsupported_chain_fails_without_escrows() {
        let t0 = Utc::now();
        let registry = ChainRegistry::new();
        let store = Arc::new(MemoryStore::new());
        store
            .insert(&SwapRecord::new(Order::from_input(input(), t0, 600).unwrap()))
            .await
            .unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(ManualClock::new(t0)),
            test_config(),
            tx,
        );

        let err = orchestrator.start_flow("order-1").await.unwrap_err();
        assert!(matches!(err, SwapError::UnsupportedChain { chain_id: SRC_CHAIN }));
        let stored = store.get("order-1").await.unwrap().unwrap();
        assert_eq!(stored.order.status, OrderStatus::Failed);
        assert!(stored.src_escrow.is_none());
        assert!(stored.cancel_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_resume_all_enqueues_interrupted_flows() {
        let t0 = Utc::now();
        let mut h = harness(MockResolver::new(), MockResolver::new(), t0).await;

        let mut revealed = h.store.get("order-1").await.unwrap().unwrap();
        revealed.order.id = "order-2".to_string();
        revealed.order.status = OrderStatus::DstWithdrawn;
        revealed.revealed_secret = Some(secret());
        h.store.save(&revealed).await.unwrap();

        let summary = h.orchestrator.resume_all().await.unwrap();
        assert_eq!(summary.restarted, 1);
        assert_eq!(summary.resumed, 1);

        let mut seen = vec![h.commands.recv().await.unwrap(), h.commands.recv().await.unwrap()];
        seen.sort_by(|a, b| a.order_id().cmp(b.order_id()));
        assert_eq!(
            seen[0],
            FlowCommand::Start {
                order_id: "order-1".to_string()
            }
        );
        assert_eq!(
            seen[1],
            FlowCommand::Resume {
                order_id: "order-2".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_lost_destination_receipt_still_settles_source() {
        let t0 = Utc::now();
        let mut src = funded_resolver("0xresolver", t0, U256::exp10(19));
        src.expect_withdraw()
            .times(1)
            .returning(|_, _, _| Ok(receipt("0xsrc-withdraw")));
        src.expect_cancel().never();
        // The withdrawal lands but its confirmation times out
        let mut dst = drained_resolver("0:resolver", t0);
        dst.expect_withdraw().times(1).returning(|_, _, _| {
            Err(SwapError::ChainQuery {
                chain_id: DST_CHAIN,
                message: "withdraw timed out".to_string(),
            })
        });
        dst.expect_cancel().never();

        let h = harness(src, dst, t0).await;
        h.orchestrator.start_flow("order-1").await.unwrap();
        h.clock.advance(Duration::seconds(150));

        let record = h.orchestrator.complete_flow("order-1", secret()).await.unwrap();
        assert_eq!(record.order.status, OrderStatus::Completed);
        assert!(record.attention.is_none());

        let dst = record.dst_escrow.unwrap();
        assert_eq!(dst.status, EscrowStatus::Withdrawn);
        assert!(dst.withdraw_tx.is_none());
        assert_eq!(dst.funds_recipient.as_deref(), Some(dst.beneficiary.as_str()));
        assert_eq!(record.src_escrow.unwrap().status, EscrowStatus::Withdrawn);
    }

    #[tokio::test]
    async fn test_emptied_destination_blocks_source_refund() {
        let t0 = Utc::now();
        let mut src = funded_resolver("0xresolver", t0, U256::exp10(19));
        src.expect_cancel().never();
        let mut dst = drained_resolver("0:resolver", t0);
        dst.expect_cancel().never();

        let h = harness(src, dst, t0).await;
        h.orchestrator.start_flow("order-1").await.unwrap();

        // Failed after the secret went out, with the destination already paid
        let mut failed = h.store.get("order-1").await.unwrap().unwrap();
        failed.order.status = OrderStatus::Failed;
        failed.revealed_secret = Some(secret());
        h.store.save(&failed).await.unwrap();

        h.clock.set(t0 + Duration::seconds(7_200));
        let record = h.orchestrator.retry_cancellation("order-1").await.unwrap();
        assert_eq!(record.order.status, OrderStatus::Failed);
        assert!(record.attention.is_some());
        assert!(record.cancel_retry_at.is_none());
        assert_eq!(record.dst_escrow.unwrap().status, EscrowStatus::Withdrawn);
        assert_eq!(record.src_escrow.unwrap().status, EscrowStatus::Funded);

        // stays with the operator
        let record = h.orchestrator.retry_cancellation("order-1").await.unwrap();
        assert_eq!(record.order.status, OrderStatus::Failed);
        assert_eq!(record.src_escrow.unwrap().status, EscrowStatus::Funded);
    }

    #[tokio::test]
    async fn test_partially_funded_destination_fails_setup() {
        let t0 = Utc::now();
        let taker_amount = Order::from_input(input(), t0, 600).unwrap().taker_amount;
        let short = taker_amount - U256::one();

        let src = funded_resolver("0xresolver", t0, U256::exp10(19));
        let dst = funded_resolver("0:resolver", t0, short);
        let h = harness(src, dst, t0).await;

        let err = h.orchestrator.start_flow("order-1").await.unwrap_err();
        match err {
            SwapError::FundingVerification {
                side,
                expected,
                actual,
                ..
            } => {
                assert_eq!(side, Side::Dst);
                assert_eq!(expected, taker_amount.to_string());
                assert_eq!(actual, short.to_string());
            }
            other => panic!("unexpected error: {}", other),
        }

        let stored = h.store.get("order-1").await.unwrap().unwrap();
        assert_eq!(stored.order.status, OrderStatus::Failed);
        // holds value, so it waits for its own cancellation window
        assert_eq!(stored.dst_escrow.unwrap().status, EscrowStatus::Funded);
        assert_eq!(stored.cancel_retry_at, Some(t0 + Duration::seconds(3_000)));
    }
}
