//! End-to-end swap flows against a simulated EVM/TON chain pair
//!
//! The simulated chains enforce the same timelock rules as the escrow
//! contracts, read time from a manual clock shared with the orchestrator and
//! record every fund movement in one log so cross-chain ordering is visible.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ethers::types::U256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crosslock_resolver::config::OrchestratorConfig;
use crosslock_resolver::intake::OrderService;
use crosslock_resolver::model::{
    Asset, ChainFamily, EscrowDeployment, EscrowHandle, EscrowParams, EscrowStatus,
    InclusionProof, OrderInput, OrderStatus, Secret, Side, SwapRecord, TimeLockConfig,
};
use crosslock_resolver::orchestrator::{
    Clock, FlowCommand, FlowWorker, ManualClock, Orchestrator,
};
use crosslock_resolver::policy;
use crosslock_resolver::resolver::{
    ChainRegistry, ResolvedChain, Resolver, ResolverFactory, TxReceipt, TxState, TxStatus,
};
use crosslock_resolver::store::{MemoryStore, OrderStore};
use crosslock_resolver::{SwapError, SwapResult};

const EVM_CHAIN: i64 = 11155111;
const TON_CHAIN: i64 = -3;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Deploy(i64, Side),
    Withdraw(i64, Side),
    Cancel(i64, Side),
}

struct SimEscrow {
    deployment: EscrowDeployment,
    balance: U256,
}

#[derive(Default)]
struct ChainState {
    escrows: HashMap<(String, Side), SimEscrow>,
    txs: HashMap<String, TxStatus>,
    nonce: u64,
}

struct SimulatedChain {
    chain_id: i64,
    family: ChainFamily,
    address: String,
    clock: Arc<ManualClock>,
    log: Arc<Mutex<Vec<Event>>>,
    /// Escrows created here receive their full amount
    funds_escrows: bool,
    /// Real-time delay inside `withdraw`, to widen race windows
    withdraw_delay: Option<std::time::Duration>,
    state: Mutex<ChainState>,
}

impl SimulatedChain {
    fn new(chain_id: i64, family: ChainFamily, clock: Arc<ManualClock>, log: Arc<Mutex<Vec<Event>>>) -> Self {
        Self {
            chain_id,
            family,
            address: format!("resolver@{}", chain_id),
            clock,
            log,
            funds_escrows: true,
            withdraw_delay: None,
            state: Mutex::new(ChainState::default()),
        }
    }

    fn submit(&self, state: &mut ChainState) -> TxReceipt {
        state.nonce += 1;
        let tx_hash = format!("0x{}-{}", self.chain_id, state.nonce);
        state.txs.insert(
            tx_hash.clone(),
            TxStatus {
                state: TxState::Included,
                block_number: Some(state.nonce),
                confirmations: 100,
                finalized: true,
            },
        );
        TxReceipt {
            tx_hash,
            block_number: Some(state.nonce),
        }
    }

    fn close(&self, escrow: &EscrowHandle, side: Side, event: Event) -> SwapResult<TxReceipt> {
        let mut state = self.state.lock().unwrap();
        let key = (escrow.order_id.clone(), side);
        let current = state.escrows.get(&key).map(|e| e.balance).unwrap_or_default();
        if current.is_zero() {
            return Err(SwapError::TransactionFailed {
                chain_id: self.chain_id,
                tx_hash: String::new(),
                reason: "escrow is empty".to_string(),
            });
        }
        if let Some(e) = state.escrows.get_mut(&key) {
            e.balance = U256::zero();
        }
        self.log.lock().unwrap().push(event);
        Ok(self.submit(&mut state))
    }
}

#[async_trait]
impl Resolver for SimulatedChain {
    fn family(&self) -> ChainFamily {
        self.family
    }

    fn chain_id(&self) -> i64 {
        self.chain_id
    }

    async fn initialize(&self) -> SwapResult<()> {
        Ok(())
    }

    async fn get_address(&self) -> SwapResult<String> {
        Ok(self.address.clone())
    }

    async fn get_balance(&self) -> SwapResult<U256> {
        Ok(U256::exp10(24))
    }

    async fn get_token_balance(&self, _asset: &Asset) -> SwapResult<U256> {
        Ok(U256::exp10(24))
    }

    async fn deploy_escrow(&self, params: &EscrowParams) -> SwapResult<EscrowDeployment> {
        let mut state = self.state.lock().unwrap();
        let key = (params.order_id.clone(), params.side);
        if let Some(existing) = state.escrows.get(&key) {
            return Ok(existing.deployment.clone());
        }

        let receipt = self.submit(&mut state);
        let deployment = EscrowDeployment {
            address: format!("escrow:{}:{}:{}", self.chain_id, params.order_id, params.side),
            tx_hash: receipt.tx_hash.clone(),
            block_number: receipt.block_number,
            deployed_at: self.clock.now(),
            proof: InclusionProof {
                chain_id: self.chain_id,
                tx_hash: receipt.tx_hash,
                block_number: receipt.block_number,
                block_hash: None,
            },
        };
        let balance = if self.funds_escrows {
            params.amount
        } else {
            U256::zero()
        };
        state.escrows.insert(
            key,
            SimEscrow {
                deployment: deployment.clone(),
                balance,
            },
        );
        self.log
            .lock()
            .unwrap()
            .push(Event::Deploy(self.chain_id, params.side));
        Ok(deployment)
    }

    async fn find_escrow(
        &self,
        _factory: &str,
        order_id: &str,
        side: Side,
    ) -> SwapResult<Option<EscrowDeployment>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .escrows
            .get(&(order_id.to_string(), side))
            .map(|e| e.deployment.clone()))
    }

    async fn get_contract_balance(&self, address: &str, _asset: &Asset) -> SwapResult<U256> {
        let state = self.state.lock().unwrap();
        Ok(state
            .escrows
            .values()
            .find(|e| e.deployment.address == address)
            .map(|e| e.balance)
            .unwrap_or_default())
    }

    async fn withdraw(
        &self,
        escrow: &EscrowHandle,
        secret: &Secret,
        side: Side,
    ) -> SwapResult<TxReceipt> {
        policy::ensure_withdrawable(escrow.deployed_at, &escrow.timelocks, self.clock.now(), side)?;
        if !secret.matches(&escrow.hashlock) {
            return Err(SwapError::InvalidSecret {
                order_id: escrow.order_id.clone(),
            });
        }
        if let Some(delay) = self.withdraw_delay {
            tokio::time::sleep(delay).await;
        }
        self.close(escrow, side, Event::Withdraw(self.chain_id, side))
    }

    async fn cancel(&self, escrow: &EscrowHandle, side: Side) -> SwapResult<TxReceipt> {
        policy::ensure_cancellable(escrow.deployed_at, &escrow.timelocks, self.clock.now(), side)?;
        self.close(escrow, side, Event::Cancel(self.chain_id, side))
    }

    async fn get_transaction_status(&self, tx_hash: &str) -> SwapResult<TxStatus> {
        let state = self.state.lock().unwrap();
        Ok(state
            .txs
            .get(tx_hash)
            .copied()
            .unwrap_or_else(TxStatus::not_found))
    }

    async fn chain_time(&self) -> SwapResult<DateTime<Utc>> {
        Ok(self.clock.now())
    }
}

fn timelocks() -> TimeLockConfig {
    TimeLockConfig {
        src_withdrawal: 10,
        src_public_withdrawal: 120,
        src_cancellation: 7_200,
        src_public_cancellation: 7_800,
        dst_withdrawal: 10,
        dst_public_withdrawal: 100,
        dst_cancellation: 3_000,
    }
}

fn secret() -> Secret {
    Secret::new([7u8; 32])
}

fn order_input(id: &str, dst_chain_id: i64) -> OrderInput {
    OrderInput {
        id: Some(id.to_string()),
        maker: "0x1111111111111111111111111111111111111111".to_string(),
        receiver: Some(
            "0:2222222222222222222222222222222222222222222222222222222222222222".to_string(),
        ),
        maker_asset: "native".to_string(),
        maker_amount: U256::exp10(18),
        taker_asset: "native".to_string(),
        taker_amount: U256::exp10(18) * 2,
        src_chain_id: EVM_CHAIN,
        dst_chain_id,
        secret_hash: secret().hashlock().to_hex(),
        time_locks: timelocks(),
        src_safety_deposit: U256::from(1_000u64),
        dst_safety_deposit: U256::from(2_000u64),
    }
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        call_timeout_ms: 1_000,
        submit_timeout_ms: 1_000,
        max_retries: 2,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 10,
        finality_poll_initial_ms: 1,
        finality_poll_max_ms: 10,
        finality_timeout_secs: 600,
        safety_margin_secs: 600,
    }
}

struct World {
    t0: DateTime<Utc>,
    clock: Arc<ManualClock>,
    log: Arc<Mutex<Vec<Event>>>,
    store: Arc<MemoryStore>,
    chains: Arc<ChainRegistry>,
    orchestrator: Arc<Orchestrator>,
    commands: Option<mpsc::Receiver<FlowCommand>>,
}

impl World {
    fn new(configure: impl FnOnce(&mut SimulatedChain, &mut SimulatedChain)) -> Self {
        let t0 = Utc::now();
        let clock = Arc::new(ManualClock::new(t0));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut evm = SimulatedChain::new(EVM_CHAIN, ChainFamily::Evm, clock.clone(), log.clone());
        let mut ton = SimulatedChain::new(TON_CHAIN, ChainFamily::Ton, clock.clone(), log.clone());
        configure(&mut evm, &mut ton);

        let chains = Arc::new(ChainRegistry::new());
        for (family, resolver) in [(ChainFamily::Evm, evm), (ChainFamily::Ton, ton)] {
            chains.insert(ResolvedChain {
                chain_id: resolver.chain_id,
                family,
                escrow_factory: format!("factory@{}", resolver.chain_id),
                confirmations: 1,
                resolver: Arc::new(resolver),
            });
        }

        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::channel(64);
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            chains.clone(),
            clock.clone(),
            test_config(),
            tx,
        ));

        Self {
            t0,
            clock,
            log,
            store,
            chains,
            orchestrator,
            commands: Some(rx),
        }
    }

    fn service(&self) -> OrderService {
        OrderService::new(self.store.clone(), self.orchestrator.clone())
    }

    fn spawn_worker(&mut self) {
        if let Some(rx) = self.commands.take() {
            tokio::spawn(FlowWorker::new(self.orchestrator.clone(), rx).run());
        }
    }

    async fn record(&self, order_id: &str) -> SwapRecord {
        self.store.get(order_id).await.unwrap().unwrap()
    }

    async fn wait_until(
        &self,
        order_id: &str,
        what: &str,
        done: impl Fn(&SwapRecord) -> bool,
    ) -> SwapRecord {
        let waited = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                let record = self.record(order_id).await;
                if done(&record) {
                    return record;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;
        match waited {
            Ok(record) => record,
            Err(_) => panic!(
                "order {} never reached {}, stuck at {}",
                order_id,
                what,
                self.record(order_id).await.order.status
            ),
        }
    }

    async fn wait_for(&self, order_id: &str, status: OrderStatus) -> SwapRecord {
        self.wait_until(order_id, status.as_str(), |r| r.order.status == status)
            .await
    }

    async fn wait_idle(&self, order_id: &str) {
        let idle = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while self.orchestrator.is_running(order_id) {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(idle.is_ok(), "flow for order {} never finished", order_id);
    }

    fn events(&self) -> Vec<Event> {
        self.log.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn funded_escrows_reach_ready() {
    let world = World::new(|_, _| {});
    world.service().create_order(order_input("swap-a", TON_CHAIN)).await.unwrap();

    let record = world.orchestrator.start_flow("swap-a").await.unwrap();
    assert_eq!(record.order.status, OrderStatus::EscrowsReady);

    let src = record.src_escrow.unwrap();
    let dst = record.dst_escrow.unwrap();
    assert_eq!(src.status, EscrowStatus::Funded);
    assert_eq!(dst.status, EscrowStatus::Funded);
    assert_eq!(src.amount, U256::exp10(18));
    assert_eq!(dst.amount, U256::exp10(18) * 2);
    assert_eq!(src.hashlock, dst.hashlock);
    assert_eq!(
        world.events(),
        vec![
            Event::Deploy(EVM_CHAIN, Side::Src),
            Event::Deploy(TON_CHAIN, Side::Dst)
        ]
    );
}

#[tokio::test]
async fn wrong_secret_is_rejected_without_chain_calls() {
    let world = World::new(|_, _| {});
    world.service().create_order(order_input("swap-b", TON_CHAIN)).await.unwrap();
    world.orchestrator.start_flow("swap-b").await.unwrap();
    world.clock.advance(Duration::seconds(150));

    let err = world
        .orchestrator
        .complete_flow("swap-b", Secret::new([8u8; 32]))
        .await
        .unwrap_err();
    assert!(matches!(err, SwapError::InvalidSecret { .. }));

    let record = world.record("swap-b").await;
    assert_eq!(record.order.status, OrderStatus::EscrowsReady);
    assert_eq!(world.events().len(), 2);
}

#[tokio::test]
async fn settlement_withdraws_destination_before_source() {
    let world = World::new(|_, _| {});
    world.service().create_order(order_input("swap-ok", TON_CHAIN)).await.unwrap();
    world.orchestrator.start_flow("swap-ok").await.unwrap();
    world.clock.advance(Duration::seconds(30));

    let record = world.orchestrator.complete_flow("swap-ok", secret()).await.unwrap();
    assert_eq!(record.order.status, OrderStatus::Completed);
    assert_eq!(
        world.events()[2..],
        [
            Event::Withdraw(TON_CHAIN, Side::Dst),
            Event::Withdraw(EVM_CHAIN, Side::Src)
        ]
    );

    let src = record.src_escrow.unwrap();
    assert_eq!(src.status, EscrowStatus::Withdrawn);
    assert_eq!(src.funds_recipient.as_deref(), Some("resolver@11155111"));
    let dst = record.dst_escrow.unwrap();
    assert_eq!(
        dst.funds_recipient.as_deref(),
        Some("0:2222222222222222222222222222222222222222222222222222222222222222")
    );
}

#[tokio::test]
async fn unfunded_destination_fails_and_source_is_refunded() {
    let mut world = World::new(|_, ton| ton.funds_escrows = false);
    world.spawn_worker();
    world.service().create_order(order_input("swap-c", TON_CHAIN)).await.unwrap();

    let record = world
        .wait_until("swap-c", "a scheduled refund", |r| {
            r.order.status == OrderStatus::Failed && r.cancel_retry_at.is_some()
        })
        .await;
    assert_eq!(record.dst_escrow.unwrap().status, EscrowStatus::Cancelled);
    assert_eq!(record.src_escrow.unwrap().status, EscrowStatus::Funded);
    let src_cancellation = world.t0 + Duration::seconds(7_200);
    assert_eq!(record.cancel_retry_at, Some(src_cancellation));

    // Nothing moves before the source window opens
    world.clock.set(src_cancellation - Duration::seconds(1));
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(world.record("swap-c").await.order.status, OrderStatus::Failed);

    world.clock.set(src_cancellation);
    let record = world.wait_for("swap-c", OrderStatus::Cancelled).await;
    let src = record.src_escrow.unwrap();
    assert_eq!(src.status, EscrowStatus::Cancelled);
    assert_eq!(
        src.funds_recipient.as_deref(),
        Some("0x1111111111111111111111111111111111111111")
    );
    assert!(world.events().contains(&Event::Cancel(EVM_CHAIN, Side::Src)));
}

#[tokio::test]
async fn parallel_completion_withdraws_once() {
    let world = World::new(|_, ton| {
        ton.withdraw_delay = Some(std::time::Duration::from_millis(50))
    });
    world.service().create_order(order_input("swap-d", TON_CHAIN)).await.unwrap();
    world.orchestrator.start_flow("swap-d").await.unwrap();
    world.clock.advance(Duration::seconds(30));

    let (first, second) = tokio::join!(
        world.orchestrator.complete_flow("swap-d", secret()),
        world.orchestrator.complete_flow("swap-d", secret()),
    );
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes.iter().any(|r| matches!(
        r,
        Err(SwapError::FlowInProgress { .. }) | Err(SwapError::InvalidState { .. })
    )));

    let dst_withdrawals = world
        .events()
        .iter()
        .filter(|e| **e == Event::Withdraw(TON_CHAIN, Side::Dst))
        .count();
    assert_eq!(dst_withdrawals, 1);
    assert_eq!(world.record("swap-d").await.order.status, OrderStatus::Completed);
}

#[tokio::test]
async fn intake_drives_full_swap_through_worker() {
    let mut world = World::new(|_, _| {});
    world.spawn_worker();
    let service = world.service();

    let created = service.create_order(order_input("swap-e", TON_CHAIN)).await.unwrap();
    assert!(created.created);
    world.wait_for("swap-e", OrderStatus::EscrowsReady).await;
    world.wait_idle("swap-e").await;

    world.clock.advance(Duration::seconds(30));
    service.reveal_secret("swap-e", &secret().to_hex()).await.unwrap();
    let record = world.wait_for("swap-e", OrderStatus::Completed).await;
    assert!(record.revealed_secret.is_some());

    let view = service.get_status("swap-e").await.unwrap();
    assert!(view.secret_revealed);
    assert!(view.dst_escrow.unwrap().withdraw_tx_hash.is_some());
}

#[tokio::test]
async fn restart_resumes_interrupted_settlement() {
    let world = World::new(|_, _| {});
    world.service().create_order(order_input("swap-r", TON_CHAIN)).await.unwrap();
    world.orchestrator.start_flow("swap-r").await.unwrap();
    world.clock.advance(Duration::seconds(30));

    // Crash right after the secret was persisted
    let mut record = world.record("swap-r").await;
    record.revealed_secret = Some(secret());
    record
        .order
        .transition(OrderStatus::SecretRevealed, world.clock.now())
        .unwrap();
    world.store.save(&record).await.unwrap();

    let (tx, rx) = mpsc::channel(16);
    let restarted = Arc::new(Orchestrator::new(
        world.store.clone(),
        world.chains.clone(),
        world.clock.clone(),
        test_config(),
        tx,
    ));
    tokio::spawn(FlowWorker::new(restarted.clone(), rx).run());

    let summary = restarted.resume_all().await.unwrap();
    assert_eq!(summary.resumed, 1);
    world.wait_for("swap-r", OrderStatus::Completed).await;
    assert_eq!(
        world.events()[2..],
        [
            Event::Withdraw(TON_CHAIN, Side::Dst),
            Event::Withdraw(EVM_CHAIN, Side::Src)
        ]
    );
}

#[tokio::test]
async fn restart_after_landed_destination_withdrawal_settles_source() {
    let world = World::new(|_, _| {});
    world.service().create_order(order_input("swap-l", TON_CHAIN)).await.unwrap();
    world.orchestrator.start_flow("swap-l").await.unwrap();
    world.clock.advance(Duration::seconds(30));

    // The destination withdrawal landed, then the process died before saving it
    let mut record = world.record("swap-l").await;
    let handle = record
        .dst_escrow
        .as_ref()
        .unwrap()
        .handle(&record.order.time_locks)
        .unwrap();
    let ton = world.chains.resolve(TON_CHAIN).unwrap();
    ton.resolver.withdraw(&handle, &secret(), Side::Dst).await.unwrap();
    record.revealed_secret = Some(secret());
    record
        .order
        .transition(OrderStatus::SecretRevealed, world.clock.now())
        .unwrap();
    world.store.save(&record).await.unwrap();

    let (tx, rx) = mpsc::channel(16);
    let restarted = Arc::new(Orchestrator::new(
        world.store.clone(),
        world.chains.clone(),
        world.clock.clone(),
        test_config(),
        tx,
    ));
    tokio::spawn(FlowWorker::new(restarted.clone(), rx).run());

    restarted.resume_all().await.unwrap();
    let record = world.wait_for("swap-l", OrderStatus::Completed).await;
    assert!(record.attention.is_none());
    assert_eq!(record.dst_escrow.unwrap().status, EscrowStatus::Withdrawn);
    assert_eq!(
        world.events()[2..],
        [
            Event::Withdraw(TON_CHAIN, Side::Dst),
            Event::Withdraw(EVM_CHAIN, Side::Src)
        ]
    );
}

#[tokio::test]
async fn unsupported_chain_fails_before_any_deployment() {
    let world = World::new(|_, _| {});
    world.service().create_order(order_input("swap-x", 424242)).await.unwrap();

    let err = world.orchestrator.start_flow("swap-x").await.unwrap_err();
    assert!(matches!(err, SwapError::UnsupportedChain { chain_id: 424242 }));

    let record = world.record("swap-x").await;
    assert_eq!(record.order.status, OrderStatus::Failed);
    assert!(record.src_escrow.is_none());
    assert!(world.events().is_empty());
}

#[tokio::test]
async fn late_destination_deployment_is_refused() {
    let world = World::new(|_, _| {});
    world.service().create_order(order_input("swap-late", TON_CHAIN)).await.unwrap();

    // Source escrow deployed, then the service stalls past the safe point
    let mut record = world.record("swap-late").await;
    let params = EscrowParams {
        order_id: "swap-late".to_string(),
        side: Side::Src,
        chain_id: EVM_CHAIN,
        escrow_factory: format!("factory@{}", EVM_CHAIN),
        hashlock: secret().hashlock(),
        depositor: record.order.maker.clone(),
        beneficiary: format!("resolver@{}", EVM_CHAIN),
        asset: Asset::Native,
        amount: record.order.maker_amount,
        safety_deposit: record.order.src_safety_deposit,
        timelocks: timelocks(),
        src_cancellation_at: None,
    };
    assert_eq!(world.chains.chain_ids(), vec![TON_CHAIN, EVM_CHAIN]);
    let deployment = {
        use crosslock_resolver::resolver::ResolverFactory;
        world
            .chains
            .resolve(EVM_CHAIN)
            .unwrap()
            .resolver
            .deploy_escrow(&params)
            .await
            .unwrap()
    };
    let mut escrow = crosslock_resolver::model::EscrowRecord::deploying(&params, world.t0);
    escrow.record_deployment(&deployment, world.t0);
    record.set_escrow(escrow);
    record
        .order
        .transition(OrderStatus::SrcEscrowDeployed, world.t0)
        .unwrap();
    world.store.save(&record).await.unwrap();

    world.clock.advance(Duration::seconds(3_601));
    let err = world.orchestrator.start_flow("swap-late").await.unwrap_err();
    assert!(matches!(err, SwapError::WindowClosed { side: Side::Dst, .. }));

    let record = world.record("swap-late").await;
    assert_eq!(record.order.status, OrderStatus::Failed);
    assert!(record.dst_escrow.is_none());
    assert!(!world
        .events()
        .iter()
        .any(|e| matches!(e, Event::Deploy(TON_CHAIN, _))));
}
