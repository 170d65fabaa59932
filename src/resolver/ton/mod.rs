//! TON resolver
//!
//! The resolver signs wallet v4 external messages with its ed25519 key and
//! talks to toncenter. Escrow addresses are derived by the factory's
//! `get_escrow_address` get-method from the order key and side.

mod address;
mod cell;
mod client;
mod messages;
mod wallet;

pub use address::TonAddress;
pub use cell::{Cell, CellBuilder, CellSlice};
pub use client::{TonClient, TonClientConfig};
pub use wallet::{key_from_hex, key_from_mnemonic, OutgoingMessage, TonWallet};

use crate::config::{ChainConfig, CredentialSource, SigningMaterial};
use crate::error::{SwapError, SwapResult};
use crate::model::{
    keccak256, Asset, ChainFamily, EscrowDeployment, EscrowHandle, EscrowParams, InclusionProof,
    Secret, Side,
};
use crate::policy::{ensure_cancellable, ensure_withdrawable};
use crate::resolver::{Resolver, TxReceipt, TxState, TxStatus};

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use ethers::types::U256;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

/// TON attached to every message for fees, in nanotons
const GAS_RESERVE: u64 = 50_000_000;
const MESSAGE_TTL_SECS: i64 = 60;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_ATTEMPTS: u32 = 3;

pub struct TonResolver {
    config: ChainConfig,
    credentials: CredentialSource,
    client: TonClient,
    wallet_address: TonAddress,
    wallet: OnceCell<Arc<TonWallet>>,
    /// Serializes sends so two messages never share a seqno
    send_lock: Mutex<()>,
    /// Deployment messages handed to the network and not yet seen as escrows
    pending_deploys: DashMap<DeployKey, SentMessage>,
}

type DeployKey = (String, Side);

/// An external message as signed: its hash, seqno and expiry
#[derive(Debug, Clone)]
struct SentMessage {
    hash: String,
    seqno: u32,
    valid_until: u32,
}

fn order_key(order_id: &str) -> [u8; 32] {
    keccak256(order_id.as_bytes())
}

fn query_id() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// toncenter v3 returns base64 hashes; everything stored here is hex
fn hash_to_hex(value: &str) -> String {
    STANDARD
        .decode(value)
        .or_else(|_| URL_SAFE.decode(value))
        .ok()
        .filter(|bytes| bytes.len() == 32)
        .map(hex::encode)
        .unwrap_or_else(|| value.trim_start_matches("0x").to_lowercase())
}

impl TonResolver {
    pub fn new(config: ChainConfig, credentials: CredentialSource) -> SwapResult<Self> {
        let wallet_address = config
            .wallet_address
            .as_deref()
            .ok_or_else(|| {
                SwapError::Config(format!("TON chain {} needs wallet_address", config.chain_id))
            })
            .and_then(TonAddress::parse)?;
        let rpc_url = config.rpc_urls.first().cloned().ok_or_else(|| {
            SwapError::Config(format!("TON chain {} has no RPC URL", config.chain_id))
        })?;
        let index_url = config.index_url.clone().ok_or_else(|| {
            SwapError::Config(format!("TON chain {} needs index_url", config.chain_id))
        })?;

        let client = TonClient::new(TonClientConfig {
            chain_id: config.chain_id,
            rpc_url,
            index_url,
            api_key: config.api_key(),
            timeout: REQUEST_TIMEOUT,
            max_attempts: REQUEST_ATTEMPTS,
        })?;

        Ok(Self {
            config,
            credentials,
            client,
            wallet_address,
            wallet: OnceCell::new(),
            send_lock: Mutex::new(()),
            pending_deploys: DashMap::new(),
        })
    }

    fn load_key(&self) -> SwapResult<ed25519_dalek::SigningKey> {
        match self.credentials.signing_material() {
            Some(SigningMaterial::Mnemonic(phrase)) => key_from_mnemonic(&phrase),
            Some(SigningMaterial::PrivateKey(key)) => key_from_hex(&key),
            None => Err(SwapError::Credential(format!(
                "No TON signing key configured for chain {}",
                self.config.chain_id
            ))),
        }
    }

    /// Signing wallet; the key must match the deployed wallet's public key
    async fn wallet(&self) -> SwapResult<Arc<TonWallet>> {
        self.wallet
            .get_or_try_init(|| async {
                let wallet = TonWallet::new(self.load_key()?, self.wallet_address);

                let result = self
                    .client
                    .run_get_method(&self.wallet_address.to_raw(), "get_public_key", vec![])
                    .await?;
                let on_chain = result
                    .stack
                    .first()
                    .and_then(client::parse_stack_num)
                    .ok_or_else(|| self.query_error("get_public_key returned no key"))?;
                if on_chain != U256::from_big_endian(&wallet.public_key()) {
                    return Err(SwapError::Credential(format!(
                        "Configured TON key does not control wallet {}",
                        self.wallet_address
                    )));
                }

                info!(
                    "TON resolver for chain {} signing as {}",
                    self.config.chain_id, self.wallet_address
                );
                Ok(Arc::new(wallet))
            })
            .await
            .cloned()
    }

    fn query_error(&self, message: impl std::fmt::Display) -> SwapError {
        SwapError::chain(self.config.chain_id, message)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.deploy_poll_interval_ms)
    }

    async fn seqno(&self) -> SwapResult<u32> {
        let result = self
            .client
            .run_get_method(&self.wallet_address.to_raw(), "seqno", vec![])
            .await?;
        let seqno = result
            .stack
            .first()
            .and_then(client::parse_stack_num)
            .ok_or_else(|| self.query_error("seqno returned no value"))?;
        u32::try_from(seqno.low_u64()).map_err(|_| self.query_error("seqno out of range"))
    }

    /// Sign and submit one wallet transfer; returns the external message hash.
    /// A deployment is recorded as pending as soon as the network accepts it.
    async fn send(
        &self,
        messages: &[OutgoingMessage],
        deploy: Option<DeployKey>,
    ) -> SwapResult<String> {
        let wallet = self.wallet().await?;
        let _guard = self.send_lock.lock().await;

        let seqno = self.seqno().await?;
        let valid_until = (self.chain_time().await?.timestamp() + MESSAGE_TTL_SECS)
            .clamp(0, i64::from(u32::MAX)) as u32;
        let external = wallet.transfer(seqno, valid_until, messages)?;
        let msg_hash = hex::encode(external.hash());

        self.client
            .send_boc_return_hash(&STANDARD.encode(external.to_boc()))
            .await?;
        debug!(
            "Sent external message {} (seqno {}) on chain {}",
            msg_hash, seqno, self.config.chain_id
        );
        if let Some(key) = deploy {
            self.pending_deploys.insert(
                key,
                SentMessage {
                    hash: msg_hash.clone(),
                    seqno,
                    valid_until,
                },
            );
        }

        // The next send must see the incremented seqno
        for _ in 0..self.config.deploy_poll_attempts {
            if self.seqno().await? > seqno {
                return Ok(msg_hash);
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
        Err(self.query_error(format!(
            "external message {} not processed before seqno {} expired",
            msg_hash, seqno
        )))
    }

    /// Check the wallet transaction for a sent message; `None` while unindexed
    async fn confirm(&self, msg_hash: &str) -> SwapResult<Option<u64>> {
        let txs = self.client.transactions_by_message(msg_hash).await?;
        match txs.first() {
            Some(tx) if !tx.succeeded() => Err(SwapError::TransactionFailed {
                chain_id: self.config.chain_id,
                tx_hash: msg_hash.to_string(),
                reason: "wallet transaction aborted".to_string(),
            }),
            Some(tx) => Ok(tx.mc_block_seqno),
            None => Ok(None),
        }
    }

    async fn balance_of(&self, owner: &TonAddress, asset: &Asset) -> SwapResult<U256> {
        let raw = match asset {
            Asset::Native => self.client.get_address_balance(&owner.to_raw()).await?,
            Asset::Token(master) => {
                let master = TonAddress::parse(master)?;
                match self
                    .client
                    .jetton_wallet(&owner.to_raw(), &master.to_raw())
                    .await?
                {
                    Some(wallet) => wallet.balance,
                    None => return Ok(U256::zero()),
                }
            }
        };
        U256::from_dec_str(raw.trim())
            .map_err(|e| self.query_error(format!("invalid balance {}: {:?}", raw, e)))
    }

    /// False only once a message expired without its seqno being consumed
    async fn may_have_landed(&self, sent: &SentMessage) -> SwapResult<bool> {
        if self.confirm(&sent.hash).await?.is_some() {
            return Ok(true);
        }
        if self.chain_time().await?.timestamp() <= i64::from(sent.valid_until) {
            return Ok(true);
        }
        Ok(self.seqno().await? > sent.seqno)
    }

    /// Wait for the escrow created by a deployment message
    async fn await_escrow(
        &self,
        params: &EscrowParams,
        msg_hash: &str,
    ) -> SwapResult<EscrowDeployment> {
        let key = (params.order_id.clone(), params.side);
        if let Err(e) = self.confirm(msg_hash).await {
            if matches!(e, SwapError::TransactionFailed { .. }) {
                self.pending_deploys.remove(&key);
            }
            return Err(e);
        }

        for attempt in 1..=self.config.deploy_poll_attempts {
            if let Some(deployment) = self
                .find_escrow(&params.escrow_factory, &params.order_id, params.side)
                .await?
            {
                self.pending_deploys.remove(&key);
                info!(
                    "Deployed {} escrow {} for order {} on chain {}",
                    params.side, deployment.address, params.order_id, self.config.chain_id
                );
                return Ok(deployment);
            }
            debug!(
                "Waiting for {} escrow of order {} (attempt {})",
                params.side, params.order_id, attempt
            );
            tokio::time::sleep(self.poll_interval()).await;
        }

        Err(self.query_error(format!(
            "{} escrow for order {} not active after message {}",
            params.side, params.order_id, msg_hash
        )))
    }

    async fn send_to_escrow(
        &self,
        escrow: &EscrowHandle,
        body: Arc<Cell>,
        what: &str,
    ) -> SwapResult<TxReceipt> {
        let message = OutgoingMessage {
            destination: TonAddress::parse(&escrow.address)?,
            value: U256::from(GAS_RESERVE),
            bounce: true,
            body: Some(body),
            mode: wallet::SEND_MODE_PAY_FEES_SEPARATELY,
        };
        let msg_hash = self.send(&[message], None).await?;
        let block_number = self.confirm(&msg_hash).await?;

        info!(
            "Sent {} to escrow {} for order {} on chain {}",
            what, escrow.address, escrow.order_id, self.config.chain_id
        );
        Ok(TxReceipt {
            tx_hash: msg_hash,
            block_number,
        })
    }
}

#[async_trait]
impl Resolver for TonResolver {
    fn family(&self) -> ChainFamily {
        ChainFamily::Ton
    }

    fn chain_id(&self) -> i64 {
        self.config.chain_id
    }

    async fn initialize(&self) -> SwapResult<()> {
        self.wallet().await.map(|_| ())
    }

    async fn get_address(&self) -> SwapResult<String> {
        Ok(self.wallet_address.to_raw())
    }

    async fn get_balance(&self) -> SwapResult<U256> {
        self.balance_of(&self.wallet_address, &Asset::Native).await
    }

    async fn get_token_balance(&self, asset: &Asset) -> SwapResult<U256> {
        self.balance_of(&self.wallet_address, asset).await
    }

    async fn deploy_escrow(&self, params: &EscrowParams) -> SwapResult<EscrowDeployment> {
        let key = (params.order_id.clone(), params.side);
        if let Some(existing) = self
            .find_escrow(&params.escrow_factory, &params.order_id, params.side)
            .await?
        {
            info!(
                "Order {} already has a {} escrow at {} on chain {}",
                params.order_id, params.side, existing.address, self.config.chain_id
            );
            self.pending_deploys.remove(&key);
            return Ok(existing);
        }

        let pending = self.pending_deploys.get(&key).map(|p| p.clone());
        if let Some(sent) = pending {
            if self.may_have_landed(&sent).await? {
                info!(
                    "Deployment message {} for order {} {} escrow is still in flight, not sending again",
                    sent.hash, params.order_id, params.side
                );
                return self.await_escrow(params, &sent.hash).await;
            }
            warn!(
                "Deployment message {} for order {} {} escrow expired unprocessed, sending a new one",
                sent.hash, params.order_id, params.side
            );
            self.pending_deploys.remove(&key);
        }

        let factory = TonAddress::parse(&params.escrow_factory)?;
        let depositor = TonAddress::parse(&params.depositor)?;
        let beneficiary = TonAddress::parse(&params.beneficiary)?;
        let own = self.wallet_address;
        let token = match &params.asset {
            Asset::Native => None,
            Asset::Token(master) => Some(TonAddress::parse(master)?),
        };
        let query_id = query_id();
        let body = messages::create_escrow_body(
            params,
            &order_key(&params.order_id),
            &depositor,
            &beneficiary,
            token.as_ref(),
            query_id,
        )?;
        let gas = U256::from(GAS_RESERVE);

        let message = match token {
            // Our own jettons travel through our jetton wallet with the
            // factory call as forward payload
            Some(master) if depositor == own => {
                let jetton_wallet = self
                    .client
                    .jetton_wallet(&own.to_raw(), &master.to_raw())
                    .await?
                    .ok_or_else(|| {
                        SwapError::Validation(format!(
                            "resolver holds no jetton wallet for {}",
                            master
                        ))
                    })?;
                let forward = params.safety_deposit.saturating_add(gas);
                OutgoingMessage {
                    destination: TonAddress::parse(&jetton_wallet.address)?,
                    value: forward.saturating_add(gas),
                    bounce: true,
                    body: Some(messages::jetton_transfer_body(
                        query_id,
                        params.amount,
                        &factory,
                        &own,
                        forward,
                        body,
                    )?),
                    mode: wallet::SEND_MODE_PAY_FEES_SEPARATELY,
                }
            }
            _ => {
                let locked = if depositor == own && token.is_none() {
                    params.amount.saturating_add(params.safety_deposit)
                } else {
                    params.safety_deposit
                };
                OutgoingMessage {
                    destination: factory,
                    value: locked.saturating_add(gas),
                    bounce: true,
                    body: Some(body),
                    mode: wallet::SEND_MODE_PAY_FEES_SEPARATELY,
                }
            }
        };

        let msg_hash = self.send(&[message], Some(key)).await?;
        self.await_escrow(params, &msg_hash).await
    }

    async fn find_escrow(
        &self,
        factory: &str,
        order_id: &str,
        side: Side,
    ) -> SwapResult<Option<EscrowDeployment>> {
        let factory = TonAddress::parse(factory)?;
        let result = self
            .client
            .run_get_method(
                &factory.to_raw(),
                "get_escrow_address",
                vec![
                    client::stack_num(&order_key(order_id)),
                    json!(["num", format!("0x{:x}", side.as_u8())]),
                ],
            )
            .await?;

        let boc = result
            .stack
            .first()
            .and_then(client::stack_boc)
            .ok_or_else(|| self.query_error("get_escrow_address returned no slice"))?;
        let boc = STANDARD
            .decode(boc)
            .map_err(|e| self.query_error(format!("invalid bag of cells: {}", e)))?;
        let escrow = Cell::from_boc(&boc)?
            .slice()
            .load_address()?
            .ok_or_else(|| self.query_error("get_escrow_address returned addr_none"))?;
        let escrow_raw = escrow.to_raw();

        let state = self.client.get_address_state(&escrow_raw).await?;
        if state != "active" {
            debug!(
                "Escrow {} for order {} is {} on chain {}",
                escrow_raw, order_id, state, self.config.chain_id
            );
            return Ok(None);
        }

        let first = self
            .client
            .first_transaction(&escrow_raw)
            .await?
            .ok_or_else(|| {
                self.query_error(format!("escrow {} is active but not indexed yet", escrow_raw))
            })?;
        let deployed_at = Utc
            .timestamp_opt(first.now as i64, 0)
            .single()
            .ok_or_else(|| self.query_error("invalid transaction time"))?;
        let tx_hash = hash_to_hex(
            first
                .in_msg
                .as_ref()
                .map(|m| m.hash.as_str())
                .unwrap_or(first.hash.as_str()),
        );

        Ok(Some(EscrowDeployment {
            address: escrow_raw,
            tx_hash: tx_hash.clone(),
            block_number: first.mc_block_seqno,
            deployed_at,
            proof: InclusionProof {
                chain_id: self.config.chain_id,
                tx_hash: hash_to_hex(&first.hash),
                block_number: first.mc_block_seqno,
                block_hash: None,
            },
        }))
    }

    async fn get_contract_balance(&self, address: &str, asset: &Asset) -> SwapResult<U256> {
        self.balance_of(&TonAddress::parse(address)?, asset).await
    }

    async fn withdraw(
        &self,
        escrow: &EscrowHandle,
        secret: &Secret,
        side: Side,
    ) -> SwapResult<TxReceipt> {
        if !secret.matches(&escrow.hashlock) {
            return Err(SwapError::InvalidSecret {
                order_id: escrow.order_id.clone(),
            });
        }
        let now = self.chain_time().await?;
        ensure_withdrawable(escrow.deployed_at, &escrow.timelocks, now, side)?;

        let body = messages::withdraw_body(secret, query_id())?;
        self.send_to_escrow(escrow, body, "withdraw").await
    }

    async fn cancel(&self, escrow: &EscrowHandle, side: Side) -> SwapResult<TxReceipt> {
        let now = self.chain_time().await?;
        ensure_cancellable(escrow.deployed_at, &escrow.timelocks, now, side)?;

        let body = messages::cancel_body(query_id())?;
        self.send_to_escrow(escrow, body, "cancel").await
    }

    async fn get_transaction_status(&self, tx_hash: &str) -> SwapResult<TxStatus> {
        let txs = self.client.transactions_by_message(tx_hash).await?;
        let Some(tx) = txs.first() else {
            return Ok(TxStatus::pending());
        };

        if !tx.succeeded() {
            warn!("Transaction for message {} aborted on chain {}", tx_hash, self.config.chain_id);
            return Ok(TxStatus {
                state: TxState::Failed,
                block_number: tx.mc_block_seqno,
                confirmations: 0,
                finalized: false,
            });
        }

        let current = self.client.masterchain_info().await?.last.seqno;
        let confirmations = tx
            .mc_block_seqno
            .map(|block| current.saturating_sub(block))
            .unwrap_or(0);

        Ok(TxStatus {
            state: TxState::Included,
            block_number: tx.mc_block_seqno,
            confirmations,
            finalized: tx.mc_block_seqno.is_some()
                && confirmations >= self.config.confirmation_blocks,
        })
    }

    async fn chain_time(&self) -> SwapResult<DateTime<Utc>> {
        let info = self.client.masterchain_info().await?;
        Utc.timestamp_opt(info.last.gen_utime as i64, 0)
            .single()
            .ok_or_else(|| self.query_error("invalid masterchain time"))
    }
}
