//! EVM resolver
//!
//! Escrows are created through a factory contract keyed by
//! `keccak256(order_id)` and side, so a deployment can always be found again
//! from the order alone.

mod contracts;
mod provider;

pub use contracts::{EscrowCreatedFilter, EscrowFactory, Erc20, HashedTimelockEscrow};
pub use provider::ChainProvider;

use crate::config::{ChainConfig, CredentialSource, SigningMaterial};
use crate::error::{SwapError, SwapResult};
use crate::model::{
    keccak256, Asset, ChainFamily, EscrowDeployment, EscrowHandle, EscrowParams, InclusionProof,
    Secret, Side,
};
use crate::policy::{ensure_cancellable, ensure_withdrawable};
use crate::resolver::{Resolver, TxReceipt, TxState, TxStatus};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ethers::abi::Detokenize;
use ethers::contract::{parse_log, ContractCall};
use ethers::prelude::*;
use ethers::signers::coins_bip39::English;
use ethers::signers::{LocalWallet, MnemonicBuilder, Signer};
use ethers::utils::to_checksum;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

pub struct EvmResolver {
    config: ChainConfig,
    evm_chain_id: u64,
    credentials: CredentialSource,
    provider: Arc<ChainProvider>,
    client: OnceCell<Arc<SignerClient>>,
}

/// Factory key of an order
pub fn order_key(order_id: &str) -> [u8; 32] {
    keccak256(order_id.as_bytes())
}

impl EvmResolver {
    pub fn new(config: ChainConfig, credentials: CredentialSource) -> SwapResult<Self> {
        let evm_chain_id = u64::try_from(config.chain_id).map_err(|_| {
            SwapError::Config(format!("EVM chain id {} must be positive", config.chain_id))
        })?;
        let provider = Arc::new(ChainProvider::new(&config)?);

        Ok(Self {
            config,
            evm_chain_id,
            credentials,
            provider,
            client: OnceCell::new(),
        })
    }

    fn load_wallet(&self) -> SwapResult<LocalWallet> {
        let material = self.credentials.signing_material().ok_or_else(|| {
            SwapError::Credential(format!(
                "No EVM signing key configured for chain {}",
                self.config.chain_id
            ))
        })?;

        let wallet = match material {
            SigningMaterial::PrivateKey(key) => key
                .parse::<LocalWallet>()
                .map_err(|e| SwapError::Credential(format!("Invalid private key: {}", e)))?,
            SigningMaterial::Mnemonic(phrase) => MnemonicBuilder::<English>::default()
                .phrase(phrase.as_str())
                .build()
                .map_err(|e| SwapError::Credential(format!("Invalid mnemonic: {}", e)))?,
        };

        Ok(wallet.with_chain_id(self.evm_chain_id))
    }

    /// Signing client, created on first use
    async fn client(&self) -> SwapResult<Arc<SignerClient>> {
        self.client
            .get_or_try_init(|| async {
                let wallet = self.load_wallet()?;
                info!(
                    "EVM resolver for chain {} signing as {}",
                    self.config.chain_id,
                    to_checksum(&wallet.address(), None)
                );
                Ok::<_, SwapError>(Arc::new(SignerMiddleware::new(
                    self.provider.http().clone(),
                    wallet,
                )))
            })
            .await
            .cloned()
    }

    /// Unsigned client for view calls
    fn reader(&self) -> Arc<Provider<Http>> {
        Arc::new(self.provider.http().clone())
    }

    fn parse_address(&self, value: &str, what: &str) -> SwapResult<Address> {
        Address::from_str(value.trim())
            .map_err(|e| SwapError::Validation(format!("invalid {} address {}: {}", what, value, e)))
    }

    fn token_address(&self, asset: &Asset) -> SwapResult<Option<Address>> {
        match asset {
            Asset::Native => Ok(None),
            Asset::Token(token) => self.parse_address(token, "token").map(Some),
        }
    }

    /// Send a contract call and wait for a successful receipt
    async fn submit<D: Detokenize>(
        &self,
        call: ContractCall<SignerClient, D>,
        what: &str,
    ) -> SwapResult<TransactionReceipt> {
        let chain_id = self.config.chain_id;

        let pending = call.send().await.map_err(|e| {
            if e.is_revert() {
                SwapError::TransactionFailed {
                    chain_id,
                    tx_hash: String::new(),
                    reason: format!("{} reverted: {}", what, e),
                }
            } else {
                SwapError::chain(chain_id, format!("{} submission failed: {}", what, e))
            }
        })?;
        let tx_hash = format!("{:?}", pending.tx_hash());
        debug!("Submitted {} on chain {}: {}", what, chain_id, tx_hash);

        let receipt = pending
            .await
            .map_err(|e| SwapError::chain(chain_id, e))?
            .ok_or_else(|| SwapError::TransactionFailed {
                chain_id,
                tx_hash: tx_hash.clone(),
                reason: format!("{} dropped from mempool", what),
            })?;

        if receipt.status != Some(U64::from(1)) {
            return Err(SwapError::TransactionFailed {
                chain_id,
                tx_hash,
                reason: format!("{} reverted", what),
            });
        }

        Ok(receipt)
    }

    async fn ensure_allowance(
        &self,
        client: &Arc<SignerClient>,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> SwapResult<()> {
        let erc20 = Erc20::new(token, client.clone());
        let current = erc20
            .allowance(client.address(), spender)
            .call()
            .await
            .map_err(|e| SwapError::chain(self.config.chain_id, e))?;

        if current >= amount {
            return Ok(());
        }

        debug!(
            "Approving {} of token {:?} for factory on chain {}",
            amount, token, self.config.chain_id
        );
        self.submit(erc20.approve(spender, amount), "approve").await?;
        Ok(())
    }

    async fn balance_of(&self, owner: Address, asset: &Asset) -> SwapResult<U256> {
        match self.token_address(asset)? {
            None => self.provider.get_balance(owner).await,
            Some(token) => Erc20::new(token, self.reader())
                .balance_of(owner)
                .call()
                .await
                .map_err(|e| SwapError::chain(self.config.chain_id, e)),
        }
    }

    fn deployment(
        &self,
        escrow: Address,
        deployed_at: U256,
        tx_hash: H256,
        block_number: Option<u64>,
        block_hash: Option<H256>,
    ) -> SwapResult<EscrowDeployment> {
        let deployed_at = Utc
            .timestamp_opt(deployed_at.low_u64() as i64, 0)
            .single()
            .ok_or_else(|| SwapError::chain(self.config.chain_id, "invalid deployment time"))?;
        let tx_hash = format!("{:?}", tx_hash);

        Ok(EscrowDeployment {
            address: to_checksum(&escrow, None),
            tx_hash: tx_hash.clone(),
            block_number,
            deployed_at,
            proof: InclusionProof {
                chain_id: self.config.chain_id,
                tx_hash,
                block_number,
                block_hash: block_hash.map(|h| format!("{:?}", h)),
            },
        })
    }
}

#[async_trait]
impl Resolver for EvmResolver {
    fn family(&self) -> ChainFamily {
        ChainFamily::Evm
    }

    fn chain_id(&self) -> i64 {
        self.config.chain_id
    }

    async fn initialize(&self) -> SwapResult<()> {
        self.client().await.map(|_| ())
    }

    async fn get_address(&self) -> SwapResult<String> {
        let client = self.client().await?;
        Ok(to_checksum(&client.address(), None))
    }

    async fn get_balance(&self) -> SwapResult<U256> {
        let client = self.client().await?;
        self.provider.get_balance(client.address()).await
    }

    async fn get_token_balance(&self, asset: &Asset) -> SwapResult<U256> {
        let client = self.client().await?;
        self.balance_of(client.address(), asset).await
    }

    async fn deploy_escrow(&self, params: &EscrowParams) -> SwapResult<EscrowDeployment> {
        if let Some(existing) = self
            .find_escrow(&params.escrow_factory, &params.order_id, params.side)
            .await?
        {
            info!(
                "Order {} already has a {} escrow at {} on chain {}",
                params.order_id, params.side, existing.address, self.config.chain_id
            );
            return Ok(existing);
        }

        let client = self.client().await?;
        let factory_address = self.parse_address(&params.escrow_factory, "escrow factory")?;
        let factory = EscrowFactory::new(factory_address, client.clone());
        let depositor = self.parse_address(&params.depositor, "depositor")?;
        let beneficiary = self.parse_address(&params.beneficiary, "beneficiary")?;
        let token = self.token_address(&params.asset)?;

        // The resolver funds its own escrows; maker escrows pull the maker's
        // pre-approved funds and the resolver only adds the safety deposit.
        let value = if depositor == client.address() {
            match token {
                None => params
                    .amount
                    .checked_add(params.safety_deposit)
                    .ok_or_else(|| SwapError::Validation("escrow value overflows".to_string()))?,
                Some(token) => {
                    self.ensure_allowance(&client, token, factory_address, params.amount)
                        .await?;
                    params.safety_deposit
                }
            }
        } else {
            params.safety_deposit
        };

        let call = factory
            .create_escrow(
                order_key(&params.order_id),
                params.side.as_u8(),
                depositor,
                beneficiary,
                token.unwrap_or_else(Address::zero),
                params.amount,
                params.safety_deposit,
                *params.hashlock.as_bytes(),
                params.timelocks.pack(0),
            )
            .value(value);

        let receipt = self.submit(call, "createEscrow").await?;
        let created = receipt
            .logs
            .iter()
            .filter(|log| log.address == factory_address)
            .find_map(|log| parse_log::<EscrowCreatedFilter>(log.clone()).ok())
            .ok_or_else(|| SwapError::TransactionFailed {
                chain_id: self.config.chain_id,
                tx_hash: format!("{:?}", receipt.transaction_hash),
                reason: "no EscrowCreated event in receipt".to_string(),
            })?;

        info!(
            "Deployed {} escrow {:?} for order {} on chain {}",
            params.side, created.escrow, params.order_id, self.config.chain_id
        );

        self.deployment(
            created.escrow,
            created.deployed_at,
            receipt.transaction_hash,
            receipt.block_number.map(|b| b.as_u64()),
            receipt.block_hash,
        )
    }

    async fn find_escrow(
        &self,
        factory: &str,
        order_id: &str,
        side: Side,
    ) -> SwapResult<Option<EscrowDeployment>> {
        let chain_id = self.config.chain_id;
        let factory = EscrowFactory::new(self.parse_address(factory, "escrow factory")?, self.reader());
        let key = order_key(order_id);

        let escrow = factory
            .escrow_of(key, side.as_u8())
            .call()
            .await
            .map_err(|e| SwapError::chain(chain_id, e))?;
        if escrow.is_zero() {
            return Ok(None);
        }

        let current = self.provider.get_block_number().await?;
        let from_block = current.saturating_sub(self.config.log_lookback_blocks);
        let events = factory
            .escrow_created_filter()
            .topic1(H256::from(key))
            .topic2(H256::from_low_u64_be(u64::from(side.as_u8())))
            .from_block(from_block)
            .query_with_meta()
            .await
            .map_err(|e| SwapError::chain(chain_id, e))?;

        let (event, meta) = events
            .into_iter()
            .find(|(event, _)| event.escrow == escrow)
            .ok_or_else(|| {
                SwapError::chain(
                    chain_id,
                    format!(
                        "escrow {:?} exists but its creation is older than {} blocks",
                        escrow, self.config.log_lookback_blocks
                    ),
                )
            })?;

        self.deployment(
            event.escrow,
            event.deployed_at,
            meta.transaction_hash,
            Some(meta.block_number.as_u64()),
            Some(meta.block_hash),
        )
        .map(Some)
    }

    async fn get_contract_balance(&self, address: &str, asset: &Asset) -> SwapResult<U256> {
        let owner = self.parse_address(address, "escrow")?;
        self.balance_of(owner, asset).await
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

        let client = self.client().await?;
        let contract =
            HashedTimelockEscrow::new(self.parse_address(&escrow.address, "escrow")?, client);
        let receipt = self
            .submit(contract.withdraw(*secret.as_bytes()), "withdraw")
            .await?;

        info!(
            "Withdrew {} escrow {} for order {} on chain {}",
            side, escrow.address, escrow.order_id, self.config.chain_id
        );
        Ok(TxReceipt {
            tx_hash: format!("{:?}", receipt.transaction_hash),
            block_number: receipt.block_number.map(|b| b.as_u64()),
        })
    }

    async fn cancel(&self, escrow: &EscrowHandle, side: Side) -> SwapResult<TxReceipt> {
        let now = self.chain_time().await?;
        ensure_cancellable(escrow.deployed_at, &escrow.timelocks, now, side)?;

        let client = self.client().await?;
        let contract =
            HashedTimelockEscrow::new(self.parse_address(&escrow.address, "escrow")?, client);
        let receipt = self.submit(contract.cancel(), "cancel").await?;

        info!(
            "Cancelled {} escrow {} for order {} on chain {}",
            side, escrow.address, escrow.order_id, self.config.chain_id
        );
        Ok(TxReceipt {
            tx_hash: format!("{:?}", receipt.transaction_hash),
            block_number: receipt.block_number.map(|b| b.as_u64()),
        })
    }

    async fn get_transaction_status(&self, tx_hash: &str) -> SwapResult<TxStatus> {
        let hash = H256::from_str(tx_hash.trim().trim_start_matches("0x"))
            .map_err(|e| SwapError::Validation(format!("invalid tx hash {}: {}", tx_hash, e)))?;

        let Some(receipt) = self.provider.get_transaction_receipt(hash).await? else {
            return if self.provider.transaction_known(hash).await? {
                Ok(TxStatus::pending())
            } else {
                Ok(TxStatus::not_found())
            };
        };

        let block_number = receipt.block_number.map(|b| b.as_u64());
        if receipt.status != Some(U64::from(1)) {
            warn!("Transaction {} failed on chain {}", tx_hash, self.config.chain_id);
            return Ok(TxStatus {
                state: TxState::Failed,
                block_number,
                confirmations: 0,
                finalized: false,
            });
        }

        let current = self.provider.get_block_number().await?;
        let confirmations = block_number
            .map(|block| current.saturating_sub(block))
            .unwrap_or(0);

        Ok(TxStatus {
            state: TxState::Included,
            block_number,
            confirmations,
            finalized: confirmations >= self.config.confirmation_blocks,
        })
    }

    async fn chain_time(&self) -> SwapResult<DateTime<Utc>> {
        self.provider.latest_block_time().await
    }
}
