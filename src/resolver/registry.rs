//! Chain id to resolver mapping
//!
//! Family dispatch happens once, here, when the registry is built from
//! configuration. Everything downstream holds an `Arc<dyn Resolver>`.

use crate::config::{ChainConfig, Settings};
use crate::error::{SwapError, SwapResult};
use crate::model::ChainFamily;
use crate::resolver::evm::EvmResolver;
use crate::resolver::ton::TonResolver;
use crate::resolver::Resolver;

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{error, info};

/// A chain the service can act on
#[derive(Clone)]
pub struct ResolvedChain {
    pub chain_id: i64,
    pub family: ChainFamily,
    pub escrow_factory: String,
    pub confirmations: u64,
    pub resolver: Arc<dyn Resolver>,
}

impl std::fmt::Debug for ResolvedChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedChain")
            .field("chain_id", &self.chain_id)
            .field("family", &self.family)
            .field("escrow_factory", &self.escrow_factory)
            .field("confirmations", &self.confirmations)
            .finish()
    }
}

/// Produces the resolver for a chain id
pub trait ResolverFactory: Send + Sync {
    fn resolve(&self, chain_id: i64) -> SwapResult<ResolvedChain>;
}

#[derive(Default)]
pub struct ChainRegistry {
    chains: DashMap<i64, ResolvedChain>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, chain: ResolvedChain) {
        self.chains.insert(chain.chain_id, chain);
    }

    /// Build one resolver per enabled chain
    pub fn from_settings(settings: &Settings) -> SwapResult<Self> {
        let registry = Self::new();

        for (name, chain) in settings.enabled_chains() {
            let family = chain.family().ok_or_else(|| {
                SwapError::Config(format!("Chain {} has no resolvable family", name))
            })?;
            let credentials = settings.credentials.for_family(family).clone();

            let resolver: Arc<dyn Resolver> = match family {
                ChainFamily::Evm => Arc::new(EvmResolver::new(chain.clone(), credentials)?),
                ChainFamily::Ton => Arc::new(TonResolver::new(chain.clone(), credentials)?),
            };

            info!(
                "Registered {} resolver for chain {} ({})",
                family, chain.chain_id, chain.name
            );
            registry.insert(resolved(chain, family, resolver));
        }

        Ok(registry)
    }

    pub fn chain_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.chains.iter().map(|c| *c.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Initialize every resolver; failures are logged and left for the
    /// first flow touching that chain to surface
    pub async fn initialize_all(&self) {
        let chains: Vec<ResolvedChain> = self.chains.iter().map(|c| c.value().clone()).collect();
        for chain in chains {
            if let Err(e) = chain.resolver.initialize().await {
                error!("Failed to initialize resolver for chain {}: {}", chain.chain_id, e);
            }
        }
    }

    /// Per-chain reachability, probed through the chain clock
    pub async fn health_check(&self) -> Vec<(i64, bool)> {
        let chains: Vec<ResolvedChain> = self.chains.iter().map(|c| c.value().clone()).collect();
        let probes = chains.into_iter().map(|chain| async move {
            let healthy = match chain.resolver.chain_time().await {
                Ok(_) => true,
                Err(e) => {
                    error!("Health check failed for chain {}: {}", chain.chain_id, e);
                    false
                }
            };
            (chain.chain_id, healthy)
        });
        futures::future::join_all(probes).await
    }
}

impl ResolverFactory for ChainRegistry {
    fn resolve(&self, chain_id: i64) -> SwapResult<ResolvedChain> {
        self.chains
            .get(&chain_id)
            .map(|c| c.value().clone())
            .ok_or(SwapError::UnsupportedChain { chain_id })
    }
}

fn resolved(chain: &ChainConfig, family: ChainFamily, resolver: Arc<dyn Resolver>) -> ResolvedChain {
    ResolvedChain {
        chain_id: chain.chain_id,
        family,
        escrow_factory: chain.escrow_factory.clone(),
        confirmations: chain.confirmation_blocks,
        resolver,
    }
}
