//! Configuration management for the swap resolver
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Signing material is never stored in the file: credential sections name the
//! environment variables holding it.

use crate::model::ChainFamily;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the configuration path
pub const CONFIG_ENV: &str = "CROSSLOCK_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub service: ServiceConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub instance_id: String,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_queue_size")]
    pub command_queue_size: usize,
}

/// Timing and retry budget of the swap state machine
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Deadline for a single read-only chain call
    pub call_timeout_ms: u64,
    /// Deadline for a call that submits a transaction and waits for its receipt
    pub submit_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub finality_poll_initial_ms: u64,
    pub finality_poll_max_ms: u64,
    pub finality_timeout_secs: u64,
    /// Minimum gap between destination and source cancellation deadlines
    pub safety_margin_secs: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 15_000,
            submit_timeout_ms: 180_000,
            max_retries: 5,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            finality_poll_initial_ms: 2_000,
            finality_poll_max_ms: 30_000,
            finality_timeout_secs: 1_800,
            safety_margin_secs: 600,
        }
    }
}

impl OrchestratorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Empty selects the in-memory store
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: i64,
    pub name: String,
    /// Overrides the family inferred from the sign of `chain_id`
    #[serde(default)]
    pub family: Option<ChainFamily>,
    pub rpc_urls: Vec<String>,
    /// toncenter v3 index API (TON only)
    #[serde(default)]
    pub index_url: Option<String>,
    /// Environment variable holding the RPC API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub escrow_factory: String,
    /// Deployed resolver wallet (TON only)
    #[serde(default)]
    pub wallet_address: Option<String>,
    pub confirmation_blocks: u64,
    #[serde(default = "default_log_lookback")]
    pub log_lookback_blocks: u64,
    /// Attempts while waiting for a TON deployment to become visible
    #[serde(default = "default_deploy_poll_attempts")]
    pub deploy_poll_attempts: u32,
    #[serde(default = "default_deploy_poll_interval")]
    pub deploy_poll_interval_ms: u64,
    pub enabled: bool,
}

impl ChainConfig {
    pub fn family(&self) -> Option<ChainFamily> {
        self.family.or_else(|| ChainFamily::from_chain_id(self.chain_id))
    }

    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_ref()
            .and_then(|name| env::var(name).ok())
            .filter(|key| !key.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub evm: CredentialSource,
    #[serde(default)]
    pub ton: CredentialSource,
}

impl CredentialsConfig {
    pub fn for_family(&self, family: ChainFamily) -> &CredentialSource {
        match family {
            ChainFamily::Evm => &self.evm,
            ChainFamily::Ton => &self.ton,
        }
    }
}

/// Names of the environment variables holding signing material
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialSource {
    pub private_key_env: Option<String>,
    pub mnemonic_env: Option<String>,
}

/// Signing material read from the environment
#[derive(Clone)]
pub enum SigningMaterial {
    PrivateKey(String),
    Mnemonic(String),
}

impl std::fmt::Debug for SigningMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningMaterial::PrivateKey(_) => f.write_str("PrivateKey(***)"),
            SigningMaterial::Mnemonic(_) => f.write_str("Mnemonic(***)"),
        }
    }
}

impl CredentialSource {
    /// Private key wins over mnemonic when both are set
    pub fn signing_material(&self) -> Option<SigningMaterial> {
        let read = |name: &Option<String>| {
            name.as_ref()
                .and_then(|n| env::var(n).ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        read(&self.private_key_env)
            .map(SigningMaterial::PrivateKey)
            .or_else(|| read(&self.mnemonic_env).map(SigningMaterial::Mnemonic))
    }
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_queue_size() -> usize {
    1024
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_log_lookback() -> u64 {
    50_000
}

fn default_deploy_poll_attempts() -> u32 {
    30
}

fn default_deploy_poll_interval() -> u64 {
    2_000
}

impl Settings {
    /// Load settings from the file named by `CROSSLOCK_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        let mut seen = HashSet::new();
        for (name, chain) in self.enabled_chains() {
            if !seen.insert(chain.chain_id) {
                anyhow::bail!("Chain id {} is configured twice", chain.chain_id);
            }
            let Some(family) = chain.family() else {
                anyhow::bail!("Chain {} has id 0 and no family", name);
            };
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            if chain.escrow_factory.trim().is_empty() {
                anyhow::bail!("Chain {} has no escrow factory configured", name);
            }
            if family == ChainFamily::Ton {
                if chain.index_url.as_deref().unwrap_or_default().is_empty() {
                    anyhow::bail!("TON chain {} needs index_url", name);
                }
                if chain.wallet_address.as_deref().unwrap_or_default().is_empty() {
                    anyhow::bail!("TON chain {} needs wallet_address", name);
                }
            }
            let creds = self.credentials.for_family(family);
            if creds.private_key_env.is_none() && creds.mnemonic_env.is_none() {
                tracing::warn!(
                    "No {} credentials configured - chain {} will fail to initialize",
                    family,
                    name
                );
            }
        }

        let o = &self.orchestrator;
        if o.call_timeout_ms == 0 || o.submit_timeout_ms == 0 {
            anyhow::bail!("Chain call timeouts must be non-zero");
        }
        if o.finality_poll_initial_ms == 0 || o.finality_poll_max_ms < o.finality_poll_initial_ms {
            anyhow::bail!("Finality poll interval must be non-zero and below its cap");
        }
        if o.retry_max_delay_ms < o.retry_base_delay_ms {
            anyhow::bail!("retry_max_delay_ms must not be below retry_base_delay_ms");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: i64) -> Option<&ChainConfig> {
        self.chains
            .values()
            .find(|c| c.enabled && c.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
