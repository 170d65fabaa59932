//! toncenter HTTP client
//!
//! v2 JSON-RPC for get-methods, balances, account state and message
//! submission; v3 REST for indexed transactions and jetton wallets.

use crate::error::{SwapError, SwapResult};

use ethers::types::U256;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::cmp;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct TonClientConfig {
    pub chain_id: i64,
    /// v2 JSON-RPC endpoint
    pub rpc_url: String,
    /// v3 REST base URL
    pub index_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_attempts: u32,
}

pub struct TonClient {
    cfg: TonClientConfig,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    code: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunGetMethodResult {
    pub exit_code: i32,
    #[serde(default)]
    pub stack: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendBocResult {
    pub hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MasterchainBlock {
    #[serde(deserialize_with = "number_or_string")]
    pub seqno: u64,
    #[serde(deserialize_with = "number_or_string")]
    pub gen_utime: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MasterchainInfo {
    pub last: MasterchainBlock,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JettonWallet {
    pub address: String,
    pub balance: String,
}

#[derive(Debug, Deserialize)]
struct JettonWallets {
    #[serde(default)]
    jetton_wallets: Vec<JettonWallet>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComputePhase {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TxDescription {
    #[serde(default)]
    pub aborted: bool,
    #[serde(default)]
    pub compute_ph: Option<ComputePhase>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageRef {
    pub hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexedTransaction {
    pub hash: String,
    #[serde(deserialize_with = "number_or_string")]
    pub now: u64,
    #[serde(default)]
    pub mc_block_seqno: Option<u64>,
    #[serde(default)]
    pub description: TxDescription,
    #[serde(default)]
    pub in_msg: Option<MessageRef>,
}

impl IndexedTransaction {
    pub fn succeeded(&self) -> bool {
        !self.description.aborted
            && self
                .description
                .compute_ph
                .as_ref()
                .and_then(|c| c.success)
                .unwrap_or(true)
    }
}

#[derive(Debug, Deserialize)]
struct Transactions {
    #[serde(default)]
    transactions: Vec<IndexedTransaction>,
}

fn number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Exponential backoff capped at 2s
fn backoff_delay_ms(attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1);
    let base = 100u64.saturating_mul(2u64.saturating_pow(exp));
    base.min(2_000)
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

impl TonClient {
    pub fn new(cfg: TonClientConfig) -> SwapResult<Self> {
        let http = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| SwapError::Config(format!("failed to build http client: {}", e)))?;
        Ok(Self { cfg, http })
    }

    fn query_error(&self, message: impl std::fmt::Display) -> SwapError {
        SwapError::chain(self.cfg.chain_id, message)
    }

    fn index_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.cfg.index_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn auth(&self, req: RequestBuilder) -> RequestBuilder {
        match self
            .cfg
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            Some(key) => req.header("X-API-Key", key),
            None => req,
        }
    }

    async fn send_with_retry(
        &self,
        op: &'static str,
        make_req: impl Fn() -> RequestBuilder,
    ) -> SwapResult<reqwest::Response> {
        let attempts = cmp::max(1, self.cfg.max_attempts);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            debug!(op, attempt, attempts, "toncenter request");
            match self.auth(make_req()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() || !is_transient_status(status) {
                        return Ok(resp);
                    }
                    last_error = format!("{} returned HTTP {}", op, status.as_u16());
                }
                Err(e) => {
                    if !(e.is_timeout() || e.is_connect()) {
                        return Err(self.query_error(format!("{} failed: {}", op, e)));
                    }
                    last_error = format!("{} failed: {}", op, e);
                }
            }

            if attempt < attempts {
                let delay_ms = backoff_delay_ms(attempt);
                warn!(op, attempt, attempts, delay_ms, "transient toncenter error; retrying");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        Err(self.query_error(format!("{} after {} attempts", last_error, attempts)))
    }

    async fn rpc<T: DeserializeOwned>(&self, method: &'static str, params: Value) -> SwapResult<T> {
        let body = json!({
            "id": 1,
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        let resp = self
            .send_with_retry(method, || self.http.post(&self.cfg.rpc_url).json(&body))
            .await?;

        // toncenter reports JSON-RPC errors with a non-2xx status and a JSON body
        let parsed: RpcResponse<T> = resp
            .json()
            .await
            .map_err(|e| self.query_error(format!("{}: invalid response: {}", method, e)))?;
        if !parsed.ok {
            return Err(self.query_error(format!(
                "{} error {}: {}",
                method,
                parsed.code.unwrap_or_default(),
                parsed.error.unwrap_or_default()
            )));
        }
        parsed
            .result
            .ok_or_else(|| self.query_error(format!("{}: empty result", method)))
    }

    async fn get_index<T: DeserializeOwned>(
        &self,
        op: &'static str,
        path: &str,
        query: &[(&str, String)],
    ) -> SwapResult<T> {
        let url = self.index_url(path);
        let resp = self
            .send_with_retry(op, || self.http.get(&url).query(query))
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(self.query_error(format!("{} returned HTTP {}", op, status.as_u16())));
        }
        resp.json()
            .await
            .map_err(|e| self.query_error(format!("{}: invalid response: {}", op, e)))
    }

    pub async fn run_get_method(
        &self,
        address: &str,
        method: &str,
        stack: Vec<Value>,
    ) -> SwapResult<RunGetMethodResult> {
        let result: RunGetMethodResult = self
            .rpc(
                "runGetMethod",
                json!({ "address": address, "method": method, "stack": stack }),
            )
            .await?;
        if result.exit_code != 0 && result.exit_code != 1 {
            return Err(self.query_error(format!(
                "get method {} on {} exited with {}",
                method, address, result.exit_code
            )));
        }
        Ok(result)
    }

    /// Balance in nanotons
    pub async fn get_address_balance(&self, address: &str) -> SwapResult<String> {
        self.rpc("getAddressBalance", json!({ "address": address }))
            .await
    }

    /// `active`, `uninitialized` or `frozen`
    pub async fn get_address_state(&self, address: &str) -> SwapResult<String> {
        self.rpc("getAddressState", json!({ "address": address }))
            .await
    }

    pub async fn send_boc_return_hash(&self, boc_base64: &str) -> SwapResult<SendBocResult> {
        self.rpc("sendBocReturnHash", json!({ "boc": boc_base64 }))
            .await
    }

    pub async fn masterchain_info(&self) -> SwapResult<MasterchainInfo> {
        self.get_index("masterchainInfo", "masterchainInfo", &[])
            .await
    }

    pub async fn jetton_wallet(
        &self,
        owner: &str,
        jetton_master: &str,
    ) -> SwapResult<Option<JettonWallet>> {
        let wallets: JettonWallets = self
            .get_index(
                "jettonWallets",
                "jetton/wallets",
                &[
                    ("owner_address", owner.to_string()),
                    ("jetton_address", jetton_master.to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(wallets.jetton_wallets.into_iter().next())
    }

    pub async fn transactions_by_message(
        &self,
        msg_hash: &str,
    ) -> SwapResult<Vec<IndexedTransaction>> {
        let txs: Transactions = self
            .get_index(
                "transactionsByMessage",
                "transactionsByMessage",
                &[("msg_hash", msg_hash.to_string())],
            )
            .await?;
        Ok(txs.transactions)
    }

    /// Oldest indexed transaction of an account
    pub async fn first_transaction(&self, account: &str) -> SwapResult<Option<IndexedTransaction>> {
        let txs: Transactions = self
            .get_index(
                "transactions",
                "transactions",
                &[
                    ("account", account.to_string()),
                    ("limit", "1".to_string()),
                    ("sort", "asc".to_string()),
                ],
            )
            .await?;
        Ok(txs.transactions.into_iter().next())
    }
}

/// Numeric stack entry as `["num", "0x.."]`
pub fn stack_num(value: &[u8]) -> Value {
    json!(["num", format!("0x{}", hex::encode(value))])
}

/// Unsigned integer from a `["num", "0x.."]` stack entry
pub fn parse_stack_num(entry: &Value) -> Option<U256> {
    let raw = entry.get(1)?.as_str()?;
    match raw.strip_prefix("0x") {
        Some(hex) => U256::from_str_radix(hex, 16).ok(),
        None => U256::from_dec_str(raw).ok(),
    }
}

/// Base64 bag of cells from a `["cell", {"bytes": ..}]` or `["slice", ..]` stack entry
pub fn stack_boc(entry: &Value) -> Option<&str> {
    let payload = entry.get(1)?;
    payload
        .get("bytes")
        .and_then(Value::as_str)
        .or_else(|| payload.as_str())
}
