use alloy_primitives::{Address, B256, U256};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Errors from a single JSON-RPC round trip.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to parse RPC response: {0}")]
    Decode(String),

    /// The node answered with a JSON-RPC error object.
    #[error("RPC error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("null result from {0}")]
    NullResult(String),
}

/// A minimal JSON-RPC client for one ledger node.
///
/// Uses raw `reqwest` calls so the supervisor does not depend on a full
/// provider stack.
pub struct RpcClient {
    url: String,
    client: reqwest::Client,
    request_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Subset of `eth_getTransactionReceipt` the workload needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    #[serde(deserialize_with = "deserialize_u64_hex")]
    pub status: u64,
    #[serde(deserialize_with = "deserialize_u64_hex")]
    pub block_number: u64,
    #[serde(deserialize_with = "deserialize_u64_hex")]
    pub gas_used: u64,
    pub effective_gas_price: U256,
}

fn deserialize_u64_hex<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(serde::de::Error::custom)
}

fn parse_hex_u64(hex: &str) -> Result<u64, RpcError> {
    u64::from_str_radix(hex.trim_start_matches("0x"), 16)
        .map_err(|e| RpcError::Decode(format!("bad quantity {hex}: {e}")))
}

impl RpcClient {
    pub fn new(url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { url, client, request_id: AtomicU64::new(1) }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id(),
        });

        let text = self.client.post(&self.url).json(&body).send().await?.text().await?;
        let resp: JsonRpcResponse<T> = serde_json::from_str(&text)
            .map_err(|e| RpcError::Decode(format!("{e}\nraw: {text}")))?;

        if let Some(err) = resp.error {
            return Err(RpcError::Server { code: err.code, message: err.message });
        }
        Ok(resp.result)
    }

    async fn call_required<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        self.call(method, params).await?.ok_or_else(|| RpcError::NullResult(method.to_string()))
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let hex: String = self.call_required("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&hex)
    }

    pub async fn get_balance(&self, address: Address) -> Result<U256, RpcError> {
        let hex: String = self
            .call_required("eth_getBalance", json!([format!("{address:?}"), "latest"]))
            .await?;
        U256::from_str_radix(hex.trim_start_matches("0x"), 16)
            .map_err(|e| RpcError::Decode(format!("bad balance {hex}: {e}")))
    }

    /// Nonce including transactions still in the pool.
    pub async fn get_pending_nonce(&self, address: Address) -> Result<u64, RpcError> {
        let hex: String = self
            .call_required("eth_getTransactionCount", json!([format!("{address:?}"), "pending"]))
            .await?;
        parse_hex_u64(&hex)
    }

    pub async fn send_raw_transaction(&self, raw_tx: &[u8]) -> Result<B256, RpcError> {
        let hex_tx = format!("0x{}", hex::encode(raw_tx));
        self.call_required("eth_sendRawTransaction", json!([hex_tx])).await
    }

    pub async fn get_transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        self.call("eth_getTransactionReceipt", json!([format!("{tx_hash:?}")])).await
    }
}
