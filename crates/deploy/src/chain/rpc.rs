//! JSON-RPC implementation of [`ChainClient`].
//!
//! Transactions are sent with `eth_sendTransaction` from an account managed by
//! the node (or a signing proxy in front of it).

use std::time::Duration;

use alloy_core::primitives::{Address, B256, Bytes};
use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use url::Url;

use super::{CallRequest, ChainClient, Log, PendingTx, Receipt, TxRequest};
use crate::error::{DeployError, Result};

/// Default timeout for a single RPC request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of retries for read-only requests.
const DEFAULT_MAX_RETRIES: usize = 5;

/// Why a JSON-RPC request failed.
#[derive(Debug)]
enum RpcFailure {
    /// The request never got a well-formed answer. Safe to retry for reads.
    Transport(String),
    /// The node answered with an error object.
    Node { message: String, data: Option<Value> },
}

impl RpcFailure {
    fn into_error(self, method: &str) -> DeployError {
        match self {
            RpcFailure::Transport(message) => DeployError::rpc(method, message),
            RpcFailure::Node {
                message,
                data: Some(data),
            } => DeployError::rpc(method, format!("{message} (data: {data})")),
            RpcFailure::Node { message, .. } => DeployError::rpc(method, message),
        }
    }
}

/// Log entry as returned by the node.
#[derive(Debug, Deserialize)]
struct RpcLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
}

/// Receipt as returned by `eth_getTransactionReceipt`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    status: u64,
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    gas_used: u64,
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    block_number: u64,
    #[serde(default)]
    contract_address: Option<Address>,
    logs: Vec<RpcLog>,
}

impl From<RpcReceipt> for Receipt {
    fn from(receipt: RpcReceipt) -> Self {
        Self {
            tx_hash: receipt.transaction_hash,
            status: receipt.status == 1,
            gas_used: receipt.gas_used,
            block_number: receipt.block_number,
            contract_address: receipt.contract_address,
            logs: receipt
                .logs
                .into_iter()
                .map(|log| Log {
                    address: log.address,
                    topics: log.topics,
                    data: log.data,
                })
                .collect(),
        }
    }
}

/// Deserialize a u64 from a hex string (with 0x prefix).
fn deserialize_u64_from_hex<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(serde::de::Error::custom)
}

fn parse_hex_u64(method: &str, value: &str) -> Result<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| DeployError::rpc(method, format!("invalid quantity `{value}`: {e}")))
}

fn parse_hex_u128(method: &str, value: &str) -> Result<u128> {
    u128::from_str_radix(value.trim_start_matches("0x"), 16)
        .map_err(|e| DeployError::rpc(method, format!("invalid quantity `{value}`: {e}")))
}

/// [`ChainClient`] over HTTP JSON-RPC.
#[derive(Debug, Clone)]
pub struct JsonRpcChainClient {
    client: reqwest::Client,
    url: Url,
    sender: Address,
    poll_interval: Duration,
    max_retries: usize,
}

impl JsonRpcChainClient {
    pub fn new(url: Url, sender: Address, poll_interval: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| DeployError::rpc("client", e))?;
        Ok(Self {
            client,
            url,
            sender,
            poll_interval,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Make a JSON-RPC call and deserialize the result.
    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> std::result::Result<T, RpcFailure> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": 1
            }))
            .send()
            .await
            .map_err(|e| RpcFailure::Transport(format!("failed to send request: {e}")))?;

        let result: Value = response
            .json()
            .await
            .map_err(|e| RpcFailure::Transport(format!("failed to parse response: {e}")))?;

        if let Some(error) = result.get("error") {
            return Err(RpcFailure::Node {
                message: error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                data: error.get("data").cloned(),
            });
        }

        let value = result
            .get("result")
            .cloned()
            .ok_or_else(|| RpcFailure::Transport("no result in response".to_string()))?;

        serde_json::from_value(value)
            .map_err(|e| RpcFailure::Transport(format!("failed to deserialize result: {e}")))
    }

    /// Read-only request, retried with backoff on transport failures.
    async fn read<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T> {
        let backoff = ExponentialBuilder::default().with_max_times(self.max_retries);
        let attempt = || {
            let params = params.clone();
            async move { self.request(method, params).await }
        };
        attempt
            .retry(backoff)
            .when(|e| matches!(e, RpcFailure::Transport(_)))
            .notify(|e, dur| {
                tracing::debug!(method, error = ?e, retry_in = ?dur, "RPC read failed, retrying...");
            })
            .await
            .map_err(|e| e.into_error(method))
    }
}

impl ChainClient for JsonRpcChainClient {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn get_transaction_count(&self, address: Address) -> Result<u64> {
        const METHOD: &str = "eth_getTransactionCount";
        let count: String = self
            .read(METHOD, vec![json!(address), json!("pending")])
            .await?;
        parse_hex_u64(METHOD, &count)
    }

    async fn get_code(&self, address: Address) -> Result<Bytes> {
        self.read("eth_getCode", vec![json!(address), json!("latest")])
            .await
    }

    async fn send_transaction(&self, tx: TxRequest) -> Result<PendingTx> {
        const METHOD: &str = "eth_sendTransaction";
        let mut request = json!({
            "from": self.sender,
            "data": tx.data,
            "value": tx.value,
            "nonce": format!("0x{:x}", tx.nonce),
            "gas": format!("0x{:x}", tx.gas_limit),
            "gasPrice": format!("0x{:x}", tx.gas_price),
        });
        if let Some(to) = tx.to {
            request["to"] = json!(to);
        }

        // Never retried: a resend could race the first submission for the nonce.
        let hash: B256 = self
            .request(METHOD, vec![request])
            .await
            .map_err(|e| e.into_error(METHOD))?;

        tracing::debug!(tx_hash = %hash, nonce = tx.nonce, "Transaction submitted");
        Ok(PendingTx {
            hash,
            nonce: tx.nonce,
        })
    }

    async fn wait(&self, pending: &PendingTx) -> Result<Receipt> {
        const METHOD: &str = "eth_getTransactionReceipt";
        loop {
            match self
                .request::<Option<RpcReceipt>>(METHOD, vec![json!(pending.hash)])
                .await
            {
                Ok(Some(receipt)) => return Ok(receipt.into()),
                Ok(None) => {
                    tracing::trace!(tx_hash = %pending.hash, "Receipt not available yet");
                }
                Err(RpcFailure::Transport(e)) => {
                    tracing::debug!(tx_hash = %pending.hash, error = %e, "Receipt poll failed, retrying...");
                }
                Err(e) => return Err(e.into_error(METHOD)),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn get_gas_price(&self) -> Result<u128> {
        const METHOD: &str = "eth_gasPrice";
        let price: String = self.read(METHOD, vec![]).await?;
        parse_hex_u128(METHOD, &price)
    }

    async fn call(&self, call: CallRequest) -> Result<Bytes> {
        const METHOD: &str = "eth_call";
        let mut request = json!({
            "to": call.to,
            "data": call.data,
        });
        if let Some(from) = call.from {
            request["from"] = json!(from);
        }
        // Reverts are answers, not transport failures, so they are not retried.
        self.read(METHOD, vec![request, json!("latest")]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_deserialization() {
        let raw = json!({
            "transactionHash": "0x0000000000000000000000000000000000000000000000000000000000000abc",
            "status": "0x1",
            "gasUsed": "0x5208",
            "blockNumber": "0x10",
            "contractAddress": null,
            "logs": [{
                "address": "0x00000000000000000000000000000000000000aa",
                "topics": ["0x00000000000000000000000000000000000000000000000000000000000000ff"],
                "data": "0x"
            }]
        });

        let receipt: Receipt = serde_json::from_value::<RpcReceipt>(raw).unwrap().into();
        assert!(receipt.status);
        assert_eq!(receipt.gas_used, 21_000);
        assert_eq!(receipt.block_number, 16);
        assert_eq!(receipt.contract_address, None);
        assert_eq!(receipt.logs.len(), 1);
        assert_eq!(receipt.logs[0].topics[0], B256::with_last_byte(0xff));
    }

    #[test]
    fn test_failed_receipt_status() {
        let raw = json!({
            "transactionHash": "0x0000000000000000000000000000000000000000000000000000000000000abc",
            "status": "0x0",
            "gasUsed": "0x0",
            "blockNumber": "0x1",
            "logs": []
        });
        let receipt: Receipt = serde_json::from_value::<RpcReceipt>(raw).unwrap().into();
        assert!(!receipt.status);
    }

    #[test]
    fn test_parse_quantities() {
        assert_eq!(parse_hex_u64("m", "0x1a").unwrap(), 26);
        assert_eq!(parse_hex_u128("m", "0x3b9aca00").unwrap(), 1_000_000_000);
        assert!(parse_hex_u64("m", "0xzz").is_err());
    }
}
