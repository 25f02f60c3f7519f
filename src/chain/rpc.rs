//! JSON-RPC node access
//!
//! Only the three reads the subsystem needs: chain id, `eth_call`, and
//! transaction receipts. Transient failures are retried with exponential
//! backoff; everything else surfaces immediately.

use alloy::primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::NetworkConfig;
use crate::error::{Error, Result};

/// A log entry from a transaction receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// The parts of a transaction receipt the payment verifier inspects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    pub success: bool,
    pub logs: Vec<Log>,
}

/// Read-only chain access
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Chain id reported by the node
    async fn chain_id(&self) -> Result<u64>;

    /// `eth_call` against the latest block
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;

    /// Receipt for a mined transaction, `None` if unknown or still pending
    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<TransactionReceipt>>;
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: String,
    topics: Vec<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: String,
    status: Option<String>,
    #[serde(default)]
    logs: Vec<RawLog>,
}

impl RawReceipt {
    fn into_receipt(self) -> Result<TransactionReceipt> {
        let transaction_hash = B256::from_str(&self.transaction_hash)
            .map_err(|e| Error::Deserialization(format!("receipt hash: {}", e)))?;

        // Pre-Byzantium receipts carry no status; treat them as unsuccessful
        let success = matches!(self.status.as_deref(), Some("0x1") | Some("0x01"));

        let logs = self
            .logs
            .into_iter()
            .map(|raw| {
                let address = Address::from_str(&raw.address.to_ascii_lowercase())
                    .map_err(|e| Error::Deserialization(format!("log address: {}", e)))?;
                let topics = raw
                    .topics
                    .iter()
                    .map(|t| B256::from_str(t))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| Error::Deserialization(format!("log topic: {}", e)))?;
                let data = Bytes::from_str(&raw.data)
                    .map_err(|e| Error::Deserialization(format!("log data: {}", e)))?;
                Ok(Log {
                    address,
                    topics,
                    data,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(TransactionReceipt {
            transaction_hash,
            success,
            logs,
        })
    }
}

/// JSON-RPC client over HTTP
pub struct HttpRpcClient {
    client: Client,
    endpoint: String,
    timeout_ms: u64,
    max_retries: u32,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    /// Create a new RPC client
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.rpc_url.clone(),
            timeout_ms: config.timeout_ms,
            max_retries: config.max_retries,
            next_id: AtomicU64::new(1),
        })
    }

    /// Issue a request, retrying transient failures
    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>> {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(1_000),
            max_elapsed_time: Some(Duration::from_millis(
                self.timeout_ms * (self.max_retries as u64 + 1),
            )),
            ..Default::default()
        };

        retry(backoff, || async {
            match self.request_once::<T>(method, params.clone()).await {
                Ok(result) => Ok(result),
                Err(e) if e.is_retryable() => {
                    warn!("Retryable RPC error on {}: {}", method, e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    /// Single request attempt
    async fn request_once<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        debug!("RPC {} -> {}", method, self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::RpcTimeout(self.timeout_ms)
                } else {
                    Error::Rpc(format!("HTTP request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            return Err(Error::Rpc(format!(
                "{} returned HTTP {}",
                method,
                response.status()
            )));
        }

        let body: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| Error::Deserialization(format!("Failed to parse {} response: {}", method, e)))?;

        if let Some(err) = body.error {
            return Err(Error::Rpc(format!("{} failed ({}): {}", method, err.code, err.message)));
        }

        Ok(body.result)
    }
}

#[async_trait]
impl ChainReader for HttpRpcClient {
    async fn chain_id(&self) -> Result<u64> {
        let hex: String = self
            .request("eth_chainId", serde_json::json!([]))
            .await?
            .ok_or_else(|| Error::Rpc("eth_chainId returned null".to_string()))?;

        u64::from_str_radix(hex.trim_start_matches("0x"), 16)
            .map_err(|e| Error::Deserialization(format!("Invalid chain id {}: {}", hex, e)))
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let params = serde_json::json!([
            { "to": to.to_string(), "data": data.to_string() },
            "latest"
        ]);

        let hex: String = self
            .request("eth_call", params)
            .await?
            .ok_or_else(|| Error::Rpc("eth_call returned null".to_string()))?;

        Bytes::from_str(&hex)
            .map_err(|e| Error::Deserialization(format!("Invalid eth_call result: {}", e)))
    }

    async fn transaction_receipt(&self, tx_hash: B256) -> Result<Option<TransactionReceipt>> {
        let raw: Option<RawReceipt> = self
            .request("eth_getTransactionReceipt", serde_json::json!([tx_hash.to_string()]))
            .await?;

        raw.map(RawReceipt::into_receipt).transpose()
    }
}
