//! Relayed execution of account operations
//!
//! The owner never sends transactions directly. Deployment and batched
//! account operations are signed locally and submitted to a relay service,
//! which returns an id that can be awaited until the transaction lands.

pub mod http;

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::account::ops::{transfer_op, SafeOperation};
use crate::error::{Error, Result};

pub use http::HttpRelayClient;

/// Relay-side lifecycle of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum RelayState {
    #[serde(rename = "STATE_NEW")]
    New,
    #[serde(rename = "STATE_EXECUTED")]
    Executed,
    #[serde(rename = "STATE_MINED")]
    Mined,
    #[serde(rename = "STATE_CONFIRMED")]
    Confirmed,
    #[serde(rename = "STATE_FAILED")]
    Failed,
    #[serde(rename = "STATE_INVALID")]
    Invalid,
    #[serde(other)]
    Unknown,
}

impl RelayState {
    pub fn is_success(&self) -> bool {
        matches!(self, RelayState::Mined | RelayState::Confirmed)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RelayState::Failed | RelayState::Invalid)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_success() || self.is_failure()
    }
}

/// Status snapshot reported by the relay
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayTransaction {
    #[serde(rename = "transactionID")]
    pub id: String,
    pub state: RelayState,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub error_msg: Option<String>,
}

/// Anything that can report the status of a relay transaction
#[async_trait]
pub trait RelayStatusSource: Send + Sync {
    async fn transaction_status(&self, id: &str) -> Result<RelayTransaction>;
}

/// Awaitable handle to a submitted relay transaction
pub struct TxHandle {
    id: String,
    source: Arc<dyn RelayStatusSource>,
    poll_interval: Duration,
    timeout: Duration,
}

impl std::fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxHandle")
            .field("id", &self.id)
            .field("poll_interval", &self.poll_interval)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TxHandle {
    pub fn new(
        id: String,
        source: Arc<dyn RelayStatusSource>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            source,
            poll_interval,
            timeout,
        }
    }

    /// Relay transaction id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for a terminal state and return the on-chain transaction hash.
    ///
    /// Running out of time yields `RelayTimeout`: the transaction may still
    /// land, so callers must re-read chain state instead of resubmitting.
    pub async fn wait(&self) -> Result<B256> {
        match tokio::time::timeout(self.timeout, self.poll()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Relay transaction {} not terminal after {:?}",
                    self.id, self.timeout
                );
                Err(Error::RelayTimeout {
                    id: self.id.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn poll(&self) -> Result<B256> {
        loop {
            match self.source.transaction_status(&self.id).await {
                Ok(tx) if tx.state.is_success() => {
                    let hash = tx.transaction_hash.ok_or_else(|| {
                        Error::Relay(format!("Transaction {} mined without a hash", self.id))
                    })?;
                    let hash = B256::from_str(&hash)
                        .map_err(|e| Error::Deserialization(format!("transaction hash: {}", e)))?;
                    info!("Relay transaction {} landed: {}", self.id, hash);
                    return Ok(hash);
                }
                Ok(tx) if tx.state.is_failure() => {
                    let reason = tx
                        .error_msg
                        .unwrap_or_else(|| format!("{:?}", tx.state));
                    return Err(Error::OnChainRevert(format!("{}: {}", self.id, reason)));
                }
                Ok(tx) => debug!("Relay transaction {} is {:?}", self.id, tx.state),
                Err(e) if e.is_retryable() => {
                    warn!("Status poll for {} failed, retrying: {}", self.id, e)
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Relayed execution for an owner's account
#[async_trait]
pub trait RelayExecutor: Send + Sync {
    /// Submit deployment of the account
    async fn deploy(&self, account: Address) -> Result<TxHandle>;

    /// Submit a batch of operations as one atomic transaction
    async fn execute(&self, account: Address, ops: Vec<SafeOperation>) -> Result<TxHandle>;

    /// Whether the account contract exists on-chain
    async fn is_deployed(&self, account: Address) -> Result<bool>;

    /// Transfer settlement tokens out of the account
    async fn transfer(
        &self,
        account: Address,
        token: Address,
        to: Address,
        amount: U256,
    ) -> Result<TxHandle> {
        info!("Transferring {} raw units of {} to {}", amount, token, to);
        self.execute(account, vec![transfer_op(token, to, amount)])
            .await
    }
}
