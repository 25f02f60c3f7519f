//! Relay service client over its JSON API

use alloy::primitives::{Address, U256};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::account::ops::{
    aggregate, create_proxy_hash, pack_eth_sign_signature, pack_signature, safe_tx_hash,
    SafeOperation,
};
use crate::account::signer::OwnerSigner;
use crate::chain::abi::{decode_uint, nonceCall};
use crate::chain::{ChainReader, FactoryParams};
use crate::config::RelayConfig;
use crate::error::{Error, Result};

use super::{RelayExecutor, RelayStatusSource, RelayTransaction, TxHandle};

const ZERO: &str = "0x0000000000000000000000000000000000000000";

/// Submission payload for `POST /submit`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub from: String,
    pub to: String,
    pub proxy_wallet: String,
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub signature: String,
    pub signature_params: SignatureParams,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Parameters the relay needs to rebuild the signed payload
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SignatureParams {
    #[serde(rename_all = "camelCase")]
    Create {
        payment_token: String,
        payment: String,
        payment_receiver: String,
    },
    #[serde(rename_all = "camelCase")]
    Safe {
        gas_price: String,
        operation: String,
        safe_txn_gas: String,
        base_gas: String,
        gas_token: String,
        refund_receiver: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    #[serde(rename = "transactionID")]
    transaction_id: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeployedResponse {
    deployed: bool,
}

/// Read side of the relay API, shared with outstanding `TxHandle`s
struct RelayApi {
    client: Client,
    base_url: String,
    retry_base_delay: Duration,
    retry_max_elapsed: Duration,
}

impl RelayApi {
    fn new(config: &RelayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.confirm_timeout_ms.min(30_000)))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            retry_max_elapsed: Duration::from_millis(config.retry_max_elapsed_ms),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let backoff = ExponentialBackoff {
            initial_interval: self.retry_base_delay,
            max_interval: self.retry_base_delay * 4,
            max_elapsed_time: Some(self.retry_max_elapsed),
            ..Default::default()
        };

        retry(backoff, || async {
            match self.get_once::<T>(path, query).await {
                Ok(body) => Ok(body),
                Err(e) if e.is_retryable() => {
                    warn!("Retryable relay error on {}: {}", path, e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    async fn get_once<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .send()
            .await
            .map_err(|e| Error::Relay(format!("GET {} failed: {}", path, e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::Relay(format!("GET {} returned HTTP {}", path, status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::InvalidInput(format!(
                "Relay rejected GET {} (HTTP {}): {}",
                path, status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Deserialization(format!("Failed to parse {} response: {}", path, e)))
    }

    /// Submission is sent once; a lost response must not cause a second submit
    async fn submit(&self, request: &SubmitRequest) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/submit", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Relay(format!("Submit failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Relay(format!("Submit returned HTTP {}: {}", status, body)));
        }

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| Error::Deserialization(format!("Failed to parse submit response: {}", e)))?;

        if let Some(error) = body.error {
            return Err(Error::Relay(error));
        }

        let id = body
            .transaction_id
            .ok_or_else(|| Error::Relay("No transaction id in submit response".to_string()))?;

        debug!("Relay accepted {} ({:?})", id, body.state);
        Ok(id)
    }
}

#[async_trait]
impl RelayStatusSource for RelayApi {
    async fn transaction_status(&self, id: &str) -> Result<RelayTransaction> {
        let mut txs: Vec<RelayTransaction> = self
            .get("/transaction", &[("id", id.to_string())])
            .await?;

        txs.pop()
            .ok_or_else(|| Error::Relay(format!("Relay does not know transaction {}", id)))
    }
}

/// Relay client that signs with the owner key and submits over HTTP
pub struct HttpRelayClient {
    api: Arc<RelayApi>,
    signer: Arc<dyn OwnerSigner>,
    reader: Arc<dyn ChainReader>,
    chain_id: u64,
    factory: FactoryParams,
    factory_domain_name: String,
    multisend: Address,
    poll_interval: Duration,
    confirm_timeout: Duration,
}

impl HttpRelayClient {
    /// `signer` should be the session's shared `SerializedSigner`
    pub fn new(
        config: &RelayConfig,
        chain_id: u64,
        factory: FactoryParams,
        factory_domain_name: &str,
        multisend: Address,
        signer: Arc<dyn OwnerSigner>,
        reader: Arc<dyn ChainReader>,
    ) -> Result<Self> {
        Ok(Self {
            api: Arc::new(RelayApi::new(config)?),
            signer,
            reader,
            chain_id,
            factory,
            factory_domain_name: factory_domain_name.to_string(),
            multisend,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            confirm_timeout: Duration::from_millis(config.confirm_timeout_ms),
        })
    }

    fn handle(&self, id: String) -> TxHandle {
        TxHandle::new(id, self.api.clone(), self.poll_interval, self.confirm_timeout)
    }

    fn check_account(&self, account: Address) -> Result<Address> {
        let owner = self.signer.address();
        let expected = self.factory.account_for(owner);
        if account != expected {
            return Err(Error::InvalidInput(format!(
                "Account {} does not belong to owner {} (expected {})",
                account, owner, expected
            )));
        }
        Ok(owner)
    }

    /// Signed deployment request for the owner's account
    pub async fn create_request(&self, account: Address) -> Result<SubmitRequest> {
        let owner = self.check_account(account)?;
        let hash = create_proxy_hash(self.chain_id, self.factory.factory, &self.factory_domain_name);
        let signature = self.signer.sign_hash(hash).await?;

        Ok(SubmitRequest {
            from: owner.to_string(),
            to: self.factory.factory.to_string(),
            proxy_wallet: account.to_string(),
            data: "0x".to_string(),
            nonce: None,
            signature: pack_signature(&signature).to_string(),
            signature_params: SignatureParams::Create {
                payment_token: ZERO.to_string(),
                payment: "0".to_string(),
                payment_receiver: ZERO.to_string(),
            },
            kind: "SAFE-CREATE".to_string(),
        })
    }

    /// Signed execution request for a batch of operations
    pub async fn safe_request(
        &self,
        account: Address,
        ops: &[SafeOperation],
    ) -> Result<SubmitRequest> {
        let owner = self.check_account(account)?;
        let op = aggregate(ops, self.multisend)?;
        let nonce = self.account_nonce(account).await?;

        let hash = safe_tx_hash(self.chain_id, account, &op, nonce);
        let signature = self.signer.sign_message(hash.as_slice()).await?;

        Ok(SubmitRequest {
            from: owner.to_string(),
            to: op.to.to_string(),
            proxy_wallet: account.to_string(),
            data: op.data.to_string(),
            nonce: Some(nonce.to_string()),
            signature: pack_eth_sign_signature(&signature).to_string(),
            signature_params: SignatureParams::Safe {
                gas_price: "0".to_string(),
                operation: op.kind.as_u8().to_string(),
                safe_txn_gas: "0".to_string(),
                base_gas: "0".to_string(),
                gas_token: ZERO.to_string(),
                refund_receiver: ZERO.to_string(),
            },
            kind: "SAFE".to_string(),
        })
    }

    async fn account_nonce(&self, account: Address) -> Result<U256> {
        let ret = self
            .reader
            .call(account, nonceCall {}.abi_encode().into())
            .await?;
        decode_uint(&ret)
    }
}

/// Round-trip latency to the relay, without retries.
///
/// Needs no signer, so it can run before an owner key is configured.
pub async fn health_check(config: &RelayConfig) -> Result<Duration> {
    let api = RelayApi::new(config)?;
    let start = std::time::Instant::now();
    let _: DeployedResponse = api
        .get_once("/deployed", &[("address", ZERO.to_string())])
        .await?;
    Ok(start.elapsed())
}

#[async_trait]
impl RelayExecutor for HttpRelayClient {
    async fn deploy(&self, account: Address) -> Result<TxHandle> {
        let request = self.create_request(account).await?;
        info!("Submitting deployment of {}", account);
        let id = self.api.submit(&request).await?;
        Ok(self.handle(id))
    }

    async fn execute(&self, account: Address, ops: Vec<SafeOperation>) -> Result<TxHandle> {
        let request = self.safe_request(account, &ops).await?;
        info!("Submitting {} operation(s) for {}", ops.len(), account);
        let id = self.api.submit(&request).await?;
        Ok(self.handle(id))
    }

    async fn is_deployed(&self, account: Address) -> Result<bool> {
        let body: DeployedResponse = self
            .api
            .get("/deployed", &[("address", account.to_string())])
            .await?;
        debug!("Account {} deployed: {}", account, body.deployed);
        Ok(body.deployed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::ops::{approval_ops, transfer_op, OperationKind};
    use crate::account::signer::LocalKeySigner;
    use crate::config::Config;
    use crate::testing::{MockChain, DEV_KEY};
    use alloy::primitives::{address, b256, Bytes, Signature};
    use std::str::FromStr;

    const TOKEN: Address = address!("3c499c542cEF5E3811e1192ce70d8cC03d5c3359");
    const POSITIONS: Address = address!("4D97DCd97eC945f40cF65F87097ACe5EA0476045");
    const ACCOUNT: Address = address!("d93B25cb943D14d0d34FBaF01Fc93a0f8b5F6E47");
    const DEAD: Address = address!("000000000000000000000000000000000000dEaD");

    fn client(chain: Arc<MockChain>) -> HttpRelayClient {
        let config = Config::default();
        let signer = Arc::new(LocalKeySigner::from_hex(DEV_KEY, 137).unwrap());
        HttpRelayClient::new(
            &config.relay,
            137,
            FactoryParams::from_config(&config.factory).unwrap(),
            &config.factory.domain_name,
            address!("A238CBeb142c10Ef7Ad8442C6D1f9E89e07e7761"),
            signer,
            chain,
        )
        .unwrap()
    }

    fn recover(signature: &str, prehash: alloy::primitives::B256) -> Address {
        let mut bytes = Bytes::from_str(signature).unwrap().to_vec();
        bytes[64] -= 4;
        let signature = Signature::from_raw(&bytes).unwrap();
        signature.recover_address_from_msg(prehash.as_slice()).unwrap()
    }

    #[tokio::test]
    async fn test_health_check_reports_unreachable_relay() {
        let mut config = Config::default().relay;
        config.url = "http://127.0.0.1:1".to_string();

        let err = health_check(&config).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NetworkError);
    }

    #[tokio::test]
    async fn test_single_transfer_request_is_signed_at_current_nonce() {
        let chain = Arc::new(MockChain::new(137));
        chain.set_nonce(ACCOUNT, 7);
        let relay = client(chain);

        let op = transfer_op(TOKEN, DEAD, U256::from(5_000_000u64));
        let request = relay.safe_request(ACCOUNT, &[op]).await.unwrap();

        assert_eq!(request.kind, "SAFE");
        assert_eq!(request.nonce.as_deref(), Some("7"));
        assert_eq!(Address::from_str(&request.to).unwrap(), TOKEN);

        let expected = b256!("4a9dd33a8dc6cc035e28e9e3e41d8dd07ac205385961ebc308523bb6c4f1b48e");
        let v = Bytes::from_str(&request.signature).unwrap()[64];
        assert!(v == 31 || v == 32);
        assert_eq!(
            recover(&request.signature, expected),
            address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
        );
    }

    #[tokio::test]
    async fn test_batch_goes_through_multisend() {
        let chain = Arc::new(MockChain::new(137));
        let relay = client(chain);

        let ops = approval_ops(TOKEN, POSITIONS, &[DEAD], &[DEAD]);
        let request = relay.safe_request(ACCOUNT, &ops).await.unwrap();

        assert_eq!(
            Address::from_str(&request.to).unwrap(),
            address!("A238CBeb142c10Ef7Ad8442C6D1f9E89e07e7761")
        );
        match request.signature_params {
            SignatureParams::Safe { operation, .. } => {
                assert_eq!(operation, OperationKind::DelegateCall.as_u8().to_string())
            }
            other => panic!("unexpected params {:?}", other),
        }
        assert_eq!(request.nonce.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_create_request_signs_factory_payload() {
        let chain = Arc::new(MockChain::new(137));
        let relay = client(chain);

        let request = relay.create_request(ACCOUNT).await.unwrap();
        assert_eq!(request.kind, "SAFE-CREATE");
        assert!(request.nonce.is_none());

        let expected = b256!("563ac315294c5be01ab1f3b04a5abdfa39e8317a9d90679d4e63caf760b126a4");
        let bytes = Bytes::from_str(&request.signature).unwrap();
        let signature = Signature::from_raw(&bytes).unwrap();
        assert_eq!(
            signature.recover_address_from_prehash(&expected).unwrap(),
            address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
        );

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "SAFE-CREATE");
        assert_eq!(json["signatureParams"]["payment"], "0");
        assert_eq!(json["proxyWallet"], ACCOUNT.to_string());
    }

    #[tokio::test]
    async fn test_rejects_foreign_account() {
        let chain = Arc::new(MockChain::new(137));
        let relay = client(chain);

        let err = relay.create_request(DEAD).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_nonce_read_failure_surfaces() {
        let chain = Arc::new(MockChain::new(137));
        chain.fail_calls(true);
        let relay = client(chain);

        let op = transfer_op(TOKEN, DEAD, U256::from(1u64));
        assert!(relay.safe_request(ACCOUNT, &[op]).await.unwrap_err().is_retryable());
    }
}
