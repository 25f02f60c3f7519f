//! API credential issuance
//!
//! A credential is bound to the owner key. The issuing API can re-derive an
//! existing credential from a fresh signer proof, so the derive path is tried
//! first and creation is only the fallback.

use alloy::primitives::{hex, Address, U256};
use alloy::sol_types::eip712_domain;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chain::abi::clob_auth_signing_hash;
use crate::error::{Error, Result};

use super::signer::OwnerSigner;

/// Fixed attestation text signed in every proof
pub const AUTH_MESSAGE: &str = "This message attests that I control the given wallet";

/// Opaque API credential triple
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("api_key", &self.api_key)
            .field("secret", &"***")
            .field("passphrase", &"***")
            .finish()
    }
}

/// Signed statement that the caller controls the owner key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerProof {
    pub address: Address,
    pub signature: String,
    pub timestamp: String,
    pub nonce: u64,
}

impl SignerProof {
    /// Sign a fresh proof for the current time
    pub async fn sign(signer: &dyn OwnerSigner, chain_id: u64, nonce: u64) -> Result<Self> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        Self::sign_at(signer, chain_id, nonce, timestamp).await
    }

    pub async fn sign_at(
        signer: &dyn OwnerSigner,
        chain_id: u64,
        nonce: u64,
        timestamp: String,
    ) -> Result<Self> {
        let domain = eip712_domain! {
            name: "ClobAuthDomain",
            version: "1",
            chain_id: chain_id,
        };
        let address = signer.address();
        let hash = clob_auth_signing_hash(&domain, address, &timestamp, U256::from(nonce), AUTH_MESSAGE);
        let signature = signer.sign_hash(hash).await?;

        Ok(Self {
            address,
            signature: hex::encode_prefixed(signature.as_bytes()),
            timestamp,
            nonce,
        })
    }

    /// Attach the proof headers to a request
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("POLY_ADDRESS", self.address.to_string())
            .header("POLY_SIGNATURE", &self.signature)
            .header("POLY_TIMESTAMP", &self.timestamp)
            .header("POLY_NONCE", self.nonce.to_string())
    }
}

/// Credential-issuing service
#[async_trait]
pub trait CredentialApi: Send + Sync {
    /// Re-derive a previously issued credential
    async fn derive(&self, proof: &SignerProof) -> Result<Credential>;

    /// Issue a new credential
    async fn create(&self, proof: &SignerProof) -> Result<Credential>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialResponse {
    api_key: Option<String>,
    secret: Option<String>,
    passphrase: Option<String>,
    error: Option<String>,
}

impl CredentialResponse {
    fn into_credential(self) -> Result<Credential> {
        if let Some(error) = self.error {
            return Err(Error::CredentialApi(error));
        }
        match (self.api_key, self.secret, self.passphrase) {
            (Some(api_key), Some(secret), Some(passphrase)) => Ok(Credential {
                api_key,
                secret,
                passphrase,
            }),
            _ => Err(Error::CredentialApi(
                "Incomplete credential in response".to_string(),
            )),
        }
    }
}

/// HTTP client for the credential-issuing API
pub struct HttpCredentialApi {
    client: Client,
    base_url: String,
}

impl HttpCredentialApi {
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Credential> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::CredentialApi(format!("{} request failed: {}", what, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::CredentialApi(format!(
                "{} returned HTTP {}: {}",
                what, status, body
            )));
        }

        let body: CredentialResponse = response
            .json()
            .await
            .map_err(|e| Error::Deserialization(format!("Failed to parse {} response: {}", what, e)))?;

        body.into_credential()
    }
}

#[async_trait]
impl CredentialApi for HttpCredentialApi {
    async fn derive(&self, proof: &SignerProof) -> Result<Credential> {
        let url = format!("{}/auth/derive-api-key", self.base_url);
        debug!("Deriving credential for {}", proof.address);
        self.send(proof.apply(self.client.get(url)), "derive").await
    }

    async fn create(&self, proof: &SignerProof) -> Result<Credential> {
        let url = format!("{}/auth/api-key", self.base_url);
        debug!("Creating credential for {}", proof.address);
        self.send(proof.apply(self.client.post(url)), "create").await
    }
}

/// Derive-or-create credential flow
pub struct CredentialIssuer {
    api: Arc<dyn CredentialApi>,
    chain_id: u64,
    nonce: u64,
}

impl CredentialIssuer {
    pub fn new(api: Arc<dyn CredentialApi>, chain_id: u64, nonce: u64) -> Self {
        Self {
            api,
            chain_id,
            nonce,
        }
    }

    /// Obtain the owner's credential, deriving an existing one when possible.
    ///
    /// A declined signing prompt is returned as is; only API failures on both
    /// paths become `CredentialDerivationFailure`.
    pub async fn obtain(&self, signer: &dyn OwnerSigner) -> Result<Credential> {
        let proof = SignerProof::sign(signer, self.chain_id, self.nonce).await?;

        let derive_err = match self.api.derive(&proof).await {
            Ok(credential) => {
                info!("Derived existing credential for {}", proof.address);
                return Ok(credential);
            }
            Err(e) => e,
        };

        warn!("Credential derivation failed, creating new: {}", derive_err);

        match self.api.create(&proof).await {
            Ok(credential) => {
                info!("Created new credential for {}", proof.address);
                Ok(credential)
            }
            Err(create_err) => Err(Error::CredentialDerivationFailure {
                derive: derive_err.to_string(),
                create: create_err.to_string(),
            }),
        }
    }
}
