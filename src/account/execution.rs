//! Ready trading client handed out by a completed session

use alloy::primitives::Address;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

use super::credentials::Credential;

type HmacSha256 = Hmac<Sha256>;

/// Orders are signed by the owner key and funded from the account
pub const SIGNATURE_TYPE_ACCOUNT: u8 = 2;

/// Authenticated client for the downstream trading API
#[derive(Debug, Clone)]
pub struct ExecutionClient {
    base_url: String,
    chain_id: u64,
    credential: Credential,
    signer: Address,
    funder: Address,
    signature_type: u8,
}

impl ExecutionClient {
    pub fn new(
        base_url: &str,
        chain_id: u64,
        credential: Credential,
        signer: Address,
        funder: Address,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            chain_id,
            credential,
            signer,
            funder,
            signature_type: SIGNATURE_TYPE_ACCOUNT,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Owner key address
    pub fn signer(&self) -> Address {
        self.signer
    }

    /// Account that holds funds and positions
    pub fn funder(&self) -> Address {
        self.funder
    }

    pub fn signature_type(&self) -> u8 {
        self.signature_type
    }

    /// Authentication headers for a request made now
    pub fn l2_headers(
        &self,
        method: &str,
        path: &str,
        body: Option<&str>,
    ) -> Result<Vec<(&'static str, String)>> {
        self.l2_headers_at(chrono::Utc::now().timestamp(), method, path, body)
    }

    /// Authentication headers for a request made at `timestamp` (unix seconds)
    pub fn l2_headers_at(
        &self,
        timestamp: i64,
        method: &str,
        path: &str,
        body: Option<&str>,
    ) -> Result<Vec<(&'static str, String)>> {
        let timestamp = timestamp.to_string();
        let signature = self.sign_request(&timestamp, method, path, body)?;

        Ok(vec![
            ("POLY_ADDRESS", self.signer.to_string()),
            ("POLY_SIGNATURE", signature),
            ("POLY_TIMESTAMP", timestamp),
            ("POLY_API_KEY", self.credential.api_key.clone()),
            ("POLY_PASSPHRASE", self.credential.passphrase.clone()),
        ])
    }

    /// URL-safe base64 HMAC-SHA256 over `timestamp ‖ method ‖ path ‖ body`
    fn sign_request(
        &self,
        timestamp: &str,
        method: &str,
        path: &str,
        body: Option<&str>,
    ) -> Result<String> {
        let key = URL_SAFE
            .decode(&self.credential.secret)
            .or_else(|_| STANDARD.decode(&self.credential.secret))
            .map_err(|e| Error::InvalidInput(format!("Credential secret is not base64: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| Error::Internal(format!("HMAC key rejected: {}", e)))?;
        mac.update(timestamp.as_bytes());
        mac.update(method.to_ascii_uppercase().as_bytes());
        mac.update(path.as_bytes());
        if let Some(body) = body {
            mac.update(body.as_bytes());
        }

        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }
}
