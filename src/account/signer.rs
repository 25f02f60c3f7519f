//! Owner signing capability
//!
//! The owner key lives outside this subsystem (browser wallet, hardware
//! device, key file). It is modelled as an injected capability so the session
//! logic never depends on where signatures come from.

use alloy::primitives::{Address, Signature, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Signing capability of the owner identity
#[async_trait]
pub trait OwnerSigner: Send + Sync {
    /// Public address of the owner key
    fn address(&self) -> Address;

    /// Chain the signer is currently connected to
    async fn chain_id(&self) -> Result<u64>;

    /// Ask the signer to move to another chain
    async fn request_chain_switch(&self, chain_id: u64) -> Result<()>;

    /// Sign a 32-byte digest (EIP-712 hashes)
    async fn sign_hash(&self, hash: B256) -> Result<Signature>;

    /// Sign an arbitrary message with the EIP-191 personal-message prefix
    async fn sign_message(&self, message: &[u8]) -> Result<Signature>;
}

/// Signer backed by a private key held in process
pub struct LocalKeySigner {
    inner: PrivateKeySigner,
    chain_id: AtomicU64,
}

impl LocalKeySigner {
    /// Create from a hex-encoded private key
    pub fn from_hex(key: &str, chain_id: u64) -> Result<Self> {
        let inner: PrivateKeySigner = key
            .trim()
            .parse()
            .map_err(|e| Error::InvalidKey(format!("Failed to parse private key: {}", e)))?;

        Ok(Self {
            inner,
            chain_id: AtomicU64::new(chain_id),
        })
    }

    /// Load a hex private key from a file
    ///
    /// Refuses files readable by group or others on Unix.
    pub fn from_key_file(path: &Path, chain_id: u64) -> Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = std::fs::metadata(path)
                .map_err(|e| Error::InvalidKey(format!("Cannot read key file {}: {}", path.display(), e)))?;
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(Error::InsecureKey(format!(
                    "Key file {} has insecure permissions {:o}. Run 'chmod 600 {}'",
                    path.display(),
                    mode & 0o777,
                    path.display()
                )));
            }
        }

        debug!("Loading owner key from: {:?}", path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidKey(format!("Failed to read key file: {}", e)))?;
        let signer = Self::from_hex(&contents, chain_id)?;

        info!("Loaded owner key: {}", signer.address());
        Ok(signer)
    }
}

#[async_trait]
impl OwnerSigner for LocalKeySigner {
    fn address(&self) -> Address {
        self.inner.address()
    }

    async fn chain_id(&self) -> Result<u64> {
        Ok(self.chain_id.load(Ordering::SeqCst))
    }

    async fn request_chain_switch(&self, chain_id: u64) -> Result<()> {
        info!("Local signer switching to chain {}", chain_id);
        self.chain_id.store(chain_id, Ordering::SeqCst);
        Ok(())
    }

    async fn sign_hash(&self, hash: B256) -> Result<Signature> {
        self.inner
            .sign_hash_sync(&hash)
            .map_err(|e| Error::Signer(e.to_string()))
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Signature> {
        self.inner
            .sign_message_sync(message)
            .map_err(|e| Error::Signer(e.to_string()))
    }
}

/// Wraps a signer so that at most one signing request is outstanding.
///
/// Wallets can only show one prompt at a time; every component that signs
/// shares the same `SerializedSigner`.
pub struct SerializedSigner {
    inner: Arc<dyn OwnerSigner>,
    prompt: Mutex<()>,
}

impl SerializedSigner {
    pub fn new(inner: Arc<dyn OwnerSigner>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            prompt: Mutex::new(()),
        })
    }
}

#[async_trait]
impl OwnerSigner for SerializedSigner {
    fn address(&self) -> Address {
        self.inner.address()
    }

    async fn chain_id(&self) -> Result<u64> {
        self.inner.chain_id().await
    }

    async fn request_chain_switch(&self, chain_id: u64) -> Result<()> {
        let _prompt = self.prompt.lock().await;
        self.inner.request_chain_switch(chain_id).await
    }

    async fn sign_hash(&self, hash: B256) -> Result<Signature> {
        let _prompt = self.prompt.lock().await;
        self.inner.sign_hash(hash).await
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Signature> {
        let _prompt = self.prompt.lock().await;
        self.inner.sign_message(message).await
    }
}
