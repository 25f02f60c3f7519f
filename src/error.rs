//! Error types for account sessions and payment crediting

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error categories surfaced to callers and the CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NetworkError,
    SignatureRejected,
    OnChainRevert,
    CredentialDerivationFailure,
    WrongNetwork,
    TransactionFailed,
    NoTransferFound,
    MalformedLog,
    WrongRecipient,
    AmountMismatch,
    ReplayedPayment,
    PersistenceError,
    Subscription,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::SignatureRejected => "signature_rejected",
            ErrorKind::OnChainRevert => "on_chain_revert",
            ErrorKind::CredentialDerivationFailure => "credential_derivation_failure",
            ErrorKind::WrongNetwork => "wrong_network",
            ErrorKind::TransactionFailed => "transaction_failed",
            ErrorKind::NoTransferFound => "no_transfer_found",
            ErrorKind::MalformedLog => "malformed_log",
            ErrorKind::WrongRecipient => "wrong_recipient",
            ErrorKind::AmountMismatch => "amount_mismatch",
            ErrorKind::ReplayedPayment => "replayed_payment",
            ErrorKind::PersistenceError => "persistence_error",
            ErrorKind::Subscription => "subscription",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// Main error type for the session and payment subsystem
#[derive(Error, Debug)]
pub enum Error {
    // Input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Insecure key file permissions: {0}")]
    InsecureKey(String),

    // Network errors
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC timeout after {0}ms")]
    RpcTimeout(u64),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error(
        "Relay transaction {id} not confirmed after {timeout_ms}ms; it may still land, re-check on-chain state before retrying"
    )]
    RelayTimeout { id: String, timeout_ms: u64 },

    #[error("No receipt for {tx_id} after {timeout_ms}ms; the RPC node may be lagging, retry verification later")]
    ReceiptTimeout { tx_id: String, timeout_ms: u64 },

    #[error("Credential API error: {0}")]
    CredentialApi(String),

    // Signer errors
    #[error("Signature rejected: {0}")]
    SignatureRejected(String),

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Wrong network: signer is on chain {actual}, expected chain {expected}; switch requested")]
    WrongNetwork { expected: u64, actual: u64 },

    // On-chain errors
    #[error("Transaction reverted on-chain: {0}")]
    OnChainRevert(String),

    #[error("Credential derivation failed (derive: {derive}; create: {create})")]
    CredentialDerivationFailure { derive: String, create: String },

    // Payment verification rejections
    #[error("Transaction {0} is missing or did not succeed")]
    TransactionFailed(String),

    #[error("No settlement token transfer found in transaction {0}")]
    NoTransferFound(String),

    #[error("Malformed transfer log in transaction {tx_id}: {reason}")]
    MalformedLog { tx_id: String, reason: String },

    #[error("Payment sent to {actual}, expected {expected}")]
    WrongRecipient { expected: String, actual: String },

    #[error("Payment amount mismatch: expected {expected}, got {actual}")]
    AmountMismatch { expected: f64, actual: f64 },

    // Ledger errors
    #[error("Payment {0} has already been processed")]
    ReplayedPayment(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Unknown tier: {0}")]
    UnknownTier(String),

    #[error("No subscription for {0}")]
    NoSubscription(String),

    #[error("Subscription for {0} has expired")]
    SubscriptionExpired(String),

    #[error("Usage quota exhausted: {used}/{quota} generations used")]
    QuotaExhausted { used: u32, quota: u32 },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Map this error onto its caller-facing category
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_)
            | Error::Config(_)
            | Error::InvalidKey(_)
            | Error::InsecureKey(_)
            | Error::UnknownTier(_) => ErrorKind::InvalidInput,
            Error::Rpc(_)
            | Error::RpcTimeout(_)
            | Error::Relay(_)
            | Error::RelayTimeout { .. }
            | Error::ReceiptTimeout { .. }
            | Error::CredentialApi(_) => ErrorKind::NetworkError,
            Error::SignatureRejected(_) => ErrorKind::SignatureRejected,
            Error::WrongNetwork { .. } => ErrorKind::WrongNetwork,
            Error::OnChainRevert(_) => ErrorKind::OnChainRevert,
            Error::CredentialDerivationFailure { .. } => ErrorKind::CredentialDerivationFailure,
            Error::TransactionFailed(_) => ErrorKind::TransactionFailed,
            Error::NoTransferFound(_) => ErrorKind::NoTransferFound,
            Error::MalformedLog { .. } => ErrorKind::MalformedLog,
            Error::WrongRecipient { .. } => ErrorKind::WrongRecipient,
            Error::AmountMismatch { .. } => ErrorKind::AmountMismatch,
            Error::ReplayedPayment(_) => ErrorKind::ReplayedPayment,
            Error::Persistence(_) => ErrorKind::PersistenceError,
            Error::NoSubscription(_)
            | Error::SubscriptionExpired(_)
            | Error::QuotaExhausted { .. } => ErrorKind::Subscription,
            Error::Signer(_)
            | Error::Serialization(_)
            | Error::Deserialization(_)
            | Error::Io(_)
            | Error::Internal(_)
            | Error::Anyhow(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::NetworkError
    }

    /// Check if this error permanently rejects a payment transaction id
    pub fn is_permanent_payment_rejection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransactionFailed
                | ErrorKind::NoTransferFound
                | ErrorKind::MalformedLog
                | ErrorKind::WrongRecipient
                | ErrorKind::AmountMismatch
                | ErrorKind::ReplayedPayment
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::Deserialization(e.to_string())
        } else {
            Error::Rpc(e.to_string())
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors_are_retryable() {
        assert!(Error::Rpc("down".into()).is_retryable());
        assert!(Error::RelayTimeout {
            id: "abc".into(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(!Error::ReplayedPayment("0x1".into()).is_retryable());
        assert!(!Error::SignatureRejected("user said no".into()).is_retryable());
    }

    #[test]
    fn test_replay_is_distinct_from_invalid_payment() {
        let replay = Error::ReplayedPayment("0x1".into());
        let mismatch = Error::AmountMismatch {
            expected: 5.0,
            actual: 4.0,
        };
        assert_eq!(replay.kind(), ErrorKind::ReplayedPayment);
        assert_eq!(mismatch.kind(), ErrorKind::AmountMismatch);
        assert!(replay.is_permanent_payment_rejection());
        assert!(mismatch.is_permanent_payment_rejection());
        assert!(!Error::Persistence("disk full".into()).is_permanent_payment_rejection());
    }
}
