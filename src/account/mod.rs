//! Owner-side account capabilities
//!
//! Signing, operation building, approval checks and credential handling for
//! the deterministic smart account bound to an owner key.

pub mod approvals;
pub mod credentials;
pub mod execution;
pub mod ops;
pub mod signer;
pub mod store;

pub use approvals::{ApprovalChecker, ApprovalPolicy, ApprovalSet};
pub use credentials::{Credential, CredentialApi, CredentialIssuer, HttpCredentialApi, SignerProof};
pub use execution::ExecutionClient;
pub use ops::{OperationKind, SafeOperation};
pub use signer::{LocalKeySigner, OwnerSigner, SerializedSigner};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
