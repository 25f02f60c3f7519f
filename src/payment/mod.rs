//! Subscription payments
//!
//! Verification of settlement transfers and replay-safe crediting of the
//! subscription ledger.

pub mod checkout;
pub mod ledger;
pub mod store;
pub mod tiers;
pub mod types;
pub mod verifier;

pub use checkout::Checkout;
pub use ledger::SubscriptionLedger;
pub use store::{LedgerStore, MemoryLedgerStore, SqliteLedgerStore};
pub use tiers::{Tier, TierCatalog};
pub use types::{parse_tx_id, PaymentRecord, Subscription, VerifiedPayment};
pub use verifier::{PaymentVerifier, VerifierConfig};
