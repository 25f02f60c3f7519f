//! Payment and subscription records

use alloy::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Parse a user-supplied transaction id
pub fn parse_tx_id(s: &str) -> Result<B256> {
    let trimmed = s.trim();
    if trimmed.len() != 66 || !trimmed.starts_with("0x") {
        return Err(Error::InvalidInput(format!("Invalid transaction id: {}", s)));
    }
    B256::from_str(trimmed).map_err(|e| Error::InvalidInput(format!("Invalid transaction id {}: {}", s, e)))
}

/// Canonical storage key for a transaction id (lowercase hex)
pub fn tx_key(tx_id: &B256) -> String {
    format!("{:#x}", tx_id)
}

/// A settlement transfer that passed verification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifiedPayment {
    pub tx_id: B256,
    pub amount: f64,
    pub recipient: Address,
    pub payer: Address,
}

/// Credited payment, at most one per transaction id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentRecord {
    pub tx_id: B256,
    pub payer_owner: Address,
    pub amount_paid: f64,
    pub tier_purchased: String,
    pub observed_at: DateTime<Utc>,
}

/// An owner's subscription
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub owner: Address,
    pub tier: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub usage_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.end_date > now
    }

    /// Generations left in the current period
    pub fn remaining(&self, quota: u32) -> u32 {
        quota.saturating_sub(self.usage_count)
    }
}
