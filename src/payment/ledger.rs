//! Subscription crediting
//!
//! Turns verified payments into subscription time. Renewals extend from the
//! end of the current period when it is still running, so paying early never
//! loses days.

use alloy::primitives::{Address, B256};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};

use super::store::LedgerStore;
use super::tiers::{Tier, TierCatalog};
use super::types::{tx_key, PaymentRecord, Subscription, VerifiedPayment};

pub struct SubscriptionLedger {
    store: Arc<dyn LedgerStore>,
    tiers: TierCatalog,
    period: Duration,
}

impl SubscriptionLedger {
    pub fn new(store: Arc<dyn LedgerStore>, tiers: TierCatalog, renewal_days: i64) -> Self {
        Self {
            store,
            tiers,
            period: Duration::days(renewal_days),
        }
    }

    pub fn tiers(&self) -> &TierCatalog {
        &self.tiers
    }

    /// Credit a verified payment to `owner` as a purchase of `tier`
    pub fn apply(&self, owner: Address, tier: &str, payment: &VerifiedPayment) -> Result<Subscription> {
        self.apply_at(owner, tier, payment, Utc::now())
    }

    pub fn apply_at(
        &self,
        owner: Address,
        tier: &str,
        payment: &VerifiedPayment,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        let tier = self.tiers.get(tier)?.name.clone();

        let record = PaymentRecord {
            tx_id: payment.tx_id,
            payer_owner: owner,
            amount_paid: payment.amount,
            tier_purchased: tier.clone(),
            observed_at: now,
        };

        let period = self.period;
        let renew = |current: Option<&Subscription>| {
            let end_date = match current {
                Some(existing) if existing.end_date > now => existing.end_date + period,
                _ => now + period,
            };
            Subscription {
                owner,
                tier: tier.clone(),
                start_date: now,
                end_date,
                usage_count: 0,
                updated_at: now,
            }
        };

        match self.store.credit(&record, &renew) {
            Ok(subscription) => {
                info!(
                    "Credited {} to {}: {} until {}",
                    tx_key(&payment.tx_id),
                    owner,
                    subscription.tier,
                    subscription.end_date
                );
                Ok(subscription)
            }
            Err(e) => {
                warn!("Failed to credit {}: {}", tx_key(&payment.tx_id), e);
                Err(e)
            }
        }
    }

    pub fn subscription(&self, owner: Address) -> Result<Option<Subscription>> {
        self.store.subscription(owner)
    }

    /// Whether a transaction has already been credited
    pub fn is_processed(&self, tx_id: &B256) -> Result<bool> {
        Ok(self.store.payment(tx_id)?.is_some())
    }

    /// Consume one generation from the owner's current tier quota
    pub fn record_usage(&self, owner: Address) -> Result<Subscription> {
        self.record_usage_at(owner, Utc::now())
    }

    pub fn record_usage_at(&self, owner: Address, now: DateTime<Utc>) -> Result<Subscription> {
        let subscription = self
            .store
            .subscription(owner)?
            .ok_or_else(|| Error::NoSubscription(owner.to_string()))?;
        let quota = self.quota_for(&subscription)?;
        self.store.record_usage(owner, quota, now)
    }

    /// Quota of the subscription's tier
    pub fn quota_for(&self, subscription: &Subscription) -> Result<u32> {
        self.tiers.get(&subscription.tier).map(|t: &Tier| t.monthly_quota)
    }
}
