//! Purchase flow: pay from the account, verify on-chain, credit the ledger

use alloy::primitives::Address;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::chain::{from_decimal_amount, FactoryParams};
use crate::error::Result;
use crate::relay::RelayExecutor;

use super::ledger::SubscriptionLedger;
use super::types::Subscription;
use super::verifier::PaymentVerifier;

pub struct Checkout {
    relay: Arc<dyn RelayExecutor>,
    verifier: PaymentVerifier,
    ledger: Arc<SubscriptionLedger>,
    factory: FactoryParams,
    treasury: Address,
    receipt_poll: Duration,
    receipt_timeout: Duration,
}

impl Checkout {
    pub fn new(
        relay: Arc<dyn RelayExecutor>,
        verifier: PaymentVerifier,
        ledger: Arc<SubscriptionLedger>,
        factory: FactoryParams,
        treasury: Address,
        receipt_poll: Duration,
        receipt_timeout: Duration,
    ) -> Self {
        Self {
            relay,
            verifier,
            ledger,
            factory,
            treasury,
            receipt_poll,
            receipt_timeout,
        }
    }

    /// Buy `tier` for `owner`, paying from the owner's account.
    ///
    /// A relay or receipt timeout leaves the payment indeterminate; it can be
    /// credited later by transaction id once the node serves it.
    pub async fn purchase(&self, owner: Address, tier: &str) -> Result<Subscription> {
        let tier = self.ledger.tiers().get(tier)?.clone();
        let config = self.verifier.config();
        let amount = from_decimal_amount(tier.price, config.decimals)?;
        let account = self.factory.account_for(owner);

        info!(
            "Purchasing {} for {} ({} from account {})",
            tier.name, owner, tier.price, account
        );

        let handle = self
            .relay
            .transfer(account, config.token, self.treasury, amount)
            .await?;
        let tx_id = handle.wait().await?;

        self.verifier
            .await_receipt(tx_id, self.receipt_poll, self.receipt_timeout)
            .await?;

        let payment = self.verifier.verify(tx_id, tier.price, self.treasury).await?;
        self.ledger.apply(owner, &tier.name, &payment)
    }
}
