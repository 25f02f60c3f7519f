//! On-chain payment verification
//!
//! Checks a settlement-token transfer against an expected recipient and
//! amount. Verification only reads finalized chain state, so it is safe to
//! repeat and to run concurrently.

use alloy::primitives::{Address, B256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chain::abi::{decode_transfer, transfer_topic};
use crate::chain::{to_decimal_amount, ChainReader};
use crate::error::{Error, Result};

use super::types::{tx_key, VerifiedPayment};

/// Settlement token and comparison policy
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub token: Address,
    pub decimals: u8,
    /// Absolute tolerance, absorbing float rounding from upstream price math
    pub tolerance: f64,
}

/// Verifies settlement transfers from transaction receipts
pub struct PaymentVerifier {
    reader: Arc<dyn ChainReader>,
    config: VerifierConfig,
}

impl PaymentVerifier {
    pub fn new(reader: Arc<dyn ChainReader>, config: VerifierConfig) -> Self {
        Self { reader, config }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Wait until the node serves a receipt for `tx_id`.
    ///
    /// The relay can report a transaction mined before the RPC node has
    /// indexed it. Giving up surfaces as a retryable `ReceiptTimeout`, never
    /// as a payment rejection.
    pub async fn await_receipt(
        &self,
        tx_id: B256,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<()> {
        let poll = async {
            loop {
                match self.reader.transaction_receipt(tx_id).await {
                    Ok(Some(_)) => return Ok::<(), Error>(()),
                    Ok(None) => debug!("Receipt for {} not available yet", tx_key(&tx_id)),
                    Err(e) if e.is_retryable() => {
                        warn!("Receipt poll for {} failed, retrying: {}", tx_key(&tx_id), e)
                    }
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => {
                warn!("No receipt for {} after {:?}", tx_key(&tx_id), timeout);
                Err(Error::ReceiptTimeout {
                    tx_id: tx_key(&tx_id),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Verify that `tx_id` paid `expected_amount` tokens to `expected_recipient`
    pub async fn verify(
        &self,
        tx_id: B256,
        expected_amount: f64,
        expected_recipient: Address,
    ) -> Result<VerifiedPayment> {
        if !expected_amount.is_finite() || expected_amount < 0.0 {
            return Err(Error::InvalidInput(format!(
                "Expected amount must be a non-negative number, got {}",
                expected_amount
            )));
        }

        let id = tx_key(&tx_id);
        debug!("Verifying payment {}", id);

        let receipt = match self.reader.transaction_receipt(tx_id).await? {
            Some(receipt) if receipt.success => receipt,
            Some(_) => {
                warn!("Payment {} reverted", id);
                return Err(Error::TransactionFailed(id));
            }
            None => {
                warn!("Payment {} has no receipt", id);
                return Err(Error::TransactionFailed(id));
            }
        };

        let token_logs: Vec<_> = receipt
            .logs
            .iter()
            .filter(|log| log.address == self.config.token)
            .collect();

        // Token contracts may emit other events in the same transaction
        let log = token_logs
            .iter()
            .find(|log| log.topics.first() == Some(&transfer_topic()))
            .or_else(|| token_logs.first())
            .ok_or_else(|| {
                warn!("Payment {} has no {} log", id, self.config.token);
                Error::NoTransferFound(id.clone())
            })?;

        let transfer = decode_transfer(&log.topics, &log.data).map_err(|reason| {
            warn!("Payment {} has a malformed transfer log: {}", id, reason);
            Error::MalformedLog {
                tx_id: id.clone(),
                reason,
            }
        })?;

        if transfer.to != expected_recipient {
            warn!(
                "Payment {} went to {}, expected {}",
                id, transfer.to, expected_recipient
            );
            return Err(Error::WrongRecipient {
                expected: expected_recipient.to_string(),
                actual: transfer.to.to_string(),
            });
        }

        let amount = to_decimal_amount(transfer.value, self.config.decimals);
        // Fails closed when the tolerance is NaN
        let within = (amount - expected_amount).abs() <= self.config.tolerance;
        if !within {
            warn!(
                "Payment {} amount {} outside tolerance of expected {}",
                id, amount, expected_amount
            );
            return Err(Error::AmountMismatch {
                expected: expected_amount,
                actual: amount,
            });
        }

        info!("Verified payment {}: {} from {}", id, amount, transfer.from);

        Ok(VerifiedPayment {
            tx_id,
            amount,
            recipient: transfer.to,
            payer: transfer.from,
        })
    }
}
