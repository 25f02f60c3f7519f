//! Approval sufficiency checks
//!
//! Reads settlement-token allowances and position-token operator flags for
//! every trusted spender. Reads are independent and fanned out concurrently;
//! nothing here mutates chain state.

use alloy::primitives::{Address, U256};
use alloy::sol_types::SolCall;
use futures::future::try_join_all;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::chain::abi::{allowanceCall, decode_bool, decode_uint, isApprovedForAllCall};
use crate::chain::ChainReader;
use crate::config::{parse_address, ApprovalConfig, TokenConfig};
use crate::error::{Error, Result};

use super::ops::{approval_ops, SafeOperation};

/// Which contracts must be approved, and how much is enough
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalPolicy {
    pub token: Address,
    pub position_token: Address,
    pub erc20_spenders: Vec<Address>,
    pub operator_spenders: Vec<Address>,
    /// Allowance at or above this many raw units counts as approved
    pub threshold: U256,
}

impl ApprovalPolicy {
    /// Build from the `[token]` and `[approvals]` config sections
    pub fn from_config(token: &TokenConfig, approvals: &ApprovalConfig) -> Result<Self> {
        let parse = |s: &String| parse_address(s).map_err(|e| Error::InvalidInput(e.to_string()));

        Ok(Self {
            token: parse(&token.address)?,
            position_token: parse(&token.position_token)?,
            erc20_spenders: approvals.erc20_spenders.iter().map(parse).collect::<Result<_>>()?,
            operator_spenders: approvals
                .operator_spenders
                .iter()
                .map(parse)
                .collect::<Result<_>>()?,
            threshold: U256::from_str(&approvals.threshold)
                .map_err(|e| Error::InvalidInput(format!("approval threshold: {}", e)))?,
        })
    }

    /// Operations that grant every approval in this policy
    pub fn approval_ops(&self) -> Vec<SafeOperation> {
        approval_ops(
            self.token,
            self.position_token,
            &self.erc20_spenders,
            &self.operator_spenders,
        )
    }
}

/// Current approval level for one spender
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalLevel {
    Allowance(U256),
    Operator(bool),
}

/// Per-spender approval snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalEntry {
    pub spender: Address,
    pub level: ApprovalLevel,
    pub sufficient: bool,
}

/// Snapshot of every approval an account holds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalSet {
    pub entries: Vec<ApprovalEntry>,
}

impl ApprovalSet {
    pub fn is_sufficient(&self) -> bool {
        self.entries.iter().all(|e| e.sufficient)
    }

    pub fn missing(&self) -> impl Iterator<Item = &ApprovalEntry> {
        self.entries.iter().filter(|e| !e.sufficient)
    }
}

/// Read-only approval checker
pub struct ApprovalChecker {
    reader: Arc<dyn ChainReader>,
    policy: ApprovalPolicy,
}

impl ApprovalChecker {
    pub fn new(reader: Arc<dyn ChainReader>, policy: ApprovalPolicy) -> Self {
        Self { reader, policy }
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    /// Fetch every approval the account holds.
    ///
    /// Any failed read fails the whole snapshot; an unreadable approval is
    /// never reported as missing.
    pub async fn snapshot(&self, account: Address) -> Result<ApprovalSet> {
        let allowances = try_join_all(
            self.policy
                .erc20_spenders
                .iter()
                .map(|spender| self.allowance(account, *spender)),
        );
        let operators = try_join_all(
            self.policy
                .operator_spenders
                .iter()
                .map(|spender| self.operator_flag(account, *spender)),
        );

        let (allowances, operators) = futures::try_join!(allowances, operators)?;

        let mut entries = Vec::with_capacity(allowances.len() + operators.len());
        for (spender, allowance) in self.policy.erc20_spenders.iter().zip(allowances) {
            entries.push(ApprovalEntry {
                spender: *spender,
                sufficient: allowance >= self.policy.threshold,
                level: ApprovalLevel::Allowance(allowance),
            });
        }
        for (spender, approved) in self.policy.operator_spenders.iter().zip(operators) {
            entries.push(ApprovalEntry {
                spender: *spender,
                sufficient: approved,
                level: ApprovalLevel::Operator(approved),
            });
        }

        Ok(ApprovalSet { entries })
    }

    /// True only if every allowance meets the threshold and every operator flag is set
    pub async fn check_sufficient(&self, account: Address) -> Result<bool> {
        let set = self.snapshot(account).await?;
        let sufficient = set.is_sufficient();

        if sufficient {
            debug!("Account {} has all approvals", account);
        } else {
            info!(
                "Account {} is missing {} approval(s)",
                account,
                set.missing().count()
            );
        }

        Ok(sufficient)
    }

    async fn allowance(&self, account: Address, spender: Address) -> Result<U256> {
        let call = allowanceCall {
            owner: account,
            spender,
        };
        let ret = self
            .reader
            .call(self.policy.token, call.abi_encode().into())
            .await?;
        decode_uint(&ret)
    }

    async fn operator_flag(&self, account: Address, operator: Address) -> Result<bool> {
        let call = isApprovedForAllCall { account, operator };
        let ret = self
            .reader
            .call(self.policy.position_token, call.abi_encode().into())
            .await?;
        decode_bool(&ret)
    }
}
