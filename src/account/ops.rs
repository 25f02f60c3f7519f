//! Account operations - building, batching and authorizing
//!
//! An account executes exactly one operation per transaction. Batches are
//! packed into a single delegate call to the MultiSend library, so every
//! operation in a batch lands or reverts together.

use alloy::primitives::{Address, Bytes, Signature, B256, U256};
use alloy::sol_types::{Eip712Domain, SolCall, SolStruct};
use serde::Serialize;
use std::borrow::Cow;

use crate::chain::abi::{
    approveCall, multiSendCall, setApprovalForAllCall, transferCall, CreateProxy, SafeTx,
};
use crate::error::{Error, Result};

/// How the account invokes the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Call,
    DelegateCall,
}

impl OperationKind {
    pub fn as_u8(self) -> u8 {
        match self {
            OperationKind::Call => 0,
            OperationKind::DelegateCall => 1,
        }
    }
}

/// A single operation authorized by the account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeOperation {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub kind: OperationKind,
}

impl SafeOperation {
    /// Plain call with no value attached
    pub fn call(to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            to,
            value: U256::ZERO,
            data: data.into(),
            kind: OperationKind::Call,
        }
    }
}

/// Approval batch granting every trusted spender full access
///
/// Settlement-token allowances are set to `U256::MAX`; the sufficiency check
/// only requires them to stay above a much lower threshold.
pub fn approval_ops(
    token: Address,
    position_token: Address,
    erc20_spenders: &[Address],
    operator_spenders: &[Address],
) -> Vec<SafeOperation> {
    let allowances = erc20_spenders.iter().map(|spender| {
        let call = approveCall {
            spender: *spender,
            amount: U256::MAX,
        };
        SafeOperation::call(token, call.abi_encode())
    });

    let operators = operator_spenders.iter().map(|operator| {
        let call = setApprovalForAllCall {
            operator: *operator,
            approved: true,
        };
        SafeOperation::call(position_token, call.abi_encode())
    });

    allowances.chain(operators).collect()
}

/// Settlement-token transfer from the account
pub fn transfer_op(token: Address, to: Address, amount: U256) -> SafeOperation {
    let call = transferCall { to, amount };
    SafeOperation::call(token, call.abi_encode())
}

/// Pack operations in the MultiSend wire format:
/// `operation (1) ‖ to (20) ‖ value (32) ‖ data length (32) ‖ data`
pub fn encode_multisend(ops: &[SafeOperation]) -> Bytes {
    let mut packed = Vec::new();
    for op in ops {
        packed.push(op.kind.as_u8());
        packed.extend_from_slice(op.to.as_slice());
        packed.extend_from_slice(&op.value.to_be_bytes::<32>());
        packed.extend_from_slice(&U256::from(op.data.len()).to_be_bytes::<32>());
        packed.extend_from_slice(&op.data);
    }

    let call = multiSendCall {
        transactions: packed.into(),
    };
    call.abi_encode().into()
}

/// Collapse a batch into the one operation the account will execute
pub fn aggregate(ops: &[SafeOperation], multisend: Address) -> Result<SafeOperation> {
    match ops {
        [] => Err(Error::InvalidInput("Empty operation batch".to_string())),
        [single] => Ok(single.clone()),
        many => Ok(SafeOperation {
            to: multisend,
            value: U256::ZERO,
            data: encode_multisend(many),
            kind: OperationKind::DelegateCall,
        }),
    }
}

/// EIP-712 hash the account owner signs to authorize `op`
pub fn safe_tx_hash(chain_id: u64, account: Address, op: &SafeOperation, nonce: U256) -> B256 {
    let domain = Eip712Domain::new(None, None, Some(U256::from(chain_id)), Some(account), None);

    let tx = SafeTx {
        to: op.to,
        value: op.value,
        data: op.data.clone(),
        operation: op.kind.as_u8(),
        safeTxGas: U256::ZERO,
        baseGas: U256::ZERO,
        gasPrice: U256::ZERO,
        gasToken: Address::ZERO,
        refundReceiver: Address::ZERO,
        nonce,
    };

    tx.eip712_signing_hash(&domain)
}

/// EIP-712 hash authorizing the factory to deploy the owner's account
pub fn create_proxy_hash(chain_id: u64, factory: Address, domain_name: &str) -> B256 {
    let domain = Eip712Domain::new(
        Some(Cow::Owned(domain_name.to_string())),
        None,
        Some(U256::from(chain_id)),
        Some(factory),
        None,
    );

    let payload = CreateProxy {
        paymentToken: Address::ZERO,
        payment: U256::ZERO,
        paymentReceiver: Address::ZERO,
    };

    payload.eip712_signing_hash(&domain)
}

/// Encode a personal-message signature over a SafeTx hash.
///
/// The account recognises `eth_sign` signatures by `v > 30`, so 27/28
/// becomes 31/32.
pub fn pack_eth_sign_signature(signature: &Signature) -> Bytes {
    let mut bytes = signature.as_bytes();
    bytes[64] = match bytes[64] {
        0 | 1 => bytes[64] + 31,
        27 | 28 => bytes[64] + 4,
        v => v,
    };
    Bytes::from(bytes.to_vec())
}

/// Encode a plain EIP-712 signature as `r ‖ s ‖ v` with `v` in 27/28
pub fn pack_signature(signature: &Signature) -> Bytes {
    Bytes::from(signature.as_bytes().to_vec())
}
