//! Contract ABI fragments used by the account, approval and payment paths

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::Eip712Domain;

use crate::error::{Error, Result};

sol! {
    // Settlement token (ERC-20)
    function allowance(address owner, address spender) external view returns (uint256);
    function approve(address spender, uint256 amount) external returns (bool);
    function transfer(address to, uint256 amount) external returns (bool);

    event Transfer(address indexed from, address indexed to, uint256 value);

    // Position token (ERC-1155)
    function isApprovedForAll(address account, address operator) external view returns (bool);
    function setApprovalForAll(address operator, bool approved) external;

    // Account (Safe)
    function nonce() external view returns (uint256);

    // Batched execution through the MultiSend library
    function multiSend(bytes transactions) external payable;

    // EIP-712 payload authorizing an account operation
    struct SafeTx {
        address to;
        uint256 value;
        bytes data;
        uint8 operation;
        uint256 safeTxGas;
        uint256 baseGas;
        uint256 gasPrice;
        address gasToken;
        address refundReceiver;
        uint256 nonce;
    }

    // EIP-712 payload authorizing account deployment through the factory
    struct CreateProxy {
        address paymentToken;
        uint256 payment;
        address paymentReceiver;
    }
}

/// EIP-712 type string for the credential API's signer proof.
///
/// Declared by hand since its first member is named `address`, which the
/// `sol!` grammar does not accept as an identifier.
pub const CLOB_AUTH_TYPE: &str =
    "ClobAuth(address address,string timestamp,uint256 nonce,string message)";

/// EIP-712 signing hash of a `ClobAuth` payload
pub fn clob_auth_signing_hash(
    domain: &Eip712Domain,
    address: Address,
    timestamp: &str,
    nonce: U256,
    message: &str,
) -> B256 {
    let mut encoded = Vec::with_capacity(5 * 32);
    encoded.extend_from_slice(keccak256(CLOB_AUTH_TYPE).as_slice());
    encoded.extend_from_slice(address.into_word().as_slice());
    encoded.extend_from_slice(keccak256(timestamp).as_slice());
    encoded.extend_from_slice(&nonce.to_be_bytes::<32>());
    encoded.extend_from_slice(keccak256(message).as_slice());
    let struct_hash = keccak256(&encoded);

    let mut digest = Vec::with_capacity(66);
    digest.extend_from_slice(&[0x19, 0x01]);
    digest.extend_from_slice(domain.separator().as_slice());
    digest.extend_from_slice(struct_hash.as_slice());
    keccak256(&digest)
}

/// A decoded ERC-20 `Transfer` event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

/// Topic0 of `Transfer(address,address,uint256)`
pub fn transfer_topic() -> B256 {
    use alloy::sol_types::SolEvent;
    Transfer::SIGNATURE_HASH
}

/// Decode a raw log as an ERC-20 `Transfer`
///
/// Two indexed addresses and a single uint256 data word are required.
pub fn decode_transfer(topics: &[B256], data: &[u8]) -> std::result::Result<TransferEvent, String> {
    if topics.len() != 3 {
        return Err(format!("expected 3 topics, got {}", topics.len()));
    }
    if topics[0] != transfer_topic() {
        return Err(format!("unexpected event signature {}", topics[0]));
    }
    if data.len() != 32 {
        return Err(format!("expected 32 bytes of data, got {}", data.len()));
    }
    for topic in &topics[1..] {
        if topic[..12].iter().any(|b| *b != 0) {
            return Err(format!("topic {} is not a left-padded address", topic));
        }
    }

    Ok(TransferEvent {
        from: Address::from_word(topics[1]),
        to: Address::from_word(topics[2]),
        value: U256::from_be_slice(data),
    })
}

/// Decode a single `uint256` return word
pub fn decode_uint(ret: &Bytes) -> Result<U256> {
    if ret.len() < 32 {
        return Err(Error::Rpc(format!(
            "expected 32-byte return value, got {} bytes",
            ret.len()
        )));
    }
    Ok(U256::from_be_slice(&ret[..32]))
}

/// Decode a single `bool` return word
pub fn decode_bool(ret: &Bytes) -> Result<bool> {
    let word = decode_uint(ret)?;
    match word {
        w if w.is_zero() => Ok(false),
        w if w == U256::from(1) => Ok(true),
        w => Err(Error::Rpc(format!("invalid bool return value {}", w))),
    }
}
