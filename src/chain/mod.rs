//! Chain primitives - address derivation, ABI encoding and RPC reads
//!
//! Everything here is either pure (address derivation, calldata encoding,
//! unit conversion) or read-only against the node (`ChainReader`).

pub mod abi;
pub mod address;
pub mod rpc;
pub mod units;

pub use address::{derive_account_address, FactoryParams};
pub use rpc::{ChainReader, HttpRpcClient, Log, TransactionReceipt};
pub use units::{from_decimal_amount, to_decimal_amount};
