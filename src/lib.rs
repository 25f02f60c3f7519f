//! Safe Session Library
//!
//! Deterministic smart-account sessions bound to an owner key, plus on-chain
//! verification and replay-safe crediting of subscription payments.

pub mod account;
pub mod chain;
pub mod cli;
pub mod config;
pub mod error;
pub mod payment;
pub mod relay;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
