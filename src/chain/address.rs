//! Counterfactual account address derivation
//!
//! The factory deploys each account with CREATE2 using
//! `salt = keccak256(abi.encode(owner))` and a fixed proxy init-code hash, so
//! the account address is known before deployment and never needs storing.

use alloy::primitives::{keccak256, Address, B256};

use crate::config::{parse_address, parse_hash, FactoryConfig};
use crate::error::{Error, Result};

/// Factory inputs to the CREATE2 formula
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactoryParams {
    pub factory: Address,
    pub init_code_hash: B256,
}

impl FactoryParams {
    pub fn new(factory: Address, init_code_hash: B256) -> Self {
        Self {
            factory,
            init_code_hash,
        }
    }

    /// Build from the `[factory]` config section
    pub fn from_config(config: &FactoryConfig) -> Result<Self> {
        let factory = parse_address(&config.address)
            .map_err(|e| Error::InvalidInput(format!("factory address: {}", e)))?;
        let init_code_hash = parse_hash(&config.init_code_hash)
            .map_err(|e| Error::InvalidInput(format!("init code hash: {}", e)))?;
        Ok(Self::new(factory, init_code_hash))
    }

    /// Derive the account address for an owner
    pub fn account_for(&self, owner: Address) -> Address {
        let salt = keccak256(owner.into_word());
        self.factory.create2(salt, self.init_code_hash)
    }
}

/// Derive the account address from a textual owner address.
///
/// Fails only on a malformed owner (`InvalidInput`).
pub fn derive_account_address(owner: &str, params: &FactoryParams) -> Result<Address> {
    let owner = parse_address(owner).map_err(|e| Error::InvalidInput(e.to_string()))?;
    Ok(params.account_for(owner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use alloy::primitives::address;

    fn mainnet_factory() -> FactoryParams {
        FactoryParams::from_config(&FactoryConfig::default()).unwrap()
    }

    #[test]
    fn test_golden_vectors() {
        let params = mainnet_factory();

        let account =
            derive_account_address("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266", &params).unwrap();
        assert_eq!(account, address!("d93B25cb943D14d0d34FBaF01Fc93a0f8b5F6E47"));

        let account =
            derive_account_address("0x0000000000000000000000000000000000000001", &params).unwrap();
        assert_eq!(account, address!("766b6851A199BF91Ae3fa13B1cfaC5187355118f"));
    }

    #[test]
    fn test_derivation_is_deterministic_and_case_insensitive() {
        let params = mainnet_factory();
        let a = derive_account_address("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266", &params).unwrap();
        let b = derive_account_address("0xF39FD6E51AAD88F6F4CE6AB8827279CFFFB92266", &params).unwrap();
        let c = derive_account_address("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266", &params).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_different_factory_gives_different_account() {
        let params = mainnet_factory();
        let other = FactoryParams::new(
            address!("0000000000000000000000000000000000000002"),
            params.init_code_hash,
        );
        let owner = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
        assert_ne!(params.account_for(owner), other.account_for(owner));
    }

    #[test]
    fn test_malformed_owner_is_invalid_input() {
        let params = mainnet_factory();
        for bad in ["", "0x1234", "f39Fd6e51aad88F6F4ce6aB8827279cffFb92266", "0xzz9Fd6e51aad88F6F4ce6aB8827279cffFb92266"] {
            let err = derive_account_address(bad, &params).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "input {:?}", bad);
        }
    }
}
