//! Configuration loading and validation

use alloy::primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    #[serde(default)]
    pub factory: FactoryConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub approvals: ApprovalConfig,
    pub relay: RelayConfig,
    pub credentials: CredentialsConfig,
    pub payment: PaymentConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Counterfactual account factory parameters
#[derive(Debug, Clone, Deserialize)]
pub struct FactoryConfig {
    #[serde(default = "default_factory_address")]
    pub address: String,
    /// keccak256 of the account proxy creation code
    #[serde(default = "default_init_code_hash")]
    pub init_code_hash: String,
    /// EIP-712 domain name used when authorizing deployment
    #[serde(default = "default_factory_domain_name")]
    pub domain_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Settlement (stable) token contract
    #[serde(default = "default_token_address")]
    pub address: String,
    #[serde(default = "default_token_decimals")]
    pub decimals: u8,
    /// ERC-1155 position token contract
    #[serde(default = "default_position_token")]
    pub position_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    /// Spenders that need a settlement-token allowance
    #[serde(default = "default_erc20_spenders")]
    pub erc20_spenders: Vec<String>,
    /// Spenders that need position-token operator approval
    #[serde(default = "default_operator_spenders")]
    pub operator_spenders: Vec<String>,
    /// Minimum allowance (raw token units) considered sufficient
    #[serde(default = "default_allowance_threshold")]
    pub threshold: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_url")]
    pub url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_elapsed_ms")]
    pub retry_max_elapsed_ms: u64,
    /// MultiSend contract used to batch several operations into one transaction
    #[serde(default = "default_multisend_address")]
    pub multisend_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_credential_api_url")]
    pub api_url: String,
    #[serde(default = "default_credential_cache_path")]
    pub cache_path: String,
    #[serde(default)]
    pub auth_nonce: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    /// Treasury address receiving subscription payments
    #[serde(default)]
    pub treasury: String,
    /// Absolute tolerance when comparing paid and expected amounts
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_renewal_days")]
    pub renewal_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TierConfig {
    pub name: String,
    /// Price in settlement token units (e.g. dollars)
    pub price: f64,
    /// Generations allowed per billing period
    pub monthly_quota: u32,
}

fn default_chain_id() -> u64 {
    137
}

fn default_rpc_url() -> String {
    "https://polygon-rpc.com".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_factory_address() -> String {
    "0xaacFeEa03eb1561C4e67d661e40682Bd20E3541b".to_string()
}

fn default_init_code_hash() -> String {
    "0x2bce2127ff07fb632d16c8347c4ebf501f4841168bed00d9e6ef715ddb6fcecf".to_string()
}

fn default_factory_domain_name() -> String {
    "Polymarket Contract Proxy Factory".to_string()
}

fn default_token_address() -> String {
    "0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359".to_string()
}

fn default_token_decimals() -> u8 {
    6
}

fn default_position_token() -> String {
    "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045".to_string()
}

const CTF_EXCHANGE: &str = "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E";
const NEG_RISK_EXCHANGE: &str = "0xC5d563A36AE78145C45a50134d48A1215220f80a";
const NEG_RISK_ADAPTER: &str = "0xd91E80cF2E7be2e162c6513ceD06f1dD0dA35296";

fn default_erc20_spenders() -> Vec<String> {
    vec![
        default_position_token(),
        CTF_EXCHANGE.to_string(),
        NEG_RISK_EXCHANGE.to_string(),
        NEG_RISK_ADAPTER.to_string(),
    ]
}

fn default_operator_spenders() -> Vec<String> {
    vec![
        CTF_EXCHANGE.to_string(),
        NEG_RISK_EXCHANGE.to_string(),
        NEG_RISK_ADAPTER.to_string(),
    ]
}

fn default_allowance_threshold() -> String {
    // 1M tokens at 6 decimals; approvals are granted at U256::MAX
    "1000000000000".to_string()
}

fn default_relay_url() -> String {
    "https://relayer-v2.polymarket.com".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_confirm_timeout_ms() -> u64 {
    120_000
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

fn default_retry_max_elapsed_ms() -> u64 {
    5_000
}

fn default_multisend_address() -> String {
    "0xA238CBeb142c10Ef7Ad8442C6D1f9E89e07e7761".to_string()
}

fn default_credential_api_url() -> String {
    "https://clob.polymarket.com".to_string()
}

fn default_credential_cache_path() -> String {
    "credentials/api-credentials.json".to_string()
}

fn default_tolerance() -> f64 {
    0.1
}

fn default_renewal_days() -> i64 {
    30
}

fn default_database_path() -> String {
    "data/ledger.sqlite".to_string()
}

fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig {
            name: "basic".to_string(),
            price: 5.0,
            monthly_quota: 50,
        },
        TierConfig {
            name: "pro".to_string(),
            price: 15.0,
            monthly_quota: 250,
        },
        TierConfig {
            name: "premium".to_string(),
            price: 30.0,
            monthly_quota: 1000,
        },
    ]
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            address: default_factory_address(),
            init_code_hash: default_init_code_hash(),
            domain_name: default_factory_domain_name(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            address: default_token_address(),
            decimals: default_token_decimals(),
            position_token: default_position_token(),
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            erc20_spenders: default_erc20_spenders(),
            operator_spenders: default_operator_spenders(),
            threshold: default_allowance_threshold(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("network.chain_id", default_chain_id() as i64)?
            .set_default("network.rpc_url", default_rpc_url())?
            .set_default("network.timeout_ms", default_timeout_ms() as i64)?
            .set_default("network.max_retries", default_max_retries() as i64)?
            .set_default("relay.url", default_relay_url())?
            .set_default("credentials.api_url", default_credential_api_url())?
            .set_default("payment.tolerance", default_tolerance())?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix SAFE_SESSION_)
            .add_source(
                config::Environment::with_prefix("SAFE_SESSION")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.network.chain_id == 0 {
            anyhow::bail!("network.chain_id must be non-zero");
        }

        parse_address(&self.factory.address).context("factory.address")?;
        parse_hash(&self.factory.init_code_hash).context("factory.init_code_hash")?;
        parse_address(&self.token.address).context("token.address")?;
        parse_address(&self.token.position_token).context("token.position_token")?;
        parse_address(&self.relay.multisend_address).context("relay.multisend_address")?;

        if self.token.decimals == 0 || self.token.decimals > 36 {
            anyhow::bail!("token.decimals must be between 1 and 36");
        }

        if self.approvals.erc20_spenders.is_empty() {
            anyhow::bail!("approvals.erc20_spenders must not be empty");
        }
        if self.approvals.operator_spenders.is_empty() {
            anyhow::bail!("approvals.operator_spenders must not be empty");
        }

        for spender in self
            .approvals
            .erc20_spenders
            .iter()
            .chain(self.approvals.operator_spenders.iter())
        {
            parse_address(spender).with_context(|| format!("Invalid spender: {}", spender))?;
        }

        U256::from_str(&self.approvals.threshold)
            .map_err(|e| anyhow::anyhow!("approvals.threshold is not an integer: {}", e))?;

        if !self.payment.treasury.is_empty() {
            parse_address(&self.payment.treasury).context("payment.treasury")?;
        }

        if !(self.payment.tolerance.is_finite() && self.payment.tolerance > 0.0) {
            anyhow::bail!("payment.tolerance must be a positive number");
        }

        if self.payment.renewal_days <= 0 {
            anyhow::bail!("payment.renewal_days must be positive");
        }

        if self.relay.poll_interval_ms == 0 || self.relay.confirm_timeout_ms == 0 {
            anyhow::bail!("relay poll interval and confirmation timeout must be positive");
        }

        let mut seen = HashSet::new();
        for tier in &self.tiers {
            // Tier lookup ignores case
            if !seen.insert(tier.name.to_lowercase()) {
                anyhow::bail!("Duplicate tier name: {}", tier.name);
            }
            if !(tier.price.is_finite() && tier.price > 0.0) {
                anyhow::bail!("Tier {} must have a positive price", tier.name);
            }
        }

        Ok(())
    }

    /// Treasury address, required for payment commands
    pub fn treasury(&self) -> Result<Address> {
        if self.payment.treasury.is_empty() {
            anyhow::bail!("payment.treasury is not configured");
        }
        parse_address(&self.payment.treasury)
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        let tiers: Vec<String> = self
            .tiers
            .iter()
            .map(|t| format!("{} (${}, {} generations)", t.name, t.price, t.monthly_quota))
            .collect();

        format!(
            r#"Configuration:
  Network:
    chain_id: {}
    rpc_url: {}
    timeout: {}ms
  Factory:
    address: {}
    init_code_hash: {}
  Token:
    address: {}
    decimals: {}
    position_token: {}
  Approvals:
    erc20_spenders: {}
    operator_spenders: {}
    threshold: {}
  Relay:
    url: {}
    confirm_timeout: {}ms
  Credentials:
    api_url: {}
    cache_path: {}
  Payment:
    treasury: {}
    tolerance: {}
    renewal_days: {}
  Ledger:
    database_path: {}
  Tiers: {}
"#,
            self.network.chain_id,
            mask_url(&self.network.rpc_url),
            self.network.timeout_ms,
            self.factory.address,
            self.factory.init_code_hash,
            self.token.address,
            self.token.decimals,
            self.token.position_token,
            self.approvals.erc20_spenders.len(),
            self.approvals.operator_spenders.len(),
            self.approvals.threshold,
            mask_url(&self.relay.url),
            self.relay.confirm_timeout_ms,
            mask_url(&self.credentials.api_url),
            self.credentials.cache_path,
            if self.payment.treasury.is_empty() {
                "(not set)"
            } else {
                self.payment.treasury.as_str()
            },
            self.payment.tolerance,
            self.payment.renewal_days,
            self.ledger.database_path,
            tiers.join(", "),
        )
    }
}

/// Parse a 0x-prefixed hex address (case-insensitive)
pub fn parse_address(s: &str) -> Result<Address> {
    let trimmed = s.trim();
    if trimmed.len() != 42 || !(trimmed.starts_with("0x") || trimmed.starts_with("0X")) {
        anyhow::bail!("Invalid address: {}", s);
    }
    Address::from_str(&trimmed.to_ascii_lowercase())
        .map_err(|e| anyhow::anyhow!("Invalid address {}: {}", s, e))
}

/// Parse a 0x-prefixed 32-byte hash
pub fn parse_hash(s: &str) -> Result<B256> {
    B256::from_str(s.trim()).map_err(|e| anyhow::anyhow!("Invalid 32-byte hash {}: {}", s, e))
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                chain_id: default_chain_id(),
                rpc_url: default_rpc_url(),
                timeout_ms: default_timeout_ms(),
                max_retries: default_max_retries(),
            },
            factory: FactoryConfig::default(),
            token: TokenConfig::default(),
            approvals: ApprovalConfig::default(),
            relay: RelayConfig {
                url: default_relay_url(),
                poll_interval_ms: default_poll_interval_ms(),
                confirm_timeout_ms: default_confirm_timeout_ms(),
                retry_base_delay_ms: default_retry_base_delay_ms(),
                retry_max_elapsed_ms: default_retry_max_elapsed_ms(),
                multisend_address: default_multisend_address(),
            },
            credentials: CredentialsConfig {
                api_url: default_credential_api_url(),
                cache_path: default_credential_cache_path(),
                auth_nonce: 0,
            },
            payment: PaymentConfig {
                treasury: String::new(),
                tolerance: default_tolerance(),
                renewal_days: default_renewal_days(),
            },
            ledger: LedgerConfig::default(),
            tiers: default_tiers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.chain_id, 137);
        assert_eq!(config.token.decimals, 6);
        assert_eq!(config.payment.tolerance, 0.1);
        assert_eq!(config.payment.renewal_days, 30);
        assert_eq!(config.tiers.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_spender() {
        let mut config = Config::default();
        config.approvals.operator_spenders.push("0x1234".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_tiers() {
        let mut config = Config::default();
        config.tiers.push(TierConfig {
            name: "basic".to_string(),
            price: 7.0,
            monthly_quota: 10,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tier_names_differing_only_in_case() {
        let mut config = Config::default();
        config.tiers.push(TierConfig {
            name: "Basic".to_string(),
            price: 7.0,
            monthly_quota: 10,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_amounts() {
        for bad in [f64::NAN, f64::INFINITY, 0.0, -0.1] {
            let mut config = Config::default();
            config.payment.tolerance = bad;
            assert!(config.validate().is_err(), "tolerance {}", bad);

            let mut config = Config::default();
            config.tiers[0].price = bad;
            assert!(config.validate().is_err(), "price {}", bad);
        }
    }

    #[test]
    fn test_validate_rejects_empty_spender_list() {
        let mut config = Config::default();
        config.approvals.operator_spenders.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.approvals.erc20_spenders.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_address_is_case_insensitive() {
        let lower = parse_address("0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e").unwrap();
        let upper = parse_address("0x4BFB41D5B3570DEFD03C39A9A4D8DE6BD8B8982E").unwrap();
        assert_eq!(lower, upper);
        assert!(parse_address("4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e").is_err());
    }

    #[test]
    fn test_treasury_required() {
        let mut config = Config::default();
        assert!(config.treasury().is_err());
        config.payment.treasury = "0x000000000000000000000000000000000000dEaD".to_string();
        assert!(config.treasury().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safe-session.toml");
        std::fs::write(
            &path,
            r#"
[network]
chain_id = 80002

[relay]
poll_interval_ms = 500

[credentials]
cache_path = "creds.json"

[payment]
treasury = "0x000000000000000000000000000000000000dead"

[[tiers]]
name = "basic"
price = 5.0
monthly_quota = 50
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.network.chain_id, 80002);
        assert_eq!(config.relay.poll_interval_ms, 500);
        assert_eq!(config.relay.confirm_timeout_ms, 120_000);
        assert_eq!(config.tiers.len(), 1);
        assert_eq!(config.credentials.cache_path, "creds.json");
    }

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("https://rpc.example.com?key=secret"),
            "https://rpc.example.com?***"
        );
        assert_eq!(mask_url("https://rpc.example.com"), "https://rpc.example.com");
    }
}
