//! Subscription tiers

use serde::Serialize;

use crate::config::TierConfig;
use crate::error::{Error, Result};

/// A named plan with a price and a generation quota per period
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tier {
    pub name: String,
    pub price: f64,
    pub monthly_quota: u32,
}

/// Known tiers, looked up by name
#[derive(Debug, Clone, Default)]
pub struct TierCatalog {
    tiers: Vec<Tier>,
}

impl TierCatalog {
    pub fn new(tiers: Vec<Tier>) -> Self {
        Self { tiers }
    }

    pub fn from_config(tiers: &[TierConfig]) -> Self {
        Self::new(
            tiers
                .iter()
                .map(|t| Tier {
                    name: t.name.to_ascii_lowercase(),
                    price: t.price,
                    monthly_quota: t.monthly_quota,
                })
                .collect(),
        )
    }

    /// Case-insensitive lookup
    pub fn get(&self, name: &str) -> Result<&Tier> {
        let wanted = name.trim().to_ascii_lowercase();
        self.tiers
            .iter()
            .find(|t| t.name == wanted)
            .ok_or_else(|| Error::UnknownTier(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.iter()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_default_catalog() {
        let catalog = TierCatalog::from_config(&Config::default().tiers);
        assert_eq!(catalog.len(), 3);

        let basic = catalog.get("basic").unwrap();
        assert_eq!(basic.price, 5.0);
        assert_eq!(basic.monthly_quota, 50);
        assert_eq!(catalog.get("PRO").unwrap().monthly_quota, 250);
        assert_eq!(catalog.get("premium").unwrap().price, 30.0);
    }

    #[test]
    fn test_unknown_tier() {
        let catalog = TierCatalog::from_config(&Config::default().tiers);
        assert!(matches!(catalog.get("enterprise"), Err(Error::UnknownTier(_))));
    }
}
