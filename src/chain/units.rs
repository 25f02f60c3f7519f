//! Settlement token unit conversion

use alloy::primitives::U256;

use crate::error::{Error, Result};

/// Convert raw token units to a decimal amount
pub fn to_decimal_amount(raw: U256, decimals: u8) -> f64 {
    // U256's decimal rendering parses losslessly enough for amount comparison
    let whole: f64 = raw.to_string().parse().unwrap_or(f64::INFINITY);
    whole / 10f64.powi(decimals as i32)
}

/// Convert a decimal amount to raw token units, rounding to the nearest unit
pub fn from_decimal_amount(amount: f64, decimals: u8) -> Result<U256> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(Error::InvalidInput(format!("Invalid token amount: {}", amount)));
    }

    let scaled = (amount * 10f64.powi(decimals as i32)).round();
    if scaled > u128::MAX as f64 {
        return Err(Error::InvalidInput(format!("Token amount too large: {}", amount)));
    }

    Ok(U256::from(scaled as u128))
}
