//! Token unit conversion between human decimal strings and base units

use crate::error::{BridgeError, BridgeResult, ValidationError};

use ethers::types::U256;
use ethers::utils::{format_units, parse_units};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref DECIMAL_AMOUNT: Regex = Regex::new(r"^(\d+)(?:\.(\d+))?$").unwrap();
}

/// Parse a decimal string ("500", "2.5") into base units.
///
/// Rejects negative values, malformed input and more fractional digits
/// than `decimals` instead of silently truncating.
pub fn parse_amount(value: &str, decimals: u32) -> Result<u128, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidAmount {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = value.trim();
    let caps = DECIMAL_AMOUNT
        .captures(trimmed)
        .ok_or_else(|| invalid("expected a non-negative decimal number"))?;

    if let Some(fraction) = caps.get(2) {
        if fraction.as_str().len() as u32 > decimals {
            return Err(invalid("too many fractional digits"));
        }
    }

    let parsed: U256 = parse_units(trimmed, decimals)
        .map_err(|e| invalid(&e.to_string()))?
        .into();

    if parsed > U256::from(u128::MAX) {
        return Err(invalid("value too large"));
    }

    Ok(parsed.as_u128())
}

/// Format base units as a decimal string without trailing zeros
pub fn format_amount(amount: u128, decimals: u32) -> String {
    match format_units(U256::from(amount), decimals) {
        Ok(formatted) if formatted.contains('.') => formatted
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string(),
        Ok(formatted) => formatted,
        Err(_) => amount.to_string(),
    }
}

/// Parse an amount from a configuration file
pub fn parse_config_amount(value: &str, decimals: u32) -> BridgeResult<u128> {
    parse_amount(value, decimals).map_err(|e| BridgeError::Config(e.to_string()))
}
