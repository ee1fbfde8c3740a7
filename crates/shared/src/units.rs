//! Fixed-point conversion between decimal strings and integer base units.

use alloy_primitives::U256;
use thiserror::Error;

/// Decimal scale of the native currency and of the sale token.
pub const ETHER_DECIMALS: u8 = 18;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitsError {
    #[error("amount is empty")]
    Empty,
    #[error("amount must not be negative")]
    Negative,
    #[error("amount is not a decimal number: {0}")]
    Malformed(String),
    #[error("amount has more than {max} fractional digits")]
    TooPrecise { max: u8 },
    #[error("amount is too large")]
    Overflow,
}

pub fn pow10(exponent: u8) -> U256 {
    U256::from(10u64).pow(U256::from(exponent))
}

/// Parses a plain decimal string (`"12"`, `"0.5"`, `".25"`) into base units.
/// Exponents, signs and separators are rejected, as is any precision finer
/// than `decimals`.
pub fn parse_units(raw: &str, decimals: u8) -> Result<U256, UnitsError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(UnitsError::Empty);
    }
    if raw.starts_with('-') {
        return Err(UnitsError::Negative);
    }

    let (whole, fraction) = match raw.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (raw, ""),
    };
    let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(whole) || !all_digits(fraction) || (whole.is_empty() && fraction.is_empty()) {
        return Err(UnitsError::Malformed(raw.to_string()));
    }
    if fraction.len() > usize::from(decimals) {
        return Err(UnitsError::TooPrecise { max: decimals });
    }

    let mut digits = String::with_capacity(whole.len() + usize::from(decimals));
    digits.push_str(whole);
    digits.push_str(fraction);
    for _ in fraction.len()..usize::from(decimals) {
        digits.push('0');
    }
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }

    U256::from_str_radix(digits, 10).map_err(|_| UnitsError::Overflow)
}

/// Renders base units with `fraction_digits` decimals, truncating the rest.
pub fn format_units(value: U256, decimals: u8, fraction_digits: usize) -> String {
    let scale = pow10(decimals);
    let whole = value / scale;
    if fraction_digits == 0 {
        return whole.to_string();
    }

    let remainder = (value % scale).to_string();
    let mut fraction = "0".repeat(usize::from(decimals).saturating_sub(remainder.len()));
    fraction.push_str(&remainder);
    fraction.truncate(fraction_digits);
    while fraction.len() < fraction_digits {
        fraction.push('0');
    }
    format!("{whole}.{fraction}")
}

pub fn format_ether(value: U256, fraction_digits: usize) -> String {
    format_units(value, ETHER_DECIMALS, fraction_digits)
}
