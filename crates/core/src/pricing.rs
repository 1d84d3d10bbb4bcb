//! Fixed-point USD/ETH arithmetic.
//!
//! USD amounts are carried with [`USD_DECIMALS`] decimals, the scale of the
//! Chainlink ETH/USD feed. Native amounts are wei.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

pub const USD_DECIMALS: u8 = 8;
pub const NATIVE_DECIMALS: u8 = 18;
pub const FEE_PERCENT: u64 = 5;

/// One basis point is 1/10000.
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Latest round as reported by a price feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRound {
    pub answer: i128,
    pub decimals: u8,
}

impl PriceRound {
    /// Price of one native unit in USD, rescaled to [`USD_DECIMALS`].
    pub fn usd_price(&self) -> Result<U256, LedgerError> {
        if self.answer <= 0 {
            return Err(LedgerError::PriceUnavailable(format!(
                "non-positive feed answer {}",
                self.answer
            )));
        }

        let raw = U256::from(self.answer as u128);
        let rescaled = if self.decimals >= USD_DECIMALS {
            checked_pow10(self.decimals - USD_DECIMALS).map(|unit| raw / unit)
        } else {
            checked_pow10(USD_DECIMALS - self.decimals).and_then(|unit| raw.checked_mul(unit))
        };
        let price = rescaled.ok_or_else(|| {
            LedgerError::PriceUnavailable(format!("feed decimals {} out of range", self.decimals))
        })?;

        if price.is_zero() {
            return Err(LedgerError::PriceUnavailable(
                "feed answer rounds to zero".to_string(),
            ));
        }
        Ok(price)
    }
}

pub fn pow10(exp: u8) -> U256 {
    U256::from(10u64).pow(U256::from(exp))
}

/// `10^exp`, or `None` past the range of `U256`.
pub fn checked_pow10(exp: u8) -> Option<U256> {
    U256::from(10u64).checked_pow(U256::from(exp))
}

/// `usd * 10^18 / price`, truncating.
pub fn usd_to_native(usd_amount: U256, round: &PriceRound) -> Result<U256, LedgerError> {
    let price = round.usd_price()?;
    let scaled = usd_amount
        .checked_mul(pow10(NATIVE_DECIMALS))
        .ok_or_else(|| LedgerError::PriceUnavailable("usd amount overflows".to_string()))?;
    Ok(scaled / price)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeSplit {
    pub fee: U256,
    pub payout: U256,
}

/// Platform fee is truncated; the payee receives the remainder, so
/// `fee + payout == native_amount` always.
pub fn split_fee(native_amount: U256) -> FeeSplit {
    let fee = native_amount * U256::from(FEE_PERCENT) / U256::from(100u64);
    FeeSplit {
        fee,
        payout: native_amount - fee,
    }
}

/// Amount increased by `bps` basis points, rounding up.
pub fn with_buffer(amount: U256, bps: u32) -> U256 {
    let denom = U256::from(BPS_DENOMINATOR);
    let numerator = amount * (denom + U256::from(bps));
    (numerator + denom - U256::from(1u64)) / denom
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseAmountError {
    #[error("amount is empty")]
    Empty,

    #[error("invalid digit in amount: {0}")]
    InvalidDigit(String),

    #[error("too many fractional digits (max {max})")]
    TooPrecise { max: u8 },

    #[error("amount out of range")]
    Overflow,
}

/// Parses a decimal dollar string such as `"1000"` or `"1000.25"`.
pub fn parse_usd(input: &str) -> Result<U256, ParseAmountError> {
    parse_fixed(input, USD_DECIMALS)
}

pub fn parse_fixed(input: &str, decimals: u8) -> Result<U256, ParseAmountError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ParseAmountError::Empty);
    }

    let (whole, frac) = match input.split_once('.') {
        Some((w, f)) => (w, f),
        None => (input, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(ParseAmountError::Empty);
    }
    if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return Err(ParseAmountError::InvalidDigit(input.to_string()));
    }
    if frac.len() > decimals as usize {
        return Err(ParseAmountError::TooPrecise { max: decimals });
    }

    let digits = format!("{whole}{frac:0<width$}", width = decimals as usize);
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 10).map_err(|_| ParseAmountError::Overflow)
}

/// Renders a fixed-point value, trimming trailing fractional zeros.
pub fn format_fixed(value: U256, decimals: u8) -> String {
    let unit = pow10(decimals);
    let whole = value / unit;
    let frac = value % unit;
    if frac.is_zero() {
        return whole.to_string();
    }
    let frac = format!("{:0>width$}", frac.to_string(), width = decimals as usize);
    format!("{whole}.{}", frac.trim_end_matches('0'))
}
