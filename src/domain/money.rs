//! Exact decimal money arithmetic.
//!
//! Every monetary value in the system is an [`Amount`]: a ticker, a decimal
//! value and the currency's precision. Arithmetic is only defined between
//! compatible amounts (same ticker, same precision) and every operation that
//! could silently lose money returns a [`MoneyError`] instead.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::error::MoneyError;

/// Whether an amount denominates a fiat or a crypto currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmountKind {
    Fiat,
    Crypto,
}

impl AmountKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AmountKind::Fiat => "fiat",
            AmountKind::Crypto => "crypto",
        }
    }
}

impl fmt::Display for AmountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A non-negative monetary amount in a single currency.
///
/// The value's scale never exceeds `decimals`, so converting to raw
/// smallest-unit representation is lossless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    ticker: String,
    value: Decimal,
    decimals: u32,
    kind: AmountKind,
}

impl Amount {
    /// Creates a crypto amount, rejecting negative values and values with
    /// more fractional digits than the currency supports.
    pub fn crypto(ticker: &str, value: Decimal, decimals: u32) -> Result<Self, MoneyError> {
        Self::new(ticker, value, decimals, AmountKind::Crypto)
    }

    /// Creates a fiat amount.
    pub fn fiat(ticker: &str, value: Decimal, decimals: u32) -> Result<Self, MoneyError> {
        Self::new(ticker, value, decimals, AmountKind::Fiat)
    }

    /// Creates a US dollar amount (2 fractional digits).
    pub fn usd(value: Decimal) -> Result<Self, MoneyError> {
        Self::fiat("USD", value, 2)
    }

    /// Creates a zero amount.
    #[must_use]
    pub fn zero(ticker: &str, decimals: u32, kind: AmountKind) -> Self {
        Self {
            ticker: ticker.to_uppercase(),
            value: Decimal::ZERO,
            decimals,
            kind,
        }
    }

    /// Parses an integer string of smallest currency units
    /// (e.g. wei for ETH, sun for TRX).
    pub fn from_raw(ticker: &str, raw: &str, decimals: u32) -> Result<Self, MoneyError> {
        let units: i128 = raw
            .trim()
            .parse()
            .map_err(|_| MoneyError::InvalidAmount(format!("not an integer: {raw}")))?;
        if units < 0 {
            return Err(MoneyError::InvalidAmount(format!("negative raw amount: {raw}")));
        }
        let value = Decimal::try_from_i128_with_scale(units, decimals)
            .map_err(|e| MoneyError::Overflow(e.to_string()))?;
        Self::new(ticker, value, decimals, AmountKind::Crypto)
    }

    fn new(
        ticker: &str,
        value: Decimal,
        decimals: u32,
        kind: AmountKind,
    ) -> Result<Self, MoneyError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(MoneyError::InvalidAmount(format!(
                "negative amount: {value} {ticker}"
            )));
        }
        let value = value.normalize();
        if value.scale() > decimals {
            return Err(MoneyError::InvalidAmount(format!(
                "{value} has more than {decimals} fractional digits"
            )));
        }
        Ok(Self {
            ticker: ticker.to_uppercase(),
            value,
            decimals,
            kind,
        })
    }

    #[must_use]
    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    #[must_use]
    pub fn value(&self) -> Decimal {
        self.value
    }

    #[must_use]
    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    #[must_use]
    pub fn kind(&self) -> AmountKind {
        self.kind
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    #[must_use]
    pub fn is_positive(&self) -> bool {
        !self.value.is_zero()
    }

    /// Two amounts are compatible when they share a ticker and precision.
    #[must_use]
    pub fn is_compatible(&self, other: &Amount) -> bool {
        self.ticker == other.ticker && self.decimals == other.decimals
    }

    fn ensure_compatible(&self, other: &Amount) -> Result<(), MoneyError> {
        if !self.is_compatible(other) {
            return Err(MoneyError::IncompatibleAmounts {
                expected: format!("{}/{}", self.ticker, self.decimals),
                actual: format!("{}/{}", other.ticker, other.decimals),
            });
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Amount) -> Result<Amount, MoneyError> {
        self.ensure_compatible(other)?;
        let value = self
            .value
            .checked_add(other.value)
            .ok_or_else(|| MoneyError::Overflow(format!("{} + {}", self.value, other.value)))?;
        Ok(Self {
            ticker: self.ticker.clone(),
            value,
            decimals: self.decimals,
            kind: self.kind,
        })
    }

    /// Subtracts `other`, failing if the result would be negative.
    pub fn checked_sub(&self, other: &Amount) -> Result<Amount, MoneyError> {
        self.ensure_compatible(other)?;
        if other.value > self.value {
            return Err(MoneyError::NegativeResult);
        }
        Ok(Self {
            ticker: self.ticker.clone(),
            value: self.value - other.value,
            decimals: self.decimals,
            kind: self.kind,
        })
    }

    /// Multiplies by a positive factor, truncating toward zero to the
    /// currency's precision.
    pub fn mul_decimal(&self, factor: Decimal) -> Result<Amount, MoneyError> {
        if factor <= Decimal::ZERO {
            return Err(MoneyError::InvalidAmount(format!(
                "multiplier must be positive, got {factor}"
            )));
        }
        let value = self
            .value
            .checked_mul(factor)
            .ok_or_else(|| MoneyError::Overflow(format!("{} * {factor}", self.value)))?
            .round_dp_with_strategy(self.decimals, RoundingStrategy::ToZero)
            .normalize();
        Ok(Self {
            ticker: self.ticker.clone(),
            value,
            decimals: self.decimals,
            kind: self.kind,
        })
    }

    pub fn compare(&self, other: &Amount) -> Result<Ordering, MoneyError> {
        self.ensure_compatible(other)?;
        Ok(self.value.cmp(&other.value))
    }

    /// Returns the smaller of two compatible amounts.
    pub fn min(&self, other: &Amount) -> Result<Amount, MoneyError> {
        match self.compare(other)? {
            Ordering::Greater => Ok(other.clone()),
            _ => Ok(self.clone()),
        }
    }

    /// The amount expressed as an integer count of smallest currency units.
    #[must_use]
    pub fn to_raw_string(&self) -> String {
        let mut scaled = self.value;
        scaled.rescale(self.decimals);
        scaled.mantissa().to_string()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.ticker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_rejects_negative_and_excess_precision() {
        assert!(Amount::crypto("ETH", dec!(-1), 18).is_err());
        assert!(Amount::crypto("TRX", dec!(0.0000001), 6).is_err());
        assert!(Amount::usd(dec!(1.001)).is_err());
        assert!(Amount::crypto("TRX", dec!(0.000001), 6).is_ok());
    }

    #[test]
    fn test_checked_sub_fails_on_negative_result() {
        let a = Amount::crypto("ETH", dec!(0.5), 18).unwrap();
        let b = Amount::crypto("ETH", dec!(0.7), 18).unwrap();
        assert_eq!(b.checked_sub(&a).unwrap().value(), dec!(0.2));
        assert_eq!(a.checked_sub(&b), Err(MoneyError::NegativeResult));
    }

    #[test]
    fn test_incompatible_amounts_cannot_mix() {
        let eth = Amount::crypto("ETH", dec!(1), 18).unwrap();
        let usdt6 = Amount::crypto("USDT", dec!(1), 6).unwrap();
        let usdt18 = Amount::crypto("USDT", dec!(1), 18).unwrap();

        assert!(eth.checked_add(&usdt6).is_err());
        // Same ticker, different chain precision.
        assert!(usdt6.checked_add(&usdt18).is_err());
        assert!(usdt6.compare(&usdt18).is_err());
    }

    #[test]
    fn test_mul_decimal_truncates_toward_zero() {
        let fee = Amount::usd(dec!(0.01)).unwrap();
        let scaled = fee.mul_decimal(dec!(1.5)).unwrap();
        // 0.015 truncates to 0.01 at two fractional digits.
        assert_eq!(scaled.value(), dec!(0.01));

        let amount = Amount::crypto("USDT", dec!(10), 6).unwrap();
        let converted = amount.mul_decimal(dec!(0.999999999)).unwrap();
        assert_eq!(converted.value(), dec!(9.99999999).round_dp(6));

        assert!(amount.mul_decimal(dec!(0)).is_err());
        assert!(amount.mul_decimal(dec!(-2)).is_err());
    }

    #[test]
    fn test_raw_round_trip() {
        let amount = Amount::from_raw("ETH", "1500000000000000000", 18).unwrap();
        assert_eq!(amount.value(), dec!(1.5));
        assert_eq!(amount.to_raw_string(), "1500000000000000000");

        let dust = Amount::from_raw("TRX", "1", 6).unwrap();
        assert_eq!(dust.value(), dec!(0.000001));
        assert_eq!(dust.to_raw_string(), "1");

        assert!(Amount::from_raw("ETH", "-5", 18).is_err());
        assert!(Amount::from_raw("ETH", "1.5", 18).is_err());
    }

    #[test]
    fn test_min_and_compare() {
        let a = Amount::crypto("ETH", dec!(0.3), 18).unwrap();
        let b = Amount::crypto("ETH", dec!(0.4), 18).unwrap();
        assert_eq!(a.min(&b).unwrap(), a);
        assert_eq!(b.min(&a).unwrap(), a);
        assert_eq!(a.compare(&b).unwrap(), Ordering::Less);
    }

    #[test]
    fn test_display_and_zero() {
        let zero = Amount::zero("eth", 18, AmountKind::Crypto);
        assert_eq!(zero.ticker(), "ETH");
        assert!(zero.is_zero());
        assert!(!zero.is_positive());

        let amount = Amount::crypto("ETH", dec!(0.50), 18).unwrap();
        assert_eq!(amount.to_string(), "0.5 ETH");
    }
}
