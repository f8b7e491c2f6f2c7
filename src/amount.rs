//! Fixed-point amounts at 1e-8 scale
//!
//! Balances never touch binary floating point. Every stored and computed
//! value is an integer count of minor units (satoshi-scale), and crosses
//! the ledger-of-record boundary as a decimal string.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Number of fractional digits carried by every amount
pub const DECIMALS: u32 = 8;

/// Minor units per whole coin
pub const UNITS_PER_COIN: u64 = 100_000_000;

/// Fixed-point scale applied to fee percentages
const PERCENT_SCALE: u128 = 100_000_000;

/// Non-negative amount in minor units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Build from minor units (satoshis)
    pub const fn from_sat(sat: u64) -> Self {
        Self(sat)
    }

    /// Minor units (satoshis)
    pub const fn to_sat(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Result<Amount> {
        self.0
            .checked_add(other.0)
            .map(Amount)
            .ok_or_else(|| Error::InvalidAmount(format!("{} + {} overflows", self, other)))
    }

    /// Subtraction that refuses to go negative
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Signed difference `self - other`
    pub fn signed_diff(self, other: Amount) -> SignedAmount {
        SignedAmount((self.0 as i128 - other.0 as i128) as i64)
    }

    /// Sum a sequence of amounts, failing on overflow
    pub fn sum<'a, I: IntoIterator<Item = &'a Amount>>(amounts: I) -> Result<Amount> {
        amounts
            .into_iter()
            .try_fold(Amount::ZERO, |acc, a| acc.checked_add(*a))
    }

    /// Multiply by a percentage and round half away from zero to the minor unit
    ///
    /// The percentage is fixed to 1e-8 before any arithmetic, so the
    /// rounding itself is exact.
    pub fn percent(self, percentage: f64) -> Amount {
        if !percentage.is_finite() || percentage <= 0.0 {
            return Amount::ZERO;
        }
        let scaled = (percentage * PERCENT_SCALE as f64).round() as u128;
        let denominator = 100 * PERCENT_SCALE;
        let fee = (self.0 as u128 * scaled + denominator / 2) / denominator;
        Amount(u64::try_from(fee).unwrap_or(u64::MAX))
    }

    /// Require a strictly positive amount
    pub fn ensure_positive(self, what: &str) -> Result<Amount> {
        if self.is_zero() {
            return Err(Error::InvalidAmount(format!("{} must be positive", what)));
        }
        Ok(self)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:08}",
            self.0 / UNITS_PER_COIN,
            self.0 % UNITS_PER_COIN
        )
    }
}

impl FromStr for Amount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidAmount("empty amount".to_string()));
        }

        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };

        let digits_only = |part: &str| part.chars().all(|c| c.is_ascii_digit());
        if whole.is_empty() && frac.is_empty()
            || !digits_only(whole)
            || !digits_only(frac)
        {
            return Err(Error::InvalidAmount(format!("malformed amount: {:?}", s)));
        }

        if frac.len() > DECIMALS as usize {
            return Err(Error::InvalidAmount(format!(
                "{:?} has more than {} fractional digits",
                s, DECIMALS
            )));
        }

        let whole_units: u64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| Error::InvalidAmount(format!("amount too large: {}", s)))?
        };

        let mut frac_padded = frac.to_string();
        while frac_padded.len() < DECIMALS as usize {
            frac_padded.push('0');
        }
        let frac_units: u64 = frac_padded
            .parse()
            .map_err(|_| Error::InvalidAmount(format!("malformed amount: {:?}", s)))?;

        whole_units
            .checked_mul(UNITS_PER_COIN)
            .and_then(|w| w.checked_add(frac_units))
            .map(Amount)
            .ok_or_else(|| Error::InvalidAmount(format!("amount too large: {}", s)))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Signed amount in minor units, used for drift and balance deltas
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SignedAmount(i64);

impl SignedAmount {
    pub const ZERO: SignedAmount = SignedAmount(0);

    pub const fn from_sat(sat: i64) -> Self {
        Self(sat)
    }

    pub const fn to_sat(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Magnitude as an unsigned amount
    pub fn unsigned_abs(self) -> Amount {
        Amount(self.0.unsigned_abs())
    }
}

impl fmt::Display for SignedAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 < 0 {
            write!(f, "-{}", self.unsigned_abs())
        } else {
            write!(f, "{}", self.unsigned_abs())
        }
    }
}

impl FromStr for SignedAmount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let magnitude: Amount = body.parse()?;
        let sat = i64::try_from(magnitude.to_sat())
            .map_err(|_| Error::InvalidAmount(format!("amount too large: {}", s)))?;
        Ok(SignedAmount(if negative { -sat } else { sat }))
    }
}

impl Serialize for SignedAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SignedAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(amt("0.75").to_sat(), 75_000_000);
        assert_eq!(amt("2").to_sat(), 200_000_000);
        assert_eq!(amt(".5").to_sat(), 50_000_000);
        assert_eq!(amt("0.00000001").to_sat(), 1);
        assert_eq!(amt("0.2499").to_string(), "0.24990000");
        assert_eq!(Amount::from_sat(123).to_string(), "0.00000123");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", ".", "-1", "1e8", "0.000000001", "abc", "1.2.3", " . "] {
            assert!(bad.parse::<Amount>().is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_withdraw_arithmetic_is_exact() {
        let balance = amt("0.75");
        let debit = amt("0.5").checked_add(amt("0.0001")).unwrap();
        assert_eq!(balance.checked_sub(debit).unwrap(), amt("0.2499"));
    }

    #[test]
    fn test_many_small_transfers_do_not_drift() {
        let mut balance = Amount::ZERO;
        for _ in 0..10_000 {
            balance = balance.checked_add(amt("0.1")).unwrap();
        }
        assert_eq!(balance, amt("1000"));
    }

    #[test]
    fn test_percent_rounding() {
        assert_eq!(amt("1").percent(2.5), amt("0.025"));
        assert_eq!(Amount::from_sat(3).percent(50.0), Amount::from_sat(2));
        assert_eq!(amt("1").percent(0.0), Amount::ZERO);
        // Float products land just under .5 here
        assert_eq!(Amount::from_sat(1_500).percent(2.3), Amount::from_sat(35));
        assert_eq!(Amount::from_sat(11_000).percent(0.35), Amount::from_sat(39));
        assert_eq!(Amount::from_sat(u64::MAX).percent(100.0), Amount::from_sat(u64::MAX));
    }

    #[test]
    fn test_signed_amount() {
        let drift = amt("1").signed_diff(amt("1.5"));
        assert!(drift.is_negative());
        assert_eq!(drift.to_string(), "-0.50000000");
        assert_eq!("-0.5".parse::<SignedAmount>().unwrap(), drift);
        assert_eq!(drift.unsigned_abs(), amt("0.5"));
    }

    #[test]
    fn test_serde_uses_decimal_strings() {
        let json = serde_json::to_string(&amt("0.2499")).unwrap();
        assert_eq!(json, "\"0.24990000\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amt("0.2499"));
    }
}
