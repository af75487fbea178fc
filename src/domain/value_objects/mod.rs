//! Value Objects for pricing and incentives

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Referral code value object.
///
/// Codes are compared case-insensitively, so the stored form is trimmed and
/// upper-cased once at construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReferralCode(String);

impl ReferralCode {
    pub fn new(value: impl AsRef<str>) -> Result<Self, ReferralCodeError> {
        let value = value.as_ref().trim().to_uppercase();
        if value.is_empty() { return Err(ReferralCodeError::Empty); }
        if value.len() > 32 { return Err(ReferralCodeError::TooLong); }
        if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(ReferralCodeError::InvalidCharacter);
        }
        Ok(Self(value))
    }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ReferralCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl TryFrom<String> for ReferralCode {
    type Error = ReferralCodeError;
    fn try_from(value: String) -> Result<Self, Self::Error> { Self::new(value) }
}

impl From<ReferralCode> for String {
    fn from(code: ReferralCode) -> Self { code.0 }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferralCodeError {
    #[error("referral code is empty")]
    Empty,
    #[error("referral code is longer than 32 characters")]
    TooLong,
    #[error("referral code may only contain letters, digits, '-' and '_'")]
    InvalidCharacter,
}

/// Number of decimal places in the currency's minor unit (ISO 4217).
pub fn minor_units(currency: &str) -> u32 {
    match currency {
        "JPY" | "KRW" | "ISK" | "CLP" | "VND" | "UGX" | "XAF" | "XOF" => 0,
        "BHD" | "KWD" | "OMR" | "JOD" | "TND" => 3,
        _ => 2,
    }
}

/// Money value object
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money { amount: Decimal, currency: String }

impl Money {
    pub fn new(amount: Decimal, currency: &str) -> Self { Self { amount, currency: currency.to_uppercase() } }
    pub fn sek(amount: Decimal) -> Self { Self::new(amount, "SEK") }
    pub fn usd(amount: Decimal) -> Self { Self::new(amount, "USD") }
    pub fn zero(currency: &str) -> Self { Self::new(Decimal::ZERO, currency) }
    pub fn amount(&self) -> Decimal { self.amount }
    pub fn currency(&self) -> &str { &self.currency }
    pub fn is_zero(&self) -> bool { self.amount.is_zero() }
    pub fn is_negative(&self) -> bool { self.amount.is_sign_negative() && !self.amount.is_zero() }
    pub fn is_positive(&self) -> bool { self.amount > Decimal::ZERO }

    pub fn add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.same_currency(other)?;
        Ok(Money::new(self.amount + other.amount, &self.currency))
    }

    pub fn subtract(&self, other: &Money) -> Result<Money, MoneyError> {
        self.same_currency(other)?;
        Ok(Money::new(self.amount - other.amount, &self.currency))
    }

    pub fn multiply(&self, qty: u32) -> Money { Money::new(self.amount * Decimal::from(qty), &self.currency) }

    /// `percent` of this amount, unrounded.
    pub fn percent(&self, percent: Percent) -> Money { Money::new(self.amount * percent.fraction(), &self.currency) }

    /// Rounds to the currency's minor unit with banker's rounding.
    pub fn round_minor(&self) -> Money {
        Money::new(round_minor(self.amount, &self.currency), &self.currency)
    }

    fn same_currency(&self, other: &Money) -> Result<(), MoneyError> {
        if self.currency != other.currency {
            return Err(MoneyError::CurrencyMismatch { left: self.currency.clone(), right: other.currency.clone() });
        }
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount.round_dp(minor_units(&self.currency)), self.currency)
    }
}

impl Default for Money { fn default() -> Self { Self::zero("SEK") } }

/// Banker's rounding of a raw amount to the minor unit of `currency`.
pub fn round_minor(amount: Decimal, currency: &str) -> Decimal {
    amount.round_dp_with_strategy(minor_units(currency), RoundingStrategy::MidpointNearestEven)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: String, right: String },
}

/// Percentage in the closed range 0..=100.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Percent(Decimal);

impl Percent {
    pub const ZERO: Percent = Percent(Decimal::ZERO);

    pub fn new(value: Decimal) -> Result<Self, PercentError> {
        if value < Decimal::ZERO || value > Decimal::ONE_HUNDRED { return Err(PercentError::OutOfRange(value)); }
        Ok(Self(value))
    }
    /// Whole-number percent usable in constants.
    pub const fn whole(value: u32) -> Self {
        assert!(value <= 100, "percent above 100");
        Self(Decimal::from_parts(value, 0, 0, false, 0))
    }
    pub fn from_whole(value: u32) -> Result<Self, PercentError> { Self::new(Decimal::from(value)) }
    pub fn value(&self) -> Decimal { self.0 }
    /// `percent / 100`
    pub fn fraction(&self) -> Decimal { self.0 / Decimal::ONE_HUNDRED }
    /// `1 - percent / 100`, the factor left after taking this percent off.
    pub fn remaining_factor(&self) -> Decimal { Decimal::ONE - self.fraction() }
}

impl TryFrom<Decimal> for Percent {
    type Error = PercentError;
    fn try_from(value: Decimal) -> Result<Self, Self::Error> { Self::new(value) }
}

impl From<Percent> for Decimal {
    fn from(p: Percent) -> Self { p.0 }
}

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}%", self.0.normalize()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PercentError {
    #[error("percent {0} is outside 0..=100")]
    OutOfRange(Decimal),
}

/// Quantity value object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Quantity(u32);

impl Quantity {
    pub fn new(value: u32) -> Self { Self(value) }
    pub fn value(&self) -> u32 { self.0 }
    pub fn add(&self, other: u32) -> Self { Self(self.0.saturating_add(other)) }
    pub fn subtract(&self, other: u32) -> Option<Self> {
        if other > self.0 { None } else { Some(Self(self.0 - other)) }
    }
    pub fn is_zero(&self) -> bool { self.0 == 0 }
}
