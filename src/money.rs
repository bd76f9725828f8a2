//! Parsing and formatting of the monetary value grammar used on the wire and
//! in policy configuration: `([0-9.]+) *(BTC|USD)`, at most 8 decimal places.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

const MINOR_UNITS_PER_MAJOR: i64 = 100_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "BTC")]
    Btc,
    #[serde(rename = "USD")]
    Usd,
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Currency::Btc => "BTC",
            Currency::Usd => "USD",
        })
    }
}

impl std::str::FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BTC" => Ok(Currency::Btc),
            "USD" => Ok(Currency::Usd),
            _ => Err(MoneyError::UnsupportedCurrency(s.to_string())),
        }
    }
}

/// An amount in the smallest unit of its currency (1 BTC == 10^8), tagged
/// with the currency it denominates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    pub amount: i64,
    pub currency: Currency,
}

#[derive(Debug)]
pub enum MoneyError {
    NoMatch(String),
    TooManyDecimals,
    UnsupportedCurrency(String),
    Overflow,
}

impl fmt::Display for MoneyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MoneyError::NoMatch(s) => write!(f, "'{}' does not match the monetary grammar", s),
            MoneyError::TooManyDecimals => write!(f, "max precision is 8 decimal places"),
            MoneyError::UnsupportedCurrency(s) => write!(f, "unsupported currency '{}'", s),
            MoneyError::Overflow => write!(f, "amount overflows i64 minor units"),
        }
    }
}

impl std::error::Error for MoneyError {}

fn grammar() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^([0-9.]+) *(BTC|USD)$").expect("static regex"))
}

impl Money {
    pub fn parse(s: &str) -> Result<Money, MoneyError> {
        let caps = grammar()
            .captures(s.trim())
            .ok_or_else(|| MoneyError::NoMatch(s.to_string()))?;
        let number = &caps[1];
        let currency: Currency = caps[2].parse()?;

        let (whole, frac) = match number.split_once('.') {
            Some((w, f)) => (w, f),
            None => (number, ""),
        };
        if frac.len() > 8 {
            return Err(MoneyError::TooManyDecimals);
        }
        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| MoneyError::Overflow)?
        };
        let mut frac_digits = frac.to_string();
        while frac_digits.len() < 8 {
            frac_digits.push('0');
        }
        let frac_minor: i64 = if frac_digits.is_empty() {
            0
        } else {
            frac_digits.parse().map_err(|_| MoneyError::Overflow)?
        };
        let amount = whole
            .checked_mul(MINOR_UNITS_PER_MAJOR)
            .and_then(|v| v.checked_add(frac_minor))
            .ok_or(MoneyError::Overflow)?;

        Ok(Money { amount, currency })
    }

    /// Render back in the canonical `X.XXXXXXXX CCY` form, trimming trailing
    /// zeros (but keeping at least one digit after the point when non-zero).
    pub fn format(&self) -> String {
        let whole = self.amount / MINOR_UNITS_PER_MAJOR;
        let frac = (self.amount % MINOR_UNITS_PER_MAJOR).abs();
        let mut frac_str = format!("{:08}", frac);
        while frac_str.len() > 1 && frac_str.ends_with('0') {
            frac_str.pop();
        }
        if frac_str == "0" {
            format!("{} {}", whole, self.currency)
        } else {
            format!("{}.{} {}", whole, frac_str, self.currency)
        }
    }

    pub fn checked_sub(&self, other: &Money) -> Option<Money> {
        if self.currency != other.currency {
            return None;
        }
        Some(Money {
            amount: self.amount.checked_sub(other.amount)?,
            currency: self.currency,
        })
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.format())
    }
}
