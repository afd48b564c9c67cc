//! Resource quantity literals
//!
//! Workspace limits arrive as the same quantity strings container
//! orchestrators use for CPU requests: `"2"`, `"500m"`, `"1.5"`, `"2k"`,
//! `"1Ki"`, `"1e3"`.
//!
//! ```text
//! <quantity> ::= <sign>? <digits> ( "." <digits> )? <suffix>?
//! <suffix>   ::= n | u | m | k | M | G | T | P | E        (decimal SI)
//!              | Ki | Mi | Gi | Ti | Pi | Ei              (binary SI)
//!              | (e | E) <sign>? <digits>                 (exponent)
//! ```
//!
//! Only the milli-value is needed downstream. It is rounded up, so `"0.0001"`
//! still asks for one milli-CPU.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid quantity {0:?}: expected a number")]
    InvalidNumber(String),
    #[error("invalid quantity {0:?}: unknown suffix {1:?}")]
    InvalidSuffix(String, String),
    #[error("quantity {0:?} is out of range")]
    OutOfRange(String),
}

/// A parsed resource quantity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quantity {
    milli: i64,
    literal: String,
}

impl Quantity {
    /// Quantity with the given milli-value
    pub fn from_milli(milli: i64) -> Self {
        Self {
            milli,
            literal: format!("{milli}m"),
        }
    }

    /// The value in thousandths, rounded up
    pub fn milli_value(&self) -> i64 {
        self.milli
    }

    pub fn is_negative(&self) -> bool {
        self.milli < 0
    }
}

enum Scale {
    Decimal(i32),
    Binary(u32),
}

fn parse_suffix(input: &str, suffix: &str) -> Result<Scale, QuantityError> {
    let scale = match suffix {
        "" => Scale::Decimal(0),
        "n" => Scale::Decimal(-9),
        "u" => Scale::Decimal(-6),
        "m" => Scale::Decimal(-3),
        "k" => Scale::Decimal(3),
        "M" => Scale::Decimal(6),
        "G" => Scale::Decimal(9),
        "T" => Scale::Decimal(12),
        "P" => Scale::Decimal(15),
        "E" => Scale::Decimal(18),
        "Ki" => Scale::Binary(10),
        "Mi" => Scale::Binary(20),
        "Gi" => Scale::Binary(30),
        "Ti" => Scale::Binary(40),
        "Pi" => Scale::Binary(50),
        "Ei" => Scale::Binary(60),
        s if s.starts_with('e') || s.starts_with('E') => {
            let exp: i32 = s[1..]
                .parse()
                .map_err(|_| QuantityError::InvalidSuffix(input.to_string(), s.to_string()))?;
            Scale::Decimal(exp)
        }
        s => return Err(QuantityError::InvalidSuffix(input.to_string(), s.to_string())),
    };
    Ok(scale)
}

fn pow10(exp: u32, input: &str) -> Result<i128, QuantityError> {
    10i128
        .checked_pow(exp)
        .ok_or_else(|| QuantityError::OutOfRange(input.to_string()))
}

/// Ceiling division for a positive denominator
fn div_ceil(n: i128, d: i128) -> i128 {
    let q = n.div_euclid(d);
    if n.rem_euclid(d) != 0 {
        q + 1
    } else {
        q
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let s = input.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }

        let (negative, unsigned) = match s.as_bytes()[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };

        let number_len = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(number_len);

        let (int_part, frac_part) = match number.split_once('.') {
            Some((i, f)) => (i, f),
            None => (number, ""),
        };
        if (int_part.is_empty() && frac_part.is_empty()) || frac_part.contains('.') {
            return Err(QuantityError::InvalidNumber(input.to_string()));
        }

        let digits = format!("{int_part}{frac_part}");
        let mut mantissa: i128 = digits
            .parse()
            .map_err(|_| QuantityError::OutOfRange(input.to_string()))?;
        if negative {
            mantissa = -mantissa;
        }

        // value = mantissa / 10^frac_len * scale; we want value * 1000
        let out_of_range = || QuantityError::OutOfRange(input.to_string());
        let frac_len = i32::try_from(frac_part.len()).map_err(|_| out_of_range())?;
        let (exp10, binary) = match parse_suffix(input, suffix)? {
            Scale::Decimal(e) => (e.checked_add(3).and_then(|x| x.checked_sub(frac_len)), 0),
            Scale::Binary(b) => ((3 - frac_len).into(), b),
        };
        let exp10 = exp10.ok_or_else(out_of_range)?;

        let mut numerator = mantissa
            .checked_mul(1i128 << binary)
            .ok_or_else(|| QuantityError::OutOfRange(input.to_string()))?;
        let mut denominator: i128 = 1;
        if exp10 >= 0 {
            numerator = numerator
                .checked_mul(pow10(exp10 as u32, input)?)
                .ok_or_else(|| QuantityError::OutOfRange(input.to_string()))?;
        } else {
            denominator = pow10(exp10.unsigned_abs(), input)?;
        }

        let milli = i64::try_from(div_ceil(numerator, denominator))
            .map_err(|_| QuantityError::OutOfRange(input.to_string()))?;

        Ok(Self {
            milli,
            literal: s.to_string(),
        })
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.literal)
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.literal)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let literal = String::deserialize(deserializer)?;
        literal.parse().map_err(serde::de::Error::custom)
    }
}
