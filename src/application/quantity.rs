//! Parsing of Kubernetes resource quantities (`250000n`, `100m`, `1.5`, `128Mi`, `1G`, `1e3`). The operator
//! only needs to compare quantities with each other, so they're converted to an `f64` number of
//! base units, which is exact for all the binary suffixes and precise enough for the rest.
use serde::{Deserialize, Deserializer};

use std::fmt::{self, Display};

#[derive(Debug, Clone, PartialEq)]
pub struct QuantityError {
    pub value: String,
}

impl Display for QuantityError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid quantity: '{}'", self.value)
    }
}

impl std::error::Error for QuantityError {}

/// Parses a quantity into its value in base units, so `"100m"` becomes `0.1` and `"1Ki"` becomes `1024.0`
pub fn parse(input: &str) -> Result<f64, QuantityError> {
    let err = || QuantityError {
        value: input.to_owned(),
    };
    let trimmed = input.trim();
    let suffix_start = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or_else(|| trimmed.len());
    let (number, suffix) = trimmed.split_at(suffix_start);

    let value: f64 = number.parse().map_err(|_| err())?;
    let multiplier = suffix_multiplier(suffix).ok_or_else(err)?;
    // dividing keeps the fractional suffixes exact, so "100m" parses to the same value as "0.1"
    let result = match suffix {
        "n" => value / 1e9,
        "u" => value / 1e6,
        "m" => value / 1e3,
        _ => value * multiplier,
    };
    if result.is_finite() && result >= 0.0 {
        Ok(result)
    } else {
        Err(err())
    }
}

fn suffix_multiplier(suffix: &str) -> Option<f64> {
    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        other if other.starts_with('e') || other.starts_with('E') => {
            let exponent: i32 = other[1..].parse().ok()?;
            10f64.powi(exponent)
        }
        _ => return None,
    };
    Some(multiplier)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawQuantity {
    Text(String),
    Integer(i64),
    Float(f64),
}

/// Accepts quantities written as either strings or bare numbers, like `cpu: 1`
pub(crate) fn deserialize_optional<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawQuantity>::deserialize(deserializer)?;
    Ok(raw.map(|quantity| match quantity {
        RawQuantity::Text(s) => s,
        RawQuantity::Integer(i) => i.to_string(),
        RawQuantity::Float(f) => f.to_string(),
    }))
}
