// Resource Units
// CPU and memory quantities accepted as plain numbers or suffixed strings

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Raw YAML scalar forms accepted for a quantity
#[derive(Deserialize)]
#[serde(untagged)]
enum RawQuantity {
    Int(i64),
    Float(f64),
    Text(String),
}

/// CPU quantity in millicores.
///
/// Integers are taken as millicores; strings accept `500m` or fractional
/// cores such as `1.5`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliCpu(pub i64);

/// Memory quantity in bytes.
///
/// Integers are taken as bytes; strings accept binary suffixes with or without
/// the `i` and trailing `B` (`512Mi`, `1GiB`, `1G`, `64k`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct BytesSize(pub i64);

/// Error produced by quantity parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitError(pub String);

impl fmt::Display for UnitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid quantity: {}", self.0)
    }
}

impl std::error::Error for UnitError {}

/// Parse a CPU string into millicores
pub fn parse_cpu(value: &str) -> Result<i64, UnitError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0);
    }
    if let Some(millis) = value.strip_suffix('m') {
        return millis
            .trim()
            .parse::<i64>()
            .map_err(|_| UnitError(value.to_string()));
    }
    value
        .parse::<f64>()
        .map(|cores| (cores * 1000.0).round() as i64)
        .map_err(|_| UnitError(value.to_string()))
}

/// Parse a memory string into bytes
pub fn parse_bytes(value: &str) -> Result<i64, UnitError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0);
    }

    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| UnitError(value.to_string()))?;

    let suffix = suffix.trim().to_lowercase();
    let suffix = suffix.strip_suffix('b').unwrap_or(&suffix);
    let suffix = suffix.strip_suffix('i').unwrap_or(suffix);
    let multiplier: i64 = match suffix {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        "p" => 1 << 50,
        _ => return Err(UnitError(value.to_string())),
    };

    Ok((number * multiplier as f64).round() as i64)
}

impl<'de> Deserialize<'de> for MilliCpu {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawQuantity::deserialize(deserializer)? {
            RawQuantity::Int(millis) => Ok(Self(millis)),
            RawQuantity::Float(cores) => Ok(Self((cores * 1000.0).round() as i64)),
            RawQuantity::Text(text) => parse_cpu(&text)
                .map(Self)
                .map_err(serde::de::Error::custom),
        }
    }
}

impl Serialize for MilliCpu {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for BytesSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawQuantity::deserialize(deserializer)? {
            RawQuantity::Int(bytes) => Ok(Self(bytes)),
            RawQuantity::Float(bytes) => Ok(Self(bytes.round() as i64)),
            RawQuantity::Text(text) => parse_bytes(&text)
                .map(Self)
                .map_err(serde::de::Error::custom),
        }
    }
}

impl Serialize for BytesSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

/// Render millicores the way kubernetes quantities expect (`500m`)
pub fn format_cpu(millis: i64) -> String {
    format!("{}m", millis)
}

/// Render bytes as a kubernetes quantity
pub fn format_bytes(bytes: i64) -> String {
    bytes.to_string()
}
