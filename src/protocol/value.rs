//! Typed response parsing and value-set formatting.
//!
//! Drive responses are plain text. Numeric replies optionally carry a
//! bracketed unit suffix (`"123.000 [deg]"`); the parsers here split that
//! suffix off and hand it back separately when asked. Text that does not
//! match the expected numeric shape is a [`DriveError::TypeMismatch`],
//! never a default value.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{DriveError, DriveResult};

/// `<token> [unit]` — leading whitespace tolerated, unit optional.
#[allow(clippy::unwrap_used)]
static VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\S+)( \[(.*)\])?").unwrap());

/// Split a raw response into its value token and optional unit.
fn split_unit(raw: &str) -> Option<(&str, Option<&str>)> {
    let caps = VALUE_RE.captures(raw)?;
    let token = caps.get(1)?.as_str();
    let unit = caps.get(3).map(|m| m.as_str());
    Some((token, unit))
}

/// Parse an integer reply, returning the unit when the device echoed one.
pub fn parse_int(raw: &str) -> DriveResult<(i64, Option<String>)> {
    let mismatch = || DriveError::TypeMismatch {
        expected: "an int",
        got: raw.to_string(),
    };
    let (token, unit) = split_unit(raw).ok_or_else(mismatch)?;
    let value = token.parse::<i64>().map_err(|_| mismatch())?;
    Ok((value, unit.map(str::to_string)))
}

/// Parse a float reply, returning the unit when the device echoed one.
pub fn parse_float(raw: &str) -> DriveResult<(f64, Option<String>)> {
    let mismatch = || DriveError::TypeMismatch {
        expected: "a float",
        got: raw.to_string(),
    };
    let (token, unit) = split_unit(raw).ok_or_else(mismatch)?;
    let value = token.parse::<f64>().map_err(|_| mismatch())?;
    Ok((value, unit.map(str::to_string)))
}

/// A parameter value as it travels to and from a drive.
///
/// Values are opaque to the crate: no device schema is consulted. The only
/// formatting rule lives in [`fmt::Display`]: floats are written with
/// exactly three decimal digits, since the device rejects higher precision.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Classify a live value read back from a drive.
    ///
    /// The protocol carries no type information, so this is a heuristic
    /// fallback chain: int first, then float, then the raw text. It is the
    /// single place that chain lives; parameter trees carry typed YAML
    /// scalars and never go through it.
    pub fn classify(raw: &str) -> Value {
        let trimmed = raw.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return Value::Float(f);
        }
        Value::Text(raw.to_string())
    }

    /// Numeric view of the value, when it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            // The device rejects floats with more than three decimals.
            Value::Float(v) => write!(f, "{:.3}", v),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}
