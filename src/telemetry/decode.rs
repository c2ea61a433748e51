//! Decoder for the drive's compact internal sample encoding.
//!
//! To sustain high retrieval rates the recorder is configured for the
//! internal format rather than the human-readable one. Each retrieved row
//! is a comma-separated set of tokens:
//!
//! - a token starting with `F` is a scaled fixed-point value: the next
//!   character is a decimal scale exponent and the remainder is a hex
//!   mantissa, so `F3-2EE0` decodes to `-0x2EE0 * 10^-3 = -12.0`;
//! - any other token is a plain hex integer.

use crate::error::{DriveError, DriveResult};

fn bad_token(token: &str) -> DriveError {
    DriveError::TypeMismatch {
        expected: "an internal-format sample",
        got: token.to_string(),
    }
}

/// Decode one sample token.
pub fn decode_sample(token: &str) -> DriveResult<f64> {
    let bytes = token.as_bytes();
    if bytes.first() == Some(&b'F') {
        let scale = bytes
            .get(1)
            .filter(|b| b.is_ascii_digit())
            .map(|b| i32::from(b - b'0'))
            .ok_or_else(|| bad_token(token))?;
        let mantissa =
            i64::from_str_radix(&token[2..], 16).map_err(|_| bad_token(token))?;
        Ok(mantissa as f64 * 10f64.powi(-scale))
    } else {
        let value = i64::from_str_radix(token, 16).map_err(|_| bad_token(token))?;
        Ok(value as f64)
    }
}

/// Decode one comma-separated row of sample tokens.
pub fn decode_row(line: &str) -> DriveResult<Vec<f64>> {
    line.split(',').map(|t| decode_sample(t.trim())).collect()
}
