//! Custom error types for the crate.
//!
//! This module defines the primary error type, `DriveError`, for the entire
//! library. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures a fleet
//! operation can hit, from connection problems to device-reported errors.
//!
//! ## Error Hierarchy
//!
//! `DriveError` is an enum that consolidates the failure modes of one drive:
//!
//! - **`Connect`**: the drive was unreachable or the connect timed out.
//! - **`NoResponse`**: the drive accepted the connection but an exchange
//!   produced no terminated response within its timeout.
//! - **`Device`**: the drive answered with its literal `Error:` marker; the
//!   device's own error text is carried along.
//! - **`TypeMismatch`**: a response did not match the numeric shape the
//!   caller asked for. Malformed text is never silently coerced to a
//!   default value.
//! - **`Parameter`**: a malformed parameter file or tree, or an
//!   unresolvable drive name.
//! - **`RecordingLimit`**: more recording channels requested than the
//!   device has hardware slots for.
//! - **`MotionFault`**: the motion status word reported a device-side
//!   fault while a task was being polled.
//! - **`Io`**: wraps `std::io::Error` for socket and file trouble.
//!
//! Every variant's display text carries enough context (drive label,
//! offending command) to identify the drive inside an aggregated fleet
//! report.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DriveResult<T> = std::result::Result<T, DriveError>;

/// Highest number of simultaneously recordable channels a drive offers.
pub const MAX_RECORD_CHANNELS: usize = 6;

#[derive(Error, Debug)]
pub enum DriveError {
    #[error("Could not connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("Drive {drive} (cmd: {cmd:?}) doesn't respond")]
    NoResponse { drive: String, cmd: String },

    #[error("Drive {drive} (cmd: {cmd:?}) Error: {message}")]
    Device {
        drive: String,
        cmd: String,
        message: String,
    },

    #[error("Expecting {expected}, got {got:?}")]
    TypeMismatch { expected: &'static str, got: String },

    #[error("Parameter error: {0}")]
    Parameter(String),

    #[error("Cannot record more than {MAX_RECORD_CHANNELS} channels ({0} requested)")]
    RecordingLimit(usize),

    #[error("Motion task failed: {0}")]
    MotionFault(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DriveError::Device {
            drive: "axis1".to_string(),
            cmd: "drv.en".to_string(),
            message: "command not allowed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Drive axis1 (cmd: \"drv.en\") Error: command not allowed"
        );
    }

    #[test]
    fn test_recording_limit_display() {
        let err = DriveError::RecordingLimit(7);
        assert!(err.to_string().contains("more than 6 channels"));
        assert!(err.to_string().contains("7 requested"));
    }
}
