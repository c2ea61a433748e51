//! Core library for commanding fleets of networked servo drives.
//!
//! The drives speak a line-oriented, prompt-terminated text protocol over
//! TCP. This crate provides the protocol client ([`protocol`]), a bounded
//! parallel fleet executor ([`fleet`]), the telemetry recording engine
//! ([`telemetry`]), hierarchical parameter synchronization ([`params`])
//! and the motion-task engine ([`motion`]). The CLI layer on top of it
//! stays thin: every operation here returns a structured per-drive report
//! or a typed error and never terminates the process.

pub mod cancel;
pub mod config;
pub mod error;
pub mod fleet;
pub mod motion;
pub mod params;
pub mod protocol;
pub mod registry;
pub mod telemetry;

pub use cancel::CancelToken;
pub use config::{DriveEndpoint, ProtocolTimeouts};
pub use error::{DriveError, DriveResult};
pub use protocol::DriveSession;
