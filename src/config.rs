//! Connection endpoints and protocol timing settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Network address of one drive plus its wire-trace flag.
///
/// An endpoint is owned exclusively by one
/// [`DriveSession`](crate::protocol::DriveSession); the underlying socket is
/// closed exactly once, on explicit disconnect or when the session is
/// dropped.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DriveEndpoint {
    /// Configured drive name. May be empty when selecting by raw address;
    /// the session replaces it with the drive's self-reported name.
    #[serde(default)]
    pub name: String,
    /// Hostname or IP address.
    pub host: String,
    /// TCP port of the drive's command console.
    #[serde(default = "default_port")]
    pub port: u16,
    /// When set, every wire exchange is logged.
    #[serde(default)]
    pub trace: bool,
}

fn default_port() -> u16 {
    23
}

impl DriveEndpoint {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: default_port(),
            trace: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// `host:port` form used for connecting and error labels.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Human label combining the drive name and its address.
    pub fn label(&self) -> String {
        nice_name(&self.name, &self.host)
    }
}

/// `name (ip: host)` — the label every per-drive report line carries.
pub fn nice_name(name: &str, host: &str) -> String {
    format!("{} (ip: {})", name, host)
}

/// Per-exchange timeout settings.
///
/// Each protocol exchange carries its own timeout; a few commands are known
/// to be slow on the device side (factory reset, flash save) and get their
/// own budgets.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolTimeouts {
    /// TCP connect timeout in milliseconds.
    pub connect_ms: u64,
    /// Default command round-trip timeout in milliseconds.
    pub command_ms: u64,
    /// Timeout for the factory-reset command, which takes ~20 s.
    pub factory_reset_ms: u64,
    /// Timeout for the flash-save command.
    pub flash_ms: u64,
}

impl Default for ProtocolTimeouts {
    fn default() -> Self {
        Self {
            connect_ms: 1_000,
            command_ms: 5_000,
            factory_reset_ms: 20_000,
            flash_ms: 10_000,
        }
    }
}

impl ProtocolTimeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    pub fn factory_reset(&self) -> Duration {
        Duration::from_millis(self.factory_reset_ms)
    }

    pub fn flash(&self) -> Duration {
        Duration::from_millis(self.flash_ms)
    }
}
