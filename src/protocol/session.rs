//! Typed command execution against one connected drive.
//!
//! A [`DriveSession`] owns exactly one [`Transport`] and layers the typed
//! accessors, the value setter, and the derived drive operations (fault
//! queries, enable/disable, flash, factory reset) on top of the raw
//! exchange. Construction bootstraps the drive's self-reported identity
//! name, which every error and log line then carries.
//!
//! The connection is released exactly once: on explicit
//! [`DriveSession::disconnect`] or when the session is dropped, whichever
//! comes first.

use std::time::Duration;

use log::debug;
use tokio::time::sleep;

use super::transport::Transport;
use super::value::{self, Value};
use crate::config::{nice_name, DriveEndpoint, ProtocolTimeouts};
use crate::error::{DriveError, DriveResult};

/// One entry of the drive's non-default parameter list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NonDefaultParam {
    pub name: String,
    pub value: String,
    /// Factory default the value deviates from.
    pub default: String,
}

/// Reasons a drive may refuse to enable, in `drv.dissources` bit order.
const DISABLE_SOURCES: [&str; 11] = [
    "Software disable",
    "Fault exists",
    "Hardware disable",
    "In-rush disable (no high power)",
    "Initialization disable (the drive did not finish the initialization)",
    "Controlled stop disable from a digital input",
    "Field Bus requested disable",
    "Controller requested disable (remote-string drive only)",
    "Pre-charge disable (string controller only)",
    "Unknown",
    "String controller in download mode",
];

/// Identity parameters appended to a saved parameter file's info trailer.
const INFO_PARAMS: [&str; 24] = [
    "IP.MODE",
    "IL.KPDRATIO",
    "MOTOR.BRAKE",
    "MOTOR.CTF0",
    "MOTOR.ICONT",
    "MOTOR.INERTIA",
    "MOTOR.IPEAK",
    "MOTOR.KE",
    "MOTOR.KT",
    "MOTOR.LDLL",
    "MOTOR.LISAT",
    "MOTOR.LQLL",
    "MOTOR.NAME",
    "MOTOR.POLES",
    "MOTOR.R",
    "MOTOR.RSOURCE",
    "MOTOR.RTYPE",
    "MOTOR.TBRAKEAPP",
    "MOTOR.TBRAKERLS",
    "MOTOR.TEMPFAULT",
    "MOTOR.TYPE",
    "MOTOR.VMAX",
    "MOTOR.VOLTMAX",
    "FB1.IDENTIFIED",
];

/// A live, half-duplex session with one drive.
#[derive(Debug)]
pub struct DriveSession {
    endpoint: DriveEndpoint,
    timeouts: ProtocolTimeouts,
    transport: Option<Transport>,
    name: String,
}

impl DriveSession {
    /// Connect and bootstrap the drive's identity name.
    pub async fn connect(
        endpoint: DriveEndpoint,
        timeouts: ProtocolTimeouts,
    ) -> DriveResult<Self> {
        let transport = Transport::connect(&endpoint, &timeouts).await?;
        let mut session = Self {
            endpoint,
            timeouts,
            transport: Some(transport),
            name: String::new(),
        };
        session.name = session.command_str("drv.name").await?;
        let label = session.label();
        if let Some(t) = session.transport.as_mut() {
            t.set_label(label);
        }
        Ok(session)
    }

    /// The drive's self-reported name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &DriveEndpoint {
        &self.endpoint
    }

    /// `name (ip: host)` label used in reports and logs.
    pub fn label(&self) -> String {
        nice_name(&self.name, &self.endpoint.host)
    }

    /// Close the connection. Idempotent; later calls are no-ops and later
    /// commands fail with an I/O error.
    pub async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown().await;
            debug!("[{}] disconnected", self.label());
        }
    }

    fn transport(&mut self) -> DriveResult<&mut Transport> {
        self.transport.as_mut().ok_or_else(|| {
            DriveError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session already disconnected",
            ))
        })
    }

    /// Execute one command with the default exchange timeout.
    pub async fn command(&mut self, cmd: &str) -> DriveResult<Vec<u8>> {
        let timeout = self.timeouts.command();
        self.command_with_timeout(cmd, timeout).await
    }

    /// Execute one command with an explicit timeout (factory reset and
    /// flash need more than the default).
    pub async fn command_with_timeout(
        &mut self,
        cmd: &str,
        timeout: Duration,
    ) -> DriveResult<Vec<u8>> {
        self.transport()?.execute(cmd, timeout).await
    }

    /// Execute and parse the reply as an integer.
    pub async fn command_int(&mut self, cmd: &str) -> DriveResult<i64> {
        let raw = self.command(cmd).await?;
        Ok(value::parse_int(&String::from_utf8_lossy(&raw))?.0)
    }

    /// Execute and parse the reply as an integer plus its unit, when the
    /// device echoes one.
    pub async fn command_int_unit(&mut self, cmd: &str) -> DriveResult<(i64, Option<String>)> {
        let raw = self.command(cmd).await?;
        value::parse_int(&String::from_utf8_lossy(&raw))
    }

    /// Execute and parse the reply as a float.
    pub async fn command_float(&mut self, cmd: &str) -> DriveResult<f64> {
        let raw = self.command(cmd).await?;
        Ok(value::parse_float(&String::from_utf8_lossy(&raw))?.0)
    }

    /// Execute and parse the reply as a float plus its unit.
    pub async fn command_float_unit(&mut self, cmd: &str) -> DriveResult<(f64, Option<String>)> {
        let raw = self.command(cmd).await?;
        value::parse_float(&String::from_utf8_lossy(&raw))
    }

    /// Execute and return the reply as text with normalized line endings.
    pub async fn command_str(&mut self, cmd: &str) -> DriveResult<String> {
        let raw = self.command(cmd).await?;
        Ok(String::from_utf8_lossy(&raw).replace("\r\n", "\n"))
    }

    /// Set a parameter. Floats are formatted with exactly three decimal
    /// digits; everything else goes out as a bare token.
    pub async fn set(&mut self, param: &str, value: impl Into<Value>) -> DriveResult<()> {
        let value = value.into();
        self.command(&format!("{} {}", param, value)).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Derived operations
    // ------------------------------------------------------------------

    /// The device checksum summarizing its non-default parameter state.
    pub async fn checksum(&mut self) -> DriveResult<String> {
        self.command_str("drv.nvcheck").await
    }

    /// The drive's non-default parameters with their factory defaults.
    pub async fn non_default_params(&mut self) -> DriveResult<Vec<NonDefaultParam>> {
        let text = self.command_str("drv.difvar").await?;
        let mut delta = Vec::new();
        for line in text.lines() {
            delta.push(parse_difvar_line(line)?);
        }
        Ok(delta)
    }

    /// Reset every parameter to its factory default. Slow (~20 s).
    pub async fn factory_reset(&mut self) -> DriveResult<()> {
        let timeout = self.timeouts.factory_reset();
        self.command_with_timeout("drv.rstvar", timeout).await?;
        Ok(())
    }

    /// Persist the current RAM parameters to non-volatile storage.
    ///
    /// The device acknowledges the save command before the background
    /// flash write completes, so a settle sleep follows.
    pub async fn flash(&mut self) -> DriveResult<()> {
        let timeout = self.timeouts.flash();
        self.command_with_timeout("drv.nvsave", timeout).await?;
        sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    /// Active fault lines, `F`-prefixed, optionally followed by
    /// `W`-prefixed warning lines.
    pub async fn faults(&mut self, include_warnings: bool) -> DriveResult<Vec<String>> {
        let mut faults = Vec::new();

        let text = self.command_str("drv.faults").await?;
        if !text.is_empty() && text != "No faults active" {
            faults.extend(text.lines().map(|l| format!("F{}", l)));
        }

        if include_warnings {
            let text = self.command_str("drv.warnings").await?;
            if !text.is_empty() && text != "No warnings active" {
                faults.extend(text.lines().map(|l| format!("W{}", l)));
            }
        }

        Ok(faults)
    }

    /// Compact comma-separated fault code list from the numbered fault
    /// registers, e.g. `"F501,W107"`. Empty when no fault is active.
    pub async fn faults_short(&mut self, include_warnings: bool) -> DriveResult<String> {
        let mut out = String::new();
        for i in 1..=10 {
            let code = self.command_int(&format!("drv.fault{}", i)).await?;
            if code == 0 {
                break;
            }
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(&format!("F{}", code));
        }
        if include_warnings {
            for i in 1..=10 {
                let code = self.command_int(&format!("drv.warning{}", i)).await?;
                if code == 0 {
                    break;
                }
                if !out.is_empty() {
                    out.push(',');
                }
                out.push_str(&format!("W{}", code));
            }
        }
        Ok(out)
    }

    pub async fn clear_faults(&mut self) -> DriveResult<()> {
        self.command("drv.clrfaults").await?;
        Ok(())
    }

    /// Why the drive currently refuses to enable, as named reasons.
    pub async fn disable_sources(&mut self) -> DriveResult<Vec<&'static str>> {
        let mut bits = self.command_int("drv.dissources").await?;
        let mut sources = Vec::new();
        for source in DISABLE_SOURCES {
            if bits & 1 != 0 {
                sources.push(source);
            }
            bits >>= 1;
        }
        Ok(sources)
    }

    /// Enable the drive, polling until it reports active. Device faults
    /// observed while waiting are re-raised.
    pub async fn enable(&mut self) -> DriveResult<()> {
        self.clear_faults().await?;
        self.command("drv.en").await?;
        while self.command_int("drv.active").await? == 0 {
            sleep(Duration::from_millis(100)).await;
            let faults = self.faults(false).await?;
            if !faults.is_empty() {
                return Err(DriveError::Device {
                    drive: self.label(),
                    cmd: "drv.en".to_string(),
                    message: format!("drive faults: {}", faults.join(",")),
                });
            }
            self.command("drv.en").await?;
        }
        debug!("[{}] drive enabled", self.label());
        Ok(())
    }

    /// Disable the drive, polling until it reports inactive.
    pub async fn disable(&mut self) -> DriveResult<()> {
        while self.command_int("drv.active").await? != 0 {
            self.command("drv.dis").await?;
            sleep(Duration::from_millis(100)).await;
        }
        debug!("[{}] drive disabled", self.label());
        Ok(())
    }

    /// Fixed unit setup every fleet in a machine shares.
    pub async fn set_standard_units(&mut self) -> DriveResult<()> {
        self.set("unit.protary", 2).await?; // deg
        self.set("unit.vrotary", 1).await?; // rev/s
        self.set("unit.accrotary", 1).await?; // rev/s/s
        self.set("unit.pin", 1048576).await?;
        self.set("unit.pout", 1).await?;
        Ok(())
    }

    /// Motor temperature in degrees Celsius.
    pub async fn temperature(&mut self) -> DriveResult<i64> {
        self.command_int("motor.tempc").await
    }

    /// Shift the feedback offset so the current position reads zero.
    /// Returns the confirmed new offset and its unit.
    pub async fn home_here(&mut self) -> DriveResult<(f64, Option<String>)> {
        let position = self.command_float("pl.fb").await?;
        let (offset, unit) = self.command_float_unit("fb1.offset").await?;
        self.set("fb1.offset", -(position - offset)).await?;
        let confirmed = self.command_float("fb1.offset").await?;
        debug!(
            "[{}] offset old: {}  new: {}",
            self.label(),
            offset,
            confirmed
        );
        Ok((confirmed, unit))
    }

    /// `#`-prefixed identity block appended to saved parameter files:
    /// `drv.info`, the motor/feedback parameters, and the `DRV.NVCHECK`
    /// marker line the restore short-circuit keys on.
    pub async fn info_header(&mut self) -> DriveResult<String> {
        let mut s = String::from("# DRV.INFO\n#   ");
        let info = self.command_str("drv.info").await?;
        s.push_str(&info.lines().collect::<Vec<_>>().join("\n#   "));

        for param in INFO_PARAMS {
            // Not every parameter exists on every drive variant; missing
            // ones are skipped.
            if let Ok(value) = self.command_str(param).await {
                s.push_str(&format!("\n# {} {}", param, value));
            }
        }

        let checksum = self.checksum().await?;
        s.push_str(&format!("\n#\n# DRV.NVCHECK {}", checksum));
        Ok(s)
    }

    /// Run a recorded command script, one command per line.
    ///
    /// Lines indented with a leading space execute with their output
    /// suppressed; the outputs of all other lines are returned in order.
    pub async fn run_script(&mut self, script: &str) -> DriveResult<Vec<String>> {
        let mut outputs = Vec::new();
        for line in script.lines() {
            if let Some(silenced) = line.strip_prefix(' ') {
                self.command_str(silenced.trim_start()).await?;
            } else {
                outputs.push(self.command_str(line).await?);
            }
        }
        Ok(outputs)
    }
}

/// Parse one `drv.difvar` output line: `NAME value (default)`.
fn parse_difvar_line(line: &str) -> DriveResult<NonDefaultParam> {
    use once_cell::sync::Lazy;
    use regex::Regex;

    #[allow(clippy::unwrap_used)]
    static DIFVAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.*?) (.*?) \((.*)\)").unwrap());

    let caps = DIFVAR_RE
        .captures(line)
        .ok_or_else(|| DriveError::Parameter(format!("unexpected difvar output: {:?}", line)))?;
    Ok(NonDefaultParam {
        name: caps[1].to_string(),
        value: caps[2].to_string(),
        default: caps[3].to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_difvar_line() {
        let p = parse_difvar_line("IL.KP 120.000 (480.000)").unwrap();
        assert_eq!(p.name, "IL.KP");
        assert_eq!(p.value, "120.000");
        assert_eq!(p.default, "480.000");
    }

    #[test]
    fn test_parse_difvar_line_rejects_garbage() {
        assert!(parse_difvar_line("nonsense").is_err());
    }
}
