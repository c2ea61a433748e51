//! Persisted parameter files: save, restore, and comparison parsing.
//!
//! The file format is plain text, one `name value` pair per line, with
//! `#` starting a comment. A saved file ends in an info trailer whose
//! `# DRV.NVCHECK <hash>` line records the device checksum at save time;
//! restore reads that marker and skips the whole replay when it still
//! matches the live device.

use std::path::Path;

use log::info;
use once_cell::sync::Lazy;
use regex::Regex;

use super::ParamMap;
use crate::error::DriveResult;
use crate::protocol::{DriveSession, Value};

#[allow(clippy::unwrap_used)]
static NVCHECK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^# DRV\.NVCHECK (\S+)\s*$").unwrap());

/// Knobs for [`restore_params`].
#[derive(Clone, Debug)]
pub struct RestoreOptions {
    /// Skip the whole restore when the file's NVCHECK marker equals the
    /// live device checksum.
    pub trust_checksum: bool,
    /// Factory-reset the drive before replaying the file.
    pub factory_reset: bool,
    /// Flash the restored parameters to non-volatile storage afterwards.
    pub flash_afterward: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            trust_checksum: true,
            factory_reset: false,
            flash_afterward: true,
        }
    }
}

/// What a restore actually did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The checksum matched; no command was replayed.
    Skipped { checksum: String },
    /// The file was replayed; `commands` lines were sent.
    Restored { commands: usize },
}

/// Save the drive's parameters to a file.
///
/// In diff-only form, only non-default parameters are written, each
/// annotated with its factory default. The full form dumps the complete
/// non-volatile list. Both end with the info trailer carrying the
/// `DRV.NVCHECK` marker.
pub async fn save_params(
    session: &mut DriveSession,
    path: &Path,
    diff_only: bool,
) -> DriveResult<()> {
    let mut out = String::new();

    if diff_only {
        for p in session.non_default_params().await? {
            out.push_str(&format!("{} {}   # ({})\n", p.name, p.value, p.default));
        }
    } else {
        out.push_str(&session.command_str("drv.nvlist").await?);
    }

    out.push_str("\n### Infos\n\n");
    out.push_str(&session.info_header().await?);
    out.push('\n');

    std::fs::write(path, out)?;
    info!("{}\tSaved parameters to {}", session.label(), path.display());
    Ok(())
}

/// Restore parameters from a file, with the trust-hash short-circuit.
pub async fn restore_params(
    session: &mut DriveSession,
    path: &Path,
    options: &RestoreOptions,
) -> DriveResult<RestoreOutcome> {
    let text = std::fs::read_to_string(path)?;

    if options.trust_checksum {
        if let Some(saved) = find_nvcheck(&text) {
            let live = session.checksum().await?;
            if saved == live {
                info!(
                    "{}\tMatching nvcheck found, no need to restore",
                    session.label()
                );
                return Ok(RestoreOutcome::Skipped { checksum: live });
            }
        }
    }

    info!(
        "{}\tRestoring parameters from {}",
        session.label(),
        path.display()
    );
    if options.factory_reset {
        session.factory_reset().await?;
    }

    let mut commands = 0;
    for line in text.lines() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        session.command(line).await?;
        commands += 1;
    }

    if options.flash_afterward {
        session.flash().await?;
    }
    Ok(RestoreOutcome::Restored { commands })
}

/// The `# DRV.NVCHECK <hash>` marker, wherever it sits in the file.
pub fn find_nvcheck(text: &str) -> Option<&str> {
    NVCHECK_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Parse a saved parameter file into a comparison source. Comment lines
/// and the info trailer are skipped; values get the heuristic type
/// classification.
pub fn parse_param_file(text: &str) -> ParamMap {
    let mut map = ParamMap::new();
    for line in text.lines() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let line = match line.find('#') {
            Some(pos) => line[..pos].trim_end(),
            None => line.trim_end(),
        };
        if let Some((name, value)) = line.split_once(' ') {
            map.insert(name.to_string(), Value::classify(value.trim()));
        }
    }
    map
}
