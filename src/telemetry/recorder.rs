//! On-device sample buffer configuration and retrieval for one drive.
//!
//! The device samples at a fixed 16 kHz base rate; the requested telemetry
//! frequency is turned into an integer decimation gap, so the frequency a
//! caller gets is a request, not a guarantee. Callers must timestamp with
//! [`Recorder::effective_hz`].

use log::debug;

use super::decode::decode_row;
use crate::error::{DriveError, DriveResult, MAX_RECORD_CHANNELS};
use crate::protocol::DriveSession;

/// Fixed device base sampling rate.
pub const BASE_RATE_HZ: f64 = 16_000.0;

/// Largest on-device recording buffer.
pub const MAX_BUFFER_POINTS: u32 = 10_000;

/// Retrieval block size used with the internal format.
const RETRIEVE_SIZE: u32 = 4_800;

/// What to record and how fast.
///
/// Note that one channel sustains roughly gap 5 (just under 4 kHz), three
/// channels gap 6 (about 3 kHz); the readable retrieval format roughly
/// halves that again, which is why the internal format is always used.
#[derive(Clone, Debug)]
pub struct RecorderConfig {
    pub frequency_hz: f64,
    /// Channel names, at most [`MAX_RECORD_CHANNELS`].
    pub channels: Vec<String>,
    /// On-device buffer size, clamped to [`MAX_BUFFER_POINTS`].
    pub num_points: u32,
}

impl RecorderConfig {
    pub fn new(frequency_hz: f64, channels: Vec<String>) -> Self {
        Self {
            frequency_hz,
            channels,
            num_points: MAX_BUFFER_POINTS,
        }
    }
}

/// Hardware trigger condition for fault-triggered capture: fire when
/// `parameter & bitmask == value`.
#[derive(Clone, Debug)]
pub struct FaultTrigger {
    pub parameter: String,
    pub bitmask: i64,
    pub value: i64,
    /// How much of the buffer to keep from before the trigger, percent.
    pub position_percent: i64,
}

impl FaultTrigger {
    pub fn new(parameter: impl Into<String>, bitmask: i64, value: i64) -> Self {
        Self {
            parameter: parameter.into(),
            bitmask,
            value,
            position_percent: 90,
        }
    }
}

/// A configured recording on one drive.
#[derive(Debug)]
pub struct Recorder {
    effective_hz: f64,
    clock: f64,
    step: f64,
}

impl Recorder {
    /// Configure the on-device recorder: continuous buffering, internal
    /// retrieval format, the requested channels, every unused hardware
    /// slot explicitly cleared.
    pub async fn configure(
        session: &mut DriveSession,
        cfg: &RecorderConfig,
    ) -> DriveResult<Self> {
        if cfg.channels.len() > MAX_RECORD_CHANNELS {
            return Err(DriveError::RecordingLimit(cfg.channels.len()));
        }
        if cfg.frequency_hz <= 0.0 {
            return Err(DriveError::Parameter(format!(
                "recording frequency must be positive, got {}",
                cfg.frequency_hz
            )));
        }

        let (gap, effective_hz) = effective_frequency(cfg.frequency_hz);

        session.command("rec.off").await?;
        session.set("rec.gap", gap).await?;
        session
            .set("rec.numpoints", cfg.num_points.min(MAX_BUFFER_POINTS))
            .await?;
        session.set("rec.stoptype", 1).await?; // 0 one shot, 1 continuous
        session.set("rec.trigtype", 0).await?; // immediate
        session.set("rec.retrievefrmt", 1).await?; // 0 readable, 1 internal
        session.set("rec.retrievesize", RETRIEVE_SIZE).await?;

        let mut slot = 1;
        for channel in &cfg.channels {
            session
                .set(&format!("rec.ch{}", slot), channel.as_str())
                .await?;
            slot += 1;
        }
        while slot <= MAX_RECORD_CHANNELS {
            session.set(&format!("rec.ch{}", slot), "clear").await?;
            slot += 1;
        }

        debug!(
            "[{}] recorder configured, gap {} -> {} Hz",
            session.label(),
            gap,
            effective_hz
        );
        Ok(Self {
            effective_hz,
            clock: 0.0,
            step: 1.0 / effective_hz,
        })
    }

    /// The frequency actually achieved. Use this for timestamping, not the
    /// requested one.
    pub fn effective_hz(&self) -> f64 {
        self.effective_hz
    }

    /// Replace the immediate trigger with a status-bit-pattern hardware
    /// trigger and switch to one-shot buffering.
    pub async fn arm_fault_trigger(
        &mut self,
        session: &mut DriveSession,
        trigger: &FaultTrigger,
    ) -> DriveResult<()> {
        session.set("rec.stoptype", 0).await?;
        session.set("rec.trigtype", 5).await?;
        session
            .set("rec.trigparam", trigger.parameter.as_str())
            .await?;
        session.set("rec.trigmask", trigger.bitmask).await?;
        session.set("rec.trigval", trigger.value).await?;
        session.set("rec.trigpos", trigger.position_percent).await?;
        Ok(())
    }

    /// Start (or, with a hardware trigger, arm) the recording and reset
    /// the synthetic clock.
    pub async fn start(&mut self, session: &mut DriveSession) -> DriveResult<()> {
        session.command("rec.trig").await?;
        self.clock = 0.0;
        Ok(())
    }

    /// The recorded channel names, as the device reports them.
    pub async fn columns(session: &mut DriveSession) -> DriveResult<Vec<String>> {
        let text = session.command_str("rec.retrievehdr").await?;
        let line = text.lines().nth(2).ok_or_else(|| {
            DriveError::Parameter(format!("unexpected rec.retrievehdr output: {:?}", text))
        })?;
        Ok(line.split(',').map(str::to_string).collect())
    }

    /// Output file header line: `time [s],<channels...>`.
    pub async fn header(&self, session: &mut DriveSession) -> DriveResult<String> {
        let columns = Self::columns(session).await?;
        Ok(format!("time [s],{}", columns.join(",")))
    }

    /// Retrieve and decode newly buffered rows. Each row is prefixed with
    /// a synthetic timestamp advancing by 1/effective frequency (device
    /// rows carry no native one). Returns whether anything arrived.
    pub async fn fetch(
        &mut self,
        session: &mut DriveSession,
        out: &mut Vec<Vec<f64>>,
    ) -> DriveResult<bool> {
        let text = session.command_str("rec.retrievedata").await?;
        let mut got_data = false;
        // The first line is the retrieval status, not a sample.
        for line in text.lines().skip(1) {
            if line.is_empty() {
                continue;
            }
            let mut row = Vec::with_capacity(7);
            row.push(self.clock);
            row.extend(decode_row(line)?);
            self.clock += self.step;
            out.push(row);
            got_data = true;
        }
        Ok(got_data)
    }

    /// Whether a one-shot (triggered) capture has completed.
    pub async fn done(session: &mut DriveSession) -> DriveResult<bool> {
        Ok(session.command_int("rec.done").await? != 0)
    }

    /// Turn the recording off and drain every remaining buffered row.
    pub async fn stop(
        &mut self,
        session: &mut DriveSession,
        out: &mut Vec<Vec<f64>>,
    ) -> DriveResult<()> {
        session.command("rec.off").await?;
        while self.fetch(session, out).await? {}
        Ok(())
    }
}

/// Decimation gap and effective frequency for a requested frequency.
/// `frequency_hz` must be positive; [`Recorder::configure`] guards that.
pub fn effective_frequency(frequency_hz: f64) -> (i64, f64) {
    let gap = (BASE_RATE_HZ / frequency_hz).ceil().max(1.0) as i64;
    (gap, BASE_RATE_HZ / gap as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_divisors_are_kept() {
        for f in [16_000.0, 8_000.0, 4_000.0, 1_000.0, 500.0, 100.0] {
            let (_, effective) = effective_frequency(f);
            assert_eq!(effective, f);
        }
    }

    #[test]
    fn test_non_divisors_round_down() {
        let (gap, effective) = effective_frequency(3_000.0);
        // ceil(16000/3000) = 6 -> 2666.67 Hz
        assert_eq!(gap, 6);
        assert!(effective <= 3_000.0);
        assert!((effective - 16_000.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_oversubscribed_frequency_clamps_to_base() {
        let (gap, effective) = effective_frequency(20_000.0);
        assert_eq!(gap, 1);
        assert_eq!(effective, BASE_RATE_HZ);
    }
}
