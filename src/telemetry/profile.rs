//! Scripted service-mode stimulus profiles recorded to a sink.
//!
//! A profile drives the command value (torque current or velocity) through
//! a timed table while the recorder streams the response channels. The
//! drive is put in service mode for the duration and disabled again on
//! every exit path.

use log::info;
use tokio::time::Instant;

use super::recorder::{Recorder, RecorderConfig};
use super::sink::TelemetrySink;
use crate::cancel::CancelToken;
use crate::error::DriveResult;
use crate::protocol::DriveSession;

/// Default response channels recorded while a profile plays.
pub const PROFILE_CHANNELS: [&str; 3] = ["IL.FB", "IL.CMD", "VL.FB"];

/// Apply `amps` between `start_s` and `end_s` of profile time.
#[derive(Clone, Copy, Debug)]
pub struct CurrentSegment {
    pub start_s: f64,
    pub end_s: f64,
    pub amps: f64,
}

/// Hold `speed` until `until_s` of profile time.
#[derive(Clone, Copy, Debug)]
pub struct VelocitySegment {
    pub until_s: f64,
    pub speed: f64,
}

enum Stimulus<'a> {
    Current(&'a [CurrentSegment]),
    Velocity {
        segments: &'a [VelocitySegment],
        repeat: bool,
    },
}

impl Stimulus<'_> {
    /// Device operation mode: 0 torque, 1 velocity.
    fn opmode(&self) -> i64 {
        match self {
            Stimulus::Current(_) => 0,
            Stimulus::Velocity { .. } => 1,
        }
    }

    /// Apply the table at `elapsed` seconds. Returns true when the
    /// profile is over.
    async fn apply(&self, session: &mut DriveSession, elapsed: f64) -> DriveResult<bool> {
        match self {
            Stimulus::Current(segments) => {
                for seg in *segments {
                    if seg.start_s < elapsed && elapsed <= seg.end_s {
                        session.set("il.cmdu", seg.amps).await?;
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Stimulus::Velocity { segments, repeat } => {
                let mut t = elapsed;
                if *repeat {
                    if let Some(last) = segments.last() {
                        t %= last.until_s;
                    }
                }
                for seg in *segments {
                    if t < seg.until_s {
                        session.set("vl.cmdu", seg.speed).await?;
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

/// Play a torque-current profile and record the response.
pub async fn record_current_profile(
    session: &mut DriveSession,
    segments: &[CurrentSegment],
    sink: &mut dyn TelemetrySink,
    frequency_hz: f64,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    run_profile(
        session,
        Stimulus::Current(segments),
        sink,
        frequency_hz,
        cancel,
    )
    .await
}

/// Play a velocity profile and record the response.
pub async fn record_velocity_profile(
    session: &mut DriveSession,
    segments: &[VelocitySegment],
    repeat: bool,
    sink: &mut dyn TelemetrySink,
    frequency_hz: f64,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    run_profile(
        session,
        Stimulus::Velocity { segments, repeat },
        sink,
        frequency_hz,
        cancel,
    )
    .await
}

async fn run_profile(
    session: &mut DriveSession,
    stimulus: Stimulus<'_>,
    sink: &mut dyn TelemetrySink,
    frequency_hz: f64,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    session.disable().await?;
    session.set("drv.cmdsource", 0).await?; // service mode
    session.set("drv.opmode", stimulus.opmode()).await?;
    session.enable().await?;

    let channels = PROFILE_CHANNELS.iter().map(|c| c.to_string()).collect();
    let cfg = RecorderConfig::new(frequency_hz, channels);
    let mut recorder = Recorder::configure(session, &cfg).await?;
    recorder.start(session).await?;
    sink.write_header(&recorder.header(session).await?)
        .await?;

    let started = Instant::now();
    let result: anyhow::Result<()> = async {
        loop {
            if cancel.is_cancelled() {
                info!("[{}] profile interrupted", session.label());
                break;
            }
            let elapsed = started.elapsed().as_secs_f64();
            if stimulus.apply(session, elapsed).await? {
                break;
            }
            let mut rows = Vec::new();
            recorder.fetch(session, &mut rows).await?;
            for row in rows {
                sink.write_row(&row).await?;
            }
        }
        Ok(())
    }
    .await;

    // Stop the recording and leave the drive disabled no matter how the
    // profile ended.
    let mut rows = Vec::new();
    if recorder.stop(session, &mut rows).await.is_ok() {
        for row in rows {
            sink.write_row(&row).await?;
        }
    }
    sink.flush().await?;
    let _ = session.disable().await;

    result
}
