//! Continuous multi-drive recording and fault-triggered capture.
//!
//! Continuous mode runs one poll task per drive, each feeding an
//! append-only queue with exactly one writer (the poll task) and one
//! reader (the drain loop). The drain loop periodically empties every
//! queue into that drive's sink and flushes; when every poll task has
//! exited — or a stop was requested — it performs one final drain so no
//! buffered row is lost.

use chrono::{DateTime, Utc};
use log::{info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};

use super::recorder::{FaultTrigger, Recorder, RecorderConfig};
use super::sink::{fault_log_file_name, TelemetrySink};
use crate::cancel::CancelToken;
use crate::error::DriveResult;
use crate::protocol::DriveSession;

/// How often the drain loop wakes up.
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);
/// Poll period for fault and capture-completion checks.
const FAULT_POLL: Duration = Duration::from_millis(100);

/// One drive's part of a continuous recording.
pub struct RecordStream {
    pub session: DriveSession,
    pub channels: Vec<String>,
    pub sink: Box<dyn TelemetrySink>,
}

enum TelemetryRecord {
    Header(String),
    Row(Vec<f64>),
}

type Queue = (
    UnboundedReceiver<TelemetryRecord>,
    Box<dyn TelemetrySink>,
);

/// Record all streams continuously until cancelled (or until any drive's
/// poll task dies, which stops the others).
///
/// `trigger_index` optionally names one stream whose digital output 1 is
/// pulsed low→high→low over its first poll iterations, to externally
/// trigger a companion device.
pub async fn record_streams(
    streams: Vec<RecordStream>,
    frequency_hz: f64,
    trigger_index: Option<usize>,
    cancel: CancelToken,
) -> anyhow::Result<()> {
    let mut join: JoinSet<DriveResult<()>> = JoinSet::new();
    let mut queues: Vec<Queue> = Vec::new();

    for (index, stream) in streams.into_iter().enumerate() {
        let (tx, rx) = mpsc::unbounded_channel();
        queues.push((rx, stream.sink));

        let cfg = RecorderConfig::new(frequency_hz, stream.channels);
        let pulse_output = trigger_index == Some(index);
        let cancel = cancel.clone();
        join.spawn(poll_worker(stream.session, cfg, pulse_output, tx, cancel));
    }

    let mut first_error: Option<anyhow::Error> = None;
    loop {
        drain_queues(&mut queues).await?;

        while let Some(joined) = join.try_join_next() {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // One dead stream stops the whole recording; siblings
                    // observe the shared token at their next poll.
                    cancel.cancel();
                    if first_error.is_none() {
                        first_error = Some(e.into());
                    }
                }
                Err(e) => {
                    cancel.cancel();
                    if first_error.is_none() {
                        first_error = Some(anyhow::anyhow!("poll task panicked: {}", e));
                    }
                }
            }
        }
        if join.is_empty() {
            break;
        }
        sleep(DRAIN_INTERVAL).await;
    }

    // Final drain: the poll tasks pushed their last rows while stopping.
    drain_queues(&mut queues).await?;
    for (_, sink) in &mut queues {
        sink.flush().await?;
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Empty every queue into its sink.
async fn drain_queues(queues: &mut [Queue]) -> anyhow::Result<()> {
    for (rx, sink) in queues.iter_mut() {
        let mut wrote = false;
        while let Ok(record) = rx.try_recv() {
            match record {
                TelemetryRecord::Header(h) => sink.write_header(&h).await?,
                TelemetryRecord::Row(row) => sink.write_row(&row).await?,
            }
            wrote = true;
        }
        if wrote {
            sink.flush().await?;
        }
    }
    Ok(())
}

/// configure → start → poll loop for one drive. The recording is stopped
/// and the device buffer drained on every exit path.
async fn poll_worker(
    mut session: DriveSession,
    cfg: RecorderConfig,
    pulse_output: bool,
    tx: UnboundedSender<TelemetryRecord>,
    cancel: CancelToken,
) -> DriveResult<()> {
    let mut recorder = match Recorder::configure(&mut session, &cfg).await {
        Ok(recorder) => recorder,
        Err(e) => {
            session.disconnect().await;
            return Err(e);
        }
    };

    let run = async {
        recorder.start(&mut session).await?;
        let header = recorder.header(&mut session).await?;
        let _ = tx.send(TelemetryRecord::Header(header));

        let mut iteration: u32 = 0;
        while !cancel.is_cancelled() {
            if pulse_output {
                pulse_trigger_output(&mut session, iteration).await?;
            }
            let mut rows = Vec::new();
            recorder.fetch(&mut session, &mut rows).await?;
            for row in rows {
                let _ = tx.send(TelemetryRecord::Row(row));
            }
            iteration += 1;
        }
        Ok(())
    }
    .await;

    let mut rows = Vec::new();
    match recorder.stop(&mut session, &mut rows).await {
        Ok(()) => {
            for row in rows {
                let _ = tx.send(TelemetryRecord::Row(row));
            }
        }
        Err(e) => warn!(
            "[{}] possible incomplete stream: {}",
            session.label(),
            e
        ),
    }
    session.disconnect().await;
    run
}

/// Low→high→low pulse on digital output 1 over the first poll iterations.
async fn pulse_trigger_output(session: &mut DriveSession, iteration: u32) -> DriveResult<()> {
    match iteration {
        0 | 1 => session.set("dout1.stateu", 0).await,
        2 => session.set("dout1.stateu", 1).await,
        3 => session.set("dout1.stateu", 0).await,
        _ => Ok(()),
    }
}

/// One captured fault window.
#[derive(Clone, Debug)]
pub struct FaultCapture {
    /// Compact fault code list, e.g. `"F501"`.
    pub fault_code: String,
    /// Wall-clock time the fault was first observed.
    pub observed_at: DateTime<Utc>,
    pub header: String,
    pub rows: Vec<Vec<f64>>,
}

impl FaultCapture {
    /// Log file name for this event.
    pub fn file_name(&self) -> String {
        fault_log_file_name(&self.fault_code, &self.observed_at)
    }

    pub async fn write_to(&self, sink: &mut dyn TelemetrySink) -> anyhow::Result<()> {
        sink.write_header(&self.header).await?;
        for row in &self.rows {
            sink.write_row(row).await?;
        }
        sink.flush().await
    }
}

/// Arm a hardware-triggered recording and wait for a fault.
///
/// The drive must report no active fault for two consecutive polls before
/// the trigger is armed (debounce against a fault that is mid-clearing).
/// A stop before any fault occurs returns `Ok(None)` — a normal outcome,
/// not an error.
pub async fn capture_fault(
    session: &mut DriveSession,
    cfg: &RecorderConfig,
    trigger: &FaultTrigger,
    cancel: &CancelToken,
) -> DriveResult<Option<FaultCapture>> {
    let mut recorder = Recorder::configure(session, cfg).await?;
    recorder.arm_fault_trigger(session, trigger).await?;

    let mut clear_polls = 0;
    while clear_polls < 2 {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if session.faults_short(false).await?.is_empty() {
            clear_polls += 1;
        } else {
            clear_polls = 0;
        }
        sleep(FAULT_POLL).await;
    }

    recorder.start(session).await?;
    info!("[{}] fault trigger armed", session.label());

    let fault_code = loop {
        if cancel.is_cancelled() {
            let _ = session.command("rec.off").await;
            return Ok(None);
        }
        let code = session.faults_short(false).await?;
        if !code.is_empty() {
            break code;
        }
        sleep(FAULT_POLL).await;
    };
    let observed_at = Utc::now();
    info!(
        "[{}] fault {} observed, waiting for capture",
        session.label(),
        fault_code
    );

    while !Recorder::done(session).await? {
        if cancel.is_cancelled() {
            break;
        }
        sleep(FAULT_POLL).await;
    }

    let header = recorder.header(session).await?;
    let mut rows = Vec::new();
    recorder.stop(session, &mut rows).await?;

    Ok(Some(FaultCapture {
        fault_code,
        observed_at,
        header,
        rows,
    }))
}
