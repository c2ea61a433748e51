//! Parallel execution of one operation across a fleet of drives.
//!
//! Each worker opens its own [`DriveSession`] and runs the per-drive job;
//! there is no shared protocol state between workers. Failures are caught
//! per worker and attached to that drive's entry in the report — one
//! drive's error never aborts its siblings unless `stop_on_error` is
//! requested, in which case the shared [`CancelToken`] is raised exactly
//! once and workers that have not started yet report `Cancelled`.
//!
//! The token is handed into every job so long-running loops (monitors,
//! recordings) can exit cleanly at their next loop boundary.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use log::error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cancel::CancelToken;
use crate::config::{nice_name, DriveEndpoint, ProtocolTimeouts};
use crate::protocol::DriveSession;

/// Execution knobs for one fleet operation.
#[derive(Clone, Debug, Default)]
pub struct FleetOptions {
    /// Concurrent worker cap. Defaults to one worker per selected drive.
    pub max_workers: Option<usize>,
    /// Raise the shared cancellation signal on the first worker failure.
    pub stop_on_error: bool,
    /// Long-running mode: additionally raise the shared signal on
    /// operator interrupt (Ctrl-C), so monitor loops stop cleanly.
    pub long_running: bool,
}

/// How one drive's job ended.
#[derive(Debug)]
pub enum Outcome {
    Completed,
    Failed(anyhow::Error),
    /// The shared signal was raised before this worker started.
    Cancelled,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed => write!(f, "ok"),
            Outcome::Failed(e) => write!(f, "Error: {:#}", e),
            Outcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One drive's result, labeled unambiguously with its name and address.
#[derive(Debug)]
pub struct DriveOutcome {
    pub name: String,
    pub host: String,
    pub outcome: Outcome,
}

impl DriveOutcome {
    pub fn label(&self) -> String {
        nice_name(&self.name, &self.host)
    }
}

/// Aggregated per-drive results of one fleet operation.
#[derive(Debug, Default)]
pub struct FleetReport {
    pub outcomes: Vec<DriveOutcome>,
}

impl FleetReport {
    /// True when every drive's job completed without error.
    pub fn all_ok(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| matches!(o.outcome, Outcome::Completed))
    }

    pub fn failures(&self) -> impl Iterator<Item = &DriveOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Outcome::Failed(_)))
    }

    pub fn cancelled(&self) -> impl Iterator<Item = &DriveOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Outcome::Cancelled))
    }
}

impl fmt::Display for FleetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for o in &self.outcomes {
            writeln!(f, "{}: {}", o.label(), o.outcome)?;
        }
        Ok(())
    }
}

/// Run `job` against every endpoint with bounded parallelism.
///
/// The report lists drives in selection order regardless of completion
/// order. This function never fails as a whole; inspect the report.
pub async fn run<F, Fut>(
    endpoints: Vec<DriveEndpoint>,
    timeouts: ProtocolTimeouts,
    options: FleetOptions,
    cancel: CancelToken,
    job: F,
) -> FleetReport
where
    F: Fn(DriveSession, CancelToken) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    if options.long_running {
        cancel.hook_interrupt();
    }

    let limit = options.max_workers.unwrap_or(endpoints.len()).max(1);
    let semaphore = Arc::new(Semaphore::new(limit));
    let mut join: JoinSet<(usize, DriveOutcome)> = JoinSet::new();

    for (index, endpoint) in endpoints.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let timeouts = timeouts.clone();
        let job = job.clone();
        let stop_on_error = options.stop_on_error;

        join.spawn(async move {
            let name = endpoint.name.clone();
            let host = endpoint.host.clone();

            let permit = semaphore.acquire_owned().await;
            if permit.is_err() || cancel.is_cancelled() {
                return (
                    index,
                    DriveOutcome {
                        name,
                        host,
                        outcome: Outcome::Cancelled,
                    },
                );
            }

            let outcome = run_one(endpoint, timeouts, cancel.clone(), job).await;
            if matches!(outcome.outcome, Outcome::Failed(_)) && stop_on_error {
                cancel.cancel();
            }
            (index, outcome)
        });
    }

    let mut indexed = Vec::new();
    while let Some(joined) = join.join_next().await {
        match joined {
            Ok(entry) => indexed.push(entry),
            Err(e) => {
                // A panicking job is reported, not propagated.
                error!("fleet worker panicked: {}", e);
            }
        }
    }
    indexed.sort_by_key(|(index, _)| *index);

    FleetReport {
        outcomes: indexed.into_iter().map(|(_, o)| o).collect(),
    }
}

async fn run_one<F, Fut>(
    endpoint: DriveEndpoint,
    timeouts: ProtocolTimeouts,
    cancel: CancelToken,
    job: F,
) -> DriveOutcome
where
    F: Fn(DriveSession, CancelToken) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let configured_name = endpoint.name.clone();
    let host = endpoint.host.clone();

    let session = match DriveSession::connect(endpoint, timeouts).await {
        Ok(session) => session,
        Err(e) => {
            error!("{} Error: {}", nice_name(&configured_name, &host), e);
            return DriveOutcome {
                name: configured_name,
                host,
                outcome: Outcome::Failed(e.into()),
            };
        }
    };

    // Prefer the drive's self-reported name for the report.
    let name = if session.name().is_empty() {
        configured_name
    } else {
        session.name().to_string()
    };
    let label = session.label();

    match job(session, cancel).await {
        Ok(()) => DriveOutcome {
            name,
            host,
            outcome: Outcome::Completed,
        },
        Err(e) => {
            error!("{} Error: {:#}", label, e);
            DriveOutcome {
                name,
                host,
                outcome: Outcome::Failed(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(name: &str, outcome: Outcome) -> DriveOutcome {
        DriveOutcome {
            name: name.to_string(),
            host: "10.0.0.1".to_string(),
            outcome,
        }
    }

    #[test]
    fn test_report_all_ok() {
        let report = FleetReport {
            outcomes: vec![
                outcome("a", Outcome::Completed),
                outcome("b", Outcome::Completed),
            ],
        };
        assert!(report.all_ok());
        assert_eq!(report.failures().count(), 0);
    }

    #[test]
    fn test_report_with_failure_and_cancel() {
        let report = FleetReport {
            outcomes: vec![
                outcome("a", Outcome::Completed),
                outcome("b", Outcome::Failed(anyhow::anyhow!("boom"))),
                outcome("c", Outcome::Cancelled),
            ],
        };
        assert!(!report.all_ok());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.cancelled().count(), 1);

        let text = report.to_string();
        assert!(text.contains("a (ip: 10.0.0.1): ok"));
        assert!(text.contains("b (ip: 10.0.0.1): Error: boom"));
        assert!(text.contains("c (ip: 10.0.0.1): cancelled"));
    }
}
