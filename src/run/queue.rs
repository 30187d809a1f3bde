//! Job-queue surface and round collection.
//!
//! The scheduler itself lives outside this crate. A [`JobQueue`] receives
//! the jobs of a round plus a [`Reporter`]; it reports each realization's
//! completion or failure from whatever threads it likes. The round waits
//! for reports on a channel with a deadline and never blocks past it.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use super::context::RunContext;
use super::run_arg::{RunId, RunStatus};
use crate::error::{EnsembleResult, ExecutionError, RealizationFailure};

/// What the job queue needs to run one realization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Realization index.
    pub realization: usize,
    /// Iteration number.
    pub iteration: usize,
    /// Absolute run path.
    pub runpath: PathBuf,
    /// Job name.
    pub job_name: String,
    /// Run id.
    pub run_id: RunId,
}

/// Final status of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// The forward model finished.
    Success,
    /// The forward model failed.
    Failure(String),
}

/// Completion report for one realization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    /// Realization index.
    pub realization: usize,
    /// Outcome.
    pub status: JobStatus,
}

impl JobReport {
    /// Successful completion.
    #[must_use]
    pub const fn success(realization: usize) -> Self {
        Self {
            realization,
            status: JobStatus::Success,
        }
    }

    /// Failed completion.
    pub fn failure(realization: usize, reason: impl Into<String>) -> Self {
        Self {
            realization,
            status: JobStatus::Failure(reason.into()),
        }
    }
}

/// Handle the job queue reports through. Cheap to clone across threads.
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: Sender<JobReport>,
}

impl Reporter {
    /// Send a report. Returns false once the round stopped listening.
    pub fn report(&self, report: JobReport) -> bool {
        self.tx.send(report).is_ok()
    }
}

/// External scheduler surface.
pub trait JobQueue {
    /// Start the given jobs; report each through `reporter`.
    ///
    /// May return before the jobs finish.
    fn submit(&self, jobs: Vec<Job>, reporter: Reporter) -> Result<(), ExecutionError>;
}

/// Result of one round of job execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundOutcome {
    /// Realizations reported as finished, in order.
    pub finished: Vec<usize>,
    /// Realizations that failed or never reported.
    pub failures: Vec<RealizationFailure>,
}

impl RoundOutcome {
    /// Indices of failed realizations.
    #[must_use]
    pub fn failed(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.realization).collect()
    }
}

fn collect(
    rx: &Receiver<JobReport>,
    mut pending: BTreeSet<usize>,
    timeout: Duration,
) -> (Vec<usize>, Vec<RealizationFailure>) {
    let deadline = Instant::now().checked_add(timeout);
    let mut finished = Vec::new();
    let mut failures = Vec::new();

    while !pending.is_empty() {
        let remaining = deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()));
        match rx.recv_timeout(remaining) {
            Ok(report) => {
                if !pending.remove(&report.realization) {
                    debug!(realization = report.realization, "ignoring duplicate or unknown report");
                    continue;
                }
                match report.status {
                    JobStatus::Success => finished.push(report.realization),
                    JobStatus::Failure(reason) => {
                        warn!(realization = report.realization, %reason, "job failed");
                        failures.push(RealizationFailure::new(report.realization, reason));
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    unreported = pending.len(),
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "round timed out"
                );
                for iens in std::mem::take(&mut pending) {
                    failures.push(RealizationFailure::new(iens, "no report before the round deadline"));
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!(unreported = pending.len(), "job queue stopped reporting");
                for iens in std::mem::take(&mut pending) {
                    failures.push(RealizationFailure::new(iens, "job queue stopped reporting"));
                }
            }
        }
    }

    finished.sort_unstable();
    failures.sort_by_key(|f| f.realization);
    (finished, failures)
}

/// Submit the active realizations of `context` and wait for their reports.
///
/// Failed and unreported realizations are deactivated and get
/// [`RunStatus::RunFailure`]; the caller marks them in the case.
pub fn run_round(queue: &dyn JobQueue, context: &mut RunContext, timeout: Duration) -> EnsembleResult<RoundOutcome> {
    context.ensure_active()?;

    let jobs: Vec<Job> = context
        .run_args()
        .iter()
        .filter(|arg| arg.is_active())
        .map(|arg| Job {
            realization: arg.realization(),
            iteration: arg.iteration(),
            runpath: arg.runpath().to_path_buf(),
            job_name: arg.job_name().to_string(),
            run_id: arg.run_id(),
        })
        .collect();
    let pending: BTreeSet<usize> = jobs.iter().map(|j| j.realization).collect();

    let (tx, rx) = unbounded();
    info!(iteration = context.iteration(), jobs = jobs.len(), "submitting round");
    queue.submit(jobs, Reporter { tx })?;

    let (finished, failures) = collect(&rx, pending, timeout);
    for failure in &failures {
        context.set_run_status(failure.realization, RunStatus::RunFailure)?;
        context.deactivate(failure.realization)?;
    }

    Ok(RoundOutcome { finished, failures })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunpathConfig;
    use crate::run::Runpaths;
    use std::path::Path;
    use std::thread;

    /// Reports every job from a background thread, failing `fail` and
    /// skipping `silent`.
    struct ThreadQueue {
        fail: Vec<usize>,
        silent: Vec<usize>,
    }

    impl JobQueue for ThreadQueue {
        fn submit(&self, jobs: Vec<Job>, reporter: Reporter) -> Result<(), ExecutionError> {
            let fail = self.fail.clone();
            let silent = self.silent.clone();
            thread::spawn(move || {
                let _keep_open = reporter.clone();
                for job in jobs {
                    if silent.contains(&job.realization) {
                        continue;
                    }
                    let report = if fail.contains(&job.realization) {
                        JobReport::failure(job.realization, "exit 1")
                    } else {
                        JobReport::success(job.realization)
                    };
                    reporter.report(report);
                }
                thread::sleep(Duration::from_millis(200));
            });
            Ok(())
        }
    }

    fn context(n: usize) -> RunContext {
        let config = RunpathConfig {
            base_dir: Some(Path::new("/ens").to_path_buf()),
            ..RunpathConfig::default()
        };
        let runpaths = Runpaths::new(&config, Path::new("/ens")).unwrap();
        RunContext::build(&runpaths, n, 0, None, "default", None).unwrap()
    }

    #[test]
    fn test_all_succeed() {
        let mut ctx = context(4);
        let queue = ThreadQueue { fail: vec![], silent: vec![] };
        let outcome = run_round(&queue, &mut ctx, Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.finished, vec![0, 1, 2, 3]);
        assert!(outcome.failures.is_empty());
        assert_eq!(ctx.count_active(), 4);
    }

    #[test]
    fn test_failure_and_timeout_deactivate() {
        let mut ctx = context(4);
        let queue = ThreadQueue { fail: vec![1], silent: vec![3] };
        let outcome = run_round(&queue, &mut ctx, Duration::from_millis(100)).unwrap();
        assert_eq!(outcome.finished, vec![0, 2]);
        assert_eq!(outcome.failed(), vec![1, 3]);
        assert_eq!(ctx.mask(), &[true, false, true, false]);
        assert_eq!(ctx.run_arg(3).unwrap().run_status(), RunStatus::RunFailure);
    }

    #[test]
    fn test_dropped_reporter_fails_pending() {
        struct Dropper;
        impl JobQueue for Dropper {
            fn submit(&self, _jobs: Vec<Job>, _reporter: Reporter) -> Result<(), ExecutionError> {
                Ok(())
            }
        }
        let mut ctx = context(2);
        let outcome = run_round(&Dropper, &mut ctx, Duration::from_secs(30)).unwrap();
        assert_eq!(outcome.failed(), vec![0, 1]);
        assert_eq!(ctx.count_active(), 0);
    }

    #[test]
    fn test_no_active_is_error() {
        let mut ctx = context(1);
        ctx.deactivate(0).unwrap();
        let queue = ThreadQueue { fail: vec![], silent: vec![] };
        assert!(run_round(&queue, &mut ctx, Duration::from_secs(1)).is_err());
    }
}
