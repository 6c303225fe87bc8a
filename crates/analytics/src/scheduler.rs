use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::job::{AnalyticsJob, JobControl};
use crate::result::AnalyticsError;

/// Executor for analytics jobs.
///
/// Intentionally minimal and runtime agnostic. A job's output is only handed
/// back when the job ran to completion; an interrupted run yields nothing.
pub trait JobScheduler: Send + Sync {
    /// Upper bound applied to every job, if any.
    fn timeout(&self) -> Option<Duration>;

    fn run<J: AnalyticsJob>(&self, job: &J, control: &JobControl) -> Result<J::Output, AnalyticsError> {
        let control = match (self.timeout(), control.deadline()) {
            (Some(timeout), None) => control.clone().with_timeout(timeout),
            (Some(timeout), Some(deadline)) => {
                control.clone().with_deadline(deadline.min(Instant::now() + timeout))
            }
            (None, _) => control.clone(),
        };

        let started = Instant::now();
        control.checkpoint()?;
        match job.run(&control) {
            Ok(output) => {
                debug!(
                    job = job.name(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "analytics job finished"
                );
                Ok(output)
            }
            Err(err) => {
                warn!(job = job.name(), error = %err, "analytics job failed; partial results discarded");
                Err(err)
            }
        }
    }
}

/// Synchronous scheduler that runs jobs immediately on the calling thread.
#[derive(Debug, Copy, Clone, Default)]
pub struct LocalScheduler {
    timeout: Option<Duration>,
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

impl JobScheduler for LocalScheduler {
    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
