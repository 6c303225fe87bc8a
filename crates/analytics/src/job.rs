use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::result::AnalyticsError;

/// Cancellation flag plus optional deadline shared with a running job.
///
/// Clones share the flag, so a caller can keep one copy and cancel the job
/// from another thread.
#[derive(Debug, Clone, Default)]
pub struct JobControl {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Called by jobs between units of work.
    pub fn checkpoint(&self) -> Result<(), AnalyticsError> {
        if self.is_cancelled() {
            return Err(AnalyticsError::Interrupted("job cancelled".to_string()));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(AnalyticsError::Interrupted("deadline exceeded".to_string()));
            }
        }
        Ok(())
    }
}

/// A read-side analytical unit of work.
///
/// Inputs are snapshots supplied by the caller; this crate stays storage
/// agnostic.
pub trait AnalyticsJob: Send + Sync {
    type Output: Send;

    /// Stable job name used in logs.
    fn name(&self) -> &'static str;

    /// Execute the job. Must not mutate ledger state and must call
    /// `control.checkpoint()` often enough to honour cancellation.
    fn run(&self, control: &JobControl) -> Result<Self::Output, AnalyticsError>;
}
