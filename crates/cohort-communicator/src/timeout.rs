use std::time::Duration;

use tokio::time::Instant;

use crate::error::CommunicatorError;
use crate::lock;
use crate::Communicator;

/// Restores a communicator's previous timeout when dropped.
///
/// Returned by [`Communicator::override_timeout`]; the previous value
/// comes back on every exit path, including early `?` returns and
/// unwinding.
#[must_use = "the override ends as soon as the guard is dropped"]
pub struct TimeoutGuard<'a> {
    communicator: &'a Communicator,
    previous: Duration,
}

impl Drop for TimeoutGuard<'_> {
    fn drop(&mut self) {
        self.communicator.set_timeout(self.previous);
    }
}

impl Communicator {
    /// Time budget of every blocking operation.
    pub fn timeout(&self) -> Duration {
        *lock(&self.timeout)
    }

    /// Replace the timeout for all later operations.
    pub fn set_timeout(&self, timeout: Duration) {
        *lock(&self.timeout) = timeout;
    }

    /// Use `timeout` until the returned guard is dropped.
    ///
    /// ```rust,no_run
    /// # async fn example(comm: &cohort_communicator::Communicator) -> cohort_communicator::Result<()> {
    /// {
    ///     let _slow = comm.override_timeout(std::time::Duration::from_secs(60));
    ///     comm.barrier().await?;
    /// }
    /// // previous timeout is back here
    /// # Ok(())
    /// # }
    /// ```
    pub fn override_timeout(&self, timeout: Duration) -> TimeoutGuard<'_> {
        let previous = std::mem::replace(&mut *lock(&self.timeout), timeout);
        TimeoutGuard {
            communicator: self,
            previous,
        }
    }

    /// Deadline for one operation started now.
    pub(crate) fn deadline(&self) -> Deadline {
        Deadline::after(self.timeout())
    }
}

/// One operation's time budget, shared by all of its steps.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn expired(&self, operation: impl Into<String>) -> CommunicatorError {
        CommunicatorError::timeout(operation, self.budget)
    }
}
