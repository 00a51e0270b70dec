//! Bounded poll-sleep loop
//!
//! Queue operations never block. Waiting for a response, or for work to
//! arrive, is a check repeated at a fixed interval until it yields a value or
//! the budget runs out.

use crate::error::{QueueError, Result};
use std::time::{Duration, Instant};

/// How long a poll may go on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// Maximum number of checks
    Attempts(u32),
    /// Wall-clock limit measured from the first check
    Deadline(Duration),
}

/// Poll interval plus budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Poller {
    interval: Duration,
    budget: Budget,
}

impl Default for Poller {
    /// 100 ms interval, 100 attempts
    fn default() -> Self {
        Self::attempts(Duration::from_millis(100), 100)
    }
}

impl Poller {
    pub fn new(interval: Duration, budget: Budget) -> Self {
        Self { interval, budget }
    }

    pub fn attempts(interval: Duration, attempts: u32) -> Self {
        Self::new(interval, Budget::Attempts(attempts))
    }

    pub fn deadline(interval: Duration, deadline: Duration) -> Self {
        Self::new(interval, Budget::Deadline(deadline))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    /// Sleep before the next check, or `None` once the budget is spent
    fn next_delay(&self, attempts: u32, elapsed: Duration) -> Option<Duration> {
        match self.budget {
            Budget::Attempts(max) => (attempts < max).then_some(self.interval),
            Budget::Deadline(deadline) => {
                let remaining = deadline.checked_sub(elapsed)?;
                (!remaining.is_zero()).then(|| self.interval.min(remaining))
            }
        }
    }

    /// Run `check` until it yields a value
    ///
    /// Errors from the check abort the poll immediately. Budget exhaustion is
    /// reported as [`QueueError::Timeout`].
    pub fn poll<T, F>(&self, mut check: F) -> Result<T>
    where
        F: FnMut() -> Result<Option<T>>,
    {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(value) = check()? {
                return Ok(value);
            }
            match self.next_delay(attempts, start.elapsed()) {
                Some(delay) => std::thread::sleep(delay),
                None => {
                    return Err(QueueError::Timeout {
                        attempts,
                        elapsed: start.elapsed(),
                    })
                }
            }
        }
    }

    /// Async variant of [`Poller::poll`]
    ///
    /// Dropping the returned future cancels the poll between checks.
    #[cfg(feature = "async")]
    pub async fn poll_async<T, F>(&self, mut check: F) -> Result<T>
    where
        F: FnMut() -> Result<Option<T>>,
    {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(value) = check()? {
                return Ok(value);
            }
            match self.next_delay(attempts, start.elapsed()) {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    return Err(QueueError::Timeout {
                        attempts,
                        elapsed: start.elapsed(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_first_value() {
        let poller = Poller::attempts(Duration::from_millis(1), 10);
        let mut calls = 0;
        let value = poller
            .poll(|| {
                calls += 1;
                Ok((calls == 3).then_some("done"))
            })
            .unwrap();
        assert_eq!(value, "done");
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_attempt_budget() {
        let poller = Poller::attempts(Duration::from_millis(1), 5);
        let mut calls = 0;
        let err = poller
            .poll::<(), _>(|| {
                calls += 1;
                Ok(None)
            })
            .unwrap_err();
        assert!(matches!(err, QueueError::Timeout { attempts: 5, .. }));
        assert_eq!(calls, 5);
    }

    #[test]
    fn test_deadline_budget() {
        let poller = Poller::deadline(Duration::from_millis(10), Duration::from_millis(50));
        let start = Instant::now();
        let err = poller.poll::<(), _>(|| Ok(None)).unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(50));
        match err {
            QueueError::Timeout { attempts, elapsed } => {
                assert!(attempts >= 2);
                assert!(elapsed >= Duration::from_millis(50));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_check_error_aborts() {
        let poller = Poller::attempts(Duration::from_millis(1), 100);
        let mut calls = 0;
        let err = poller
            .poll::<(), _>(|| {
                calls += 1;
                Err(QueueError::KeyNotFound("k".into()))
            })
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(calls, 1);
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_poll_async() {
        let poller = Poller::attempts(Duration::from_millis(1), 10);
        let mut calls = 0;
        let value = poller
            .poll_async(|| {
                calls += 1;
                Ok((calls == 2).then_some(7))
            })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let err = poller.poll_async::<(), _>(|| Ok(None)).await.unwrap_err();
        assert!(matches!(err, QueueError::Timeout { attempts: 10, .. }));
    }
}
