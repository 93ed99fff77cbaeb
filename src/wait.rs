//! Fixed-interval polling with optional deadline and cancellation
//!
//! Both suspension points of a party (waiting for peers to publish their
//! network details, and the phase barrier) are poll loops over the
//! coordination store. [`Poller`] is the one loop they share: check, sleep
//! for the interval, check again, until the check yields a value, the
//! deadline passes or the cancel flag is raised.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Polling cadence and optional deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between checks
    pub interval: Duration,
    /// Give up after this much time; `None` waits forever
    pub deadline: Option<Duration>,
}

impl PollPolicy {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Outcome of a single check
pub enum Poll<T> {
    Ready(T),
    /// Not ready yet; the string is logged once per change
    Pending(String),
}

/// Poll loop bound to a policy and an optional cancel flag
#[derive(Debug, Clone, Default)]
pub struct Poller {
    policy: PollPolicy,
    cancel: Option<Arc<AtomicBool>>,
}

impl Poller {
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            policy,
            cancel: None,
        }
    }

    /// Abort the wait once `flag` is set
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Run `check` until it is ready
    ///
    /// Errors returned by `check` end the wait immediately. `waiting_for`
    /// names the condition in logs and in timeout/cancel errors.
    pub fn wait<T, F>(&self, waiting_for: &str, mut check: F) -> Result<T>
    where
        F: FnMut() -> Result<Poll<T>>,
    {
        let start = Instant::now();
        let mut last_reason = String::new();

        loop {
            if self.is_cancelled() {
                return Err(Error::Cancelled {
                    waiting_for: waiting_for.to_string(),
                });
            }

            match check()? {
                Poll::Ready(value) => return Ok(value),
                Poll::Pending(reason) => {
                    if reason != last_reason {
                        tracing::info!("{}", reason);
                        last_reason = reason;
                    } else {
                        tracing::debug!("still waiting for {}", waiting_for);
                    }
                }
            }

            let elapsed = start.elapsed();
            let mut sleep_for = self.policy.interval;
            if let Some(deadline) = self.policy.deadline {
                if elapsed >= deadline {
                    return Err(Error::Timeout {
                        waiting_for: waiting_for.to_string(),
                        elapsed,
                    });
                }
                // One last check right at the deadline
                sleep_for = sleep_for.min(deadline - elapsed);
            }

            std::thread::sleep(sleep_for);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::Relaxed))
    }
}
