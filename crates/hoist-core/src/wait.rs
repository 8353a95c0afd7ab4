//! Polling cadence, deadlines, and cancellation shared by the wait loops.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Default gap between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How a polling loop paces itself and when it gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub interval: Duration,
    /// `None` waits until the condition holds or the run is cancelled.
    pub timeout: Option<Duration>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

impl WaitOptions {
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A started wait: the options plus the instant the clock began.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    operation: &'static str,
    timeout: Option<Duration>,
    at: Option<Instant>,
}

impl Deadline {
    pub(crate) fn start(operation: &'static str, opts: &WaitOptions) -> Self {
        Self {
            operation,
            timeout: opts.timeout,
            at: opts.timeout.map(|t| Instant::now() + t),
        }
    }

    pub(crate) fn timeout_error(&self) -> Error {
        Error::Timeout {
            operation: self.operation,
            after: self.timeout.unwrap_or_default(),
        }
    }

    /// Resolves when the deadline passes; never resolves without one.
    pub(crate) async fn expired(&self) {
        match self.at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }

    /// Sleeps one interval, failing early on cancellation or expiry.
    pub(crate) async fn pause(&self, interval: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(interval) => Ok(()),
            _ = self.expired() => Err(self.timeout_error()),
            _ = cancel.cancelled() => Err(Error::Cancelled(self.operation)),
        }
    }

    /// Runs one node call under the same deadline and cancellation as the
    /// pauses, so a node that stops replying can't stall the wait.
    pub(crate) async fn guard<T, F>(&self, call: F, cancel: &CancellationToken) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(self.operation)),
            _ = self.expired() => Err(self.timeout_error()),
            result = call => result,
        }
    }
}
