//! Bounded polling of externally driven asynchronous work.
//!
//! [`BoundedPoller::schedule`] spawns a task that invokes a probe on a fixed
//! interval until it settles or a time-to-live elapses. The returned
//! [`PollHandle`] is a future over the outcome and can be cancelled; dropping
//! it cancels the polling too.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PollingError;

/// What a single probe invocation observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome<T> {
    /// Nothing settled yet; poll again after the interval.
    Pending,
    Ready(T),
    /// The external protocol reached a terminal failure.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct BoundedPoller {
    default_interval: Duration,
    default_ttl: Duration,
}

impl Default for BoundedPoller {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(600))
    }
}

impl BoundedPoller {
    pub fn new(default_interval: Duration, default_ttl: Duration) -> Self {
        Self {
            default_interval,
            default_ttl,
        }
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Polls `probe` every `poll_interval` until it is ready, fails, or `ttl`
    /// elapses. The first probe runs immediately.
    pub fn schedule<T, F, Fut>(
        &self,
        description: impl Into<String>,
        probe: F,
        poll_interval: Duration,
        ttl: Duration,
    ) -> PollHandle<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ProbeOutcome<T>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_until_settled(
            description.into(),
            probe,
            poll_interval,
            ttl,
            cancel.clone(),
        ));
        PollHandle { task, cancel }
    }

    /// [`schedule`](Self::schedule) with the configured interval and TTL.
    pub fn schedule_default<T, F, Fut>(&self, description: impl Into<String>, probe: F) -> PollHandle<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ProbeOutcome<T>> + Send + 'static,
    {
        self.schedule(description, probe, self.default_interval, self.default_ttl)
    }
}

async fn poll_until_settled<T, F, Fut>(
    description: String,
    mut probe: F,
    poll_interval: Duration,
    ttl: Duration,
    cancel: CancellationToken,
) -> Result<T, PollingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProbeOutcome<T>>,
{
    let deadline = Instant::now() + ttl;
    let timeout = || PollingError::Timeout {
        description: description.clone(),
        ttl,
    };
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollingError::Cancelled),
            _ = sleep_until(deadline) => return Err(timeout()),
            outcome = probe() => outcome,
        };

        match outcome {
            ProbeOutcome::Ready(value) => {
                debug!(description = %description, attempt, "poll settled");
                return Ok(value);
            }
            ProbeOutcome::Failed(reason) => {
                debug!(description = %description, attempt, reason = %reason, "poll failed");
                return Err(PollingError::Failed(reason));
            }
            ProbeOutcome::Pending => {}
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollingError::Cancelled),
            _ = sleep_until(deadline) => return Err(timeout()),
            _ = sleep(poll_interval) => {}
        }
    }
}

/// Handle to a scheduled poll. Await it for the outcome.
#[derive(Debug)]
pub struct PollHandle<T> {
    task: JoinHandle<Result<T, PollingError>>,
    cancel: CancellationToken,
}

impl<T> PollHandle<T> {
    /// Stops further probing; already issued probe calls are not undone.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<T> Future for PollHandle<T> {
    type Output = Result<T, PollingError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.task).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(join_error)) if join_error.is_cancelled() => {
                Poll::Ready(Err(PollingError::Cancelled))
            }
            Poll::Ready(Err(join_error)) => Poll::Ready(Err(PollingError::Failed(format!(
                "probe panicked: {join_error}"
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for PollHandle<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
