//! Retry/timeout driver shared by every request-response exchange.

use crate::constants::WATCHDOG_POLL_SLICE;
use crate::error::SensorError;
use crate::frame::Command;
use std::future::{Future, Ready, ready};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Outcome {
    Pending = 0,
    Succeeded = 1,
    TimedOut = 2,
}

impl From<u8> for Outcome {
    fn from(value: u8) -> Self {
        match value {
            1 => Outcome::Succeeded,
            2 => Outcome::TimedOut,
            _ => Outcome::Pending,
        }
    }
}

/// Shared outcome of one pending exchange.
///
/// Only transitions out of `Pending` are possible, so an exchange can never be both
/// received and timed out.
#[derive(Debug, Clone, Default)]
pub struct Exchange(Arc<AtomicU8>);

impl Exchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcome(&self) -> Outcome {
        Outcome::from(self.0.load(Ordering::Acquire))
    }

    pub fn is_pending(&self) -> bool {
        self.outcome() == Outcome::Pending
    }

    /// Mark the response as received. Returns false if the exchange already settled.
    pub fn succeed(&self) -> bool {
        self.settle(Outcome::Succeeded)
    }

    /// Mark the exchange as timed out. Returns false if it already settled.
    pub fn expire(&self) -> bool {
        self.settle(Outcome::TimedOut)
    }

    fn reset(&self) {
        self.0.store(Outcome::Pending as u8, Ordering::Release);
    }

    fn settle(&self, to: Outcome) -> bool {
        self.0
            .compare_exchange(Outcome::Pending as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Timing of one watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait before the first action.
    pub initial_delay: Duration,
    /// Wait after the first action before the first window starts.
    pub post_action_delay: Duration,
    /// Extra action invocations allowed after the first window expires.
    pub retries: u32,
    /// Length of each waiting window.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub const fn new(initial_delay: Duration, post_action_delay: Duration, retries: u32, timeout: Duration) -> Self {
        Self {
            initial_delay,
            post_action_delay,
            retries,
            timeout,
        }
    }

    pub const fn millis(initial_delay: u64, post_action_delay: u64, retries: u32, timeout: u64) -> Self {
        Self::new(
            Duration::from_millis(initial_delay),
            Duration::from_millis(post_action_delay),
            retries,
            Duration::from_millis(timeout),
        )
    }

    pub const fn with_post_action_delay(mut self, delay: Duration) -> Self {
        self.post_action_delay = delay;
        self
    }

    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// How a watchdog task ended.
#[derive(Debug)]
pub enum WatchdogExit {
    /// The exchange settled as received; the watchdog stopped silently.
    Received,
    /// Every attempt expired; the timeout callback ran.
    TimedOut,
    /// The action itself failed.
    ActionFailed(SensorError),
    /// The task was aborted.
    Cancelled,
}

impl WatchdogExit {
    /// Map the exit into an operation result for `command`.
    pub fn into_result(self, command: Command, reason: &'static str) -> Result<(), SensorError> {
        match self {
            WatchdogExit::Received => Ok(()),
            WatchdogExit::TimedOut => Err(SensorError::ResponseTimeout { command, reason }),
            WatchdogExit::ActionFailed(err) => Err(err),
            WatchdogExit::Cancelled => Err(SensorError::Superseded),
        }
    }
}

type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;

/// Drives an action with retries until its [`Exchange`] settles.
///
/// The watchdog runs on its own task: it only reads the exchange and calls the action, it
/// never consumes the response itself.
pub struct Watchdog<A> {
    policy: RetryPolicy,
    action: A,
    on_timeout: Option<TimeoutCallback>,
}

fn no_action() -> Ready<Result<(), SensorError>> {
    ready(Ok(()))
}

impl Watchdog<fn() -> Ready<Result<(), SensorError>>> {
    /// A watchdog that only waits.
    pub fn idle(policy: RetryPolicy) -> Self {
        Watchdog::new(policy, no_action as fn() -> Ready<Result<(), SensorError>>)
    }
}

impl<A, F> Watchdog<A>
where
    A: FnMut() -> F + Send + 'static,
    F: Future<Output = Result<(), SensorError>> + Send + 'static,
{
    pub fn new(policy: RetryPolicy, action: A) -> Self {
        Self {
            policy,
            action,
            on_timeout: None,
        }
    }

    /// Invoked exactly once when the last window expires without a response.
    pub fn on_timeout(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(callback));
        self
    }

    /// Reset `exchange` to pending and start the watchdog on its own task.
    pub fn spawn(self, exchange: &Exchange) -> WatchdogHandle {
        exchange.reset();
        let exchange = exchange.clone();
        WatchdogHandle {
            task: Some(tokio::spawn(self.run(exchange))),
        }
    }

    async fn run(mut self, exchange: Exchange) -> WatchdogExit {
        if !self.policy.initial_delay.is_zero() {
            sleep(self.policy.initial_delay).await;
        }
        if let Err(err) = (self.action)().await {
            return WatchdogExit::ActionFailed(err);
        }
        if !self.policy.post_action_delay.is_zero() {
            sleep(self.policy.post_action_delay).await;
        }

        let mut remaining = self.policy.retries;
        let mut window_start = Instant::now();
        loop {
            if !exchange.is_pending() {
                return WatchdogExit::Received;
            }
            if window_start.elapsed() >= self.policy.timeout {
                if remaining == 0 {
                    if !exchange.expire() {
                        return WatchdogExit::Received;
                    }
                    debug!("Watchdog expired after {} retries", self.policy.retries);
                    if let Some(callback) = self.on_timeout.take() {
                        callback();
                    }
                    return WatchdogExit::TimedOut;
                }
                remaining -= 1;
                warn!("No response within {:?}, retrying ({} left)", self.policy.timeout, remaining);
                if let Err(err) = (self.action)().await {
                    return WatchdogExit::ActionFailed(err);
                }
                window_start = Instant::now();
                continue;
            }
            sleep(WATCHDOG_POLL_SLICE).await;
        }
    }
}

/// Owner's view of a running watchdog. Dropping the handle aborts the task, so a
/// superseded watchdog never fires.
#[derive(Debug, Default)]
pub struct WatchdogHandle {
    task: Option<JoinHandle<WatchdogExit>>,
}

impl WatchdogHandle {
    /// A handle with no task behind it; [`expired`](Self::expired) never resolves.
    pub fn disarmed() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// Abort the task, if any, and disarm.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Wait for the watchdog to finish. Resolves once, then stays pending.
    ///
    /// Cancel safe: dropping the returned future leaves the watchdog running.
    pub async fn expired(&mut self) -> WatchdogExit {
        let Some(task) = self.task.as_mut() else {
            return std::future::pending().await;
        };
        let exit = match task.await {
            Ok(exit) => exit,
            Err(_) => WatchdogExit::Cancelled,
        };
        self.task = None;
        exit
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_settles_once() {
        let exchange = Exchange::new();
        assert!(exchange.succeed());
        assert!(!exchange.expire());
        assert_eq!(exchange.outcome(), Outcome::Succeeded);
    }

    #[test]
    fn test_expired_exchange_rejects_late_response() {
        let exchange = Exchange::new();
        assert!(exchange.expire());
        assert!(!exchange.succeed());
        assert_eq!(exchange.outcome(), Outcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_handle_stays_pending() {
        let mut handle = WatchdogHandle::disarmed();
        let waited = tokio::time::timeout(Duration::from_secs(1), handle.expired()).await;
        assert!(waited.is_err());
    }
}
