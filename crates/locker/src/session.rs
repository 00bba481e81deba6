//! Session monitor.
//!
//! A session-scoped lock is only as good as the connection that holds it. The
//! monitor pings that connection on a fixed period and reports the session as
//! failed once more than `failure_threshold` consecutive pings have failed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::LockError;

/// Default period between keep-alive pings.
pub const DEFAULT_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(3);

/// Default number of consecutive failures tolerated before the session is
/// considered dead.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 2;

/// Liveness check against the connection that backs a lock.
#[async_trait]
pub trait SessionProbe: Send + Sync {
    /// Ping the underlying connection.
    async fn ping(&self) -> Result<(), LockError>;
}

/// Periodic health checker for a lock session.
#[derive(Debug, Clone, Copy)]
pub struct SessionMonitor {
    keep_alive: Duration,
    failure_threshold: u32,
}

impl Default for SessionMonitor {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE_PERIOD,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

impl SessionMonitor {
    /// Zero values fall back to the defaults.
    #[must_use]
    pub fn new(keep_alive: Duration, failure_threshold: u32) -> Self {
        Self {
            keep_alive: if keep_alive.is_zero() {
                DEFAULT_KEEP_ALIVE_PERIOD
            } else {
                keep_alive
            },
            failure_threshold: if failure_threshold == 0 {
                DEFAULT_FAILURE_THRESHOLD
            } else {
                failure_threshold
            },
        }
    }

    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    #[must_use]
    pub const fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Start monitoring in the background.
    ///
    /// The returned receiver resolves with the last ping error if the session
    /// fails. If `shutdown` is cancelled first the sender is dropped without
    /// a value.
    pub fn spawn(
        self,
        probe: Arc<dyn SessionProbe>,
        shutdown: CancellationToken,
    ) -> (JoinHandle<()>, oneshot::Receiver<LockError>) {
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(self.run(probe, shutdown, tx));
        (handle, rx)
    }

    async fn run(
        self,
        probe: Arc<dyn SessionProbe>,
        shutdown: CancellationToken,
        session_err: oneshot::Sender<LockError>,
    ) {
        let mut ticker = interval_at(Instant::now() + self.keep_alive, self.keep_alive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                () = shutdown.cancelled() => return,
                result = probe.ping() => result,
            };

            match result {
                Ok(()) => {
                    if failures > 0 {
                        debug!(previous_failures = failures, "Lock session recovered");
                    }
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        failures,
                        threshold = self.failure_threshold,
                        error = %e,
                        "Lock session keep-alive failed"
                    );
                    if failures > self.failure_threshold {
                        let _ = session_err.send(e);
                        return;
                    }
                }
            }
        }
    }
}
