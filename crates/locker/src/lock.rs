//! Lock traits and the background session shared by every backend.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::LockError;
use crate::events::{handle_events, EventSources, NotificationStream};
use crate::payload::NotificationPayload;
use crate::session::{SessionMonitor, SessionProbe, DEFAULT_FAILURE_THRESHOLD, DEFAULT_KEEP_ALIVE_PERIOD};

/// Upper bound on how long a single acquisition may be held before the holder
/// is told to yield.
pub const DEFAULT_MAX_HOLD: Duration = Duration::from_secs(60 * 60);

/// Receives at most one payload: when the lock is preempted, its session
/// fails, or the hold deadline passes. Closed without a value on release.
pub type Preempted = oneshot::Receiver<NotificationPayload>;

/// A mutual exclusion primitive scoped to an integer key that other parties
/// can ask to yield.
#[async_trait]
pub trait PreemptableLock: Send + Sync {
    /// Process-unique identity of this lock instance.
    fn id(&self) -> Uuid;

    /// Key the lock is scoped to.
    fn key(&self) -> i64;

    /// Acquire the lock, waiting at most `wait`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] if the wait elapses, or a connection
    /// or database error if the backing store fails.
    async fn lock(&mut self, wait: Duration) -> Result<Preempted, LockError>;

    /// Ask every other party on this key to yield, without releasing.
    ///
    /// # Errors
    ///
    /// Returns an error if the broadcast could not be sent.
    async fn notify(&self, reason: &str) -> Result<(), LockError>;

    /// Release the lock and tear down its connection and background tasks.
    ///
    /// Teardown happens even when the release itself fails.
    ///
    /// # Errors
    ///
    /// Returns the release failure, after cleanup.
    async fn unlock(&mut self) -> Result<(), LockError>;
}

/// Factory for locks bound to a key.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Create a lock that has not been acquired yet.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Connection`] if no dedicated connection can be
    /// obtained.
    async fn new_lock(&self, key: i64, reason: &str) -> Result<Box<dyn PreemptableLock>, LockError>;
}

/// Tuning for lock sessions.
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    /// Period between session keep-alive pings
    pub keep_alive: Duration,
    /// Consecutive ping failures tolerated before the session is declared dead
    pub failure_threshold: u32,
    /// Longest a single acquisition may be held
    pub max_hold: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE_PERIOD,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            max_hold: DEFAULT_MAX_HOLD,
        }
    }
}

impl LockOptions {
    /// Read `LOCK_*` environment variables over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidOption`] for a set but unparseable variable.
    pub fn from_env() -> Result<Self, LockError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidOption`] for a set but unparseable variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LockError> {
        let get = |var: &'static str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .map(|v| {
                    v.trim().parse::<u64>().map_err(|e| LockError::InvalidOption {
                        var,
                        message: e.to_string(),
                    })
                })
                .transpose()
        };
        let mut options = Self::default();
        if let Some(secs) = get("LOCK_KEEP_ALIVE_SECS")? {
            options.keep_alive = Duration::from_secs(secs);
        }
        if let Some(n) = get("LOCK_FAILURE_THRESHOLD")? {
            options.failure_threshold = u32::try_from(n).map_err(|e| LockError::InvalidOption {
                var: "LOCK_FAILURE_THRESHOLD",
                message: e.to_string(),
            })?;
        }
        if let Some(secs) = get("LOCK_MAX_HOLD_SECS")? {
            options.max_hold = Duration::from_secs(secs);
        }
        if options.keep_alive.is_zero() {
            return Err(LockError::InvalidOption {
                var: "LOCK_KEEP_ALIVE_SECS",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(options)
    }
}

/// Background tasks attached to an acquired lock.
pub(crate) struct LockSession {
    shutdown: CancellationToken,
    monitor: JoinHandle<()>,
    events: JoinHandle<()>,
}

impl LockSession {
    /// Start the session monitor and the event task.
    pub(crate) fn start(
        id: Uuid,
        key: i64,
        options: &LockOptions,
        probe: Arc<dyn SessionProbe>,
        notifications: NotificationStream,
    ) -> (Self, Preempted) {
        let shutdown = CancellationToken::new();
        let monitor = SessionMonitor::new(options.keep_alive, options.failure_threshold);
        let (monitor, session_failure) = monitor.spawn(probe, shutdown.clone());
        let (tx, rx) = oneshot::channel();
        let events = tokio::spawn(handle_events(
            EventSources {
                id,
                key,
                max_hold: options.max_hold,
                session_failure,
                notifications,
                shutdown: shutdown.clone(),
            },
            tx,
        ));
        (
            Self {
                shutdown,
                monitor,
                events,
            },
            rx,
        )
    }

    /// Stop both tasks and wait for them to exit.
    pub(crate) async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.monitor.await {
            debug!(error = %e, "Session monitor task ended abnormally");
        }
        if let Err(e) = self.events.await {
            debug!(error = %e, "Lock event task ended abnormally");
        }
    }

    /// Signal both tasks to stop without waiting.
    pub(crate) fn abort(&self) {
        self.shutdown.cancel();
    }
}

/// Run `release` if the lock was held, then stop the session and run
/// `teardown` whatever the release returned.
pub(crate) async fn release_then_teardown<R, T>(
    session: Option<LockSession>,
    release: R,
    teardown: T,
) -> Result<(), LockError>
where
    R: Future<Output = Result<(), LockError>>,
    T: Future<Output = ()>,
{
    let result = match &session {
        Some(_) => release.await,
        None => {
            drop(release);
            Ok(())
        }
    };
    if let Some(session) = session {
        session.stop().await;
    }
    teardown.await;
    result
}
