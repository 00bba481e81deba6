//! Notify-then-acquire locking for lifecycle operations.
//!
//! A new operation on an environment supersedes whatever is in flight for it:
//! before waiting for the lock, the locker broadcasts on the key so the current
//! holder aborts and releases instead of running to completion.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::LockError;
use crate::key::lock_key;
use crate::lock::{LockProvider, PreemptableLock, Preempted};

/// Default bound on waiting for a lock.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(60);

/// Creates [`PreemptiveLocker`]s that share a provider and a wait bound.
#[derive(Clone)]
pub struct PreemptiveLockerFactory {
    provider: Arc<dyn LockProvider>,
    lock_wait: Duration,
}

impl PreemptiveLockerFactory {
    #[must_use]
    pub fn new(provider: Arc<dyn LockProvider>, lock_wait: Duration) -> Self {
        Self {
            provider,
            lock_wait,
        }
    }

    /// Locker scoped to a repository and pull request.
    #[must_use]
    pub fn locker(&self, repo: &str, pull_request: u32, event: &str) -> PreemptiveLocker {
        self.locker_for_key(lock_key(repo, pull_request), event)
    }

    /// Locker scoped to an explicit key.
    #[must_use]
    pub fn locker_for_key(&self, key: i64, event: &str) -> PreemptiveLocker {
        PreemptiveLocker {
            provider: Arc::clone(&self.provider),
            key,
            event: event.to_string(),
            lock_wait: self.lock_wait,
            lock: None,
        }
    }

    #[must_use]
    pub const fn lock_wait(&self) -> Duration {
        self.lock_wait
    }
}

/// One locking attempt for one key.
///
/// Dropping a held locker tears down the underlying lock without an explicit
/// unlock; callers should still [`release`](Self::release) on every path.
pub struct PreemptiveLocker {
    provider: Arc<dyn LockProvider>,
    key: i64,
    event: String,
    lock_wait: Duration,
    lock: Option<Box<dyn PreemptableLock>>,
}

impl PreemptiveLocker {
    #[must_use]
    pub const fn key(&self) -> i64 {
        self.key
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.lock.is_some()
    }

    /// Preempt the current holder of the key, then acquire it.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] if the lock is not obtained within
    /// the configured wait, or a connection error from the provider.
    pub async fn lock(&mut self) -> Result<Preempted, LockError> {
        if self.lock.is_some() {
            return Err(LockError::AlreadyHeld(self.key));
        }
        let mut lock = self.provider.new_lock(self.key, &self.event).await?;
        if let Err(e) = lock.notify(&self.event).await {
            warn!(lock_key = self.key, error = %e, "Unable to notify current lock holder");
        }
        match lock.lock(self.lock_wait).await {
            Ok(preempted) => {
                self.lock = Some(lock);
                Ok(preempted)
            }
            Err(e) => {
                if let Err(cleanup) = lock.unlock().await {
                    debug!(lock_key = self.key, error = %cleanup, "Cleanup after failed acquisition");
                }
                Err(e)
            }
        }
    }

    /// Release the lock if held. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns the backend's unlock error; the lock is torn down regardless.
    pub async fn release(&mut self) -> Result<(), LockError> {
        match self.lock.take() {
            Some(mut lock) => lock.unlock().await,
            None => Ok(()),
        }
    }
}
