//! In-process backend.
//!
//! Same contract as the Postgres backend within a single process: one
//! `tokio` mutex per key for exclusivity and one broadcast channel per key
//! for preemption requests. A provider-wide health switch stands in for the
//! connection, so session failure can be exercised without a database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LockError;
use crate::lock::{LockOptions, LockProvider, LockSession, PreemptableLock, Preempted};
use crate::payload::NotificationPayload;
use crate::session::SessionProbe;

const CHANNEL_CAPACITY: usize = 64;

struct Backend {
    keys: DashMap<i64, Arc<Mutex<()>>>,
    channels: DashMap<i64, broadcast::Sender<String>>,
    healthy: AtomicBool,
}

impl Backend {
    fn mutex(&self, key: i64) -> Arc<Mutex<()>> {
        Arc::clone(self.keys.entry(key).or_default().value())
    }

    fn channel(&self, key: i64) -> broadcast::Sender<String> {
        self.channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .value()
            .clone()
    }

    /// Forget a key's mutex and channel once nothing holds, awaits or
    /// listens on them.
    fn prune(&self, key: i64) {
        self.keys
            .remove_if(&key, |_, mutex| Arc::strong_count(mutex) == 1);
        self.channels
            .remove_if(&key, |_, tx| tx.receiver_count() == 0);
    }
}

/// Lock provider for a single process.
#[derive(Clone)]
pub struct MemoryLockProvider {
    backend: Arc<Backend>,
    options: LockOptions,
}

impl Default for MemoryLockProvider {
    fn default() -> Self {
        Self::new(LockOptions::default())
    }
}

impl MemoryLockProvider {
    #[must_use]
    pub fn new(options: LockOptions) -> Self {
        Self {
            backend: Arc::new(Backend {
                keys: DashMap::new(),
                channels: DashMap::new(),
                healthy: AtomicBool::new(true),
            }),
            options,
        }
    }

    /// Flip the health of every session created by this provider.
    pub fn set_healthy(&self, healthy: bool) {
        self.backend.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Broadcast a raw payload on a key's channel, returning how many
    /// listeners received it.
    pub fn publish_raw(&self, key: i64, raw: impl Into<String>) -> usize {
        let received = self.backend.channel(key).send(raw.into()).unwrap_or(0);
        self.backend.prune(key);
        received
    }

    /// Whether some lock currently holds `key`.
    #[must_use]
    pub fn is_locked(&self, key: i64) -> bool {
        self.backend
            .keys
            .get(&key)
            .is_some_and(|mutex| mutex.try_lock().is_err())
    }
}

#[async_trait]
impl LockProvider for MemoryLockProvider {
    async fn new_lock(&self, key: i64, reason: &str) -> Result<Box<dyn PreemptableLock>, LockError> {
        Ok(Box::new(MemoryLock {
            id: Uuid::new_v4(),
            key,
            reason: reason.to_string(),
            options: self.options,
            backend: Arc::clone(&self.backend),
            guard: None,
            session: None,
            released: false,
        }))
    }
}

struct HealthProbe {
    backend: Arc<Backend>,
}

#[async_trait]
impl SessionProbe for HealthProbe {
    async fn ping(&self) -> Result<(), LockError> {
        if self.backend.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LockError::Ping("session severed".to_string()))
        }
    }
}

/// A lock held in this process.
pub struct MemoryLock {
    id: Uuid,
    key: i64,
    reason: String,
    options: LockOptions,
    backend: Arc<Backend>,
    guard: Option<OwnedMutexGuard<()>>,
    session: Option<LockSession>,
    released: bool,
}

#[async_trait]
impl PreemptableLock for MemoryLock {
    fn id(&self) -> Uuid {
        self.id
    }

    fn key(&self) -> i64 {
        self.key
    }

    async fn lock(&mut self, wait: Duration) -> Result<Preempted, LockError> {
        if self.released {
            return Err(LockError::Released(self.key));
        }
        if self.guard.is_some() {
            return Err(LockError::AlreadyHeld(self.key));
        }
        let acquired = tokio::time::timeout(wait, self.backend.mutex(self.key).lock_owned()).await;
        let guard = match acquired {
            Ok(guard) => guard,
            Err(_) => {
                self.backend.prune(self.key);
                return Err(LockError::Unavailable {
                    key: self.key,
                    waited: wait,
                });
            }
        };

        let key = self.key;
        let notifications = futures::stream::unfold(
            self.backend.channel(key).subscribe(),
            move |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(raw) => return Some((Ok::<_, LockError>(raw), rx)),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(lock_key = key, skipped, "Notification listener lagged");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        )
        .boxed();

        let probe = Arc::new(HealthProbe {
            backend: Arc::clone(&self.backend),
        });
        let (session, preempted) =
            LockSession::start(self.id, self.key, &self.options, probe, notifications);
        self.guard = Some(guard);
        self.session = Some(session);
        debug!(lock_key = self.key, lock_id = %self.id, reason = %self.reason, "Acquired lock");
        Ok(preempted)
    }

    async fn notify(&self, reason: &str) -> Result<(), LockError> {
        if self.released {
            return Err(LockError::Released(self.key));
        }
        let payload = serde_json::to_string(&NotificationPayload::new(self.id, reason, self.key))?;
        // nobody listening is not an error
        let _ = self.backend.channel(self.key).send(payload);
        self.backend.prune(self.key);
        Ok(())
    }

    async fn unlock(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if let Some(session) = self.session.take() {
            session.stop().await;
        }
        self.guard = None;
        self.backend.prune(self.key);
        debug!(lock_key = self.key, lock_id = %self.id, "Released lock");
        Ok(())
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.abort();
        }
        if self.guard.take().is_some() {
            self.backend.prune(self.key);
        }
    }
}
