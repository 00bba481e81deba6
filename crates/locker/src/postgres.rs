//! Postgres backend.
//!
//! Locks are session-level advisory locks. A session lock is released in two
//! cases: an explicit `pg_advisory_unlock`, or the end of the session that took
//! it. Every lock therefore owns one connection detached from the pool for its
//! whole life, which makes a dead session observable through pings instead of
//! being hidden behind pool recycling. Preemption requests travel over
//! `LISTEN`/`NOTIFY` on a channel named after the key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{Connection, PgConnection, PgPool};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::LockError;
use crate::lock::{release_then_teardown, LockOptions, LockProvider, LockSession, PreemptableLock, Preempted};
use crate::payload::{notification_channel, NotificationPayload};
use crate::session::SessionProbe;

/// SQLSTATE raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Bound on the unlock query so a wedged connection cannot stall a release.
const UNLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Lock provider backed by Postgres advisory locks.
#[derive(Clone)]
pub struct PostgresLockProvider {
    pool: PgPool,
    options: LockOptions,
}

impl PostgresLockProvider {
    /// Open a connection pool to `uri`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Connection`] if the pool cannot be established.
    pub async fn connect(
        uri: &str,
        max_connections: u32,
        options: LockOptions,
    ) -> Result<Self, LockError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(uri)
            .await
            .map_err(|e| LockError::Connection(format!("error opening db: {e}")))?;
        Ok(Self::with_pool(pool, options))
    }

    /// Use an existing pool.
    #[must_use]
    pub fn with_pool(pool: PgPool, options: LockOptions) -> Self {
        Self { pool, options }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LockProvider for PostgresLockProvider {
    async fn new_lock(&self, key: i64, reason: &str) -> Result<Box<dyn PreemptableLock>, LockError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| LockError::Connection(format!("unable to obtain connection from pool: {e}")))?
            .detach();
        Ok(Box::new(PostgresLock {
            id: Uuid::new_v4(),
            key,
            reason: reason.to_string(),
            options: self.options,
            pool: self.pool.clone(),
            conn: Some(Arc::new(Mutex::new(conn))),
            session: None,
        }))
    }
}

/// Pings the lock's dedicated connection.
struct ConnectionProbe {
    conn: Arc<Mutex<PgConnection>>,
}

#[async_trait]
impl SessionProbe for ConnectionProbe {
    async fn ping(&self) -> Result<(), LockError> {
        let mut conn = self.conn.lock().await;
        conn.ping().await.map_err(|e| LockError::Ping(e.to_string()))
    }
}

/// A session-scoped advisory lock on one dedicated connection.
pub struct PostgresLock {
    id: Uuid,
    key: i64,
    reason: String,
    options: LockOptions,
    pool: PgPool,
    /// `None` once released; the connection is never reused afterwards
    conn: Option<Arc<Mutex<PgConnection>>>,
    session: Option<LockSession>,
}

impl PostgresLock {
    fn conn(&self) -> Result<&Arc<Mutex<PgConnection>>, LockError> {
        self.conn.as_ref().ok_or(LockError::Released(self.key))
    }

    async fn acquire_advisory(&self, wait: Duration) -> Result<(), LockError> {
        let mut conn = self.conn()?.lock().await;
        // lock_timeout takes milliseconds; zero would mean "wait forever"
        let set_timeout = format!("SET lock_timeout = {}", wait.as_millis().max(1));
        sqlx::query(&set_timeout).execute(&mut *conn).await?;

        let acquired = sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(self.key)
            .execute(&mut *conn)
            .await;

        if let Err(e) = sqlx::query("RESET lock_timeout").execute(&mut *conn).await {
            warn!(lock_key = self.key, error = %e, "Unable to reset lock_timeout");
        }

        match acquired {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) => {
                Err(LockError::Unavailable {
                    key: self.key,
                    waited: wait,
                })
            }
            Err(e) => Err(LockError::Database(e)),
        }
    }

    async fn listen(&self) -> Result<PgListener, LockError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| LockError::Listener(format!("unable to establish listener: {e}")))?;
        listener
            .listen(&notification_channel(self.key))
            .await
            .map_err(|e| LockError::Listener(format!("unable to listen on channel: {e}")))?;
        Ok(listener)
    }
}

async fn unlock_advisory(conn: Arc<Mutex<PgConnection>>, key: i64) -> Result<(), LockError> {
    let mut conn = conn.lock().await;
    let unlock = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(key)
        .execute(&mut *conn);
    match tokio::time::timeout(UNLOCK_TIMEOUT, unlock).await {
        Ok(result) => result.map(|_| ()).map_err(LockError::Database),
        Err(_) => Err(LockError::Connection(format!(
            "unlock did not complete within {UNLOCK_TIMEOUT:?}"
        ))),
    }
}

/// Close the dedicated connection, ending its session.
async fn close_connection(conn: Arc<Mutex<PgConnection>>, key: i64) {
    match Arc::try_unwrap(conn) {
        Ok(conn) => {
            if let Err(e) = conn.into_inner().close().await {
                warn!(lock_key = key, error = %e, "Unable to close lock connection");
            }
        }
        // still referenced by a task that is shutting down; dropping ends the session
        Err(_) => debug!(lock_key = key, "Lock connection dropped while still shared"),
    }
}

#[async_trait]
impl PreemptableLock for PostgresLock {
    fn id(&self) -> Uuid {
        self.id
    }

    fn key(&self) -> i64 {
        self.key
    }

    async fn lock(&mut self, wait: Duration) -> Result<Preempted, LockError> {
        if self.session.is_some() {
            return Err(LockError::AlreadyHeld(self.key));
        }
        self.acquire_advisory(wait).await?;

        let listener = match self.listen().await {
            Ok(listener) => listener,
            Err(e) => {
                if let Err(unlock_err) = unlock_advisory(Arc::clone(self.conn()?), self.key).await {
                    warn!(lock_key = self.key, error = %unlock_err, "Unable to unlock after listener failure");
                }
                return Err(e);
            }
        };
        let notifications = listener
            .into_stream()
            .map(|item| {
                item.map(|n| n.payload().to_owned())
                    .map_err(|e| LockError::Listener(e.to_string()))
            })
            .boxed();

        let probe = Arc::new(ConnectionProbe {
            conn: Arc::clone(self.conn()?),
        });
        let (session, preempted) =
            LockSession::start(self.id, self.key, &self.options, probe, notifications);
        self.session = Some(session);

        info!(lock_key = self.key, lock_id = %self.id, reason = %self.reason, "Acquired advisory lock");
        Ok(preempted)
    }

    async fn notify(&self, reason: &str) -> Result<(), LockError> {
        let payload = serde_json::to_string(&NotificationPayload::new(self.id, reason, self.key))?;
        let mut conn = self.conn()?.lock().await;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(notification_channel(self.key))
            .bind(payload)
            .execute(&mut *conn)
            .await?;
        debug!(lock_key = self.key, lock_id = %self.id, reason, "Sent preemption notification");
        Ok(())
    }

    async fn unlock(&mut self) -> Result<(), LockError> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        // Closing the connection ends the session, which releases the lock server side
        // even when the explicit unlock failed.
        let result = release_then_teardown(
            self.session.take(),
            unlock_advisory(Arc::clone(&conn), self.key),
            close_connection(conn, self.key),
        )
        .await;
        if result.is_ok() {
            debug!(lock_key = self.key, lock_id = %self.id, "Released advisory lock");
        }
        result
    }
}

impl Drop for PostgresLock {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.abort();
        }
    }
}
