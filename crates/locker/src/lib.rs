//! Preemptive distributed locks for preview environment operations.
//!
//! A lock is keyed by a 64-bit integer derived from a repository name and a
//! pull request number. Whoever wants the lock first broadcasts a request on
//! the key; the current holder receives it as a preemption signal, aborts its
//! work and releases, and the requester then acquires.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use locker::{MemoryLockProvider, PreemptiveLockerFactory, DEFAULT_LOCK_WAIT};
//!
//! # async fn run() -> Result<(), locker::LockError> {
//! let factory = PreemptiveLockerFactory::new(
//!     Arc::new(MemoryLockProvider::default()),
//!     DEFAULT_LOCK_WAIT,
//! );
//! let mut locker = factory.locker("acme/widgets", 42, "update");
//! let preempted = locker.lock().await?;
//! // ... do work, abandoning it if `preempted` resolves ...
//! locker.release().await?;
//! # drop(preempted);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`LockProvider`] and [`PreemptableLock`] define the backend seam
//! - [`PostgresLockProvider`] uses advisory locks and `LISTEN`/`NOTIFY`
//! - [`MemoryLockProvider`] is an in-process backend for tests and single nodes
//! - [`PreemptiveLocker`] layers notify-then-acquire over any backend
//!
//! While a lock is held, a session monitor pings the backend and an event task
//! watches for the first of: a foreign notification, session failure, or the
//! maximum hold time. Whichever arrives first is delivered once on the
//! [`Preempted`] channel returned by `lock`.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod events;
pub mod key;
pub mod lock;
pub mod memory;
pub mod payload;
pub mod postgres;
pub mod preemptive;
pub mod session;

pub use error::LockError;
pub use key::lock_key;
pub use lock::{LockOptions, LockProvider, PreemptableLock, Preempted, DEFAULT_MAX_HOLD};
pub use memory::MemoryLockProvider;
pub use payload::{notification_channel, NotificationPayload};
pub use postgres::PostgresLockProvider;
pub use preemptive::{PreemptiveLocker, PreemptiveLockerFactory, DEFAULT_LOCK_WAIT};
pub use session::{DEFAULT_FAILURE_THRESHOLD, DEFAULT_KEEP_ALIVE_PERIOD};
