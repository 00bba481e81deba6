//! Operation context: cancellation plus the reason it happened.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why an operation was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// Another operation on the same environment asked this one to yield,
    /// or the lock session failed
    Preempted(String),
    /// The operation ran longer than allowed
    Timeout(Duration),
    /// The caller cancelled
    Requested(String),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preempted(why) => write!(f, "preempted: {why}"),
            Self::Timeout(after) => write!(f, "timeout reached ({after:?})"),
            Self::Requested(why) => write!(f, "cancelled: {why}"),
        }
    }
}

struct Inner {
    token: CancellationToken,
    reason: OnceLock<CancelReason>,
    parent: Option<Arc<Inner>>,
}

impl Inner {
    fn reason(&self) -> Option<CancelReason> {
        self.reason
            .get()
            .cloned()
            .or_else(|| self.parent.as_ref().and_then(|p| p.reason()))
    }
}

/// Cancellation scope of one lifecycle operation.
///
/// Cloning shares the scope. [`child`](Self::child) creates a nested scope
/// that is cancelled with its parent but can also be cancelled alone. The
/// first reason recorded for a scope wins.
#[derive(Clone)]
pub struct OpContext {
    id: Uuid,
    inner: Arc<Inner>,
}

impl Default for OpContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpContext")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

impl OpContext {
    /// A root context with a fresh operation id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    #[must_use]
    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                reason: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Operation id, used for operation records and status links.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Nested scope of the same operation.
    #[must_use]
    pub fn child(&self) -> Self {
        self.nested(self.id)
    }

    /// Nested scope for a separate operation started on behalf of this one.
    #[must_use]
    pub fn fork(&self) -> Self {
        self.nested(Uuid::new_v4())
    }

    fn nested(&self, id: Uuid) -> Self {
        Self {
            id,
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                reason: OnceLock::new(),
                parent: Some(Arc::clone(&self.inner)),
            }),
        }
    }

    /// Cancel this scope and its children. Only the first reason is kept.
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.inner.reason.set(reason);
        self.inner.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the scope is cancelled.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Token handed to collaborators.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Why the scope was cancelled, if it was.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.is_cancelled() {
            return None;
        }
        self.inner.reason()
    }

    /// Human readable reason, for errors.
    #[must_use]
    pub fn reason_text(&self) -> String {
        self.reason()
            .map_or_else(|| "context was cancelled".to_string(), |r| r.to_string())
    }
}
