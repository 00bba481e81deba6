//! Broadcast payloads exchanged between lock holders.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message broadcast on a key's channel, and delivered to a holder when it is
/// preempted.
///
/// The wire form is `{"id": "...", "message": "...", "lockKey": 123}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Identity of the lock that originated the payload
    pub id: Uuid,
    /// Human readable reason
    pub message: String,
    /// Key the payload refers to
    #[serde(rename = "lockKey")]
    pub lock_key: i64,
}

impl NotificationPayload {
    #[must_use]
    pub fn new(id: Uuid, message: impl Into<String>, lock_key: i64) -> Self {
        Self {
            id,
            message: message.into(),
            lock_key,
        }
    }
}

impl std::fmt::Display for NotificationPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lock {} (key {}): {}", self.id, self.lock_key, self.message)
    }
}

/// Returns the channel name used to listen/notify for a key.
#[must_use]
pub fn notification_channel(key: i64) -> String {
    key.to_string()
}
