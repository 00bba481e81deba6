//! Event handling for an acquired lock.
//!
//! A single task watches the hold deadline, the session monitor and the key's
//! broadcast channel. Whichever fires first produces the one preemption
//! payload handed to the holder.

use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::LockError;
use crate::payload::NotificationPayload;

/// Message used when an inbound broadcast cannot be decoded.
pub const UNKNOWN_PAYLOAD_MESSAGE: &str = "received unknown notification payload";

/// Raw broadcast payloads for one key.
pub type NotificationStream = BoxStream<'static, Result<String, LockError>>;

/// Inputs of the event task.
pub struct EventSources {
    pub id: Uuid,
    pub key: i64,
    pub max_hold: Duration,
    pub session_failure: oneshot::Receiver<LockError>,
    pub notifications: NotificationStream,
    pub shutdown: CancellationToken,
}

/// Run until the first signal, then deliver at most one payload on `preempted`.
///
/// A cancelled `shutdown` means the lock was released: the task exits without
/// delivering anything.
pub async fn handle_events(sources: EventSources, preempted: oneshot::Sender<NotificationPayload>) {
    let EventSources {
        id,
        key,
        max_hold,
        mut session_failure,
        mut notifications,
        shutdown,
    } = sources;

    let deadline = tokio::time::sleep(max_hold);
    tokio::pin!(deadline);

    let payload = loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                debug!(lock_key = key, "Lock released, event handling stopped");
                return;
            }
            () = &mut deadline => {
                break NotificationPayload::new(
                    id,
                    format!("lock held longer than {max_hold:?}"),
                    key,
                );
            }
            result = &mut session_failure => {
                match result {
                    Ok(err) => break NotificationPayload::new(id, err.to_string(), key),
                    // monitor stopped without reporting, only happens on release
                    Err(_) => return,
                }
            }
            item = notifications.next() => {
                match item {
                    None => {
                        warn!(lock_key = key, "Notification stream closed");
                        return;
                    }
                    Some(Err(e)) => {
                        warn!(lock_key = key, error = %e, "Notification listener failed, yielding lock");
                        break NotificationPayload::new(id, e.to_string(), key);
                    }
                    Some(Ok(raw)) => match serde_json::from_str::<NotificationPayload>(&raw) {
                        Err(e) => {
                            // Forced release: a hand-written NOTIFY on the channel makes the holder yield
                            warn!(lock_key = key, error = %e, "Could not decode notification payload");
                            break NotificationPayload::new(id, UNKNOWN_PAYLOAD_MESSAGE, key);
                        }
                        Ok(np) if np.id == id => {
                            debug!(lock_key = key, "Ignoring own notification");
                        }
                        Ok(np) => break np,
                    },
                }
            }
        }
    };

    info!(lock_key = key, lock_id = %id, reason = %payload.message, "Lock preempted");
    let _ = preempted.send(payload);
}
