//! Compound operations built from the client's primitives

use tracing::debug;

use crate::client::CoordinationClient;
use crate::error::CoordError;
use crate::future::{OperationFuture, SettableOperationFuture};
use crate::store::{EventType, SessionState};

/// Resolve with `path` once the node at `path` is deleted.
///
/// Resolves immediately if the node is already absent. Data changes re-arm
/// the watch. Losing the session before the deletion is observed fails the
/// handle, so it never stays pending across an expiry.
pub fn watch_deleted(client: &CoordinationClient, path: &str) -> OperationFuture<String> {
    let result = SettableOperationFuture::new(path);
    arm(client, path.to_string(), result.clone());
    result.future()
}

fn arm(client: &CoordinationClient, path: String, result: SettableOperationFuture<String>) {
    let rearm = client.downgrade();
    let watch_path = path.clone();
    let watch_result = result.clone();

    let exists = client.exists_with_presence_watch(&path, move |event| {
        if watch_result.is_done() {
            return;
        }
        match event.event_type {
            EventType::NodeDeleted => {
                watch_result.set(watch_path);
            }
            EventType::Session => {
                let cause = session_failure(event.state, &watch_path);
                debug!(path = %watch_path, error = %cause, "Deletion watch lost its session");
                watch_result.set_error(cause);
            }
            _ => match rearm.upgrade() {
                Some(client) => arm(&client, watch_path, watch_result),
                None => {
                    watch_result.set_error(CoordError::Stopped);
                }
            },
        }
    });

    exists.on_complete(move |outcome| match outcome {
        Ok(None) => {
            result.set(path);
        }
        Ok(Some(_)) => {}
        Err(e) => {
            result.set_error(e.clone());
        }
    });
}

fn session_failure(state: SessionState, path: &str) -> CoordError {
    match state {
        SessionState::Expired => CoordError::SessionExpired(path.to_string()),
        SessionState::Closed => CoordError::Stopped,
        _ => CoordError::ConnectionLoss(path.to_string()),
    }
}
