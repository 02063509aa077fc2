//! One-shot message delivery
//!
//! A message is a persistent sequential node under a prefix. The consumer
//! deletes the node once it has processed the payload; that deletion settles
//! the sender's handle with the completion value given at send time. Sends are
//! never retried.

use serde::Serialize;
use tracing::{debug, warn};

use crate::client::CoordinationClient;
use crate::error::CoordError;
use crate::future::{OperationFuture, SettableOperationFuture};
use crate::operations::watch_deleted;
use crate::path;
use crate::store::CreateMode;

/// Name of message nodes under a prefix; the store appends the sequence.
pub const MESSAGE_NODE_NAME: &str = "msg";

/// Send an encoded message under `prefix`; the handle resolves with
/// `completion` once the message node is consumed.
pub fn send_message<V>(
    client: &CoordinationClient,
    prefix: &str,
    message: impl Into<Vec<u8>>,
    completion: V,
) -> OperationFuture<V>
where
    V: Send + Sync + 'static,
{
    let result = SettableOperationFuture::new(prefix);
    send_message_to(client, prefix, message, completion, result.clone());
    result.future()
}

/// Like [`send_message`], settling a handle supplied by the caller.
pub fn send_message_to<V>(
    client: &CoordinationClient,
    prefix: &str,
    message: impl Into<Vec<u8>>,
    completion: V,
    result: SettableOperationFuture<V>,
) where
    V: Send + Sync + 'static,
{
    let node = path::join(prefix, MESSAGE_NODE_NAME);
    let watcher = client.downgrade();
    let prefix = prefix.to_string();

    client
        .create(&node, message, CreateMode::PersistentSequential)
        .on_complete(move |created| match (created, watcher.upgrade()) {
            (Ok(message_path), None) => {
                warn!(path = %message_path, "Client dropped before the message could be watched");
                result.set_error(CoordError::Stopped);
            }
            (Ok(message_path), Some(watcher)) => {
                debug!(path = %message_path, "Message sent, waiting for consumption");
                watch_deleted(&watcher, message_path).on_complete(move |deleted| match deleted {
                    Ok(path) => {
                        debug!(path = %path, "Message consumed");
                        result.set(completion);
                    }
                    Err(e) => {
                        warn!(error = %e, "Lost track of message before it was consumed");
                        result.set_error(e.clone());
                    }
                });
            }
            (Err(e), _) => {
                warn!(prefix = %prefix, error = %e, "Failed to send message");
                result.set_error(e.clone());
            }
        });
}

/// Encode `message` as JSON and send it.
pub fn send_json<M, V>(
    client: &CoordinationClient,
    prefix: &str,
    message: &M,
    completion: V,
) -> OperationFuture<V>
where
    M: Serialize + ?Sized,
    V: Send + Sync + 'static,
{
    match serde_json::to_vec(message) {
        Ok(payload) => send_message(client, prefix, payload, completion),
        Err(e) => OperationFuture::failed(prefix, CoordError::Encode(e.to_string())),
    }
}
