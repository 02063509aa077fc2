//! elohim-coord: coordination-store session client for Elohim cluster orchestration
//!
//! Launching and supervising application processes across a cluster needs a
//! shared, strongly consistent view of who is running where. This crate is the
//! client side of that view:
//!
//! - [`CoordinationClient`] keeps one session alive against a hierarchical
//!   coordination store, recovers from session expiry and exposes node
//!   operations that return [`OperationFuture`] handles
//! - [`EventExecutor`] serialises every callback in store emission order
//! - [`operations::watch_deleted`] resolves when a node goes away
//! - [`messages`] delivers one-shot commands as sequential nodes and reports
//!   when the consumer has taken them
//!
//! The store itself is abstracted behind [`store::StoreConnector`]; the
//! embedder supplies the connector for its store deployment.
//!
//! ```no_run
//! use elohim_coord::store::StoreConnector;
//! use elohim_coord::{messages, CoordinationClient};
//!
//! # async fn run(connector: impl StoreConnector + 'static) -> Result<(), elohim_coord::CoordError> {
//! let client = CoordinationClient::builder(connector).build();
//! client.start().await?;
//!
//! let ack = messages::send_message(&client, "/apps/app1/messages", "stop", "ack-1");
//! // ... the application deletes the message node once handled ...
//! assert_eq!(ack.await?, "ack-1");
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod future;
pub mod launcher;
pub mod logging;
pub mod messages;
pub mod operations;
pub mod path;
pub mod store;

pub use client::{
    ConnectionState, CoordinationClient, CoordinationClientBuilder, WeakCoordinationClient,
};
pub use config::{ClientConfig, Config, LoggingConfig};
pub use error::{classify, CoordError, StoreCode};
pub use executor::EventExecutor;
pub use future::{OperationFuture, OperationResult, SettableOperationFuture};
pub use store::{CreateMode, EventType, SessionState, Stat, WatchedEvent};
