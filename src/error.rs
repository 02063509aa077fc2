//! Error types for the coordination client
//!
//! The store reports failures as raw [`StoreCode`]s. They are turned into
//! [`CoordError`]s by [`classify`] at the moment an operation's callback fires,
//! so every failed handle carries a classified cause.

use serde::{Deserialize, Serialize};

/// Raw response codes reported by the coordination store.
///
/// The numeric values follow the store's wire protocol; success (`0`) has no
/// variant because successful responses carry a value instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreCode {
    SystemError,
    RuntimeInconsistency,
    DataInconsistency,
    ConnectionLoss,
    MarshallingError,
    Unimplemented,
    OperationTimeout,
    BadArguments,
    ApiError,
    NoNode,
    NoAuth,
    BadVersion,
    NoChildrenForEphemerals,
    NodeExists,
    NotEmpty,
    SessionExpired,
    InvalidCallback,
    InvalidAcl,
    AuthFailed,
    SessionMoved,
    /// A code this client does not know about
    Unknown(i32),
}

impl StoreCode {
    /// Decode a wire code. Returns `None` for `0` (success).
    pub fn from_raw(raw: i32) -> Option<Self> {
        let code = match raw {
            0 => return None,
            -1 => Self::SystemError,
            -2 => Self::RuntimeInconsistency,
            -3 => Self::DataInconsistency,
            -4 => Self::ConnectionLoss,
            -5 => Self::MarshallingError,
            -6 => Self::Unimplemented,
            -7 => Self::OperationTimeout,
            -8 => Self::BadArguments,
            -100 => Self::ApiError,
            -101 => Self::NoNode,
            -102 => Self::NoAuth,
            -103 => Self::BadVersion,
            -108 => Self::NoChildrenForEphemerals,
            -110 => Self::NodeExists,
            -111 => Self::NotEmpty,
            -112 => Self::SessionExpired,
            -113 => Self::InvalidCallback,
            -114 => Self::InvalidAcl,
            -115 => Self::AuthFailed,
            -118 => Self::SessionMoved,
            other => Self::Unknown(other),
        };
        Some(code)
    }

    /// Encode back to the wire value.
    pub fn as_raw(self) -> i32 {
        match self {
            Self::SystemError => -1,
            Self::RuntimeInconsistency => -2,
            Self::DataInconsistency => -3,
            Self::ConnectionLoss => -4,
            Self::MarshallingError => -5,
            Self::Unimplemented => -6,
            Self::OperationTimeout => -7,
            Self::BadArguments => -8,
            Self::ApiError => -100,
            Self::NoNode => -101,
            Self::NoAuth => -102,
            Self::BadVersion => -103,
            Self::NoChildrenForEphemerals => -108,
            Self::NodeExists => -110,
            Self::NotEmpty => -111,
            Self::SessionExpired => -112,
            Self::InvalidCallback => -113,
            Self::InvalidAcl => -114,
            Self::AuthFailed => -115,
            Self::SessionMoved => -118,
            Self::Unknown(raw) => raw,
        }
    }
}

/// Errors surfaced by the coordination client and the protocols built on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordError {
    #[error("Not connected to the coordination store")]
    NotConnected,

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node already exists: {0}")]
    NodeAlreadyExists(String),

    #[error("Version conflict on {0}")]
    VersionConflict(String),

    /// Transient; the outcome of the operation is unknown
    #[error("Connection lost during operation on {0}")]
    ConnectionLoss(String),

    #[error("Session expired during operation on {0}")]
    SessionExpired(String),

    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Coordination client stopped")]
    Stopped,

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Message encoding failed: {0}")]
    Encode(String),

    #[error("Store error {code:?} on {path}")]
    Unclassified { code: StoreCode, path: String },
}

impl CoordError {
    pub(crate) fn invalid_path(path: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Path the failed operation targeted, when there is one.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::NodeNotFound(path)
            | Self::NodeAlreadyExists(path)
            | Self::VersionConflict(path)
            | Self::ConnectionLoss(path)
            | Self::SessionExpired(path)
            | Self::InvalidPath { path, .. }
            | Self::Unclassified { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Whether the failure came from losing the session rather than from the
    /// operation itself.
    pub fn is_session_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLoss(_) | Self::SessionExpired(_) | Self::NotConnected | Self::Stopped
        )
    }
}

/// Map a store response code onto the client's error kinds.
pub fn classify(code: StoreCode, path: &str) -> CoordError {
    let path = path.to_string();
    match code {
        StoreCode::NoNode => CoordError::NodeNotFound(path),
        StoreCode::NodeExists => CoordError::NodeAlreadyExists(path),
        StoreCode::BadVersion => CoordError::VersionConflict(path),
        StoreCode::ConnectionLoss | StoreCode::OperationTimeout => CoordError::ConnectionLoss(path),
        StoreCode::SessionExpired => CoordError::SessionExpired(path),
        code => CoordError::Unclassified { code, path },
    }
}
