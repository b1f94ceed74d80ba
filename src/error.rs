//! Error types for the Hardware State Manager

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Hardware State Manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Endpoint Fetch Errors
    // =========================================================================
    /// Endpoint unreachable, connection refused, TLS failure, non-2xx status
    #[error("Transport error fetching {path}: {reason}")]
    Transport { path: String, reason: String },

    /// Fetch did not complete within its deadline
    #[error("Fetch of {path} timed out after {after:?}")]
    Timeout { path: String, after: Duration },

    /// Endpoint answered with a payload we could not decode
    #[error("Failed to decode {path}: {reason}")]
    Decode { path: String, reason: String },

    /// Resource legitimately does not exist on the endpoint
    #[error("Resource absent: {path}")]
    AbsentResource { path: String },

    // =========================================================================
    // Inventory Store Errors
    // =========================================================================
    /// A write for this endpoint collided with a newer committed run
    #[error("Store conflict for endpoint {endpoint}: {reason}")]
    StoreConflict { endpoint: String, reason: String },

    /// Update carried a component owned by a different endpoint
    #[error("Component {component} belongs to endpoint {owner}, not {endpoint}")]
    ForeignComponent {
        endpoint: String,
        component: String,
        owner: String,
    },

    /// Read path could not obtain a consistent snapshot in time
    #[error("Inventory store busy, gave up after {waited:?}")]
    StoreBusy { waited: Duration },

    /// Backend failure (database, serialization of stored rows)
    #[error("Inventory store error: {0}")]
    Store(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Malformed endpoint address, credentials, or process configuration
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Scheduling Errors
    // =========================================================================
    /// A discovery run for this endpoint is already in flight
    #[error("Discovery already in progress for endpoint: {endpoint}")]
    DiscoveryInProgress { endpoint: String },

    /// Run was cancelled before it could commit
    #[error("Discovery cancelled for endpoint: {endpoint}")]
    Cancelled { endpoint: String },

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Topology (SLS) service error
    #[error("Topology service error: {0}")]
    Topology(String),

    /// Heartbeat (HBTD) service error
    #[error("Heartbeat service error: {0}")]
    Heartbeat(String),

    // =========================================================================
    // Plumbing
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error outside of endpoint payload decoding
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Device unreachable (including timeouts), as opposed to device returned garbage
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Timeout { .. })
    }

    /// Device answered but the payload was unusable
    pub fn is_decode(&self) -> bool {
        matches!(self, Error::Decode { .. })
    }

    /// Resource not present; callers treat this as "no members", not a failure
    pub fn is_absent(&self) -> bool {
        matches!(self, Error::AbsentResource { .. })
    }

    pub(crate) fn decode(path: impl Into<String>, reason: impl ToString) -> Self {
        Error::Decode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn transport(path: impl Into<String>, reason: impl ToString) -> Self {
        Error::Transport {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(e.to_string())
    }
}
