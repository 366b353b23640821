//! Error types for the endpoint client core.

use std::path::PathBuf;
use std::time::Duration;

/// Errors surfaced by the protocol transport.
///
/// These are recoverable from the session's point of view: connect errors
/// are retried with backoff on the next control-loop tick, and read errors
/// are recorded on the action that caused them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The endpoint rejected or never answered the connection attempt.
    #[error("connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// The connection attempt exceeded its backoff-scaled timeout.
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    /// The addressed node does not exist on the server.
    #[error("node {node_id} not found")]
    NodeNotFound { node_id: String },

    /// A read against a live connection failed.
    #[error("read of {node_id} failed: {reason}")]
    ReadFailed { node_id: String, reason: String },

    /// The handle refers to a connection the stack no longer tracks.
    #[error("connection handle is no longer valid")]
    StaleHandle,
}

/// Errors raised while loading the configuration file.
///
/// These are fatal at startup: the process aborts before any session runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("cannot read config file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file was read but is not valid configuration.
    #[error("malformed config file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}
