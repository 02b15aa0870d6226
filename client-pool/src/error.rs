//! # Error Types
//!
//! Centralized error definitions for the client-pool crate.
//! Per-endpoint failures are [`ClientError`]; only [`PoolError`] ever
//! crosses the pool boundary.

use thiserror::Error;

/// Failure of a single backend endpoint.
///
/// The pool converts every one of these into a health-state update and a
/// rotation; callers of the pool never see them directly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Request timeout after {timeout_ms}ms to {endpoint}")]
    Timeout { timeout_ms: u64, endpoint: String },

    #[error("HTTP error {status_code} from {endpoint}")]
    HttpStatus { status_code: u16, endpoint: String },

    #[error("Transport error talking to {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("WebSocket error on {endpoint}: {reason}")]
    WebSocket { endpoint: String, reason: String },

    #[error("Connection to {endpoint} dropped")]
    Disconnected { endpoint: String },

    #[error("Client for {endpoint} is not connected")]
    NotConnected { endpoint: String },
}

impl ClientError {
    /// Endpoint the failure is attributed to.
    pub fn endpoint(&self) -> &str {
        match self {
            ClientError::Timeout { endpoint, .. }
            | ClientError::HttpStatus { endpoint, .. }
            | ClientError::Transport { endpoint, .. }
            | ClientError::InvalidResponse { endpoint, .. }
            | ClientError::WebSocket { endpoint, .. }
            | ClientError::Disconnected { endpoint }
            | ClientError::NotConnected { endpoint } => endpoint,
        }
    }
}

/// Errors surfaced by [`crate::ClientPool`].
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("no client endpoints provided")]
    NoEndpoints,

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Every attempt of the retry budget failed. Deliberately carries no
    /// per-endpoint detail.
    #[error("{operation} failed: all {attempts} attempts returned an invalid response")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
    },

    #[error("client pool has not been started")]
    NotStarted,

    #[error("client pool is already running")]
    AlreadyStarted,

    #[error("client pool is closed")]
    Closed,

    #[error("no endpoint is currently selected")]
    NoCurrentTarget,

    #[error("failed to start client for {endpoint}: {source}")]
    Start {
        endpoint: String,
        #[source]
        source: ClientError,
    },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid endpoint URL '{url}': {reason}")]
    InvalidEndpointUrl { url: String, reason: String },

    #[error("Endpoint '{url}' is configured more than once")]
    DuplicateEndpoint { url: String },

    #[error("Missing required configuration field: '{field}'")]
    MissingField { field: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("I/O error reading {path}: {msg}")]
    IoError { path: String, msg: String },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
