//! Error taxonomy for the discovery daemon.
//!
//! Nothing below the reconciler recovers from an error except tag parsing
//! (the instance is dropped) and version conflicts (the cycle is retried).
//! Everything else bubbles up to the daemon loop, which applies backoff.

use thiserror::Error;

/// Top-level error for a discovery + reconciliation cycle.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Dataplane(#[from] DataplaneError),

    /// Shutdown was observed mid-cycle. The in-flight transaction has been
    /// deleted; nothing was committed.
    #[error("cycle cancelled by shutdown")]
    Cancelled,
}

impl Error {
    /// Whether this wraps the retryable Dataplane 409.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::Dataplane(err) if err.is_version_conflict())
    }
}

/// Cloud provider discovery failures.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("AWS API error: {0}")]
    Aws(String),

    #[error("Azure API error: {0}")]
    Azure(String),

    #[error("credential error: {0}")]
    Credentials(String),
}

/// HAProxy Dataplane API failures.
#[derive(Debug, Error)]
pub enum DataplaneError {
    /// Transport-level failure (connect, timeout, TLS, body decode).
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-409 HTTP error response.
    #[error("HTTP {status} on {method} {path}: {body}")]
    Api {
        status: u16,
        method: String,
        path: String,
        body: String,
    },

    /// HTTP 409: the configuration version moved between read and commit.
    #[error("configuration version conflict")]
    VersionConflict { body: String },

    /// Response body did not match the expected shape.
    #[error("unexpected response on {path}: {reason}")]
    Decode { path: String, reason: String },
}

impl DataplaneError {
    /// Whether this error is the retryable 409 version conflict.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}
