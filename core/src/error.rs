//! Error taxonomy shared by every layer.
//!
//! Each layer returns `Result<T>` and nothing is swallowed. The orchestrator
//! turns these into a human-readable reason when a session enters `Error`.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HpcError {
    /// Authentication or network failure reaching the login host. Fatal.
    #[error("Connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    /// A remote command exited non-zero.
    #[error("Remote command exited with status {exit_code}: {stderr}")]
    Command { exit_code: i32, stderr: String },

    #[error("Job submission failed: {0}")]
    Submission(String),

    /// The job is unknown to both the live queue and the accounting record.
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Config error: {0}")]
    Config(String),

    /// The inference server answered with an `{error}` body.
    #[error("Inference error: {0}")]
    Inference(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HpcError {
    pub fn connection(host: &str, reason: impl Into<String>) -> Self {
        HpcError::Connection {
            host: host.to_string(),
            reason: reason.into(),
        }
    }

    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        HpcError::Timeout {
            what: what.into(),
            after,
        }
    }
}

pub type Result<T> = std::result::Result<T, HpcError>;
