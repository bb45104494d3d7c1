//! Error types for the trade-guard core.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Exchange API error: {message}")]
    Api { message: String, status: Option<u16> },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid trade intent: {0}")]
    InvalidIntent(String),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classifies an error as attributable to a remote dependency.
///
/// Circuit breakers only count errors for which this returns `true`; a
/// malformed request is the caller's fault and must not open the circuit.
pub trait DependencyFailure {
    fn is_dependency_failure(&self) -> bool;
}

impl DependencyFailure for Error {
    fn is_dependency_failure(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Timeout(_) => true,
            // No status means the transport failed before a response arrived.
            Error::Api { status: None, .. } => true,
            Error::Api {
                status: Some(code), ..
            } => *code == 429 || *code >= 500,
            Error::InvalidRequest(_)
            | Error::InvalidIntent(_)
            | Error::ConfigFile(_)
            | Error::Config { .. }
            | Error::Json(_) => false,
            Error::Io(_) => true,
        }
    }
}
