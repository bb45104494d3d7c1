//! Error types for the audit ledger.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt audit record at line {line}: {message}")]
    Corrupt { line: usize, message: String },

    #[error("Audit storage unavailable: {0}")]
    Unavailable(String),
}
