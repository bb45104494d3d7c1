//! Audit Ledger
//!
//! Append-only record of every risk decision and kill-switch transition.
//! Records are newline-delimited JSON so ops tooling can tail the file while
//! it is being written.

pub mod error;
pub mod ledger;
pub mod record;
pub mod storage;

pub use error::AuditError;
pub use ledger::{read_records, JsonlLedger};
pub use record::{AuditEventKind, AuditRecord, AuditRecordBuilder};
pub use storage::{AuditFilter, AuditStorage, MemoryAuditStorage};
