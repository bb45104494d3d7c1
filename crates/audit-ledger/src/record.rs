//! Audit record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Types of auditable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventKind {
    TradeApproved,
    TradeRejected,
    KillSwitchActivated,
    KillSwitchDeactivated,
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditEventKind::TradeApproved => "TRADE_APPROVED",
            AuditEventKind::TradeRejected => "TRADE_REJECTED",
            AuditEventKind::KillSwitchActivated => "KILL_SWITCH_ACTIVATED",
            AuditEventKind::KillSwitchDeactivated => "KILL_SWITCH_DEACTIVATED",
        };
        f.write_str(name)
    }
}

/// One immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position in the ledger, assigned by the storage on append (1-based).
    pub sequence: u64,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    pub event_kind: AuditEventKind,
    /// Flat key/value fields. Values are scalars; decimals are stored as
    /// strings so no precision is lost.
    pub payload: BTreeMap<String, Value>,
}

impl AuditRecord {
    /// Create a new audit record builder.
    pub fn builder(event_kind: AuditEventKind) -> AuditRecordBuilder {
        AuditRecordBuilder {
            event_kind,
            timestamp: None,
            payload: BTreeMap::new(),
        }
    }

    /// String value of a payload field, if present.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Builder for audit records.
pub struct AuditRecordBuilder {
    event_kind: AuditEventKind,
    timestamp: Option<DateTime<Utc>>,
    payload: BTreeMap<String, Value>,
}

impl AuditRecordBuilder {
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Add a scalar field. Nested objects and arrays are flattened to their
    /// JSON text so the payload stays one level deep.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = match value.into() {
            nested @ (Value::Array(_) | Value::Object(_)) => Value::String(nested.to_string()),
            scalar => scalar,
        };
        self.payload.insert(key.into(), value);
        self
    }

    pub fn build(self) -> AuditRecord {
        AuditRecord {
            sequence: 0, // Set by storage
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            event_kind: self.event_kind,
            payload: self.payload,
        }
    }
}
