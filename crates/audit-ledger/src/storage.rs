//! Storage seam for audit records.

use crate::error::AuditError;
use crate::record::{AuditEventKind, AuditRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Storage backend for audit records.
///
/// Implementations must serialize appends, keep records in append order, and
/// offer no way to edit or remove a record once written.
#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Durably append a record. Returns the sequence number assigned to it.
    async fn append(&self, record: AuditRecord) -> Result<u64, AuditError>;

    /// Query records in append order.
    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError>;

    /// Count records matching filter.
    async fn count(&self, filter: &AuditFilter) -> Result<u64, AuditError> {
        let records = self.query(filter).await?;
        Ok(records.len() as u64)
    }
}

/// Filter for querying audit records.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_kind: Option<AuditEventKind>,
    pub symbol: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, event_kind: AuditEventKind) -> Self {
        self.event_kind = Some(event_kind);
        self
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn time_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(kind) = self.event_kind {
            if record.event_kind != kind {
                return false;
            }
        }
        if let Some(ref symbol) = self.symbol {
            if record.field_str("symbol") != Some(symbol.as_str()) {
                return false;
            }
        }
        if let Some(from) = self.from {
            if record.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if record.timestamp > to {
                return false;
            }
        }
        true
    }

    /// Apply the filter, offset, and limit to records already in append order.
    pub fn apply<I>(&self, records: I) -> Vec<AuditRecord>
    where
        I: IntoIterator<Item = AuditRecord>,
    {
        records
            .into_iter()
            .filter(|r| self.matches(r))
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// In-memory audit storage for testing.
///
/// `set_failing(true)` makes every append fail, which lets callers exercise
/// their durability-failure paths.
pub struct MemoryAuditStorage {
    records: RwLock<Vec<AuditRecord>>,
    failing: AtomicBool,
}

impl MemoryAuditStorage {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Snapshot of every stored record.
    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl Default for MemoryAuditStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStorage for MemoryAuditStorage {
    async fn append(&self, mut record: AuditRecord) -> Result<u64, AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable(
                "in-memory storage set to fail".to_string(),
            ));
        }

        let mut records = self.records.write().await;
        let sequence = records.len() as u64 + 1;
        record.sequence = sequence;
        records.push(record);

        Ok(sequence)
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        let records = self.records.read().await;
        Ok(filter.apply(records.iter().cloned()))
    }
}
