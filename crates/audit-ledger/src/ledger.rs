//! JSON-lines file ledger.
//!
//! Each record is one `\n`-terminated JSON object written with a single
//! `write_all` and synced before `append` returns. Appends are serialized by
//! one async mutex, so records from concurrent callers never interleave.
//! A kill mid-write can only leave an unterminated tail; it is discarded on
//! the next open, and readers skip it while the file is live.

use crate::error::AuditError;
use crate::record::AuditRecord;
use crate::storage::{AuditFilter, AuditStorage};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Append-only audit ledger backed by a JSON-lines file.
pub struct JsonlLedger {
    path: PathBuf,
    writer: Mutex<LedgerWriter>,
}

struct LedgerWriter {
    file: File,
    /// File length after the last complete record.
    len: u64,
    next_sequence: u64,
    /// Set when a failed write could not be rolled back; the ledger refuses
    /// further appends rather than writing after a torn record.
    broken: Option<String>,
}

impl JsonlLedger {
    /// Open (or create) the ledger at `path`, discarding any torn tail.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let recovered = recover(&path).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(
            path = %path.display(),
            records = recovered.records,
            last_sequence = recovered.last_sequence,
            "Opened audit ledger"
        );

        Ok(Self {
            path,
            writer: Mutex::new(LedgerWriter {
                file,
                len: recovered.len,
                next_sequence: recovered.last_sequence + 1,
                broken: None,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LedgerWriter {
    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.file.write_all(line).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }

    /// Cut the file back to the last complete record after a failed write.
    async fn roll_back(&mut self) {
        match self.file.set_len(self.len).await {
            Ok(()) => warn!(len = self.len, "Rolled back partial audit record"),
            Err(e) => {
                error!(error = %e, "Failed to roll back partial audit record, ledger disabled");
                self.broken = Some(format!(
                    "ledger could not be rolled back after a failed write: {}",
                    e
                ));
            }
        }
    }
}

#[async_trait]
impl AuditStorage for JsonlLedger {
    async fn append(&self, mut record: AuditRecord) -> Result<u64, AuditError> {
        let mut writer = self.writer.lock().await;
        if let Some(reason) = &writer.broken {
            return Err(AuditError::Unavailable(reason.clone()));
        }

        let sequence = writer.next_sequence;
        record.sequence = sequence;
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        if let Err(e) = writer.write_line(&line).await {
            writer.roll_back().await;
            return Err(e.into());
        }

        writer.len += line.len() as u64;
        writer.next_sequence += 1;
        Ok(sequence)
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        let records = read_records(&self.path).await?;
        Ok(filter.apply(records))
    }
}

/// Read every complete record from a ledger file, in append order.
///
/// Safe to call while another process is appending: an unterminated final
/// line is treated as not yet written. A missing file reads as empty.
pub async fn read_records(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>, AuditError> {
    let bytes = match tokio::fs::read(path.as_ref()).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    parse_complete_lines(&bytes)
}

fn parse_complete_lines(bytes: &[u8]) -> Result<Vec<AuditRecord>, AuditError> {
    let mut records = Vec::new();
    for (idx, chunk) in bytes.split_inclusive(|b| *b == b'\n').enumerate() {
        let Some(line) = chunk.strip_suffix(b"\n") else {
            // Torn or in-flight tail
            break;
        };
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_slice(line).map_err(|e| AuditError::Corrupt {
            line: idx + 1,
            message: e.to_string(),
        })?;
        records.push(record);
    }
    Ok(records)
}

struct Recovered {
    len: u64,
    records: usize,
    last_sequence: u64,
}

async fn recover(path: &Path) -> Result<Recovered, AuditError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok(Recovered {
                len: 0,
                records: 0,
                last_sequence: 0,
            })
        }
        Err(e) => return Err(e.into()),
    };

    let complete_len = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);

    if complete_len < bytes.len() {
        warn!(
            path = %path.display(),
            discarded_bytes = bytes.len() - complete_len,
            "Truncating torn audit record left by an interrupted write"
        );
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(complete_len as u64).await?;
        file.sync_all().await?;
    }

    let records = parse_complete_lines(&bytes[..complete_len])?;
    Ok(Recovered {
        len: complete_len as u64,
        records: records.len(),
        last_sequence: records.last().map(|r| r.sequence).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::AuditEventKind;
    use std::sync::Arc;

    fn temp_ledger_path() -> PathBuf {
        std::env::temp_dir().join(format!("audit-ledger-{}.jsonl", uuid::Uuid::new_v4()))
    }

    fn approved(symbol: &str) -> AuditRecord {
        AuditRecord::builder(AuditEventKind::TradeApproved)
            .field("symbol", symbol)
            .field("reason", "OK")
            .build()
    }

    #[tokio::test]
    async fn test_append_then_read_in_order() {
        let path = temp_ledger_path();
        let ledger = JsonlLedger::open(&path).await.unwrap();

        assert_eq!(ledger.append(approved("BTC-USDT")).await.unwrap(), 1);
        assert_eq!(ledger.append(approved("ETH-USDT")).await.unwrap(), 2);

        let records = read_records(&path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].field_str("symbol"), Some("BTC-USDT"));
        assert_eq!(records[1].sequence, 2);

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.ends_with('\n'));

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn test_reopen_continues_sequence() {
        let path = temp_ledger_path();
        {
            let ledger = JsonlLedger::open(&path).await.unwrap();
            tokio_test::assert_ok!(ledger.append(approved("BTC-USDT")).await);
            tokio_test::assert_ok!(ledger.append(approved("ETH-USDT")).await);
        }

        let ledger = JsonlLedger::open(&path).await.unwrap();
        assert_eq!(ledger.append(approved("SOL-USDT")).await.unwrap(), 3);

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn test_open_discards_torn_tail() {
        let path = temp_ledger_path();
        {
            let ledger = JsonlLedger::open(&path).await.unwrap();
            ledger.append(approved("BTC-USDT")).await.unwrap();
            ledger.append(approved("ETH-USDT")).await.unwrap();
        }

        // Simulate a process killed halfway through the third record.
        let mut file = OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(br#"{"sequence":3,"timestamp":"2024-01-0"#)
            .await
            .unwrap();
        file.sync_all().await.unwrap();
        drop(file);

        // Readers never see the torn line, even before recovery.
        assert_eq!(read_records(&path).await.unwrap().len(), 2);

        let ledger = JsonlLedger::open(&path).await.unwrap();
        assert_eq!(ledger.append(approved("SOL-USDT")).await.unwrap(), 3);

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        for line in content.lines() {
            assert!(serde_json::from_str::<AuditRecord>(line).is_ok(), "unparseable line: {}", line);
        }
        let records = read_records(&path).await.unwrap();
        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn test_open_rejects_corrupt_complete_line() {
        let path = temp_ledger_path();
        tokio::fs::write(&path, b"not json at all\n").await.unwrap();

        let result = JsonlLedger::open(&path).await;
        assert!(matches!(result, Err(AuditError::Corrupt { line: 1, .. })));

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn test_concurrent_appends_never_interleave() {
        let path = temp_ledger_path();
        let ledger = Arc::new(JsonlLedger::open(&path).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..50 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .append(approved(&format!("SYM-{}", i)))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 50);
        let records = read_records(&path).await.unwrap();
        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, (1..=50).collect::<Vec<u64>>());

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn test_query_filters_file_records() {
        let path = temp_ledger_path();
        let ledger = JsonlLedger::open(&path).await.unwrap();
        ledger.append(approved("BTC-USDT")).await.unwrap();
        ledger
            .append(
                AuditRecord::builder(AuditEventKind::TradeRejected)
                    .field("symbol", "BTC-USDT")
                    .build(),
            )
            .await
            .unwrap();

        let rejected = ledger
            .query(&AuditFilter::new().kind(AuditEventKind::TradeRejected))
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].sequence, 2);

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn test_read_missing_file_is_empty() {
        let records = read_records(temp_ledger_path()).await.unwrap();
        assert!(records.is_empty());
    }
}
