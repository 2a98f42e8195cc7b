#![forbid(unsafe_code)]
//! Row sources feeding the cross-table presence check.

use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{CheckError, Result, RowId, TxId};

/// One live row of the backing table, as the index would see it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeapRow {
    /// Physical row location, stored as the leaf value.
    pub row: RowId,
    /// Encoded index key for the row.
    pub key: Vec<u8>,
    /// Transaction that created the row.
    pub created_by: TxId,
}

/// Full-table scan collaborator.
pub trait TableScanner: Send + Sync {
    /// Table name used in corruption messages.
    fn name(&self) -> &str;
    /// Estimate of the number of rows; sizes the fingerprint filter.
    fn estimated_rows(&self) -> u64;
    /// Oldest transaction that may still be running. Every row created by an
    /// earlier transaction has committed or aborted.
    fn snapshot_horizon(&self) -> TxId;
    /// Calls `visit` for every live row. Stops at the first error.
    fn scan(&self, visit: &mut dyn FnMut(HeapRow) -> Result<()>) -> Result<()>;
}

/// In-memory table.
#[derive(Debug)]
pub struct MemTable {
    name: String,
    inner: RwLock<MemTableInner>,
}

#[derive(Debug, Default)]
struct MemTableInner {
    rows: Vec<HeapRow>,
    horizon: Option<TxId>,
}

impl MemTable {
    /// Creates an empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(MemTableInner::default()),
        }
    }

    /// Appends a row.
    pub fn insert(&self, row: RowId, key: impl Into<Vec<u8>>, created_by: TxId) {
        self.inner.write().rows.push(HeapRow {
            row,
            key: key.into(),
            created_by,
        });
    }

    /// Pins the horizon instead of deriving it from the rows.
    pub fn set_horizon(&self, horizon: TxId) {
        self.inner.write().horizon = Some(horizon);
    }

    /// Copies of every row, in insertion order.
    pub fn rows(&self) -> Vec<HeapRow> {
        self.inner.read().rows.clone()
    }
}

impl TableScanner for MemTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn estimated_rows(&self) -> u64 {
        self.inner.read().rows.len() as u64
    }

    fn snapshot_horizon(&self) -> TxId {
        let inner = self.inner.read();
        inner
            .horizon
            .unwrap_or_else(|| horizon_after(inner.rows.iter().map(|r| r.created_by)))
    }

    fn scan(&self, visit: &mut dyn FnMut(HeapRow) -> Result<()>) -> Result<()> {
        // Copy out first so callbacks never run under the table lock.
        let rows = self.rows();
        for row in rows {
            visit(row)?;
        }
        Ok(())
    }
}

/// One past the newest creator, so every listed row precedes the horizon.
fn horizon_after(creators: impl IntoIterator<Item = TxId>) -> TxId {
    creators
        .into_iter()
        .map(|tx| tx.0.saturating_add(1))
        .max()
        .map(TxId)
        .unwrap_or(TxId(1))
}

#[derive(Debug, Serialize, Deserialize)]
struct CsvRecord {
    key: String,
    block: u32,
    offset: u16,
    xmin: u64,
}

/// Table exported as CSV with columns `key,block,offset,xmin`, keys in hex.
#[derive(Debug)]
pub struct CsvTable {
    name: String,
    path: PathBuf,
    rows: u64,
    horizon: TxId,
}

impl CsvTable {
    /// Opens and validates a table file. The table is named after the file stem.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut rows = 0u64;
        let mut newest: Option<TxId> = None;
        read_rows(&path, &mut |row| {
            rows += 1;
            newest = newest.max(Some(row.created_by));
            Ok(())
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "table".to_owned());
        debug!(
            target: "idxcheck::heap",
            table = %name,
            rows,
            "opened csv table"
        );
        Ok(Self {
            name,
            horizon: horizon_after(newest),
            rows,
            path,
        })
    }

    /// Overrides the horizon derived from the file.
    pub fn with_horizon(mut self, horizon: TxId) -> Self {
        self.horizon = horizon;
        self
    }

    /// Writes `rows` in the format [`CsvTable::open`] reads.
    pub fn write(path: impl AsRef<Path>, rows: &[HeapRow]) -> Result<()> {
        let mut writer = csv::Writer::from_path(path.as_ref()).map_err(csv_error)?;
        for row in rows {
            writer
                .serialize(CsvRecord {
                    key: hex::encode(&row.key),
                    block: row.row.block,
                    offset: row.row.offset,
                    xmin: row.created_by.0,
                })
                .map_err(csv_error)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl TableScanner for CsvTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn estimated_rows(&self) -> u64 {
        self.rows
    }

    fn snapshot_horizon(&self) -> TxId {
        self.horizon
    }

    fn scan(&self, visit: &mut dyn FnMut(HeapRow) -> Result<()>) -> Result<()> {
        read_rows(&self.path, visit)
    }
}

fn read_rows(path: &Path, visit: &mut dyn FnMut(HeapRow) -> Result<()>) -> Result<()> {
    let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
    for record in reader.deserialize::<CsvRecord>() {
        let record = record.map_err(csv_error)?;
        let key = hex::decode(record.key.trim())
            .map_err(|_| CheckError::Invalid("table key column is not hex"))?;
        if key.is_empty() {
            return Err(CheckError::Invalid("table key column is empty"));
        }
        visit(HeapRow {
            row: RowId::new(record.block, record.offset),
            key,
            created_by: TxId(record.xmin),
        })?;
    }
    Ok(())
}

fn csv_error(err: csv::Error) -> CheckError {
    CheckError::Io(io::Error::from(err))
}
