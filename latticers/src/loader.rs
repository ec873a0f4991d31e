//! Data loading.
//!
//! Freshly created in-memory tables are eventually consistent on some
//! backends: the first inserts after a create can fail transiently. The
//! loader owns that retry loop; the read path never retries.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{LatticeError, Result};
use crate::store::{FieldType, Store};

/// Row sink a concrete backend implements.
#[async_trait]
pub trait TableSink: Send + Sync {
    async fn create_table(&self, store: &Store) -> Result<()>;
    async fn drop_table(&self, name: &str) -> Result<()>;
    async fn insert_rows(&self, store: &Store, rows: &[Vec<Value>]) -> Result<()>;
}

const BACKOFF_SECONDS: [u64; 5] = [1, 2, 4, 8, 16];

pub struct DataLoader<S> {
    sink: S,
    backoff: Vec<Duration>,
}

impl<S: TableSink> DataLoader<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            backoff: BACKOFF_SECONDS.iter().map(|s| Duration::from_secs(*s)).collect(),
        }
    }

    /// Overrides the retry schedule. Tests shrink it to milliseconds.
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Idempotent create: an "already exists" conflict deletes the existing
    /// table and recreates it.
    pub async fn drop_and_create_in_memory_table(&self, store: &Store) -> Result<()> {
        match self.sink.create_table(store).await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("already exists") => {
                tracing::debug!(table = %store.name, "table exists, recreating");
                self.sink.drop_table(&store.name).await?;
                self.sink.create_table(store).await
            }
            Err(e) => Err(e),
        }
    }

    /// Inserts tuples, retrying transient failures with exponential backoff
    /// and failing with the last backend error once the schedule runs out.
    pub async fn load(&self, store: &Store, rows: Vec<Vec<Value>>) -> Result<()> {
        let rows = serialize_rows(store, rows)?;
        let mut attempt = 0;
        loop {
            match self.sink.insert_rows(store, &rows).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.backoff.len() => {
                    let delay = self.backoff[attempt];
                    attempt += 1;
                    tracing::warn!(
                        table = %store.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient load failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn load_csv(&self, _store: &Store, _path: &str) -> Result<()> {
        Err(LatticeError::Unsupported(
            "csv loading is not supported by this loader".to_string(),
        ))
    }
}

/// Normalizes cells for the wire: temporal values must already be ISO-8601
/// strings; opaque cells are JSON-serialized.
fn serialize_rows(store: &Store, rows: Vec<Vec<Value>>) -> Result<Vec<Vec<Value>>> {
    let mut out = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
        if row.len() != store.fields.len() {
            return Err(LatticeError::Validation(format!(
                "row {index} has {} cells, store {} has {} fields",
                row.len(),
                store.name,
                store.fields.len()
            )));
        }
        let mut cells = Vec::with_capacity(row.len());
        for (field, cell) in store.fields.iter().zip(row) {
            cells.push(serialize_cell(field.field_type, cell, &field.name)?);
        }
        out.push(cells);
    }
    Ok(out)
}

fn serialize_cell(field_type: FieldType, cell: Value, field: &str) -> Result<Value> {
    if cell.is_null() {
        return Ok(cell);
    }
    match field_type {
        FieldType::Object => {
            if cell.is_string() {
                Ok(cell)
            } else {
                Ok(Value::String(serde_json::to_string(&cell)?))
            }
        }
        FieldType::Date | FieldType::DateTime => {
            if cell.is_string() {
                Ok(cell)
            } else {
                Err(LatticeError::Validation(format!(
                    "temporal field {field} expects an ISO-8601 string, got {cell}"
                )))
            }
        }
        _ => Ok(cell),
    }
}
