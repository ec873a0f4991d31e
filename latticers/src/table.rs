//! Columnar result tables.

use serde_json::Value;

use crate::error::{LatticeError, Result};
use crate::store::Field;

/// Ordered list of (field, column) pairs. All columns share the same length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<(Field, Vec<Value>)>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_columns(columns: Vec<(Field, Vec<Value>)>) -> Result<Self> {
        if let Some(((_, first), mismatched)) = columns.split_first().and_then(|(head, rest)| {
            rest.iter()
                .find(|(_, col)| col.len() != head.1.len())
                .map(|m| (head, m))
        }) {
            return Err(LatticeError::Execution(format!(
                "column {} has {} rows, expected {}",
                mismatched.0.name,
                mismatched.1.len(),
                first.len()
            )));
        }
        Ok(Self { columns })
    }

    pub fn count(&self) -> usize {
        self.columns.first().map_or(0, |(_, col)| col.len())
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn headers(&self) -> Vec<&Field> {
        self.columns.iter().map(|(f, _)| f).collect()
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.columns.iter().map(|(f, _)| f)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|(f, _)| f.name == name)
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn column(&self, name: &str) -> Option<&Vec<Value>> {
        self.columns
            .iter()
            .find(|(f, _)| f.name == name)
            .map(|(_, col)| col)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Vec<Value>> {
        self.columns
            .iter_mut()
            .find(|(f, _)| f.name == name)
            .map(|(_, col)| col)
    }

    /// Appends a column; replaces an existing column of the same name.
    pub fn add_column(&mut self, field: Field, values: Vec<Value>) -> Result<()> {
        if !self.columns.is_empty() && values.len() != self.count() {
            return Err(LatticeError::Execution(format!(
                "column {} has {} rows, table has {}",
                field.name,
                values.len(),
                self.count()
            )));
        }
        if let Some(existing) = self.column_mut(&field.name) {
            *existing = values;
        } else {
            self.columns.push((field, values));
        }
        Ok(())
    }

    pub fn remove_column(&mut self, name: &str) -> Option<(Field, Vec<Value>)> {
        let idx = self.index_of(name)?;
        Some(self.columns.remove(idx))
    }

    pub fn row(&self, index: usize) -> Vec<Value> {
        self.columns
            .iter()
            .map(|(_, col)| col[index].clone())
            .collect()
    }

    pub fn rows(&self) -> impl Iterator<Item = Vec<Value>> + '_ {
        (0..self.count()).map(|i| self.row(i))
    }

    /// Reorders rows according to `permutation` (new row i takes old row
    /// permutation[i]).
    pub fn permute_rows(&mut self, permutation: &[usize]) {
        for (_, col) in &mut self.columns {
            let reordered = permutation.iter().map(|&i| col[i].clone()).collect();
            *col = reordered;
        }
    }

    pub fn truncate(&mut self, rows: usize) {
        for (_, col) in &mut self.columns {
            col.truncate(rows);
        }
    }

    /// Keeps only the named columns, in the given order. Unknown names error.
    pub fn select(&self, names: &[String]) -> Result<Table> {
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let pair = self
                .columns
                .iter()
                .find(|(f, _)| &f.name == name)
                .cloned()
                .ok_or_else(|| {
                    LatticeError::Execution(format!("column {name} absent from result"))
                })?;
            columns.push(pair);
        }
        Ok(Table { columns })
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.columns.iter().map(|(h, _)| h.name.as_str()).collect();
        writeln!(f, "{}", names.join(" | "))?;
        for row in self.rows() {
            let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            writeln!(f, "{}", cells.join(" | "))?;
        }
        Ok(())
    }
}

/// User-facing result: the shaped table plus which columns are grouping
/// dimensions and which are measures.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnarTable {
    pub table: Table,
    pub grouping_columns: Vec<String>,
    pub measure_columns: Vec<String>,
}

impl ColumnarTable {
    pub fn count(&self) -> usize {
        self.table.count()
    }
}

/// Result of a pivot query: the flat shaped table plus the pivoted view.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotTable {
    pub table: Table,
    pub pivoted: Table,
    pub rows: Vec<String>,
    pub columns: Vec<String>,
    pub values: Vec<String>,
    pub hidden_totals: Vec<String>,
}
