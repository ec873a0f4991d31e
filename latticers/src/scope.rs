//! Grouping scopes.
//!
//! A scope is the grouping context a measure is evaluated in: table, grouping
//! columns, rollups, grouping sets, filters and limit. Scopes are structural
//! keys; two scopes are interchangeable iff every component is equal.

use serde::{Deserialize, Serialize};

use crate::criteria::{Criteria, Literal};
use crate::store::Field;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinKey {
    pub left: String,
    pub right: String,
}

/// A join on another store (or virtual table). Part of scope identity: the
/// same grouping columns joined differently are a different scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Join {
    pub table: String,
    pub join_type: JoinType,
    pub keys: Vec<JoinKey>,
}

/// An inline table shipped with the query. Rows are literal cells so the
/// definition itself participates in scope equality and cache keys; the
/// backend materializes it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualTable {
    pub name: String,
    pub fields: Vec<Field>,
    pub rows: Vec<Vec<Literal>>,
}

impl VirtualTable {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Reference-position transformation carried by a shifted scope.
///
/// A period-over-period comparison fetches its lagged operand from a scope
/// whose grouping columns are identical to the base scope's but whose period
/// column is shifted by `offset` at aggregation time. Carrying the shift as a
/// scope component keeps the shifted scope a distinct plan node even though
/// the column lists match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeriodShift {
    pub field: String,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryScope {
    pub table: String,
    pub joins: Vec<Join>,
    pub columns: Vec<Field>,
    pub rollup_columns: Vec<Field>,
    pub grouping_sets: Vec<Vec<Field>>,
    pub criteria: Option<Criteria>,
    pub limit: i64,
    pub virtual_tables: Vec<VirtualTable>,
    pub period_shift: Option<PeriodShift>,
}

impl QueryScope {
    pub fn new(table: impl Into<String>, columns: Vec<Field>) -> Self {
        Self {
            table: table.into(),
            joins: Vec::new(),
            columns,
            rollup_columns: Vec::new(),
            grouping_sets: Vec::new(),
            criteria: None,
            limit: crate::config::default_query_limit(),
            virtual_tables: Vec::new(),
            period_shift: None,
        }
    }

    /// Identical scope except for the limit.
    pub fn copy_with_new_limit(&self, limit: i64) -> Self {
        Self {
            limit,
            ..self.clone()
        }
    }

    pub fn column(&self, name: &str) -> Option<&Field> {
        self.columns.iter().find(|f| f.name == name)
    }

    pub fn has_rollup(&self) -> bool {
        !self.rollup_columns.is_empty() || !self.grouping_sets.is_empty()
    }

    /// Columns whose nulls may denote super-aggregate rows.
    pub fn rolled_up_columns(&self) -> Vec<&Field> {
        if !self.grouping_sets.is_empty() {
            // Any column absent from at least one grouping set can be null.
            self.columns
                .iter()
                .filter(|c| self.grouping_sets.iter().any(|set| !set.contains(c)))
                .collect()
        } else {
            self.rollup_columns.iter().collect()
        }
    }
}
