//! Query DTO surface.

use serde::{Deserialize, Serialize};

use crate::criteria::Criteria;
use crate::measure::Measure;
use crate::scope::{Join, VirtualTable};

/// Cache behavior requested by the caller. `Use` is the default; `Invalidate`
/// clears the principal's entries before the query proceeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheMode {
    #[default]
    Use,
    NotUse,
    Invalidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Asc,
    Desc,
}

fn default_totals_last() -> bool {
    true
}

/// Per-column ordering. Explicit orderings pin the listed values first (in
/// list order); remaining values fall back to the direction sort.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderDto {
    pub column: String,
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub first: Vec<String>,
    /// Total markers sort last unless disabled.
    #[serde(default = "default_totals_last")]
    pub totals_last: bool,
}

impl OrderDto {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Some(Direction::Asc),
            first: Vec::new(),
            totals_last: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Some(Direction::Desc),
            first: Vec::new(),
            totals_last: true,
        }
    }
}

/// Dynamic grouping: a synthetic column derived from an existing one through
/// ordered value groups. A base value may appear in several groups; its rows
/// are repeated once per containing group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnSet {
    Group {
        name: String,
        field: String,
        groups: Vec<(String, Vec<String>)>,
    },
}

impl ColumnSet {
    pub fn name(&self) -> &str {
        match self {
            ColumnSet::Group { name, .. } => name,
        }
    }

    pub fn base_field(&self) -> &str {
        match self {
            ColumnSet::Group { field, .. } => field,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryParameters {
    #[serde(default)]
    pub cache: CacheMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryDto {
    pub table: String,
    #[serde(default)]
    pub joins: Vec<Join>,
    #[serde(default)]
    pub virtual_tables: Vec<VirtualTable>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rollup_columns: Vec<String>,
    #[serde(default)]
    pub grouping_sets: Vec<Vec<String>>,
    #[serde(default)]
    pub column_sets: Vec<ColumnSet>,
    #[serde(default)]
    pub measures: Vec<Measure>,
    #[serde(default)]
    pub criteria: Option<Criteria>,
    #[serde(default)]
    pub order: Vec<OrderDto>,
    /// Negative or absent means the process default.
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub parameters: QueryParameters,
}

impl QueryDto {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_measure(mut self, measure: Measure) -> Self {
        self.measures.push(measure);
        self
    }

    pub fn with_rollup(mut self, columns: &[&str]) -> Self {
        self.rollup_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn with_virtual_table(mut self, table: VirtualTable) -> Self {
        self.virtual_tables.push(table);
        self
    }

    pub fn with_cache(mut self, cache: CacheMode) -> Self {
        self.parameters.cache = cache;
        self
    }
}

/// Pivot query: rows × columns over the wrapped query's measures.
/// `rollup_columns` on the wrapped query must be empty; the executor derives
/// the grouping sets the pivot needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PivotQueryDto {
    pub query: QueryDto,
    pub rows: Vec<String>,
    pub columns: Vec<String>,
    /// Fields whose total rows are suppressed from the pivoted view.
    #[serde(default)]
    pub hidden_totals: Vec<String>,
}
