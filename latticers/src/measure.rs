//! Measures.
//!
//! A measure is a tagged union over the kinds of values a query can compute:
//! primitive aggregates pushed to the backend, arithmetic over other
//! measures, window/period comparisons, vectors, constants and raw
//! expressions. Each measure carries an alias that is stable across a query;
//! the resolver enforces alias uniqueness.

use serde::{Deserialize, Serialize};

use crate::criteria::{Criteria, Literal};
use crate::scope::{PeriodShift, QueryScope};

/// Alias of the count measure added to every scope fetch.
pub const COUNT_ALIAS: &str = "_contributors_count_";

const GROUPING_PREFIX: &str = "___grouping___";
const GROUPING_SUFFIX: &str = "___";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    CountDistinct,
    /// GROUPING(field) indicator; 1 on rows aggregating over the field.
    Grouping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMethod {
    AbsoluteDifference,
    RelativeDifference,
    Divide,
}

/// Where a comparison measure finds the row it compares against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReferencePosition {
    /// Compare against the parent aggregate: the shifted scope drops the
    /// deepest ancestor column present in the current scope, and rows align
    /// on the remaining grouping columns.
    Parent { ancestors: Vec<String> },
    /// Compare against the same group one period earlier: the shifted scope
    /// keeps the grouping columns and carries a period-shift transformation.
    Period { field: String, offset: i64 },
}

impl ReferencePosition {
    /// The scope the lagged operand must be fetched at.
    pub fn shifted_scope(&self, scope: &QueryScope) -> QueryScope {
        match self {
            ReferencePosition::Parent { ancestors } => {
                let mut shifted = scope.clone();
                // Drop the deepest ancestor that is actually grouped on.
                if let Some(dropped) = ancestors
                    .iter()
                    .find(|a| scope.columns.iter().any(|c| &c.name == *a))
                {
                    shifted.columns.retain(|c| &c.name != dropped);
                    shifted.rollup_columns.retain(|c| &c.name != dropped);
                    for set in &mut shifted.grouping_sets {
                        set.retain(|c| &c.name != dropped);
                    }
                }
                shifted
            }
            ReferencePosition::Period { field, offset } => {
                let mut shifted = scope.clone();
                shifted.period_shift = Some(PeriodShift {
                    field: field.clone(),
                    offset: *offset,
                });
                shifted
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Measure {
    /// Primitive aggregate computed by the backend in a single aggregation.
    Aggregated {
        alias: String,
        field: String,
        aggregation: Aggregation,
        #[serde(default)]
        filter: Option<Criteria>,
    },
    /// Arithmetic over two operand measures, evaluated after prefetch.
    Binary {
        alias: String,
        op: BinaryOp,
        left: Box<Measure>,
        right: Box<Measure>,
    },
    /// Window / period-over-period comparison of an operand measure against
    /// its value at a reference position.
    Comparison {
        alias: String,
        method: ComparisonMethod,
        measure: Box<Measure>,
        reference: ReferencePosition,
    },
    /// Primitive aggregate returning a repeated column. Never cached.
    Vector {
        alias: String,
        field: String,
        aggregation: Aggregation,
    },
    Constant { value: Literal },
    /// Raw expression evaluated by the backend.
    Expression { alias: String, sql: String },
}

impl Measure {
    pub fn alias(&self) -> String {
        match self {
            Measure::Aggregated { alias, .. }
            | Measure::Binary { alias, .. }
            | Measure::Comparison { alias, .. }
            | Measure::Vector { alias, .. }
            | Measure::Expression { alias, .. } => alias.clone(),
            Measure::Constant { value } => value.to_string(),
        }
    }

    /// Primitive measures are materialized by the backend; everything else
    /// is computed by the evaluator from already-fetched columns.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Measure::Aggregated { .. } | Measure::Vector { .. } | Measure::Expression { .. }
        )
    }

    /// Cacheable measures are primitive, not grouping indicators, not
    /// vectors, and do not wear the grouping alias pattern.
    pub fn can_be_cached(&self) -> bool {
        match self {
            Measure::Aggregated { aggregation, .. } => {
                *aggregation != Aggregation::Grouping
                    && extract_field_from_grouping_alias(&self.alias()).is_none()
            }
            Measure::Expression { alias, .. } => {
                extract_field_from_grouping_alias(alias).is_none()
            }
            _ => false,
        }
    }

    pub fn sum(alias: impl Into<String>, field: impl Into<String>) -> Self {
        Measure::Aggregated {
            alias: alias.into(),
            field: field.into(),
            aggregation: Aggregation::Sum,
            filter: None,
        }
    }

    pub fn avg(alias: impl Into<String>, field: impl Into<String>) -> Self {
        Measure::Aggregated {
            alias: alias.into(),
            field: field.into(),
            aggregation: Aggregation::Avg,
            filter: None,
        }
    }

    pub fn binary(
        alias: impl Into<String>,
        op: BinaryOp,
        left: Measure,
        right: Measure,
    ) -> Self {
        Measure::Binary {
            alias: alias.into(),
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }
}

/// The count measure every scope fetch carries.
pub fn count_measure() -> Measure {
    Measure::Aggregated {
        alias: COUNT_ALIAS.to_string(),
        field: "*".to_string(),
        aggregation: Aggregation::Count,
        filter: None,
    }
}

pub fn grouping_alias(field: &str) -> String {
    format!("{GROUPING_PREFIX}{field}{GROUPING_SUFFIX}")
}

/// GROUPING(field) indicator measure for a rollup column.
pub fn grouping_measure(field: &str) -> Measure {
    Measure::Aggregated {
        alias: grouping_alias(field),
        field: field.to_string(),
        aggregation: Aggregation::Grouping,
        filter: None,
    }
}

/// Strict inverse of [`grouping_alias`]. The pattern embeds the field name,
/// which would collide across scopes if such a column were ever cached.
pub fn extract_field_from_grouping_alias(alias: &str) -> Option<&str> {
    alias
        .strip_prefix(GROUPING_PREFIX)
        .and_then(|rest| rest.strip_suffix(GROUPING_SUFFIX))
        .filter(|field| !field.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Field, FieldType};

    #[test]
    fn grouping_alias_roundtrip() {
        let alias = grouping_alias("country");
        assert_eq!(extract_field_from_grouping_alias(&alias), Some("country"));
        assert_eq!(extract_field_from_grouping_alias("revenue"), None);
        assert_eq!(extract_field_from_grouping_alias("___grouping______"), None);
    }

    #[test]
    fn grouping_measures_are_not_cacheable() {
        assert!(!grouping_measure("country").can_be_cached());
        assert!(Measure::sum("revenue", "revenue").can_be_cached());
        // A primitive wearing the grouping alias pattern must not be cached
        // either: the alias encodes a field name and collides across scopes.
        let disguised = Measure::Aggregated {
            alias: grouping_alias("country"),
            field: "country".to_string(),
            aggregation: Aggregation::Sum,
            filter: None,
        };
        assert!(!disguised.can_be_cached());
    }

    #[test]
    fn computed_measures_are_not_primitive() {
        let margin = Measure::binary(
            "margin",
            BinaryOp::Subtract,
            Measure::sum("revenue", "revenue"),
            Measure::sum("cost", "cost"),
        );
        assert!(!margin.is_primitive());
        assert!(!margin.can_be_cached());
        assert!(count_measure().is_primitive());
    }

    #[test]
    fn parent_reference_drops_deepest_ancestor_present() {
        let scope = QueryScope::new(
            "sales",
            vec![
                Field::new("continent", FieldType::String),
                Field::new("country", FieldType::String),
            ],
        );
        let reference = ReferencePosition::Parent {
            ancestors: vec!["country".to_string(), "continent".to_string()],
        };
        let shifted = reference.shifted_scope(&scope);
        assert_eq!(shifted.columns.len(), 1);
        assert_eq!(shifted.columns[0].name, "continent");
    }

    #[test]
    fn period_reference_keeps_columns_but_marks_shift() {
        let scope = QueryScope::new("sales", vec![Field::new("year", FieldType::Integer)]);
        let reference = ReferencePosition::Period {
            field: "year".to_string(),
            offset: -1,
        };
        let shifted = reference.shifted_scope(&scope);
        assert_eq!(shifted.columns, scope.columns);
        assert_ne!(shifted, scope);
    }
}
