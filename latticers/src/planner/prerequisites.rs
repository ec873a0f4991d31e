//! Prerequisite discovery.
//!
//! For one measure at one scope, returns the (scope, measures) pairs that
//! must be materialized before the measure itself can be computed. Purely
//! declarative; the graph builder closes the transitive set by re-applying
//! this until a fixpoint.

use crate::measure::Measure;
use crate::scope::QueryScope;

pub fn prerequisites(measure: &Measure, scope: &QueryScope) -> Vec<(QueryScope, Vec<Measure>)> {
    match measure {
        // Primitives need only themselves at the current scope.
        Measure::Aggregated { .. } | Measure::Vector { .. } | Measure::Expression { .. } => {
            Vec::new()
        }
        Measure::Binary { left, right, .. } => {
            vec![(scope.clone(), vec![(**left).clone(), (**right).clone()])]
        }
        Measure::Comparison {
            measure: operand,
            reference,
            ..
        } => {
            let shifted = reference.shifted_scope(scope);
            vec![
                (scope.clone(), vec![(**operand).clone()]),
                (shifted, vec![(**operand).clone()]),
            ]
        }
        Measure::Constant { .. } => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::{BinaryOp, ComparisonMethod, ReferencePosition};
    use crate::store::{Field, FieldType};

    fn scope() -> QueryScope {
        QueryScope::new("sales", vec![Field::new("year", FieldType::Integer)])
    }

    #[test]
    fn primitives_have_no_prerequisites() {
        assert!(prerequisites(&Measure::sum("revenue", "revenue"), &scope()).is_empty());
    }

    #[test]
    fn binary_needs_both_children_at_same_scope() {
        let margin = Measure::binary(
            "margin",
            BinaryOp::Subtract,
            Measure::sum("revenue", "revenue"),
            Measure::sum("cost", "cost"),
        );
        let prereqs = prerequisites(&margin, &scope());
        assert_eq!(prereqs.len(), 1);
        assert_eq!(prereqs[0].0, scope());
        assert_eq!(prereqs[0].1.len(), 2);
    }

    #[test]
    fn comparison_needs_current_and_shifted_scope() {
        let comparison = Measure::Comparison {
            alias: "yoy".to_string(),
            method: ComparisonMethod::AbsoluteDifference,
            measure: Box::new(Measure::sum("revenue", "revenue")),
            reference: ReferencePosition::Period {
                field: "year".to_string(),
                offset: -1,
            },
        };
        let prereqs = prerequisites(&comparison, &scope());
        assert_eq!(prereqs.len(), 2);
        assert_ne!(prereqs[0].0, prereqs[1].0);
    }
}
