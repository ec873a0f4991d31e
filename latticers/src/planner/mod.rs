//! Query planning: resolution, prerequisite discovery, dependency graph and
//! topological execution order.

use crate::measure::Measure;
use crate::query::{CacheMode, ColumnSet, OrderDto};
use crate::scope::QueryScope;
use crate::store::Field;

mod execution;
mod graph;
mod prerequisites;
mod resolve;

pub use execution::ExecutionPlan;
pub use graph::{build_graph, DependencyGraph, NodeKey};
pub use prerequisites::prerequisites;
pub use resolve::resolve;

/// Output of the resolver: everything later stages need, bound against the
/// catalog and typed.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    /// User-requested grouping columns, typed, in declaration order.
    pub columns: Vec<Field>,
    /// Dynamic-grouping column sets, applied before evaluation.
    pub column_sets: Vec<ColumnSet>,
    /// Requested measures in declaration order; aliases are unique.
    pub measures: Vec<Measure>,
    /// Dimension names in final result order (column-set columns first).
    pub result_columns: Vec<String>,
    pub scope: QueryScope,
    pub cache_mode: CacheMode,
    pub limit: i64,
    pub order: Vec<OrderDto>,
}
