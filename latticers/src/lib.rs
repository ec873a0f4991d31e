pub mod cache;
pub mod config;
pub mod criteria;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod loader;
pub mod measure;
pub mod planner;
pub mod postprocess;
pub mod query;
pub mod scope;
pub mod store;
pub mod table;
pub mod value;

use std::sync::Arc;

/// Executes one query against `engine` using the process-wide cache.
pub async fn execute_query(
    engine: Arc<dyn engine::QueryEngine>,
    query: &query::QueryDto,
) -> error::Result<table::ColumnarTable> {
    executor::QueryExecutor::new(engine).execute(query).await
}

pub use cache::{global_cache, CacheKey, CacheStats, EmptyCache, InMemoryCache, QueryCache};
pub use engine::{DatabaseQuery, QueryEngine};
pub use error::{LatticeError, Result};
pub use executor::{ExecuteOptions, LimitNotifier, QueryContext, QueryExecutor};
pub use loader::{DataLoader, TableSink};
pub use measure::{Aggregation, BinaryOp, ComparisonMethod, Measure, ReferencePosition};
pub use query::{CacheMode, ColumnSet, OrderDto, PivotQueryDto, QueryDto};
pub use scope::{Join, JoinKey, JoinType, QueryScope, VirtualTable};
pub use store::{Datastore, Field, FieldType, Store};
pub use table::{ColumnarTable, PivotTable, Table};
