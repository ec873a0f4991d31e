//! Backend seam.
//!
//! The executor talks to storage exclusively through [`QueryEngine`]. An
//! implementation materializes primitive aggregates for one scope per call:
//! dimension columns exactly matching the scope's grouping columns, then one
//! column per requested measure in request order, with nulls in grouping
//! columns for rollup / grouping-set super-aggregates. The scope carries the
//! query's joins and virtual-table definitions verbatim; translating them to
//! SQL is the engine's concern.

use async_trait::async_trait;

use crate::error::Result;
use crate::measure::Measure;
use crate::scope::QueryScope;
use crate::store::Datastore;
use crate::table::Table;

/// One backend fetch: a scope plus the primitive measures to materialize.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseQuery {
    pub scope: QueryScope,
    pub measures: Vec<Measure>,
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn execute(&self, query: &DatabaseQuery) -> Result<Table>;

    async fn execute_raw_sql(&self, sql: &str) -> Result<Table>;

    /// Schema catalog; the resolver is its only consumer.
    fn datastore(&self) -> &Datastore;
}
