//! Query execution.
//!
//! Orchestrates one query end to end: resolve, build the dependency graph,
//! prefetch primitive aggregates per scope (merging with the shared cache),
//! evaluate non-primitive measures in topological order, shape the result.
//! Executors are shared across threads; everything per-query lives on the
//! stack of [`QueryExecutor::execute_with`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cache::{global_cache, CacheKey, QueryCache};
use crate::engine::{DatabaseQuery, QueryEngine};
use crate::error::{LatticeError, Result};
use crate::evaluator;
use crate::measure::Measure;
use crate::planner::{build_graph, resolve, CompiledQuery, ExecutionPlan};
use crate::postprocess;
use crate::query::{CacheMode, ColumnSet, PivotQueryDto, QueryDto};
use crate::scope::QueryScope;
use crate::table::{ColumnarTable, PivotTable, Table};

/// Invoked when the shaped result hits the query limit exactly, i.e. the
/// output may have been truncated.
pub type LimitNotifier = Arc<dyn Fn(i64) + Send + Sync>;

/// Per-query cancellation flag and optional deadline, observed before each
/// node execution and each backend call.
#[derive(Clone, Default)]
pub struct QueryContext {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn check(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(LatticeError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(LatticeError::Timeout);
        }
        Ok(())
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Partitions the cache; absent means the shared partition.
    pub principal: Option<String>,
    pub context: QueryContext,
    pub limit_notifier: Option<LimitNotifier>,
}

impl ExecuteOptions {
    pub fn for_principal(principal: impl Into<String>) -> Self {
        Self {
            principal: Some(principal.into()),
            ..Default::default()
        }
    }
}

pub struct QueryExecutor {
    engine: Arc<dyn QueryEngine>,
    cache: Arc<dyn QueryCache>,
    in_flight: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
    /// Aliases forced into the non-cacheable partition; re-fetched on every
    /// query.
    excluded_from_cache: HashSet<String>,
}

impl QueryExecutor {
    pub fn new(engine: Arc<dyn QueryEngine>) -> Self {
        Self::with_cache(engine, global_cache())
    }

    pub fn with_cache(engine: Arc<dyn QueryEngine>, cache: Arc<dyn QueryCache>) -> Self {
        Self {
            engine,
            cache,
            in_flight: Mutex::new(HashMap::new()),
            excluded_from_cache: HashSet::new(),
        }
    }

    pub fn exclude_from_cache(mut self, aliases: impl IntoIterator<Item = String>) -> Self {
        self.excluded_from_cache.extend(aliases);
        self
    }

    pub fn cache(&self) -> &Arc<dyn QueryCache> {
        &self.cache
    }

    pub async fn execute(&self, dto: &QueryDto) -> Result<ColumnarTable> {
        self.execute_with(dto, &ExecuteOptions::default()).await
    }

    #[tracing::instrument(
        skip(self, dto, opts),
        fields(
            table = %dto.table,
            columns = dto.columns.len(),
            measures = dto.measures.len(),
            principal = ?opts.principal,
        )
    )]
    pub async fn execute_with(
        &self,
        dto: &QueryDto,
        opts: &ExecuteOptions,
    ) -> Result<ColumnarTable> {
        let start = Instant::now();
        tracing::debug!("starting query execution");

        let compiled = resolve(dto, self.engine.datastore())?;
        if compiled.cache_mode == CacheMode::Invalidate {
            tracing::debug!(principal = ?opts.principal, "invalidating cache entries");
            self.cache.clear(opts.principal.as_deref());
        }

        let result = self.run(&compiled, opts).await;
        let elapsed = start.elapsed();
        match &result {
            Ok(table) => tracing::info!(
                table = %dto.table,
                rows = table.count(),
                ms = elapsed.as_millis(),
                "query completed"
            ),
            Err(e) => tracing::error!(
                table = %dto.table,
                error = %e,
                ms = elapsed.as_millis(),
                "query failed"
            ),
        }
        result
    }

    /// Pivot queries run the wrapped query with derived grouping sets, then
    /// materialize the pivoted view. Rollup columns are rejected: the pivot
    /// owns the super-aggregate structure.
    pub async fn execute_pivot(
        &self,
        pivot: &PivotQueryDto,
        opts: &ExecuteOptions,
    ) -> Result<PivotTable> {
        if !pivot.query.rollup_columns.is_empty() {
            return Err(LatticeError::Validation(
                "rollup columns must be empty in a pivot query".to_string(),
            ));
        }
        let declared: HashSet<&String> = pivot.query.columns.iter().collect();
        for axis in pivot.rows.iter().chain(&pivot.columns) {
            if !declared.contains(axis) {
                return Err(LatticeError::Validation(format!(
                    "pivot axis {axis} is not a column of the query"
                )));
            }
        }
        if pivot.rows.iter().any(|r| pivot.columns.contains(r)) {
            return Err(LatticeError::Validation(
                "a column cannot appear on both pivot axes".to_string(),
            ));
        }
        if declared.len() != pivot.rows.len() + pivot.columns.len() {
            return Err(LatticeError::Validation(
                "every query column must appear on a pivot axis".to_string(),
            ));
        }

        let mut query = pivot.query.clone();
        query.grouping_sets = pivot_grouping_sets(&pivot.rows, &pivot.columns, &pivot.hidden_totals);

        let result = self.execute_with(&query, opts).await?;
        let values: Vec<String> = query.measures.iter().map(|m| m.alias()).collect();
        let pivoted = postprocess::pivot(&result.table, &pivot.rows, &pivot.columns, &values)?;
        Ok(PivotTable {
            table: result.table,
            pivoted,
            rows: pivot.rows.clone(),
            columns: pivot.columns.clone(),
            values,
            hidden_totals: pivot.hidden_totals.clone(),
        })
    }

    async fn run(&self, compiled: &CompiledQuery, opts: &ExecuteOptions) -> Result<ColumnarTable> {
        let graph = build_graph(compiled);
        let plan = ExecutionPlan::new(&graph)?;
        tracing::debug!(nodes = graph.len(), "dependency graph built");

        // Prefetch pass: group plan nodes by scope, preserving discovery
        // order so backend calls are deterministic.
        let mut scopes: Vec<(QueryScope, Vec<Measure>)> = Vec::new();
        plan.execute(&graph, |node| {
            opts.context.check()?;
            let index = match scopes.iter().position(|(s, _)| s == &node.scope) {
                Some(i) => i,
                None => {
                    scopes.push((node.scope.clone(), Vec::new()));
                    scopes.len() - 1
                }
            };
            let entry = &mut scopes[index].1;
            if node.measure.is_primitive() && !entry.contains(&node.measure) {
                entry.push(node.measure.clone());
            }
            Ok(())
        })?;

        let mut tables: HashMap<QueryScope, Table> = HashMap::new();
        for (scope, measures) in &scopes {
            let is_root = scope == &compiled.scope;
            // Sub-scopes fetch one extra row so truncation that would corrupt
            // dependent computations is detectable instead of silent.
            let fetch_scope = if is_root {
                scope.clone()
            } else {
                scope.copy_with_new_limit(compiled.limit + 1)
            };
            let table = self
                .prefetch_scope(scope, fetch_scope, measures, compiled, opts)
                .await?;
            if !is_root && table.count() as i64 > compiled.limit {
                return Err(LatticeError::Execution(format!(
                    "intermediate result for scope on {} exceeds the query limit {}",
                    scope.table, compiled.limit
                )));
            }
            tables.insert(scope.clone(), table);
        }

        // Dynamic grouping reshapes every scope before evaluation starts.
        if !compiled.column_sets.is_empty() {
            for table in tables.values_mut() {
                *table = postprocess::reshape_with_groups(table, &compiled.column_sets)?;
            }
        }

        let group_columns: Vec<String> = compiled
            .column_sets
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        plan.execute(&graph, |node| {
            opts.context.check()?;
            evaluator::evaluate(node, &mut tables, &group_columns)
        })?;

        let root = tables.remove(&compiled.scope).ok_or_else(|| {
            LatticeError::Execution("root scope table missing after evaluation".to_string())
        })?;
        self.shape(root, compiled, opts)
    }

    async fn prefetch_scope(
        &self,
        plan_scope: &QueryScope,
        fetch_scope: QueryScope,
        measures: &[Measure],
        compiled: &CompiledQuery,
        opts: &ExecuteOptions,
    ) -> Result<Table> {
        let use_cache = compiled.cache_mode != CacheMode::NotUse;
        let key = CacheKey::new(fetch_scope.clone(), opts.principal.clone());

        // At most one in-flight fetch per (scope, principal): the second
        // caller blocks here and then observes the first one's cache writes.
        let _guard = if use_cache {
            Some(self.flight_lock(&key).lock_owned().await)
        } else {
            None
        };
        opts.context.check()?;

        let mut hits: Vec<Measure> = Vec::new();
        let mut misses: Vec<Measure> = Vec::new();
        let mut not_cached: Vec<Measure> = Vec::new();
        for measure in measures {
            if !use_cache
                || self.excluded_from_cache.contains(&measure.alias())
                || !measure.can_be_cached()
            {
                not_cached.push(measure.clone());
            } else if self.cache.contains(measure, &key) {
                hits.push(measure.clone());
            } else {
                misses.push(measure.clone());
            }
        }
        tracing::debug!(
            table = %plan_scope.table,
            hits = hits.len(),
            misses = misses.len(),
            not_cached = not_cached.len(),
            "prefetching scope"
        );

        let mut to_fetch: Vec<Measure> = misses.iter().chain(&not_cached).cloned().collect();
        // Any backend call carries the count measure so the result skeleton
        // is always aligned the same way.
        if !to_fetch.is_empty() && !to_fetch.contains(&crate::measure::count_measure()) {
            to_fetch.push(crate::measure::count_measure());
        }
        let mut table = if !to_fetch.is_empty() {
            self.engine_execute(
                &DatabaseQuery {
                    scope: fetch_scope.clone(),
                    measures: to_fetch,
                },
                &opts.context,
            )
            .await?
        } else {
            match self.cache.create_raw_result(&key) {
                Some(skeleton) => skeleton,
                // Entry vanished between partitioning and here; fall back to
                // a full fetch.
                None => {
                    misses = self.cacheable(measures);
                    hits.clear();
                    self.engine_execute(
                        &DatabaseQuery {
                            scope: fetch_scope.clone(),
                            measures: measures.to_vec(),
                        },
                        &opts.context,
                    )
                    .await?
                }
            }
        };

        // Promote rollup nulls before merging or caching so cached grouping
        // columns and evaluator alignment keys agree on the markers.
        postprocess::replace_total_cell_values(&mut table, plan_scope);

        if use_cache && !hits.is_empty() {
            let merged = self.cache.contribute_to_result(&mut table, &hits, &key);
            if !merged {
                tracing::warn!(
                    table = %plan_scope.table,
                    "cache entry inconsistent with backend result; refetching scope"
                );
                table = self
                    .engine_execute(
                        &DatabaseQuery {
                            scope: fetch_scope.clone(),
                            measures: measures.to_vec(),
                        },
                        &opts.context,
                    )
                    .await?;
                postprocess::replace_total_cell_values(&mut table, plan_scope);
                misses = self.cacheable(measures);
            }
        }

        if use_cache && !misses.is_empty() {
            self.cache.contribute_to_cache(&table, &misses, &key);
        }
        Ok(table)
    }

    fn cacheable(&self, measures: &[Measure]) -> Vec<Measure> {
        measures
            .iter()
            .filter(|m| m.can_be_cached() && !self.excluded_from_cache.contains(&m.alias()))
            .cloned()
            .collect()
    }

    async fn engine_execute(&self, query: &DatabaseQuery, ctx: &QueryContext) -> Result<Table> {
        ctx.check()?;
        match ctx.remaining() {
            Some(remaining) => tokio::time::timeout(remaining, self.engine.execute(query))
                .await
                .map_err(|_| LatticeError::Timeout)?,
            None => self.engine.execute(query).await,
        }
    }

    fn flight_lock(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        map.entry(key.clone()).or_default().clone()
    }

    fn shape(
        &self,
        root: Table,
        compiled: &CompiledQuery,
        opts: &ExecuteOptions,
    ) -> Result<ColumnarTable> {
        let mut dimensions = compiled.result_columns.clone();
        // A single-group column set adds no information; drop its column.
        for set in &compiled.column_sets {
            let ColumnSet::Group { name, groups, .. } = set;
            if compiled.column_sets.len() == 1 && groups.len() == 1 {
                dimensions.retain(|d| d != name);
            }
        }

        let measure_aliases: Vec<String> =
            compiled.measures.iter().map(|m| m.alias()).collect();
        let mut shaped =
            postprocess::select_and_order_columns(&root, &dimensions, &measure_aliases)?;
        postprocess::order_rows(&mut shaped, &compiled.order, &dimensions);

        if shaped.count() as i64 > compiled.limit {
            shaped.truncate(compiled.limit as usize);
        }
        if shaped.count() as i64 == compiled.limit {
            tracing::warn!(limit = compiled.limit, "result hit the query limit");
            if let Some(notifier) = &opts.limit_notifier {
                notifier(compiled.limit);
            }
        }

        Ok(ColumnarTable {
            table: shaped,
            grouping_columns: dimensions,
            measure_columns: measure_aliases,
        })
    }
}

/// Grouping sets a pivot needs: one per pair of (rows prefix, columns
/// prefix), which yields the detail cells, hierarchical row and column
/// totals, and the grand total. Sets aggregating over a hidden-total field
/// are omitted.
fn pivot_grouping_sets(
    rows: &[String],
    columns: &[String],
    hidden_totals: &[String],
) -> Vec<Vec<String>> {
    let mut sets = Vec::new();
    for i in (0..=rows.len()).rev() {
        for j in (0..=columns.len()).rev() {
            let mut set: Vec<String> = rows[..i].to_vec();
            set.extend(columns[..j].iter().cloned());
            let aggregates_hidden = hidden_totals.iter().any(|h| !set.contains(h));
            if !aggregates_hidden && !sets.contains(&set) {
                sets.push(set);
            }
        }
    }
    sets
}
