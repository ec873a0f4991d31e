//! In-memory backend for executor tests.
//!
//! Implements enough of the `QueryEngine` contract to exercise the planner
//! honestly: grouping, rollups, grouping sets, filters, period shifts and
//! per-scope limits over rows held in memory. Every `DatabaseQuery` is
//! recorded so tests can assert on backend traffic.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use lattice::criteria::{ConditionOp, Criteria};
use lattice::engine::{DatabaseQuery, QueryEngine};
use lattice::error::{LatticeError, Result};
use lattice::measure::{Aggregation, Measure};
use lattice::store::{Datastore, Field, FieldType, Store};
use lattice::table::Table;

pub struct MockEngine {
    datastore: Datastore,
    rows: HashMap<String, Vec<Vec<Value>>>,
    calls: Mutex<Vec<DatabaseQuery>>,
    latency: std::time::Duration,
}

impl MockEngine {
    pub fn new(stores: Vec<Store>) -> Self {
        Self {
            datastore: Datastore::new(stores),
            rows: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            latency: std::time::Duration::ZERO,
        }
    }

    pub fn with_rows(mut self, table: &str, rows: Vec<Vec<Value>>) -> Self {
        self.rows.insert(table.to_string(), rows);
        self
    }

    /// Simulated backend latency, for concurrency tests.
    #[allow(dead_code)]
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<DatabaseQuery> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn store(&self, name: &str) -> Result<&Store> {
        self.datastore
            .store(name)
            .ok_or_else(|| LatticeError::Schema(format!("unknown store {name}")))
    }

    fn field_index(store: &Store, name: &str) -> Result<usize> {
        store
            .fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| LatticeError::Schema(format!("unknown field {name}")))
    }

    fn matches(store: &Store, row: &[Value], criteria: &Criteria) -> bool {
        match criteria {
            Criteria::And { criteria } => criteria.iter().all(|c| Self::matches(store, row, c)),
            Criteria::Or { criteria } => criteria.iter().any(|c| Self::matches(store, row, c)),
            Criteria::Condition { field, op, values } => {
                let Ok(index) = Self::field_index(store, field) else {
                    return false;
                };
                let cell = &row[index];
                let literals: Vec<Value> = values.iter().map(|l| l.to_value()).collect();
                let first = literals.first();
                match op {
                    ConditionOp::Eq => first == Some(cell),
                    ConditionOp::Neq => first != Some(cell),
                    ConditionOp::In => literals.contains(cell),
                    ConditionOp::NotIn => !literals.contains(cell),
                    ConditionOp::Gt | ConditionOp::Gte | ConditionOp::Lt | ConditionOp::Lte => {
                        let (Some(a), Some(b)) =
                            (cell.as_f64(), first.and_then(|v| v.as_f64()))
                        else {
                            return false;
                        };
                        match op {
                            ConditionOp::Gt => a > b,
                            ConditionOp::Gte => a >= b,
                            ConditionOp::Lt => a < b,
                            ConditionOp::Lte => a <= b,
                            _ => unreachable!(),
                        }
                    }
                    ConditionOp::Like => cell
                        .as_str()
                        .zip(first.and_then(|v| v.as_str()))
                        .is_some_and(|(c, p)| c.contains(p)),
                }
            }
        }
    }

    /// The grouping-column subsets this scope aggregates over, detail first.
    fn grouping_sets(query: &DatabaseQuery) -> Vec<Vec<String>> {
        let scope = &query.scope;
        let all: Vec<String> = scope.columns.iter().map(|f| f.name.clone()).collect();
        if !scope.grouping_sets.is_empty() {
            return scope
                .grouping_sets
                .iter()
                .map(|set| set.iter().map(|f| f.name.clone()).collect())
                .collect();
        }
        if scope.rollup_columns.is_empty() {
            return vec![all];
        }
        // ROLLUP: progressively drop the rolled columns from the right.
        let rolled: Vec<String> = scope.rollup_columns.iter().map(|f| f.name.clone()).collect();
        let fixed: Vec<String> = all.iter().filter(|c| !rolled.contains(c)).cloned().collect();
        (0..=rolled.len())
            .rev()
            .map(|k| {
                let mut set = fixed.clone();
                set.extend(rolled[..k].iter().cloned());
                set
            })
            .collect()
    }

    fn aggregate(
        &self,
        store: &Store,
        query: &DatabaseQuery,
        rows: &[&Vec<Value>],
    ) -> Result<Table> {
        let scope = &query.scope;
        let mut out_columns: Vec<(Field, Vec<Value>)> = scope
            .columns
            .iter()
            .map(|f| (f.clone(), Vec::new()))
            .collect();
        for measure in &query.measures {
            out_columns.push((
                Field::new(measure.alias(), measure_type(store, measure)),
                Vec::new(),
            ));
        }

        for set in Self::grouping_sets(query) {
            // Stable group discovery: first-seen key order.
            let mut groups: Vec<(Vec<Value>, Vec<&Vec<Value>>)> = Vec::new();
            for row in rows {
                let key: Vec<Value> = scope
                    .columns
                    .iter()
                    .map(|f| {
                        if set.contains(&f.name) {
                            group_key_cell(scope, store, f, row)
                        } else {
                            Value::Null
                        }
                    })
                    .collect();
                match groups.iter_mut().find(|(k, _)| k == &key) {
                    Some((_, members)) => members.push(row),
                    None => groups.push((key, vec![row])),
                }
            }
            for (key, members) in groups {
                for (i, cell) in key.into_iter().enumerate() {
                    out_columns[i].1.push(cell);
                }
                for (offset, measure) in query.measures.iter().enumerate() {
                    let cell = aggregate_measure(store, measure, &set, &members)?;
                    out_columns[scope.columns.len() + offset].1.push(cell);
                }
            }
        }

        let mut table = Table::from_columns(out_columns)?;
        if scope.limit > 0 && (table.count() as i64) > scope.limit {
            table.truncate(scope.limit as usize);
        }
        Ok(table)
    }
}

/// Applies the scope's period shift: a shifted scope reports group g at the
/// position a later period will look it up from.
fn group_key_cell(
    scope: &lattice::scope::QueryScope,
    store: &Store,
    field: &Field,
    row: &[Value],
) -> Value {
    let index = MockEngine::field_index(store, &field.name).expect("validated by resolver");
    let cell = row[index].clone();
    if let Some(shift) = &scope.period_shift {
        if shift.field == field.name {
            if let Some(v) = cell.as_i64() {
                return Value::from(v - shift.offset);
            }
        }
    }
    cell
}

fn measure_type(store: &Store, measure: &Measure) -> FieldType {
    match measure {
        Measure::Aggregated {
            field, aggregation, ..
        } => match aggregation {
            Aggregation::Count | Aggregation::CountDistinct | Aggregation::Grouping => {
                FieldType::Integer
            }
            Aggregation::Avg => FieldType::Floating,
            _ => store
                .field(field)
                .map(|f| f.field_type)
                .unwrap_or(FieldType::Floating),
        },
        _ => FieldType::Floating,
    }
}

fn aggregate_measure(
    store: &Store,
    measure: &Measure,
    set: &[String],
    members: &[&Vec<Value>],
) -> Result<Value> {
    let Measure::Aggregated {
        field,
        aggregation,
        filter,
        ..
    } = measure
    else {
        return Err(LatticeError::Execution(format!(
            "mock engine only materializes primitive aggregates, got {}",
            measure.alias()
        )));
    };

    let members: Vec<&Vec<Value>> = match filter {
        Some(criteria) => members
            .iter()
            .filter(|row| MockEngine::matches(store, row, criteria))
            .copied()
            .collect(),
        None => members.to_vec(),
    };

    match aggregation {
        Aggregation::Count => Ok(Value::from(members.len() as i64)),
        Aggregation::Grouping => Ok(Value::from(i64::from(!set.contains(field)))),
        Aggregation::CountDistinct => {
            let index = MockEngine::field_index(store, field)?;
            let mut seen: Vec<&Value> = Vec::new();
            for row in &members {
                if !seen.contains(&&row[index]) {
                    seen.push(&row[index]);
                }
            }
            Ok(Value::from(seen.len() as i64))
        }
        Aggregation::Sum | Aggregation::Avg | Aggregation::Min | Aggregation::Max => {
            let index = MockEngine::field_index(store, field)?;
            let values: Vec<f64> = members
                .iter()
                .filter_map(|row| row[index].as_f64())
                .collect();
            if values.is_empty() {
                return Ok(Value::Null);
            }
            let result = match aggregation {
                Aggregation::Sum => values.iter().sum(),
                Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
                Aggregation::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
                Aggregation::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                _ => unreachable!(),
            };
            Ok(serde_json::Number::from_f64(result)
                .map(Value::Number)
                .unwrap_or(Value::Null))
        }
    }
}

#[async_trait]
impl QueryEngine for MockEngine {
    async fn execute(&self, query: &DatabaseQuery) -> Result<Table> {
        self.calls.lock().unwrap().push(query.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let store = self.store(&query.scope.table)?;
        let empty = Vec::new();
        let rows = self.rows.get(&query.scope.table).unwrap_or(&empty);
        let filtered: Vec<&Vec<Value>> = match &query.scope.criteria {
            Some(criteria) => rows
                .iter()
                .filter(|row| Self::matches(store, row, criteria))
                .collect(),
            None => rows.iter().collect(),
        };
        self.aggregate(store, query, &filtered)
    }

    async fn execute_raw_sql(&self, _sql: &str) -> Result<Table> {
        Err(LatticeError::Unsupported(
            "mock engine does not execute raw sql".to_string(),
        ))
    }

    fn datastore(&self) -> &Datastore {
        &self.datastore
    }
}
