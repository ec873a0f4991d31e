//! Binds a raw query DTO against the schema catalog.
//!
//! The only component allowed to consult the catalog. Produces typed
//! columns, the compiled measure list and the root scope, or fails with a
//! validation error before any backend call is made. Field names resolve
//! against the base store, the joined stores and the query's virtual
//! tables; a name found in more than one source is ambiguous.

use std::collections::HashSet;

use crate::config;
use crate::criteria::Criteria;
use crate::error::{LatticeError, Result};
use crate::measure::{Aggregation, Measure, ReferencePosition};
use crate::planner::CompiledQuery;
use crate::query::QueryDto;
use crate::scope::{Join, QueryScope, VirtualTable};
use crate::store::{Datastore, Field, Store};

struct FieldSources<'a> {
    base: &'a Store,
    joined: Vec<&'a Store>,
    virtual_tables: &'a [VirtualTable],
}

impl FieldSources<'_> {
    fn contains(&self, name: &str) -> bool {
        self.base.field(name).is_some()
            || self.joined.iter().any(|s| s.field(name).is_some())
            || self.virtual_tables.iter().any(|t| t.field(name).is_some())
    }

    fn resolve(&self, name: &str) -> Result<Field> {
        let mut matches: Vec<(&str, Field)> = Vec::new();
        if let Some(field) = self.base.field(name) {
            matches.push((&self.base.name, field.clone()));
        }
        for store in &self.joined {
            if let Some(field) = store.field(name) {
                matches.push((&store.name, field.clone()));
            }
        }
        for table in self.virtual_tables {
            if let Some(field) = table.field(name) {
                matches.push((&table.name, field.clone()));
            }
        }
        match matches.len() {
            0 => Err(LatticeError::Validation(format!(
                "unknown field {} on store {} and its joins",
                name, self.base.name
            ))),
            1 => Ok(matches.remove(0).1),
            _ => {
                let tables: Vec<&str> = matches.iter().map(|(t, _)| *t).collect();
                Err(LatticeError::Validation(format!(
                    "ambiguous field {}; found on {}",
                    name,
                    tables.join(", ")
                )))
            }
        }
    }
}

pub fn resolve(dto: &QueryDto, datastore: &Datastore) -> Result<CompiledQuery> {
    let store = datastore.store(&dto.table).ok_or_else(|| {
        LatticeError::Validation(format!("unknown store {}", dto.table))
    })?;

    validate_virtual_tables(&dto.virtual_tables, datastore)?;
    let joined = resolve_joins(&dto.joins, datastore, &dto.virtual_tables)?;
    let sources = FieldSources {
        base: store,
        joined,
        virtual_tables: &dto.virtual_tables,
    };
    validate_join_keys(&dto.joins, &sources)?;

    let columns = resolve_columns(&dto.columns, &sources)?;
    let rollup_columns = resolve_columns(&dto.rollup_columns, &sources)?;
    for rollup in &rollup_columns {
        if !columns.contains(rollup) {
            return Err(LatticeError::Validation(format!(
                "rollup column {} is not part of the grouping columns",
                rollup.name
            )));
        }
    }
    let mut grouping_sets = Vec::with_capacity(dto.grouping_sets.len());
    for set in &dto.grouping_sets {
        let typed = resolve_columns(set, &sources)?;
        for field in &typed {
            if !columns.contains(field) {
                return Err(LatticeError::Validation(format!(
                    "grouping set column {} is not part of the grouping columns",
                    field.name
                )));
            }
        }
        grouping_sets.push(typed);
    }

    // Column sets group an existing column into a synthetic one; the base
    // column must be grouped on even when the user did not request it.
    let mut scope_columns = columns.clone();
    let mut result_columns = Vec::new();
    for set in &dto.column_sets {
        let base = sources.resolve(set.base_field())?;
        if sources.contains(set.name()) || dto.columns.contains(&set.name().to_string()) {
            return Err(LatticeError::Validation(format!(
                "column set name {} collides with an existing column",
                set.name()
            )));
        }
        if !scope_columns.contains(&base) {
            scope_columns.push(base);
        }
        result_columns.push(set.name().to_string());
    }
    result_columns.extend(dto.columns.iter().cloned());

    if let Some(criteria) = &dto.criteria {
        validate_criteria(criteria, &sources)?;
    }

    let mut aliases = HashSet::new();
    for measure in &dto.measures {
        let alias = measure.alias();
        if !aliases.insert(alias.clone()) {
            return Err(LatticeError::Validation(format!(
                "duplicate measure alias {alias}"
            )));
        }
        validate_measure(measure, &sources)?;
    }

    for order in &dto.order {
        let known = result_columns.contains(&order.column)
            || dto.measures.iter().any(|m| m.alias() == order.column);
        if !known {
            return Err(LatticeError::Validation(format!(
                "order column {} is neither a grouping column nor a measure",
                order.column
            )));
        }
    }

    let limit = dto
        .limit
        .filter(|l| *l > 0)
        .unwrap_or_else(config::default_query_limit);

    let scope = QueryScope {
        table: store.name.clone(),
        joins: dto.joins.clone(),
        columns: scope_columns,
        rollup_columns,
        grouping_sets,
        criteria: dto.criteria.clone(),
        limit,
        virtual_tables: dto.virtual_tables.clone(),
        period_shift: None,
    };

    Ok(CompiledQuery {
        columns,
        column_sets: dto.column_sets.clone(),
        measures: dto.measures.clone(),
        result_columns,
        scope,
        cache_mode: dto.parameters.cache,
        limit,
        order: dto.order.clone(),
    })
}

fn validate_virtual_tables(tables: &[VirtualTable], datastore: &Datastore) -> Result<()> {
    let mut names = HashSet::new();
    for table in tables {
        if datastore.store(&table.name).is_some() {
            return Err(LatticeError::Validation(format!(
                "virtual table {} collides with a catalog store",
                table.name
            )));
        }
        if !names.insert(table.name.as_str()) {
            return Err(LatticeError::Validation(format!(
                "duplicate virtual table {}",
                table.name
            )));
        }
        for (index, row) in table.rows.iter().enumerate() {
            if row.len() != table.fields.len() {
                return Err(LatticeError::Validation(format!(
                    "virtual table {} row {} has {} cells, expected {}",
                    table.name,
                    index,
                    row.len(),
                    table.fields.len()
                )));
            }
        }
    }
    Ok(())
}

/// Each join must target a catalog store or one of the query's virtual
/// tables; catalog-backed joins contribute their fields to resolution.
fn resolve_joins<'a>(
    joins: &[Join],
    datastore: &'a Datastore,
    virtual_tables: &[VirtualTable],
) -> Result<Vec<&'a Store>> {
    let mut joined = Vec::new();
    for join in joins {
        if join.keys.is_empty() {
            return Err(LatticeError::Validation(format!(
                "join on {} declares no key columns",
                join.table
            )));
        }
        if let Some(store) = datastore.store(&join.table) {
            joined.push(store);
        } else if !virtual_tables.iter().any(|t| t.name == join.table) {
            return Err(LatticeError::Validation(format!(
                "unknown join table {}",
                join.table
            )));
        }
    }
    Ok(joined)
}

fn validate_join_keys(joins: &[Join], sources: &FieldSources<'_>) -> Result<()> {
    for join in joins {
        for key in &join.keys {
            sources.resolve(&key.left)?;
            let right_known = sources
                .joined
                .iter()
                .find(|s| s.name == join.table)
                .map(|s| s.field(&key.right).is_some())
                .or_else(|| {
                    sources
                        .virtual_tables
                        .iter()
                        .find(|t| t.name == join.table)
                        .map(|t| t.field(&key.right).is_some())
                })
                .unwrap_or(false);
            if !right_known {
                return Err(LatticeError::Validation(format!(
                    "join key column {} missing on {}",
                    key.right, join.table
                )));
            }
        }
    }
    Ok(())
}

fn resolve_columns(names: &[String], sources: &FieldSources<'_>) -> Result<Vec<Field>> {
    names.iter().map(|n| sources.resolve(n)).collect()
}

fn validate_criteria(criteria: &Criteria, sources: &FieldSources<'_>) -> Result<()> {
    let mut fields = Vec::new();
    criteria.referenced_fields(&mut fields);
    for field in fields {
        sources.resolve(&field)?;
    }
    Ok(())
}

fn validate_measure(measure: &Measure, sources: &FieldSources<'_>) -> Result<()> {
    match measure {
        Measure::Aggregated {
            alias,
            field,
            aggregation,
            filter,
        } => {
            if field != "*" {
                let typed = sources.resolve(field)?;
                let needs_numeric =
                    matches!(aggregation, Aggregation::Sum | Aggregation::Avg);
                if needs_numeric && !typed.field_type.is_numeric() {
                    return Err(LatticeError::Validation(format!(
                        "measure {alias}: {aggregation:?} requires a numeric field, {} is {:?}",
                        field, typed.field_type
                    )));
                }
            }
            if let Some(filter) = filter {
                validate_criteria(filter, sources)?;
            }
            Ok(())
        }
        Measure::Vector { field, .. } => sources.resolve(field).map(|_| ()),
        Measure::Binary { left, right, .. } => {
            validate_measure(left, sources)?;
            validate_measure(right, sources)
        }
        Measure::Comparison {
            measure, reference, ..
        } => {
            validate_measure(measure, sources)?;
            match reference {
                ReferencePosition::Parent { ancestors } => {
                    for ancestor in ancestors {
                        sources.resolve(ancestor)?;
                    }
                }
                ReferencePosition::Period { field, .. } => {
                    sources.resolve(field)?;
                }
            }
            Ok(())
        }
        Measure::Constant { .. } | Measure::Expression { .. } => Ok(()),
    }
}
