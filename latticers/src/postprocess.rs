//! Result shaping.
//!
//! Everything that happens to tables after aggregates are materialized:
//! dynamic-grouping reshape, total-marker substitution, column selection and
//! ordering, row ordering, and pivot materialization.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;

use crate::error::{LatticeError, Result};
use crate::measure::grouping_alias;
use crate::query::{ColumnSet, Direction, OrderDto};
use crate::scope::QueryScope;
use crate::store::{Field, FieldType};
use crate::table::Table;
use crate::value;

/// Applies a GROUP column set: inserts the synthetic group column and
/// repeats each row once per group containing its base value. Rows whose
/// base value belongs to no group are dropped.
pub fn reshape_with_groups(table: &Table, sets: &[ColumnSet]) -> Result<Table> {
    let mut current = table.clone();
    for set in sets {
        let ColumnSet::Group {
            name,
            field,
            groups,
        } = set;
        let base = current.column(field).ok_or_else(|| {
            LatticeError::Execution(format!("group column set base {field} missing from table"))
        })?;

        let mut group_cells: Vec<Value> = Vec::new();
        let mut source_rows: Vec<usize> = Vec::new();
        for (row, cell) in base.iter().enumerate() {
            let text = match cell.as_str() {
                Some(s) => s.to_string(),
                None => cell.to_string(),
            };
            for (group, members) in groups {
                if members.contains(&text) {
                    group_cells.push(Value::String(group.clone()));
                    source_rows.push(row);
                }
            }
        }

        let mut reshaped = Table::new();
        reshaped.add_column(Field::new(name.clone(), FieldType::String), group_cells)?;
        for header in current.headers() {
            let header = header.clone();
            let column = current.column(&header.name).expect("header resolved");
            let values = source_rows.iter().map(|&r| column[r].clone()).collect();
            reshaped.add_column(header, values)?;
        }
        current = reshaped;
    }
    Ok(current)
}

/// Promotes nulls produced by ROLLUP / GROUPING SETS to total markers.
///
/// Grouping indicator columns drive the substitution when present (they
/// distinguish a super-aggregate from a genuinely null dimension value);
/// otherwise plain nulls are promoted. The row aggregating over every
/// grouping column gets the grand-total marker when more than one column is
/// grouped on.
pub fn replace_total_cell_values(table: &mut Table, scope: &QueryScope) {
    let rolled: Vec<String> = scope
        .rolled_up_columns()
        .iter()
        .map(|f| f.name.clone())
        .collect();
    if rolled.is_empty() {
        return;
    }

    let rows = table.count();
    let mut aggregated: Vec<Vec<bool>> = Vec::with_capacity(rolled.len());
    for column in &rolled {
        let indicator = table.column(&grouping_alias(column));
        let cells = table.column(column);
        let flags = (0..rows)
            .map(|row| match indicator {
                Some(ind) => ind[row].as_i64() == Some(1),
                None => cells.is_some_and(|c| c[row].is_null()),
            })
            .collect();
        aggregated.push(flags);
    }

    let grand_possible = scope.columns.len() > 1 && rolled.len() == scope.columns.len();
    for row in 0..rows {
        let all_aggregated = aggregated.iter().all(|flags| flags[row]);
        let marker = value::total_marker(grand_possible && all_aggregated);
        for (i, column) in rolled.iter().enumerate() {
            if aggregated[i][row] {
                if let Some(col) = table.column_mut(column) {
                    col[row] = marker.clone();
                }
            }
        }
    }
}

/// Final column projection: dimensions in user-declared order, then measures
/// in declaration order. Backend-only columns disappear here.
pub fn select_and_order_columns(
    table: &Table,
    dimensions: &[String],
    measures: &[String],
) -> Result<Table> {
    let mut names: Vec<String> = dimensions.to_vec();
    names.extend(measures.iter().cloned());
    table.select(&names)
}

/// Stable row sort: user orderings first (in declaration order), then the
/// remaining dimension columns lexicographically. Total markers sort last
/// unless the column's ordering disables that.
pub fn order_rows(table: &mut Table, orders: &[OrderDto], dimensions: &[String]) {
    let mut chain: Vec<OrderDto> = orders.to_vec();
    for dim in dimensions {
        if !chain.iter().any(|o| &o.column == dim) {
            chain.push(OrderDto {
                column: dim.clone(),
                direction: None,
                first: Vec::new(),
                totals_last: true,
            });
        }
    }
    chain.retain(|o| table.contains_column(&o.column));
    if chain.is_empty() || table.count() < 2 {
        return;
    }

    let columns: Vec<&Vec<Value>> = chain
        .iter()
        .map(|o| table.column(&o.column).expect("retained above"))
        .collect();

    let mut permutation: Vec<usize> = (0..table.count()).collect();
    permutation.sort_by(|&a, &b| {
        for (order, column) in chain.iter().zip(&columns) {
            let ordering = compare_cells(order, &column[a], &column[b]);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    table.permute_rows(&permutation);
}

fn compare_cells(order: &OrderDto, a: &Value, b: &Value) -> Ordering {
    if order.totals_last {
        match (value::is_total_marker(a), value::is_total_marker(b)) {
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            _ => {}
        }
    }
    if !order.first.is_empty() {
        let position = |v: &Value| v.as_str().and_then(|s| order.first.iter().position(|f| f == s));
        match (position(a), position(b)) {
            (Some(x), Some(y)) => return x.cmp(&y),
            (Some(_), None) => return Ordering::Less,
            (None, Some(_)) => return Ordering::Greater,
            (None, None) => {}
        }
    }
    let ordering = value::compare(a, b);
    match order.direction {
        Some(Direction::Desc) => ordering.reverse(),
        _ => ordering,
    }
}

/// Materializes the pivoted view: one column per distinct column-tuple per
/// value alias, rows identified by the row-field tuples.
pub fn pivot(
    table: &Table,
    rows: &[String],
    columns: &[String],
    values: &[String],
) -> Result<Table> {
    let row_fields: Vec<Field> = rows
        .iter()
        .map(|name| {
            table
                .headers()
                .into_iter()
                .find(|f| &f.name == name)
                .cloned()
                .ok_or_else(|| LatticeError::Execution(format!("pivot row field {name} missing")))
        })
        .collect::<Result<_>>()?;

    let tuple_of = |names: &[String], row: usize| -> Vec<Value> {
        names
            .iter()
            .map(|n| table.column(n).map(|c| c[row].clone()).unwrap_or(Value::Null))
            .collect()
    };

    let mut row_tuples: Vec<Vec<Value>> = Vec::new();
    let mut col_tuples: Vec<Vec<Value>> = Vec::new();
    let mut cells: HashMap<(String, String), usize> = HashMap::new();
    for row in 0..table.count() {
        let r = tuple_of(rows, row);
        let c = tuple_of(columns, row);
        if !row_tuples.contains(&r) {
            row_tuples.push(r.clone());
        }
        if !col_tuples.contains(&c) {
            col_tuples.push(c.clone());
        }
        cells.insert((tuple_key(&r)?, tuple_key(&c)?), row);
    }

    let mut pivoted = Table::new();
    for (i, field) in row_fields.iter().enumerate() {
        let column = row_tuples.iter().map(|t| t[i].clone()).collect();
        pivoted.add_column(field.clone(), column)?;
    }
    for col_tuple in &col_tuples {
        for alias in values {
            let source = table.column(alias).ok_or_else(|| {
                LatticeError::Execution(format!("pivot value column {alias} missing"))
            })?;
            let column: Vec<Value> = row_tuples
                .iter()
                .map(|row_tuple| {
                    let key = (
                        tuple_key(row_tuple).expect("serializable"),
                        tuple_key(col_tuple).expect("serializable"),
                    );
                    cells.get(&key).map_or(Value::Null, |&r| source[r].clone())
                })
                .collect();
            pivoted.add_column(
                Field::new(pivot_header(col_tuple, alias), FieldType::Floating),
                column,
            )?;
        }
    }
    Ok(pivoted)
}

fn tuple_key(tuple: &[Value]) -> Result<String> {
    serde_json::to_string(tuple).map_err(Into::into)
}

fn pivot_header(col_tuple: &[Value], alias: &str) -> String {
    if col_tuple.is_empty() {
        return alias.to_string();
    }
    let parts: Vec<String> = col_tuple
        .iter()
        .map(|v| match v.as_str() {
            Some(s) => s.to_string(),
            None => v.to_string(),
        })
        .collect();
    format!("{} - {}", parts.join(" / "), alias)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(columns: Vec<(&str, FieldType, Vec<Value>)>) -> Table {
        let mut t = Table::new();
        for (name, ft, values) in columns {
            t.add_column(Field::new(name, ft), values).unwrap();
        }
        t
    }

    #[test]
    fn reshape_repeats_rows_per_containing_group() {
        let t = table(vec![
            (
                "country",
                FieldType::String,
                vec![json!("FR"), json!("US"), json!("JP")],
            ),
            (
                "revenue",
                FieldType::Floating,
                vec![json!(10.0), json!(20.0), json!(5.0)],
            ),
        ]);
        let set = ColumnSet::Group {
            name: "bloc".to_string(),
            field: "country".to_string(),
            groups: vec![
                ("west".to_string(), vec!["FR".to_string(), "US".to_string()]),
                ("atlantic".to_string(), vec!["US".to_string()]),
            ],
        };
        let reshaped = reshape_with_groups(&t, &[set]).unwrap();
        // FR in one group, US in two, JP in none.
        assert_eq!(reshaped.count(), 3);
        assert_eq!(
            reshaped.column("bloc").unwrap(),
            &vec![json!("west"), json!("west"), json!("atlantic")]
        );
        assert_eq!(
            reshaped.column("revenue").unwrap(),
            &vec![json!(10.0), json!(20.0), json!(20.0)]
        );
    }

    #[test]
    fn totals_use_grouping_indicators_when_present() {
        let mut t = table(vec![
            (
                "country",
                FieldType::String,
                vec![json!("FR"), Value::Null, Value::Null],
            ),
            (
                "revenue",
                FieldType::Floating,
                vec![json!(10.0), json!(1.0), json!(11.0)],
            ),
            (
                &grouping_alias("country"),
                FieldType::Integer,
                vec![json!(0), json!(0), json!(1)],
            ),
        ]);
        let scope = QueryScope {
            table: "sales".to_string(),
            joins: Vec::new(),
            columns: vec![Field::new("country", FieldType::String)],
            rollup_columns: vec![Field::new("country", FieldType::String)],
            grouping_sets: Vec::new(),
            criteria: None,
            limit: 10,
            virtual_tables: Vec::new(),
            period_shift: None,
        };
        replace_total_cell_values(&mut t, &scope);
        let country = t.column("country").unwrap();
        // Row 1 is a genuine null value, not a super-aggregate.
        assert_eq!(country[0], json!("FR"));
        assert_eq!(country[1], Value::Null);
        assert_eq!(country[2], json!(value::TOTAL));
    }

    #[test]
    fn grand_total_needs_every_column_aggregated() {
        let mut t = table(vec![
            (
                "continent",
                FieldType::String,
                vec![json!("EU"), Value::Null, Value::Null],
            ),
            (
                "country",
                FieldType::String,
                vec![json!("FR"), Value::Null, Value::Null],
            ),
            (
                "revenue",
                FieldType::Floating,
                vec![json!(10.0), json!(30.0), json!(30.0)],
            ),
        ]);
        // No indicators: plain null substitution. Rows 1-2 aggregate both
        // columns, so both get the grand-total marker.
        let scope = QueryScope {
            table: "sales".to_string(),
            joins: Vec::new(),
            columns: vec![
                Field::new("continent", FieldType::String),
                Field::new("country", FieldType::String),
            ],
            rollup_columns: vec![
                Field::new("continent", FieldType::String),
                Field::new("country", FieldType::String),
            ],
            grouping_sets: Vec::new(),
            criteria: None,
            limit: 10,
            virtual_tables: Vec::new(),
            period_shift: None,
        };
        replace_total_cell_values(&mut t, &scope);
        assert_eq!(t.column("continent").unwrap()[1], json!(value::GRAND_TOTAL));
        assert_eq!(t.column("country").unwrap()[2], json!(value::GRAND_TOTAL));
    }

    #[test]
    fn order_rows_sorts_totals_last() {
        let mut t = table(vec![(
            "country",
            FieldType::String,
            vec![json!(value::TOTAL), json!("US"), json!("FR")],
        )]);
        order_rows(&mut t, &[], &["country".to_string()]);
        assert_eq!(
            t.column("country").unwrap(),
            &vec![json!("FR"), json!("US"), json!(value::TOTAL)]
        );
    }

    #[test]
    fn explicit_first_values_pin_the_head_of_the_sort() {
        let mut t = table(vec![(
            "country",
            FieldType::String,
            vec![json!("FR"), json!("JP"), json!("US")],
        )]);
        let order = OrderDto {
            column: "country".to_string(),
            direction: None,
            first: vec!["US".to_string()],
            totals_last: true,
        };
        order_rows(&mut t, &[order], &["country".to_string()]);
        assert_eq!(
            t.column("country").unwrap(),
            &vec![json!("US"), json!("FR"), json!("JP")]
        );
    }

    #[test]
    fn descending_order_is_respected() {
        let mut t = table(vec![(
            "year",
            FieldType::Integer,
            vec![json!(2021), json!(2023), json!(2022)],
        )]);
        order_rows(&mut t, &[OrderDto::desc("year")], &["year".to_string()]);
        assert_eq!(
            t.column("year").unwrap(),
            &vec![json!(2023), json!(2022), json!(2021)]
        );
    }

    #[test]
    fn pivot_produces_one_column_per_tuple_and_alias() {
        let t = table(vec![
            (
                "country",
                FieldType::String,
                vec![json!("FR"), json!("FR"), json!("US")],
            ),
            (
                "year",
                FieldType::Integer,
                vec![json!(2022), json!(2023), json!(2022)],
            ),
            (
                "revenue",
                FieldType::Floating,
                vec![json!(10.0), json!(12.0), json!(20.0)],
            ),
        ]);
        let pivoted = pivot(
            &t,
            &["country".to_string()],
            &["year".to_string()],
            &["revenue".to_string()],
        )
        .unwrap();
        assert_eq!(pivoted.count(), 2);
        let names: Vec<String> = pivoted.headers().iter().map(|f| f.name.clone()).collect();
        assert_eq!(names, vec!["country", "2022 - revenue", "2023 - revenue"]);
        // US has no 2023 cell.
        assert_eq!(pivoted.column("2023 - revenue").unwrap()[1], Value::Null);
    }
}
