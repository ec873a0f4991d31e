//! Post-aggregation measure evaluation.
//!
//! Runs after the prefetch stage: every primitive column the plan needs is
//! already materialized in `tables`. Each call computes one non-primitive
//! measure column for one scope, reading operand columns that the
//! topological order guarantees are present.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{LatticeError, Result};
use crate::measure::{Aggregation, BinaryOp, ComparisonMethod, Measure, ReferencePosition};
use crate::planner::NodeKey;
use crate::scope::QueryScope;
use crate::store::{Field, FieldType};
use crate::table::Table;
use crate::value;

pub fn evaluate(
    node: &NodeKey,
    tables: &mut HashMap<QueryScope, Table>,
    group_columns: &[String],
) -> Result<()> {
    let alias = node.measure.alias();
    if tables
        .get(&node.scope)
        .is_some_and(|t| t.contains_column(&alias))
    {
        return Ok(());
    }
    let (field, column) = match &node.measure {
        Measure::Binary {
            alias,
            op,
            left,
            right,
        } => evaluate_binary(node, alias, *op, left, right, tables)?,
        Measure::Comparison {
            alias,
            method,
            measure,
            reference,
        } => evaluate_comparison(node, alias, *method, measure, reference, tables, group_columns)?,
        Measure::Constant { value: literal } => {
            let rows = table_of(tables, &node.scope)?.count();
            let cell = literal.to_value();
            let field_type = match cell {
                Value::Number(ref n) if n.is_i64() => FieldType::Integer,
                Value::Number(_) => FieldType::Floating,
                Value::Bool(_) => FieldType::Boolean,
                _ => FieldType::String,
            };
            (
                Field::new(node.measure.alias(), field_type),
                vec![cell; rows],
            )
        }
        // Primitives were materialized by the prefetch stage.
        Measure::Aggregated { .. } | Measure::Vector { .. } | Measure::Expression { .. } => {
            return Ok(())
        }
    };

    table_of_mut(tables, &node.scope)?.add_column(field, column)
}

fn table_of<'t>(tables: &'t HashMap<QueryScope, Table>, scope: &QueryScope) -> Result<&'t Table> {
    tables.get(scope).ok_or_else(|| {
        LatticeError::Execution(format!("no materialized table for scope on {}", scope.table))
    })
}

fn table_of_mut<'t>(
    tables: &'t mut HashMap<QueryScope, Table>,
    scope: &QueryScope,
) -> Result<&'t mut Table> {
    tables.get_mut(scope).ok_or_else(|| {
        LatticeError::Execution(format!("no materialized table for scope on {}", scope.table))
    })
}

fn operand_column<'t>(table: &'t Table, measure: &Measure) -> Result<&'t Vec<Value>> {
    let alias = measure.alias();
    table.column(&alias).ok_or_else(|| {
        LatticeError::Execution(format!("operand column {alias} missing from scope table"))
    })
}

fn is_count_based(measure: &Measure) -> bool {
    matches!(
        measure,
        Measure::Aggregated {
            aggregation: Aggregation::Count,
            ..
        }
    )
}

fn evaluate_binary(
    node: &NodeKey,
    alias: &str,
    op: BinaryOp,
    left: &Measure,
    right: &Measure,
    tables: &HashMap<QueryScope, Table>,
) -> Result<(Field, Vec<Value>)> {
    let table = table_of(tables, &node.scope)?;
    let left_col = operand_column(table, left)?;
    let right_col = operand_column(table, right)?;

    let null_count_as_zero = op == BinaryOp::Divide && is_count_based(right);
    let column: Vec<Value> = left_col
        .iter()
        .zip(right_col.iter())
        .map(|(l, r)| apply_binary(op, l, r, null_count_as_zero))
        .collect();

    let integral = column.iter().all(|v| v.is_null() || v.as_i64().is_some());
    let field_type = if op == BinaryOp::Divide || !integral {
        FieldType::Floating
    } else {
        FieldType::Integer
    };
    Ok((Field::new(alias, field_type), column))
}

fn apply_binary(op: BinaryOp, left: &Value, right: &Value, null_count_as_zero: bool) -> Value {
    let right = if null_count_as_zero && right.is_null() {
        // Count denominators treat missing groups as empty, not unknown.
        Some(0.0)
    } else {
        value::as_f64(right)
    };
    let (Some(l), Some(r)) = (value::as_f64(left), right) else {
        return Value::Null;
    };

    match op {
        BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply => {
            // Integer operands stay integral for non-ratio ops.
            if let (Some(li), Some(ri)) = (value::as_i64(left), right_as_i64(op, r)) {
                let out = match op {
                    BinaryOp::Add => li.checked_add(ri),
                    BinaryOp::Subtract => li.checked_sub(ri),
                    BinaryOp::Multiply => li.checked_mul(ri),
                    BinaryOp::Divide => unreachable!(),
                };
                if let Some(out) = out {
                    return Value::from(out);
                }
            }
            let out = match op {
                BinaryOp::Add => l + r,
                BinaryOp::Subtract => l - r,
                BinaryOp::Multiply => l * r,
                BinaryOp::Divide => unreachable!(),
            };
            value::number(out)
        }
        BinaryOp::Divide => {
            if r == 0.0 {
                Value::Null
            } else {
                value::number(l / r)
            }
        }
    }
}

fn right_as_i64(op: BinaryOp, r: f64) -> Option<i64> {
    if op == BinaryOp::Divide {
        return None;
    }
    if r.fract() == 0.0 && r.abs() < i64::MAX as f64 {
        Some(r as i64)
    } else {
        None
    }
}

fn evaluate_comparison(
    node: &NodeKey,
    alias: &str,
    method: ComparisonMethod,
    operand: &Measure,
    reference: &ReferencePosition,
    tables: &HashMap<QueryScope, Table>,
    group_columns: &[String],
) -> Result<(Field, Vec<Value>)> {
    let base_table = table_of(tables, &node.scope)?;
    let ref_scope = reference.shifted_scope(&node.scope);
    let ref_table = table_of(tables, &ref_scope)?;
    let base_col = operand_column(base_table, operand)?;
    let ref_col = operand_column(ref_table, operand)?;

    // Rows align on the reference scope's grouping columns (plus synthetic
    // group columns when both sides carry them).
    let mut align: Vec<String> = ref_scope.columns.iter().map(|f| f.name.clone()).collect();
    for group in group_columns {
        if base_table.contains_column(group) && ref_table.contains_column(group) {
            align.push(group.clone());
        }
    }
    align.retain(|c| base_table.contains_column(c) && ref_table.contains_column(c));

    let mut index: HashMap<String, usize> = HashMap::new();
    for row in 0..ref_table.count() {
        let key = alignment_key(ref_table, &align, row)?;
        index.entry(key).or_insert(row);
    }

    let mut column = Vec::with_capacity(base_table.count());
    for row in 0..base_table.count() {
        let key = alignment_key(base_table, &align, row)?;
        let reference_value = index.get(&key).map(|&r| &ref_col[r]);
        column.push(combine(method, &base_col[row], reference_value));
    }
    Ok((Field::new(alias, FieldType::Floating), column))
}

fn alignment_key(table: &Table, columns: &[String], row: usize) -> Result<String> {
    let cells: Vec<&Value> = columns
        .iter()
        .map(|c| table.column(c).map(|col| &col[row]))
        .collect::<Option<_>>()
        .ok_or_else(|| {
            LatticeError::Execution("alignment column missing from scope table".to_string())
        })?;
    serde_json::to_string(&cells).map_err(Into::into)
}

fn combine(method: ComparisonMethod, base: &Value, reference: Option<&Value>) -> Value {
    // Missing reference row means there is nothing to compare against.
    let Some(reference) = reference else {
        return Value::Null;
    };
    let (Some(b), Some(r)) = (value::as_f64(base), value::as_f64(reference)) else {
        return Value::Null;
    };
    match method {
        ComparisonMethod::AbsoluteDifference => value::number(b - r),
        ComparisonMethod::RelativeDifference => {
            if r == 0.0 {
                Value::Null
            } else {
                value::number((b - r) / r)
            }
        }
        ComparisonMethod::Divide => {
            if r == 0.0 {
                Value::Null
            } else {
                value::number(b / r)
            }
        }
    }
}
