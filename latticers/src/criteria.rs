//! Structural row filters.
//!
//! Criteria participate in scope equality and cache keys, so every part of
//! the tree must be hashable; floating literals hash by bit pattern.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Literal {
    pub fn to_value(&self) -> Value {
        match self {
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::from(*i),
            Literal::Float(f) => crate::value::number(*f),
            Literal::Str(s) => Value::String(s.clone()),
        }
    }
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Float(v) => write!(f, "{v}"),
            Literal::Str(s) => write!(f, "{s}"),
        }
    }
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::Bool(a), Literal::Bool(b)) => a == b,
            (Literal::Int(a), Literal::Int(b)) => a == b,
            (Literal::Float(a), Literal::Float(b)) => a.to_bits() == b.to_bits(),
            (Literal::Str(a), Literal::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Literal {}

impl std::hash::Hash for Literal {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Literal::Bool(b) => {
                0u8.hash(state);
                b.hash(state);
            }
            Literal::Int(i) => {
                1u8.hash(state);
                i.hash(state);
            }
            Literal::Float(f) => {
                2u8.hash(state);
                f.to_bits().hash(state);
            }
            Literal::Str(s) => {
                3u8.hash(state);
                s.hash(state);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Like,
}

/// Filter tree passed through to the backend as part of the scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Criteria {
    And { criteria: Vec<Criteria> },
    Or { criteria: Vec<Criteria> },
    Condition {
        field: String,
        op: ConditionOp,
        values: Vec<Literal>,
    },
}

impl Criteria {
    pub fn eq(field: impl Into<String>, value: Literal) -> Self {
        Criteria::Condition {
            field: field.into(),
            op: ConditionOp::Eq,
            values: vec![value],
        }
    }

    pub fn all(criteria: Vec<Criteria>) -> Self {
        Criteria::And { criteria }
    }

    /// Field names referenced anywhere in the tree, for resolver validation.
    pub fn referenced_fields(&self, out: &mut Vec<String>) {
        match self {
            Criteria::And { criteria } | Criteria::Or { criteria } => {
                for c in criteria {
                    c.referenced_fields(out);
                }
            }
            Criteria::Condition { field, .. } => out.push(field.clone()),
        }
    }
}
