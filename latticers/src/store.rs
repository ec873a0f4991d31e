//! Schema catalog: stores and their typed fields.
//!
//! The catalog is owned by the backing [`QueryEngine`](crate::engine::QueryEngine);
//! the resolver is the only component that consults it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Integer,
    Floating,
    Boolean,
    Date,
    DateTime,
    String,
    RepeatedInteger,
    RepeatedString,
    /// Serialized opaque value; cells hold JSON strings.
    Object,
}

impl FieldType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Floating)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, FieldType::Date | FieldType::DateTime)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// A physical table known to the backend, with its typed fields.
///
/// Field names are unique within a store; [`Store::new`] keeps the first
/// occurrence when duplicates slip in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    pub name: String,
    pub fields: Vec<Field>,
}

impl Store {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let fields = fields
            .into_iter()
            .filter(|f| seen.insert(f.name.clone()))
            .collect();
        Self {
            name: name.into(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// The schema catalog exposed by a backend.
#[derive(Debug, Clone, Default)]
pub struct Datastore {
    stores: HashMap<String, Store>,
}

impl Datastore {
    pub fn new(stores: Vec<Store>) -> Self {
        Self {
            stores: stores.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    pub fn stores_by_name(&self) -> &HashMap<String, Store> {
        &self.stores
    }

    pub fn store(&self, name: &str) -> Option<&Store> {
        self.stores.get(name)
    }

    pub fn insert(&mut self, store: Store) {
        self.stores.insert(store.name.clone(), store);
    }

    pub fn remove(&mut self, name: &str) -> Option<Store> {
        self.stores.remove(name)
    }
}
