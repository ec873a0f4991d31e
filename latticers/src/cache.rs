//! Shared query cache.
//!
//! Keyed by (scope, principal); each entry stores the scope's grouping
//! columns (for row alignment) plus one column per cached measure alias.
//! Entries survive across queries; partial hits are the normal case: the
//! executor fetches only the missing measures for a scope and merges the
//! rest from here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::measure::Measure;
use crate::scope::QueryScope;
use crate::store::Field;
use crate::table::Table;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub scope: QueryScope,
    pub principal: Option<String>,
}

impl CacheKey {
    pub fn new(scope: QueryScope, principal: Option<String>) -> Self {
        Self { scope, principal }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Contract between the executor and a cache implementation.
///
/// Implementations are internally thread-safe; each call observes a
/// serializable view of the cache contents.
pub trait QueryCache: Send + Sync {
    /// Whether a column for this measure is cached under `key`. Counts as a
    /// hit or a miss in the principal's stats.
    fn contains(&self, measure: &Measure, key: &CacheKey) -> bool;

    /// A skeleton table holding only the grouping columns, sized and ordered
    /// identically to what the backend would have returned at this scope.
    /// `None` when the key has no entry.
    fn create_raw_result(&self, key: &CacheKey) -> Option<Table>;

    /// Copies cached columns for `measures` into `table`, preserving row
    /// alignment. Returns false (after evicting the entry) when the entry is
    /// inconsistent with the table; the caller must refetch.
    fn contribute_to_result(
        &self,
        table: &mut Table,
        measures: &[Measure],
        key: &CacheKey,
    ) -> bool;

    /// Stores columns for `measures` out of `table`. Measures that fail
    /// [`Measure::can_be_cached`] are ignored.
    fn contribute_to_cache(&self, table: &Table, measures: &[Measure], key: &CacheKey);

    fn stats(&self, principal: Option<&str>) -> CacheStats;

    /// Drops every entry belonging to the principal. Counters survive.
    fn clear(&self, principal: Option<&str>);

    fn invalidate_all(&self);
}

/// No-op cache: everything is a miss, nothing is stored.
#[derive(Debug, Default)]
pub struct EmptyCache;

impl QueryCache for EmptyCache {
    fn contains(&self, _measure: &Measure, _key: &CacheKey) -> bool {
        false
    }

    fn create_raw_result(&self, _key: &CacheKey) -> Option<Table> {
        None
    }

    fn contribute_to_result(
        &self,
        _table: &mut Table,
        _measures: &[Measure],
        _key: &CacheKey,
    ) -> bool {
        true
    }

    fn contribute_to_cache(&self, _table: &Table, _measures: &[Measure], _key: &CacheKey) {}

    fn stats(&self, _principal: Option<&str>) -> CacheStats {
        CacheStats::default()
    }

    fn clear(&self, _principal: Option<&str>) {}

    fn invalidate_all(&self) {}
}

struct Entry {
    grouping: Vec<(Field, Vec<serde_json::Value>)>,
    measures: HashMap<String, (Field, Vec<serde_json::Value>)>,
    touched: u64,
}

impl Entry {
    fn rows(&self) -> usize {
        self.grouping
            .first()
            .map(|(_, col)| col.len())
            .or_else(|| self.measures.values().next().map(|(_, col)| col.len()))
            .unwrap_or(0)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, Entry>,
    stats: HashMap<Option<String>, CacheStats>,
    tick: u64,
}

impl Inner {
    fn stats_mut(&mut self, principal: &Option<String>) -> &mut CacheStats {
        self.stats.entry(principal.clone()).or_default()
    }

    fn touch(&mut self, key: &CacheKey) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.touched = tick;
        }
    }

    fn evict(&mut self, key: &CacheKey) {
        if self.entries.remove(key).is_some() {
            self.stats_mut(&key.principal).evictions += 1;
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.touched)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.evict(&key);
        }
    }
}

/// Size-bounded LRU keyed by (scope, principal), with hit / miss / eviction
/// counters per principal. The process-wide default; see [`global_cache`].
pub struct InMemoryCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl InMemoryCache {
    pub const DEFAULT_CAPACITY: usize = 128;

    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned cache lock only ever means a panic mid-update; the
        // entries themselves stay structurally valid.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl QueryCache for InMemoryCache {
    fn contains(&self, measure: &Measure, key: &CacheKey) -> bool {
        let mut inner = self.lock();
        let alias = measure.alias();
        let hit = inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.measures.contains_key(&alias));
        if hit {
            inner.stats_mut(&key.principal).hits += 1;
            inner.touch(key);
        } else {
            inner.stats_mut(&key.principal).misses += 1;
        }
        hit
    }

    fn create_raw_result(&self, key: &CacheKey) -> Option<Table> {
        let mut inner = self.lock();
        inner.touch(key);
        let entry = inner.entries.get(key)?;
        Table::from_columns(entry.grouping.clone()).ok()
    }

    fn contribute_to_result(
        &self,
        table: &mut Table,
        measures: &[Measure],
        key: &CacheKey,
    ) -> bool {
        let mut inner = self.lock();
        let rows = table.count();
        let consistent = {
            let Some(entry) = inner.entries.get(key) else {
                return false;
            };
            entry.rows() == rows
                && measures.iter().all(|m| {
                    entry
                        .measures
                        .get(&m.alias())
                        .is_some_and(|(_, col)| col.len() == rows)
                })
        };
        if !consistent {
            // A length mismatch means the entry no longer matches what the
            // backend returns at this scope; drop it and report a miss.
            inner.evict(key);
            return false;
        }
        let entry = inner.entries.get(key).expect("checked above");
        let mut columns = Vec::with_capacity(measures.len());
        for measure in measures {
            let (field, column) = entry.measures[&measure.alias()].clone();
            columns.push((field, column));
        }
        drop(inner);
        for (field, column) in columns {
            // Lengths were validated against the entry; this cannot fail.
            let _ = table.add_column(field, column);
        }
        self.lock().touch(key);
        true
    }

    fn contribute_to_cache(&self, table: &Table, measures: &[Measure], key: &CacheKey) {
        let grouping: Vec<(Field, Vec<serde_json::Value>)> = key
            .scope
            .columns
            .iter()
            .filter_map(|field| {
                table
                    .column(&field.name)
                    .map(|col| (field.clone(), col.clone()))
            })
            .collect();

        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;

        let stale = inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.rows() != table.count());
        if stale {
            inner.evict(key);
        }
        if !inner.entries.contains_key(key) && inner.entries.len() >= self.capacity {
            inner.evict_oldest();
        }

        let entry = inner.entries.entry(key.clone()).or_insert_with(|| Entry {
            grouping,
            measures: HashMap::new(),
            touched: tick,
        });
        entry.touched = tick;
        for measure in measures {
            if !measure.can_be_cached() {
                continue;
            }
            let alias = measure.alias();
            if let Some(index) = table.index_of(&alias) {
                let field = table.headers()[index].clone();
                let column = table.column(&alias).expect("index resolved").clone();
                entry.measures.insert(alias, (field, column));
            }
        }
    }

    fn stats(&self, principal: Option<&str>) -> CacheStats {
        let inner = self.lock();
        inner
            .stats
            .get(&principal.map(|p| p.to_string()))
            .copied()
            .unwrap_or_default()
    }

    fn clear(&self, principal: Option<&str>) {
        let mut inner = self.lock();
        let principal = principal.map(|p| p.to_string());
        inner.entries.retain(|key, _| key.principal != principal);
    }

    fn invalidate_all(&self) {
        self.lock().entries.clear();
    }
}

static GLOBAL_CACHE: Lazy<Arc<InMemoryCache>> =
    Lazy::new(|| Arc::new(InMemoryCache::default()));

/// Process-wide cache shared by executors that do not bring their own.
pub fn global_cache() -> Arc<InMemoryCache> {
    GLOBAL_CACHE.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::Measure;
    use crate::store::FieldType;
    use serde_json::json;

    fn scope() -> QueryScope {
        QueryScope::new("sales", vec![Field::new("country", FieldType::String)])
    }

    fn table_with_revenue() -> Table {
        let mut table = Table::new();
        table
            .add_column(
                Field::new("country", FieldType::String),
                vec![json!("FR"), json!("US")],
            )
            .unwrap();
        table
            .add_column(
                Field::new("revenue", FieldType::Floating),
                vec![json!(10.0), json!(20.0)],
            )
            .unwrap();
        table
    }

    #[test]
    fn contribute_then_contains_then_result() {
        let cache = InMemoryCache::default();
        let key = CacheKey::new(scope(), Some("alice".to_string()));
        let revenue = Measure::sum("revenue", "revenue");

        assert!(!cache.contains(&revenue, &key));
        cache.contribute_to_cache(&table_with_revenue(), &[revenue.clone()], &key);
        assert!(cache.contains(&revenue, &key));

        let mut skeleton = cache.create_raw_result(&key).unwrap();
        assert_eq!(skeleton.count(), 2);
        assert!(!skeleton.contains_column("revenue"));
        assert!(cache.contribute_to_result(&mut skeleton, &[revenue], &key));
        assert_eq!(skeleton.column("revenue").unwrap()[1], json!(20.0));

        let stats = cache.stats(Some("alice"));
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn non_cacheable_measures_are_never_stored() {
        let cache = InMemoryCache::default();
        let key = CacheKey::new(scope(), None);
        let grouping = crate::measure::grouping_measure("country");
        let mut table = table_with_revenue();
        table
            .add_column(
                Field::new(grouping.alias(), FieldType::Integer),
                vec![json!(0), json!(0)],
            )
            .unwrap();
        cache.contribute_to_cache(&table, &[grouping.clone()], &key);
        assert!(!cache.contains(&grouping, &key));
    }

    #[test]
    fn length_mismatch_evicts_and_reports_miss() {
        let cache = InMemoryCache::default();
        let key = CacheKey::new(scope(), None);
        let revenue = Measure::sum("revenue", "revenue");
        cache.contribute_to_cache(&table_with_revenue(), &[revenue.clone()], &key);

        let mut shorter = Table::new();
        shorter
            .add_column(Field::new("country", FieldType::String), vec![json!("FR")])
            .unwrap();
        assert!(!cache.contribute_to_result(&mut shorter, &[revenue.clone()], &key));
        // Entry was evicted; a fresh lookup is a miss.
        assert!(!cache.contains(&revenue, &key));
        assert_eq!(cache.stats(None).evictions, 1);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = InMemoryCache::new(2);
        let revenue = Measure::sum("revenue", "revenue");
        let keys: Vec<CacheKey> = (0..3)
            .map(|i| {
                let mut s = scope();
                s.table = format!("sales_{i}");
                CacheKey::new(s, None)
            })
            .collect();

        cache.contribute_to_cache(&table_with_revenue(), &[revenue.clone()], &keys[0]);
        cache.contribute_to_cache(&table_with_revenue(), &[revenue.clone()], &keys[1]);
        // Refresh key 0 so key 1 becomes the eviction candidate.
        assert!(cache.contains(&revenue, &keys[0]));
        cache.contribute_to_cache(&table_with_revenue(), &[revenue.clone()], &keys[2]);

        assert!(cache.contains(&revenue, &keys[0]));
        assert!(!cache.contains(&revenue, &keys[1]));
        assert_eq!(cache.stats(None).evictions, 1);
    }

    #[test]
    fn clear_is_scoped_to_the_principal() {
        let cache = InMemoryCache::default();
        let revenue = Measure::sum("revenue", "revenue");
        let alice = CacheKey::new(scope(), Some("alice".to_string()));
        let bob = CacheKey::new(scope(), Some("bob".to_string()));
        cache.contribute_to_cache(&table_with_revenue(), &[revenue.clone()], &alice);
        cache.contribute_to_cache(&table_with_revenue(), &[revenue.clone()], &bob);

        cache.clear(Some("alice"));
        assert!(!cache.contains(&revenue, &alice));
        assert!(cache.contains(&revenue, &bob));
    }
}
