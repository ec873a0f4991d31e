//! Process-level defaults.
//!
//! Read once at startup; tests that need a different limit set an explicit
//! one on the query instead of mutating the environment.

use once_cell::sync::Lazy;

pub const DEFAULT_QUERY_LIMIT: i64 = 10_000;

static QUERY_LIMIT: Lazy<i64> = Lazy::new(|| {
    std::env::var("LATTICE_QUERY_LIMIT")
        .ok()
        .and_then(|raw| raw.parse::<i64>().ok())
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_QUERY_LIMIT)
});

/// The limit applied when a query declares none (or a negative one).
pub fn default_query_limit() -> i64 {
    *QUERY_LIMIT
}
