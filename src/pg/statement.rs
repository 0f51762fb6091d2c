//! Prepared statement caching.
//!
//! A statement is reusable only for the same query text *and* the same
//! parameter type OIDs: a query bound once with an `int8` and once with a
//! `text` needs two server-side statements. The cache key carries both.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::protocol::FieldDescription;
use super::types::Oid;

/// Column descriptions shared between a cached statement and its results.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

const NAME_PREFIX: &str = "pgproto_s_";

// ============================================================================
// Prepared Statement
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey {
    pub query: String,
    pub param_oids: Vec<Oid>,
}

impl StatementKey {
    pub fn new(query: impl Into<String>, param_oids: Vec<Oid>) -> Self {
        Self {
            query: query.into(),
            param_oids,
        }
    }
}

/// A statement the server has parsed and described.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server-side name (e.g. `pgproto_s_3`)
    pub name: String,
    /// Parameter types as resolved by the server (ParameterDescription)
    pub param_types: Vec<Oid>,
    /// Result columns (RowDescription); empty for NoData
    pub columns: SharedColumns,
}

impl PreparedStatement {
    pub fn new(name: String, param_types: Vec<Oid>, columns: Vec<FieldDescription>) -> Self {
        Self {
            name,
            param_types,
            columns: Arc::new(columns),
        }
    }

    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }
}

// ============================================================================
// Statement Cache (O(1) LRU)
// ============================================================================

/// Per-connection LRU of prepared statements.
///
/// Eviction only forgets the statement locally. The caller owns closing it
/// on the server, so [`insert`](Self::insert) and [`clear`](Self::clear)
/// hand back the names that need a Close.
pub struct StatementCache {
    cache: LruCache<StatementKey, Arc<PreparedStatement>>,
    next_id: u64,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            next_id: 0,
        }
    }

    /// Look up a statement and mark it recently used.
    pub fn get(&mut self, key: &StatementKey) -> Option<Arc<PreparedStatement>> {
        self.cache.get(key).map(Arc::clone)
    }

    /// Look up without touching LRU order.
    pub fn peek(&self, key: &StatementKey) -> Option<Arc<PreparedStatement>> {
        self.cache.peek(key).map(Arc::clone)
    }

    #[inline]
    pub fn contains(&self, key: &StatementKey) -> bool {
        self.cache.contains(key)
    }

    /// Insert a statement. Returns the server name of the statement pushed
    /// out to make room, or of the one replaced under the same key.
    pub fn insert(
        &mut self,
        key: StatementKey,
        statement: Arc<PreparedStatement>,
    ) -> Option<String> {
        let name = statement.name.clone();
        self.cache
            .push(key, statement)
            .filter(|(_, old)| old.name != name)
            .map(|(_, old)| old.name.clone())
    }

    pub fn remove(&mut self, key: &StatementKey) -> Option<Arc<PreparedStatement>> {
        self.cache.pop(key)
    }

    /// A fresh server-side statement name, unique for this connection.
    pub fn next_statement_name(&mut self) -> String {
        self.next_id += 1;
        format!("{}{}", NAME_PREFIX, self.next_id)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    /// Forget every statement, returning their names for closing.
    pub fn clear(&mut self) -> Vec<String> {
        let names = self.cache.iter().map(|(_, stmt)| stmt.name.clone()).collect();
        self.cache.clear();
        names
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(100)
    }
}
