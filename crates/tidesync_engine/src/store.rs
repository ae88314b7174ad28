//! Local data source abstraction.
//!
//! The engine never talks to a concrete database; it goes through the
//! [`DataSource`] trait, which the embedding SDK implements over its
//! persistent store. [`InMemoryDataSource`] is the reference implementation
//! used throughout the test suite.

use parking_lot::RwLock;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use thiserror::Error;
use tidesync_types::{compare_values, Item, Query, SortDirection, SystemProperties};

/// Result of a query against a store.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryPage {
    /// Matching items, in query order.
    pub items: Vec<Item>,
    /// Unpaged match count, when the query asked for it.
    pub total_count: Option<usize>,
}

/// Errors surfaced by a data source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store cannot currently serve requests.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The underlying backend rejected the operation.
    #[error("store operation failed: {0}")]
    Backend(String),

    /// A stored record is structurally invalid.
    #[error("malformed stored record: {0}")]
    Corrupt(String),
}

/// The local persistent store consumed by the engine.
///
/// All writes the engine issues against this trait happen inside the writer
/// domain; reads may come from any thread and must observe a consistent
/// snapshot per individual call.
pub trait DataSource: Send + Sync {
    /// Inserts or replaces items in a table, keyed by their `id` field.
    fn upsert(&self, table: &str, items: &[Item]) -> Result<(), StoreError>;

    /// Removes rows by id. Missing ids are ignored.
    fn delete(&self, table: &str, ids: &[String]) -> Result<(), StoreError>;

    /// Removes every row matching the query.
    fn delete_by_query(&self, query: &Query) -> Result<(), StoreError>;

    /// Reads a single row.
    fn read(&self, table: &str, item_id: &str) -> Result<Option<Item>, StoreError>;

    /// Reads rows matching a query.
    fn read_by_query(&self, query: &Query) -> Result<QueryPage, StoreError>;

    /// The system properties the server must return for a table.
    fn system_properties_for_table(&self, _table: &str) -> SystemProperties {
        SystemProperties::VERSION
    }

    /// Name of the reserved table holding pending operations.
    fn operation_table_name(&self) -> &str {
        "__operations"
    }

    /// Name of the reserved table holding config rows (delta tokens).
    fn config_table_name(&self) -> &str {
        "__config"
    }
}

/// Evaluates a query over a row set: filter, order, count, page, project.
///
/// Shared by [`InMemoryDataSource`] and the mock remote so both sides of the
/// engine agree on query semantics in tests.
pub fn apply_query(rows: Vec<Item>, query: &Query) -> QueryPage {
    let mut matched: Vec<Item> = rows
        .into_iter()
        .filter(|item| query.predicate.matches(item))
        .collect();

    let total_count = query.include_total_count.then_some(matched.len());

    if !query.order_by.is_empty() {
        matched.sort_by(|a, b| {
            for (field, direction) in &query.order_by {
                let ord = compare_values(
                    a.get(field).unwrap_or(&Value::Null),
                    b.get(field).unwrap_or(&Value::Null),
                )
                .unwrap_or(Ordering::Equal);
                let ord = match direction {
                    SortDirection::Ascending => ord,
                    SortDirection::Descending => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    let mut items: Vec<Item> = matched
        .into_iter()
        .skip(query.fetch_offset)
        .take(query.fetch_limit.unwrap_or(usize::MAX))
        .collect();

    if !query.select_fields.is_empty() {
        items = items
            .into_iter()
            .map(|item| {
                query
                    .select_fields
                    .iter()
                    .filter_map(|f| item.get(f).map(|v| (f.clone(), v.clone())))
                    .collect()
            })
            .collect();
    }

    QueryPage { items, total_count }
}

/// An in-memory data source.
///
/// Rows live in per-table ordered maps keyed by item id. Write failures can
/// be injected per table to drive the engine's partial-failure paths.
#[derive(Default)]
pub struct InMemoryDataSource {
    tables: RwLock<HashMap<String, BTreeMap<String, Item>>>,
    failing_tables: RwLock<HashSet<String>>,
    writes: AtomicUsize,
}

impl InMemoryDataSource {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write against `table` fail.
    pub fn fail_writes_for(&self, table: &str) {
        self.failing_tables.write().insert(table.to_string());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.failing_tables.write().clear();
    }

    /// Number of rows currently in a table.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    /// Number of successful write calls (upserts and deletes) so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(AtomicOrdering::SeqCst)
    }

    fn check_writable(&self, table: &str) -> Result<(), StoreError> {
        if self.failing_tables.read().contains(table) {
            return Err(StoreError::Unavailable(format!(
                "writes to {table} are failing"
            )));
        }
        Ok(())
    }
}

impl DataSource for InMemoryDataSource {
    fn upsert(&self, table: &str, items: &[Item]) -> Result<(), StoreError> {
        self.check_writable(table)?;
        let mut tables = self.tables.write();
        let rows = tables.entry(table.to_string()).or_default();
        for item in items {
            let id = item
                .id()
                .ok_or_else(|| StoreError::Backend("upsert of an item without an id".into()))?;
            rows.insert(id.to_string(), item.clone());
        }
        self.writes.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn delete(&self, table: &str, ids: &[String]) -> Result<(), StoreError> {
        self.check_writable(table)?;
        let mut tables = self.tables.write();
        if let Some(rows) = tables.get_mut(table) {
            for id in ids {
                rows.remove(id);
            }
        }
        self.writes.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn delete_by_query(&self, query: &Query) -> Result<(), StoreError> {
        self.check_writable(&query.table)?;
        let mut tables = self.tables.write();
        if let Some(rows) = tables.get_mut(&query.table) {
            rows.retain(|_, item| !query.predicate.matches(item));
        }
        self.writes.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    fn read(&self, table: &str, item_id: &str) -> Result<Option<Item>, StoreError> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|rows| rows.get(item_id))
            .cloned())
    }

    fn read_by_query(&self, query: &Query) -> Result<QueryPage, StoreError> {
        let rows = self
            .tables
            .read()
            .get(&query.table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        Ok(apply_query(rows, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidesync_types::{CompareOp, Predicate};

    fn item(value: Value) -> Item {
        Item::from_value(value).unwrap()
    }

    fn seeded() -> InMemoryDataSource {
        let store = InMemoryDataSource::new();
        store
            .upsert(
                "todo",
                &[
                    item(json!({"id": "a", "rank": 3, "done": false})),
                    item(json!({"id": "b", "rank": 1, "done": true})),
                    item(json!({"id": "c", "rank": 2, "done": false})),
                ],
            )
            .unwrap();
        store
    }

    #[test]
    fn upsert_and_read() {
        let store = seeded();
        assert_eq!(store.row_count("todo"), 3);

        let row = store.read("todo", "b").unwrap().unwrap();
        assert_eq!(row.get("rank"), Some(&json!(1)));

        assert!(store.read("todo", "zzz").unwrap().is_none());
        assert!(store.read("other", "a").unwrap().is_none());
    }

    #[test]
    fn upsert_replaces() {
        let store = seeded();
        store
            .upsert("todo", &[item(json!({"id": "a", "rank": 9}))])
            .unwrap();
        let row = store.read("todo", "a").unwrap().unwrap();
        assert_eq!(row.get("rank"), Some(&json!(9)));
        assert_eq!(store.row_count("todo"), 3);
    }

    #[test]
    fn delete_ignores_missing() {
        let store = seeded();
        store
            .delete("todo", &["a".to_string(), "ghost".to_string()])
            .unwrap();
        assert_eq!(store.row_count("todo"), 2);
    }

    #[test]
    fn query_filters_orders_and_pages() {
        let store = seeded();
        let query = Query::for_table("todo")
            .with_predicate(Predicate::eq("done", false))
            .with_order_by("rank", SortDirection::Ascending)
            .with_total_count(true)
            .with_limit(1);

        let page = store.read_by_query(&query).unwrap();
        assert_eq!(page.total_count, Some(2));
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id(), Some("c"));

        let rest = store.read_by_query(&query.clone().with_offset(1)).unwrap();
        assert_eq!(rest.items[0].id(), Some("a"));
    }

    #[test]
    fn query_projection() {
        let store = seeded();
        let query = Query::for_table("todo")
            .with_predicate(Predicate::eq("id", "a"))
            .with_select_fields(vec!["rank".into()]);

        let page = store.read_by_query(&query).unwrap();
        assert_eq!(page.items[0].len(), 1);
        assert_eq!(page.items[0].get("rank"), Some(&json!(3)));
    }

    #[test]
    fn delete_by_query() {
        let store = seeded();
        let query = Query::for_table("todo")
            .with_predicate(Predicate::compare("rank", CompareOp::Ge, 2));
        store.delete_by_query(&query).unwrap();

        assert_eq!(store.row_count("todo"), 1);
        assert!(store.read("todo", "b").unwrap().is_some());
    }

    #[test]
    fn injected_write_failures() {
        let store = seeded();
        store.fail_writes_for("todo");

        assert!(store.upsert("todo", &[item(json!({"id": "x"}))]).is_err());
        assert!(store.delete("todo", &["a".to_string()]).is_err());
        // Reads are unaffected.
        assert!(store.read("todo", "a").unwrap().is_some());

        store.clear_failures();
        assert!(store.delete("todo", &["a".to_string()]).is_ok());
    }
}
