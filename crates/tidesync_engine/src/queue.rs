//! Durable ordered queue of pending operations.

use crate::error::{SyncError, SyncResult};
use crate::operation::TableOperation;
use crate::store::DataSource;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tidesync_types::Query;

/// Durable, ordered collection of pending operations plus a
/// (table, item id) → operation index.
///
/// Rows are persisted through the data source's reserved operation table, so
/// operation ids stay strictly increasing across process restarts. All
/// mutation entry points are called from the writer domain; the index lock
/// only protects cross-thread readers.
pub struct OperationQueue {
    store: Arc<dyn DataSource>,
    inner: RwLock<Inner>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Inner {
    /// Operations by id; iteration order is enqueue order.
    ops: BTreeMap<u64, TableOperation>,
    /// (table, item id) → operation id.
    by_target: HashMap<(String, String), u64>,
}

impl OperationQueue {
    /// Loads the queue from the data source's operation table.
    pub fn load(store: Arc<dyn DataSource>) -> SyncResult<Self> {
        let table = store.operation_table_name().to_string();
        let page = store.read_by_query(&Query::for_table(table))?;

        let mut inner = Inner::default();
        let mut max_id = 0;
        for row in &page.items {
            let op = TableOperation::from_item(row)?;
            max_id = max_id.max(op.id);
            inner
                .by_target
                .insert((op.table.clone(), op.item_id.clone()), op.id);
            inner.ops.insert(op.id, op);
        }
        tracing::debug!(pending = inner.ops.len(), "loaded operation queue");

        Ok(Self {
            store,
            inner: RwLock::new(inner),
            next_id: AtomicU64::new(max_id + 1),
        })
    }

    /// Allocates the next operation id. Monotonic for the queue's lifetime.
    pub fn next_operation_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// The pending operation targeting (table, item id), if any.
    #[must_use]
    pub fn operation_for_item(&self, table: &str, item_id: &str) -> Option<TableOperation> {
        let inner = self.inner.read();
        let id = inner
            .by_target
            .get(&(table.to_string(), item_id.to_string()))?;
        inner.ops.get(id).cloned()
    }

    /// Pending operations for a table, in operation-id order. With `item_id`
    /// given, the at-most-one matching operation.
    #[must_use]
    pub fn operations_for_table(&self, table: &str, item_id: Option<&str>) -> Vec<TableOperation> {
        match item_id {
            Some(id) => self.operation_for_item(table, id).into_iter().collect(),
            None => self
                .inner
                .read()
                .ops
                .values()
                .filter(|op| op.table == table)
                .cloned()
                .collect(),
        }
    }

    /// Every pending operation, in operation-id order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TableOperation> {
        self.inner.read().ops.values().cloned().collect()
    }

    /// Appends a new operation.
    ///
    /// Fails with `QueueConflict` if the target already has a pending
    /// operation; the caller should have condensed instead.
    pub fn add(&self, op: TableOperation) -> SyncResult<()> {
        let key = (op.table.clone(), op.item_id.clone());
        let mut inner = self.inner.write();
        if inner.by_target.contains_key(&key) {
            return Err(SyncError::QueueConflict {
                table: op.table,
                item_id: op.item_id,
            });
        }
        self.persist(&op)?;
        inner.by_target.insert(key, op.id);
        inner.ops.insert(op.id, op);
        Ok(())
    }

    /// Rewrites a stored operation after in-place condensation or a recorded
    /// push failure.
    pub fn update(&self, op: TableOperation) -> SyncResult<()> {
        let mut inner = self.inner.write();
        self.persist(&op)?;
        inner
            .by_target
            .insert((op.table.clone(), op.item_id.clone()), op.id);
        inner.ops.insert(op.id, op);
        Ok(())
    }

    /// Removes an operation by id, along with its recorded error state.
    /// Removing an absent operation is a no-op.
    pub fn remove(&self, op: &TableOperation) -> SyncResult<()> {
        let mut inner = self.inner.write();
        self.store
            .delete(self.store.operation_table_name(), &[op.id.to_string()])?;
        if inner.ops.remove(&op.id).is_some() {
            inner
                .by_target
                .remove(&(op.table.clone(), op.item_id.clone()));
        }
        Ok(())
    }

    /// Number of pending operations.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().ops.len()
    }

    /// Number of pending operations for one table.
    #[must_use]
    pub fn count_for_table(&self, table: &str) -> usize {
        self.inner
            .read()
            .ops
            .values()
            .filter(|op| op.table == table)
            .count()
    }

    /// True when the table has at least one pending operation.
    #[must_use]
    pub fn has_pending(&self, table: &str) -> bool {
        self.count_for_table(table) > 0
    }

    fn persist(&self, op: &TableOperation) -> SyncResult<()> {
        let row = op.to_item()?;
        self.store
            .upsert(self.store.operation_table_name(), &[row])?;
        Ok(())
    }
}
