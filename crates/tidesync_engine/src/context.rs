//! The sync coordinator.
//!
//! `SyncContext` owns the serialized writer domain, routes local mutations
//! through condensation, and schedules push/pull/purge on a single-slot
//! lane. Every public entry point returns immediately and delivers its
//! completion on the callback executor.

use crate::config::SyncConfig;
use crate::config_store::ConfigStore;
use crate::error::{SyncError, SyncResult, TableOperationError};
use crate::executor::{CallbackPool, CancelToken, SerialExecutor};
use crate::operation::{condense, CondenseAction, OperationKind, TableOperation};
use crate::push::{self, DefaultPushHandler, PushHandler};
use crate::queue::OperationQueue;
use crate::remote::RemoteClient;
use crate::store::DataSource;
use crate::table::SyncTable;
use crate::{pull, purge};
use std::slice;
use std::sync::Arc;
use tidesync_types::{Item, Query};
use uuid::Uuid;

/// Builder for a [`SyncContext`].
#[derive(Default)]
pub struct SyncContextBuilder {
    store: Option<Arc<dyn DataSource>>,
    remote: Option<Arc<dyn RemoteClient>>,
    push_handler: Option<Arc<dyn PushHandler>>,
    config: SyncConfig,
}

impl SyncContextBuilder {
    /// Wires the local data source.
    #[must_use]
    pub fn data_source(mut self, store: Arc<dyn DataSource>) -> Self {
        self.store = Some(store);
        self
    }

    /// Wires the remote client.
    #[must_use]
    pub fn remote_client(mut self, remote: Arc<dyn RemoteClient>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Overrides the default push handler.
    #[must_use]
    pub fn push_handler(mut self, handler: Arc<dyn PushHandler>) -> Self {
        self.push_handler = Some(handler);
        self
    }

    /// Sets the context configuration.
    #[must_use]
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the context, loading the operation queue from the store.
    pub fn build(self) -> SyncResult<Arc<SyncContext>> {
        let store = self.store.ok_or(SyncError::MissingDataSource)?;
        let remote = self.remote.ok_or(SyncError::MissingRemoteClient)?;
        let queue = Arc::new(OperationQueue::load(Arc::clone(&store))?);

        Ok(Arc::new(SyncContext {
            config_store: ConfigStore::new(Arc::clone(&store)),
            queue,
            remote,
            push_handler: self
                .push_handler
                .unwrap_or_else(|| Arc::new(DefaultPushHandler)),
            writer: SerialExecutor::new("tidesync-writer"),
            lane: SerialExecutor::new("tidesync-sync"),
            callbacks: Arc::new(CallbackPool::new(self.config.callback_workers)),
            config: self.config,
            store,
        }))
    }
}

/// Coordinator for one local store / remote endpoint pair.
///
/// Local mutations, queue writes, and delta-token writes all serialize
/// through the writer domain. Push, pull, and purge serialize through a
/// one-slot lane, so a pending push always completes (or aborts) before a
/// pull merges server data for the same table. The lane is owned per
/// context; two contexts never contend with each other.
pub struct SyncContext {
    pub(crate) store: Arc<dyn DataSource>,
    pub(crate) remote: Arc<dyn RemoteClient>,
    pub(crate) queue: Arc<OperationQueue>,
    pub(crate) config_store: ConfigStore,
    pub(crate) config: SyncConfig,
    pub(crate) push_handler: Arc<dyn PushHandler>,
    pub(crate) writer: SerialExecutor,
    lane: SerialExecutor,
    callbacks: Arc<CallbackPool>,
}

impl SyncContext {
    /// Starts building a context.
    #[must_use]
    pub fn builder() -> SyncContextBuilder {
        SyncContextBuilder::default()
    }

    /// A handle to one logical table.
    #[must_use]
    pub fn table(self: &Arc<Self>, name: impl Into<String>) -> SyncTable {
        SyncTable::new(Arc::clone(self), name)
    }

    /// Number of operations waiting to be pushed.
    #[must_use]
    pub fn pending_operation_count(&self) -> usize {
        self.queue.count()
    }

    /// The pending operations for a table, in operation-id order.
    #[must_use]
    pub fn pending_operations(&self, table: &str) -> Vec<TableOperation> {
        self.queue.operations_for_table(table, None)
    }

    /// Drains the operation queue to the remote endpoint.
    ///
    /// The returned token cancels the drain between operations; the queue is
    /// left intact. The completion receives `Ok(())` when everything pushed
    /// cleanly, or an aggregate error carrying the per-operation failures.
    pub fn push<F>(self: &Arc<Self>, completion: F) -> CancelToken
    where
        F: FnOnce(SyncResult<()>) + Send + 'static,
    {
        self.spawn_lane_task(completion, |ctx, token| push::run_push(ctx, token))
    }

    /// Resolves an errored operation by replacing the local row with a
    /// corrected item (system properties stripped, `__version` kept) and
    /// removing the operation.
    pub fn cancel_and_update_item<F>(
        self: &Arc<Self>,
        op_error: &TableOperationError,
        corrected: Item,
        completion: F,
    ) where
        F: FnOnce(SyncResult<()>) + Send + 'static,
    {
        let ctx = Arc::clone(self);
        let op_error = op_error.clone();
        self.writer.dispatch(move || {
            let result = ctx.cancel_in_writer(&op_error, Some(corrected));
            ctx.complete(completion, result);
        });
    }

    /// Resolves an errored operation by deleting the local row and removing
    /// the operation.
    pub fn cancel_and_discard_item<F>(
        self: &Arc<Self>,
        op_error: &TableOperationError,
        completion: F,
    ) where
        F: FnOnce(SyncResult<()>) + Send + 'static,
    {
        let ctx = Arc::clone(self);
        let op_error = op_error.clone();
        self.writer.dispatch(move || {
            let result = ctx.cancel_in_writer(&op_error, None);
            ctx.complete(completion, result);
        });
    }

    /// Schedules a pull on the lane. Called through [`SyncTable::pull`].
    pub(crate) fn pull_table<F>(
        self: &Arc<Self>,
        query: Query,
        query_id: Option<String>,
        completion: F,
    ) -> CancelToken
    where
        F: FnOnce(SyncResult<()>) + Send + 'static,
    {
        self.spawn_lane_task(completion, move |ctx, token| {
            pull::run_pull(ctx, &query, query_id.as_deref(), token)
        })
    }

    /// Schedules a purge on the lane. Called through [`SyncTable::purge`].
    pub(crate) fn purge_table<F>(
        self: &Arc<Self>,
        query: Query,
        query_id: Option<String>,
        force: bool,
        completion: F,
    ) where
        F: FnOnce(SyncResult<()>) + Send + 'static,
    {
        self.spawn_lane_task(completion, move |ctx, _token| {
            purge::run_purge(ctx, &query, query_id.as_deref(), force)
        });
    }

    /// Accepts a local mutation: validates identity, then condenses and
    /// applies it inside the writer domain.
    pub(crate) fn apply_local_mutation<F>(
        self: &Arc<Self>,
        table: String,
        mut item: Item,
        kind: OperationKind,
        completion: F,
    ) where
        F: FnOnce(SyncResult<Item>) + Send + 'static,
    {
        let item_id = match item.id() {
            Some(id) => id.to_string(),
            None if kind == OperationKind::Insert => {
                let id = Uuid::new_v4().to_string();
                item.set_id(id.clone());
                id
            }
            None => {
                self.complete(
                    completion,
                    Err(SyncError::invalid_parameter("item has no string id")),
                );
                return;
            }
        };

        let ctx = Arc::clone(self);
        self.writer.dispatch(move || {
            let result = ctx.mutate_in_writer(&table, item, kind, &item_id);
            ctx.complete(completion, result);
        });
    }

    /// Posts a completion to the callback executor.
    pub(crate) fn complete<T, F>(&self, completion: F, result: SyncResult<T>)
    where
        T: Send + 'static,
        F: FnOnce(SyncResult<T>) + Send + 'static,
    {
        self.callbacks.post(move || completion(result));
    }

    /// The writer-domain body of a local mutation.
    fn mutate_in_writer(
        &self,
        table: &str,
        item: Item,
        kind: OperationKind,
        item_id: &str,
    ) -> SyncResult<Item> {
        let pending = self.queue.operation_for_item(table, item_id);
        let pending_kind = pending.as_ref().map(|op| op.kind);
        let action = condense(pending_kind, kind);
        if let (CondenseAction::NotSupported, Some(pending)) = (action, pending_kind) {
            return Err(SyncError::InvalidAction {
                pending,
                action: kind,
            });
        }

        // Kept for rollback, and as the pre-delete snapshot.
        let prior = self.store.read(table, item_id)?;

        match kind {
            OperationKind::Insert | OperationKind::Update => {
                self.store.upsert(table, slice::from_ref(&item))?;
            }
            OperationKind::Delete => {
                self.store.delete(table, &[item_id.to_string()])?;
            }
        }
        let snapshot = match kind {
            OperationKind::Delete => prior.clone().or_else(|| Some(item.clone())),
            _ => None,
        };

        let queue_result = match (action, pending) {
            (CondenseAction::AddNew, _) => {
                let op = TableOperation::new(self.queue.next_operation_id(), table, item_id, kind)
                    .with_item(snapshot);
                self.queue.add(op)
            }
            (CondenseAction::Keep, Some(mut op)) => {
                op.bump_version();
                self.queue.update(op)
            }
            (CondenseAction::ToDelete, Some(mut op)) => {
                op.kind = OperationKind::Delete;
                op.item = snapshot;
                op.bump_version();
                self.queue.update(op)
            }
            (CondenseAction::Discard, Some(op)) => self.queue.remove(&op),
            // condense() only yields the in-place actions when a pending
            // operation exists.
            _ => Err(SyncError::store_inconsistent(
                "condense action without a pending operation",
            )),
        };

        if let Err(queue_err) = queue_result {
            // The store write landed but the queue write did not; put the
            // store back so the two stay in agreement.
            let rollback = match &prior {
                Some(row) => self.store.upsert(table, slice::from_ref(row)),
                None => self.store.delete(table, &[item_id.to_string()]),
            };
            return match rollback {
                Ok(()) => Err(queue_err),
                Err(rollback_err) => Err(SyncError::store_inconsistent(format!(
                    "queue write failed ({queue_err}); store rollback also failed ({rollback_err})"
                ))),
            };
        }

        Ok(item)
    }

    /// The writer-domain body of both cancel variants.
    fn cancel_in_writer(
        &self,
        op_error: &TableOperationError,
        corrected: Option<Item>,
    ) -> SyncResult<()> {
        let Some(op) = self
            .queue
            .operation_for_item(&op_error.table, &op_error.item_id)
        else {
            return Err(SyncError::invalid_parameter(
                "operation is no longer pending",
            ));
        };
        if op.id != op_error.operation_id {
            return Err(SyncError::invalid_parameter(
                "operation was superseded by a newer mutation",
            ));
        }

        match corrected {
            Some(item) => {
                let mut cleaned = item.without_system_fields(true);
                cleaned.set_id(op.item_id.clone());
                self.store.upsert(&op.table, slice::from_ref(&cleaned))?;
            }
            None => {
                self.store.delete(&op.table, &[op.item_id.clone()])?;
            }
        }
        self.queue.remove(&op)
    }

    /// Queues a task on the push/pull lane with a fresh cancel token.
    ///
    /// The task holds only a weak reference to the context; once the
    /// embedder drops its last handle, queued tasks complete with
    /// `ContextDropped` instead of touching freed state.
    fn spawn_lane_task<T, F, G>(self: &Arc<Self>, completion: G, task: F) -> CancelToken
    where
        T: Send + 'static,
        F: FnOnce(&SyncContext, &CancelToken) -> SyncResult<T> + Send + 'static,
        G: FnOnce(SyncResult<T>) + Send + 'static,
    {
        let token = CancelToken::new();
        let task_token = token.clone();
        let weak = Arc::downgrade(self);
        let callbacks = Arc::clone(&self.callbacks);
        self.lane.dispatch(move || {
            let result = match weak.upgrade() {
                Some(ctx) => task(&ctx, &task_token),
                None => Err(SyncError::ContextDropped),
            };
            callbacks.post(move || completion(result));
        });
        token
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("pending_operations", &self.queue.count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemoteClient;
    use crate::store::InMemoryDataSource;
    use serde_json::json;
    use std::sync::mpsc;
    use std::time::Duration;

    fn build_context() -> (Arc<InMemoryDataSource>, Arc<SyncContext>) {
        let store = Arc::new(InMemoryDataSource::new());
        let remote = Arc::new(MockRemoteClient::new());
        let context = SyncContext::builder()
            .data_source(store.clone())
            .remote_client(remote)
            .config(SyncConfig::new().with_callback_workers(1))
            .build()
            .unwrap();
        (store, context)
    }

    fn mutate(
        ctx: &Arc<SyncContext>,
        table: &str,
        item: Item,
        kind: OperationKind,
    ) -> SyncResult<Item> {
        let (tx, rx) = mpsc::channel();
        ctx.apply_local_mutation(table.to_string(), item, kind, move |result| {
            let _ = tx.send(result);
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    fn item(value: serde_json::Value) -> Item {
        Item::from_value(value).unwrap()
    }

    #[test]
    fn builder_requires_store_and_remote() {
        let err = SyncContext::builder().build().unwrap_err();
        assert!(matches!(err, SyncError::MissingDataSource));

        let err = SyncContext::builder()
            .data_source(Arc::new(InMemoryDataSource::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingRemoteClient));
    }

    #[test]
    fn insert_generates_an_id_when_missing() {
        let (store, ctx) = build_context();
        let inserted = mutate(&ctx, "todo", item(json!({"text": "hi"})), OperationKind::Insert)
            .unwrap();

        let id = inserted.id().expect("id was generated");
        assert!(Uuid::parse_str(id).is_ok());
        assert!(store.read("todo", id).unwrap().is_some());
        assert_eq!(ctx.pending_operation_count(), 1);
    }

    #[test]
    fn update_without_id_is_rejected() {
        let (_, ctx) = build_context();
        let err = mutate(&ctx, "todo", item(json!({"text": "hi"})), OperationKind::Update)
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidParameter(_)));
        assert_eq!(ctx.pending_operation_count(), 0);
    }

    #[test]
    fn insert_over_pending_insert_is_rejected() {
        let (_, ctx) = build_context();
        mutate(&ctx, "todo", item(json!({"id": "a"})), OperationKind::Insert).unwrap();

        let err = mutate(&ctx, "todo", item(json!({"id": "a"})), OperationKind::Insert)
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidAction {
                pending: OperationKind::Insert,
                action: OperationKind::Insert,
            }
        ));
        assert_eq!(ctx.pending_operation_count(), 1);
    }

    #[test]
    fn delete_captures_the_pre_delete_snapshot() {
        let (store, ctx) = build_context();
        store
            .upsert("todo", &[item(json!({"id": "a", "text": "old", "__version": "v1"}))])
            .unwrap();
        // Mutation over a clean row (no pending op) enqueues a delete.
        mutate(&ctx, "todo", item(json!({"id": "a"})), OperationKind::Delete).unwrap();

        let op = ctx.queue.operation_for_item("todo", "a").unwrap();
        assert_eq!(op.kind, OperationKind::Delete);
        let snapshot = op.item.unwrap();
        assert_eq!(snapshot.get("text"), Some(&json!("old")));
        assert!(store.read("todo", "a").unwrap().is_none());
    }

    #[test]
    fn failed_queue_write_rolls_the_store_back() {
        let (store, ctx) = build_context();
        store.fail_writes_for(store.operation_table_name());

        let err = mutate(&ctx, "todo", item(json!({"id": "a", "text": "hi"})), OperationKind::Insert)
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
        // The upserted row was rolled back.
        assert!(store.read("todo", "a").unwrap().is_none());
        assert_eq!(ctx.pending_operation_count(), 0);
    }

    #[test]
    fn store_write_failure_surfaces_before_the_queue_write() {
        let (store, ctx) = build_context();
        store
            .upsert("todo", &[item(json!({"id": "a", "text": "old"}))])
            .unwrap();
        store.fail_writes_for("todo");

        let err = mutate(&ctx, "todo", item(json!({"id": "a"})), OperationKind::Delete)
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
        // Nothing was enqueued for the failed write.
        assert_eq!(ctx.pending_operation_count(), 0);
        assert!(store.read("todo", "a").unwrap().is_some());
    }

    #[test]
    fn cancel_and_update_item_restores_the_row() {
        let (store, ctx) = build_context();
        mutate(&ctx, "todo", item(json!({"id": "a", "text": "local"})), OperationKind::Insert)
            .unwrap();
        let op = ctx.queue.operation_for_item("todo", "a").unwrap();
        let op_error = TableOperationError::new(&op, "conflict".into(), None);

        let (tx, rx) = mpsc::channel();
        ctx.cancel_and_update_item(
            &op_error,
            item(json!({"id": "a", "text": "server", "__version": "v7", "__createdAt": "x"})),
            move |result| {
                let _ = tx.send(result);
            },
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

        assert_eq!(ctx.pending_operation_count(), 0);
        let row = store.read("todo", "a").unwrap().unwrap();
        assert_eq!(row.get("text"), Some(&json!("server")));
        // __version survives the strip, other system fields do not.
        assert_eq!(row.version(), Some("v7"));
        assert_eq!(row.get("__createdAt"), None);
    }

    #[test]
    fn cancel_and_discard_item_deletes_the_row() {
        let (store, ctx) = build_context();
        mutate(&ctx, "todo", item(json!({"id": "a", "text": "local"})), OperationKind::Insert)
            .unwrap();
        let op = ctx.queue.operation_for_item("todo", "a").unwrap();
        let op_error = TableOperationError::new(&op, "conflict".into(), None);

        let (tx, rx) = mpsc::channel();
        ctx.cancel_and_discard_item(&op_error, move |result| {
            let _ = tx.send(result);
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

        assert_eq!(ctx.pending_operation_count(), 0);
        assert!(store.read("todo", "a").unwrap().is_none());
    }

    #[test]
    fn cancel_of_a_superseded_operation_is_rejected() {
        let (_, ctx) = build_context();
        mutate(&ctx, "todo", item(json!({"id": "a"})), OperationKind::Insert).unwrap();
        let op = ctx.queue.operation_for_item("todo", "a").unwrap();
        let mut stale = TableOperationError::new(&op, "conflict".into(), None);
        stale.operation_id = op.id + 10;

        let (tx, rx) = mpsc::channel();
        ctx.cancel_and_discard_item(&stale, move |result| {
            let _ = tx.send(result);
        });
        let err = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap_err();
        assert!(matches!(err, SyncError::InvalidParameter(_)));
        assert_eq!(ctx.pending_operation_count(), 1);
    }
}
