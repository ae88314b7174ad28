//! Public handle to one logical table.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::executor::CancelToken;
use crate::operation::OperationKind;
use crate::store::QueryPage;
use std::sync::Arc;
use tidesync_types::{Item, Predicate, Query};

/// A named logical table bound to a [`SyncContext`].
///
/// Mutations are asynchronous: they return immediately and deliver their
/// completion on the context's callback executor. Reads pass straight
/// through to the local store.
#[derive(Debug, Clone)]
pub struct SyncTable {
    name: String,
    context: Arc<SyncContext>,
}

impl SyncTable {
    pub(crate) fn new(context: Arc<SyncContext>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context,
        }
    }

    /// The table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records a local insert. An item without an id gets a generated
    /// UUID-v4; the completion receives the item including that id.
    pub fn insert<F>(&self, item: Item, completion: F)
    where
        F: FnOnce(SyncResult<Item>) + Send + 'static,
    {
        self.context
            .apply_local_mutation(self.name.clone(), item, OperationKind::Insert, completion);
    }

    /// Records a local update.
    pub fn update<F>(&self, item: Item, completion: F)
    where
        F: FnOnce(SyncResult<Item>) + Send + 'static,
    {
        self.context
            .apply_local_mutation(self.name.clone(), item, OperationKind::Update, completion);
    }

    /// Records a local delete, capturing the pre-delete row for recovery.
    pub fn delete<F>(&self, item: Item, completion: F)
    where
        F: FnOnce(SyncResult<()>) + Send + 'static,
    {
        self.context.apply_local_mutation(
            self.name.clone(),
            item,
            OperationKind::Delete,
            move |result| completion(result.map(|_| ())),
        );
    }

    /// Reads one row from the local store.
    pub fn read_with_id(&self, item_id: &str) -> SyncResult<Option<Item>> {
        Ok(self.context.store.read(&self.name, item_id)?)
    }

    /// Reads rows matching a predicate from the local store.
    pub fn read_with_predicate(&self, predicate: Predicate) -> SyncResult<Vec<Item>> {
        let query = Query::for_table(&self.name).with_predicate(predicate);
        Ok(self.read_with_query(&query)?.items)
    }

    /// Reads rows matching a full query from the local store.
    pub fn read_with_query(&self, query: &Query) -> SyncResult<QueryPage> {
        self.check_table(query)?;
        Ok(self.context.store.read_by_query(query)?)
    }

    /// Reads every row of the table from the local store.
    pub fn read_all(&self) -> SyncResult<Vec<Item>> {
        Ok(self
            .context
            .store
            .read_by_query(&Query::for_table(&self.name))?
            .items)
    }

    /// Pulls server rows into the local store.
    ///
    /// With a `query_id`, the pull is incremental: only rows whose
    /// `__updatedAt` is at or past the stream's delta token are fetched, and
    /// the token advances as pages are ingested. If the table has pending
    /// operations, a push runs first; its failure fails the pull.
    pub fn pull<F>(&self, query: Query, query_id: Option<&str>, completion: F) -> CancelToken
    where
        F: FnOnce(SyncResult<()>) + Send + 'static,
    {
        if let Err(err) = self.check_table(&query) {
            self.context.complete(completion, Err(err));
            return CancelToken::new();
        }
        self.context
            .pull_table(query, query_id.map(str::to_string), completion)
    }

    /// Removes local rows.
    ///
    /// Without a query, the whole table is purged. A purge refuses to run
    /// while the table has pending operations unless `force` is set and the
    /// purge is table-wide; `force` discards those operations. A `query_id`
    /// additionally deletes that stream's delta token.
    pub fn purge<F>(&self, query: Option<Query>, query_id: Option<&str>, force: bool, completion: F)
    where
        F: FnOnce(SyncResult<()>) + Send + 'static,
    {
        let query = query.unwrap_or_else(|| Query::for_table(&self.name));
        if let Err(err) = self.check_table(&query) {
            self.context.complete(completion, Err(err));
            return;
        }
        self.context
            .purge_table(query, query_id.map(str::to_string), force, completion);
    }

    fn check_table(&self, query: &Query) -> SyncResult<()> {
        if query.table != self.name {
            return Err(SyncError::invalid_parameter(format!(
                "query targets table {:?} but this table is {:?}",
                query.table, self.name
            )));
        }
        Ok(())
    }
}
