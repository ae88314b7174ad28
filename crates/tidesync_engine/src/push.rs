//! Push: drain pending operations to the remote endpoint.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult, TableOperationError};
use crate::executor::CancelToken;
use crate::operation::{OperationError, OperationKind, TableOperation};
use crate::remote::{Features, RemoteClient, RemoteError};
use std::sync::Arc;
use tidesync_types::Item;
use tracing::{debug, warn};

/// Executes one queued operation against the remote endpoint.
///
/// The engine installs a default handler unless the embedder supplies its
/// own through [`crate::SyncContextBuilder::push_handler`], for example to
/// rewrite payloads or to resolve conflicts inline before the engine records
/// them.
pub trait PushHandler: Send + Sync {
    /// Performs the remote call for `op`.
    ///
    /// `item` is the current local row for Insert/Update and the captured
    /// pre-delete snapshot for Delete. Returns the server-authoritative item
    /// when the server produced one.
    fn execute(
        &self,
        op: &TableOperation,
        item: Option<&Item>,
        remote: &dyn RemoteClient,
    ) -> Result<Option<Item>, RemoteError>;
}

/// The default handler: one remote CRUD call matching the operation kind.
pub(crate) struct DefaultPushHandler;

impl PushHandler for DefaultPushHandler {
    fn execute(
        &self,
        op: &TableOperation,
        item: Option<&Item>,
        remote: &dyn RemoteClient,
    ) -> Result<Option<Item>, RemoteError> {
        let Some(item) = item else {
            return Err(RemoteError::Validation {
                status: 400,
                message: "operation has no payload".into(),
            });
        };
        let features = Features::OFFLINE_SYNC;
        match op.kind {
            // The server owns system properties on create.
            OperationKind::Insert => remote
                .insert(&op.table, &item.without_system_fields(false), features)
                .map(Some),
            // Updates keep __version as the server-side precondition.
            OperationKind::Update => remote
                .update(&op.table, &item.without_system_fields(true), features)
                .map(Some),
            OperationKind::Delete => remote.delete(&op.table, item, features).map(|()| None),
        }
    }
}

impl TableOperationError {
    pub(crate) fn new(op: &TableOperation, message: String, server_item: Option<Item>) -> Self {
        Self {
            operation_id: op.id,
            table: op.table.clone(),
            item_id: op.item_id.clone(),
            kind: op.kind,
            message,
            server_item,
        }
    }

    pub(crate) fn from_remote(op: &TableOperation, error: &RemoteError) -> Self {
        Self::new(op, error.to_string(), error.server_item().cloned())
    }
}

/// Drains the queue snapshot in operation-id order.
///
/// Runs on the push/pull lane. Per-op rejections are collected and recorded
/// on the operations themselves; transport and authorization failures abort
/// the drain atomically.
pub(crate) fn run_push(ctx: &SyncContext, token: &CancelToken) -> SyncResult<()> {
    let ops = ctx.queue.snapshot();
    debug!(pending = ops.len(), "starting push");

    let mut op_errors: Vec<TableOperationError> = Vec::new();

    for op in ops {
        if token.is_cancelled() {
            return Err(SyncError::PushCancelled);
        }

        let payload = match load_payload(ctx, &op) {
            Ok(Some(item)) => Some(item),
            Ok(None) => {
                let message = "item is missing from the local store".to_string();
                warn!(op_id = op.id, table = %op.table, item_id = %op.item_id, "{message}");
                let op_error = TableOperationError::new(&op, message, None);
                record_op_error(ctx, &op, &op_error)?;
                op_errors.push(op_error);
                continue;
            }
            Err(e) => return Err(e),
        };

        match ctx
            .push_handler
            .execute(&op, payload.as_ref(), ctx.remote.as_ref())
        {
            Ok(server_item) => finish_op(ctx, &op, server_item)?,
            Err(err) if err.aborts_push() => {
                warn!(op_id = op.id, error = %err, "aborting push");
                return Err(SyncError::PushAborted {
                    cause: Box::new(err.into()),
                    op_errors,
                });
            }
            Err(err) => {
                debug!(op_id = op.id, error = %err, "operation rejected, continuing");
                let op_error = TableOperationError::from_remote(&op, &err);
                record_op_error(ctx, &op, &op_error)?;
                op_errors.push(op_error);
            }
        }
    }

    if op_errors.is_empty() {
        Ok(())
    } else {
        Err(SyncError::PushCompleteWithErrors { op_errors })
    }
}

/// The wire payload for an operation: the current local row for
/// Insert/Update, the captured snapshot (or at least the id) for Delete.
fn load_payload(ctx: &SyncContext, op: &TableOperation) -> SyncResult<Option<Item>> {
    match op.kind {
        OperationKind::Insert | OperationKind::Update => {
            Ok(ctx.store.read(&op.table, &op.item_id)?)
        }
        OperationKind::Delete => Ok(Some(
            op.item
                .clone()
                .unwrap_or_else(|| Item::with_id(op.item_id.clone())),
        )),
    }
}

/// Success dispatch, inside the writer domain.
///
/// The op is removed and the server item persisted only while the queue's
/// current operation still carries the pushed id and version; anything newer
/// means a mutation was condensed in while the call was in flight, and the
/// local state wins until the next push.
fn finish_op(ctx: &SyncContext, pushed: &TableOperation, server_item: Option<Item>) -> SyncResult<()> {
    let queue = Arc::clone(&ctx.queue);
    let store = Arc::clone(&ctx.store);
    let pushed = pushed.clone();
    ctx.writer.run(move || -> SyncResult<()> {
        match queue.operation_for_item(&pushed.table, &pushed.item_id) {
            Some(current) if current.id == pushed.id && current.version == pushed.version => {
                queue.remove(&current)?;
                if let Some(item) = server_item {
                    store.upsert(&pushed.table, std::slice::from_ref(&item))?;
                }
                Ok(())
            }
            _ => {
                debug!(
                    op_id = pushed.id,
                    "operation changed while in flight; keeping local state"
                );
                Ok(())
            }
        }
    })
}

/// Records a per-op failure on the operation row, inside the writer domain.
fn record_op_error(
    ctx: &SyncContext,
    failed: &TableOperation,
    op_error: &TableOperationError,
) -> SyncResult<()> {
    let queue = Arc::clone(&ctx.queue);
    let failed = failed.clone();
    let error = OperationError {
        message: op_error.message.clone(),
        server_item: op_error.server_item.clone(),
    };
    ctx.writer.run(move || -> SyncResult<()> {
        match queue.operation_for_item(&failed.table, &failed.item_id) {
            Some(mut current) if current.id == failed.id && current.version == failed.version => {
                current.set_error(error);
                queue.update(current)
            }
            // Condensed while in flight: the newer form supersedes the error.
            _ => Ok(()),
        }
    })
}
