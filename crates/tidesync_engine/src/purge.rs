//! Purge: remove local rows, safely around pending operations.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use std::sync::Arc;
use tidesync_types::{is_valid_query_id, Query};
use tracing::debug;

/// Runs a purge. Scheduled on the push/pull lane so it cannot interleave a
/// pull; the body executes in the writer domain.
pub(crate) fn run_purge(
    ctx: &SyncContext,
    query: &Query,
    query_id: Option<&str>,
    force: bool,
) -> SyncResult<()> {
    if let Some(qid) = query_id {
        if !is_valid_query_id(qid) {
            return Err(SyncError::InvalidQueryId(qid.to_string()));
        }
    }

    let queue = Arc::clone(&ctx.queue);
    let store = Arc::clone(&ctx.store);
    let config_store = ctx.config_store.clone();
    let query = query.clone();
    let query_id = query_id.map(str::to_string);

    ctx.writer.run(move || -> SyncResult<()> {
        if let Some(qid) = &query_id {
            config_store.remove_delta_token(&query.table, qid)?;
        }

        let pending = queue.operations_for_table(&query.table, None);
        if !pending.is_empty() {
            // Force only covers a whole-table purge; a scoped purge over
            // pending operations always refuses.
            if !query.predicate.is_trivial() || !force {
                return Err(SyncError::PurgeAborted(query.table.clone()));
            }
            debug!(
                table = %query.table,
                discarded = pending.len(),
                "force purge discarding pending operations"
            );
            for op in &pending {
                queue.remove(op)?;
            }
        }

        store.delete_by_query(&query)?;
        Ok(())
    })
}
