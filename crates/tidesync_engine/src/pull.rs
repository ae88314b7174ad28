//! Pull: paged server reads merged into the local store, optionally
//! incremental via a per-query delta token.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::executor::CancelToken;
use crate::push;
use crate::remote::Features;
use std::sync::Arc;
use tidesync_types::{
    is_valid_query_id, CompareOp, Item, Predicate, Query, SortDirection, SystemProperty,
    Timestamp, UPDATED_AT_FIELD,
};
use tracing::{debug, warn};

const INCLUDE_DELETED_PARAM: &str = "__includeDeleted";
const SYSTEM_PROPERTIES_PARAM: &str = "__systemProperties";

/// Runs a pull on the push/pull lane.
pub(crate) fn run_pull(
    ctx: &SyncContext,
    query: &Query,
    query_id: Option<&str>,
    token: &CancelToken,
) -> SyncResult<()> {
    validate(query, query_id)?;

    // A dirty table pushes first; re-check afterwards because condensation
    // may enqueue new operations while the push is in flight. A push failure
    // (including a completed push with per-op errors) fails the pull.
    while ctx.queue.has_pending(&query.table) {
        if token.is_cancelled() {
            return Err(SyncError::PullCancelled);
        }
        debug!(table = %query.table, "table is dirty; pushing before pull");
        push::run_push(ctx, token)?;
    }

    let mut features = Features::OFFLINE_SYNC;
    let mut delta = None;
    // A token persisted by an earlier cycle marks rows ≤ token as already
    // ingested, so the cycle opens with a strict high-water clause. Once the
    // token advances within this cycle the clause turns inclusive again:
    // boundary rows a page split may have cut off must be re-fetched.
    let mut strict = false;
    if let Some(qid) = query_id {
        features = features.union(Features::INCREMENTAL_PULL);
        let stored = ctx.config_store.delta_token(&query.table, qid)?;
        strict = stored.is_some();
        delta = Some(stored.unwrap_or_else(Timestamp::epoch));
    }

    let mut offset = if delta.is_some() { 0 } else { query.fetch_offset };

    loop {
        if token.is_cancelled() {
            return Err(SyncError::PullCancelled);
        }

        let wire_query = page_query(ctx, query, delta, strict, offset);
        let page = ctx
            .remote
            .query(&wire_query, features)
            .map_err(|e| SyncError::PullAborted(Box::new(e.into())))?;
        if page.items.is_empty() {
            break;
        }
        let page_len = page.items.len();

        if token.is_cancelled() {
            return Err(SyncError::PullCancelled);
        }

        let max_updated = merge_page(ctx, &query.table, page.items, query_id, delta)?;

        match (delta, max_updated) {
            // The high-water mark advanced: the token row was rewritten in
            // the merge, pagination restarts under the new predicate.
            (Some(prior), Some(max)) if max > prior => {
                delta = Some(max);
                strict = false;
                offset = 0;
            }
            _ => offset += page_len,
        }
    }

    Ok(())
}

/// Pre-flight validation of a pull request.
fn validate(query: &Query, query_id: Option<&str>) -> SyncResult<()> {
    if let Some(qid) = query_id {
        if !is_valid_query_id(qid) {
            return Err(SyncError::InvalidQueryId(qid.to_string()));
        }
    }
    if !query.select_fields.is_empty() {
        return Err(SyncError::invalid_parameter(
            "a pull query cannot use a field projection",
        ));
    }
    if query.include_total_count {
        return Err(SyncError::invalid_parameter(
            "a pull query cannot request a total count",
        ));
    }
    if query_id.is_some() && (!query.order_by.is_empty() || query.fetch_offset != 0) {
        return Err(SyncError::invalid_parameter(
            "an incremental pull owns ordering and paging",
        ));
    }
    for key in query.parameters.keys() {
        if key.eq_ignore_ascii_case(SYSTEM_PROPERTIES_PARAM) {
            return Err(SyncError::invalid_parameter(
                "__systemProperties is managed by the engine",
            ));
        }
    }
    if let Some(value) = query.parameters.get(INCLUDE_DELETED_PARAM) {
        if !value.eq_ignore_ascii_case("true") {
            return Err(SyncError::invalid_parameter(
                "a pull always includes deleted rows; __includeDeleted cannot be false",
            ));
        }
    }
    Ok(())
}

/// Builds the wire query for one page.
fn page_query(
    ctx: &SyncContext,
    query: &Query,
    delta: Option<Timestamp>,
    strict: bool,
    offset: usize,
) -> Query {
    let mut page = query.clone();
    page.parameters
        .insert(INCLUDE_DELETED_PARAM.to_string(), "true".to_string());

    let mut props = ctx
        .store
        .system_properties_for_table(&query.table)
        .with(SystemProperty::Deleted);
    if delta.is_some() {
        props = props.with(SystemProperty::UpdatedAt);
    }
    page.parameters
        .insert(SYSTEM_PROPERTIES_PARAM.to_string(), props.to_parameter_value());

    if let Some(token) = delta {
        let op = if strict { CompareOp::Gt } else { CompareOp::Ge };
        page.order_by = vec![(UPDATED_AT_FIELD.to_string(), SortDirection::Ascending)];
        page.predicate = query
            .predicate
            .clone()
            .and(Predicate::compare(UPDATED_AT_FIELD, op, token.to_iso8601()));
    }
    page.fetch_offset = offset;
    page.fetch_limit = Some(ctx.config.page_size);
    page.include_total_count = false;
    page
}

/// Merges one page inside the writer domain.
///
/// Returns the maximum `__updatedAt` seen across the page (before any
/// filtering), and persists an advanced delta token in the same writer slot.
/// Rows without a usable `__updatedAt` are still ingested but count as epoch,
/// so they can never advance the token.
fn merge_page(
    ctx: &SyncContext,
    table: &str,
    items: Vec<Item>,
    query_id: Option<&str>,
    prior_delta: Option<Timestamp>,
) -> SyncResult<Option<Timestamp>> {
    let queue = Arc::clone(&ctx.queue);
    let store = Arc::clone(&ctx.store);
    let config_store = ctx.config_store.clone();
    let table = table.to_string();
    let query_id = query_id.map(str::to_string);

    ctx.writer.run(move || -> SyncResult<Option<Timestamp>> {
        let mut max_updated: Option<Timestamp> = None;
        let mut deletes: Vec<String> = Vec::new();
        let mut upserts: Vec<Item> = Vec::new();

        for item in items {
            let stamp = match item.updated_at() {
                Ok(Some(ts)) => ts,
                Ok(None) => {
                    warn!(table = %table, "server row without __updatedAt; treating as epoch");
                    Timestamp::epoch()
                }
                Err(e) => {
                    warn!(table = %table, error = %e, "unparsable __updatedAt; treating as epoch");
                    Timestamp::epoch()
                }
            };
            max_updated = Some(max_updated.map_or(stamp, |m| m.max(stamp)));

            let Some(id) = item.id().map(str::to_string) else {
                warn!(table = %table, "server row without an id; skipping");
                continue;
            };
            // A locally pending item wins until it has been pushed.
            if queue.operation_for_item(&table, &id).is_some() {
                continue;
            }
            if item.is_deleted() {
                deletes.push(id);
            } else {
                upserts.push(item);
            }
        }

        if !deletes.is_empty() {
            store.delete(&table, &deletes)?;
        }
        if !upserts.is_empty() {
            store.upsert(&table, &upserts)?;
        }

        if let (Some(qid), Some(prior), Some(max)) = (&query_id, prior_delta, max_updated) {
            if max > prior {
                debug!(table = %table, query_id = %qid, token = %max, "advancing delta token");
                config_store.set_delta_token(&table, qid, max)?;
            }
        }

        Ok(max_updated)
    })
}
