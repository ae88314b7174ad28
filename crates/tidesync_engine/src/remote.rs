//! Remote endpoint abstraction.
//!
//! The engine performs all server I/O through the [`RemoteClient`] trait;
//! the embedding SDK implements it over its REST client. [`MockRemoteClient`]
//! plays the server in tests: it stamps system properties, enforces version
//! preconditions, and records every call it receives.

use crate::store::{apply_query, QueryPage};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use thiserror::Error;
use tidesync_types::{
    Item, Query, Timestamp, CREATED_AT_FIELD, UPDATED_AT_FIELD, VERSION_FIELD,
};

/// Typed failures from the remote endpoint.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    /// Network-level failure; nothing reached the server.
    #[error("transport error: {message}")]
    Transport {
        /// Failure description.
        message: String,
    },

    /// The server rejected the credentials.
    #[error("authorization failed: {message}")]
    Auth {
        /// Failure description.
        message: String,
    },

    /// The server rejected the write with a conflict (HTTP 409).
    #[error("server conflict")]
    Conflict {
        /// The server's authoritative copy, when returned.
        server_item: Option<Item>,
    },

    /// The server's version precondition failed (HTTP 412).
    #[error("server precondition failed")]
    PreconditionFailed {
        /// The server's authoritative copy, when returned.
        server_item: Option<Item>,
    },

    /// The server rejected the request as invalid.
    #[error("server validation error ({status}): {message}")]
    Validation {
        /// HTTP status code.
        status: u16,
        /// Failure description.
        message: String,
    },
}

impl RemoteError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates an authorization error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// True when this failure must abort an in-progress push rather than be
    /// recorded against the single operation.
    #[must_use]
    pub fn aborts_push(&self) -> bool {
        matches!(self, RemoteError::Transport { .. } | RemoteError::Auth { .. })
    }

    /// The server's authoritative item, when this error carries one.
    #[must_use]
    pub fn server_item(&self) -> Option<&Item> {
        match self {
            RemoteError::Conflict { server_item }
            | RemoteError::PreconditionFailed { server_item } => server_item.as_ref(),
            _ => None,
        }
    }
}

/// Feature markers sent with each remote call (the server uses them for
/// telemetry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Features(u32);

impl Features {
    /// No markers.
    pub const NONE: Features = Features(0);
    /// The call originates from the offline sync engine.
    pub const OFFLINE_SYNC: Features = Features(1 << 0);
    /// The call is part of an incremental pull.
    pub const INCREMENTAL_PULL: Features = Features(1 << 1);

    /// Returns the union of two marker sets.
    #[must_use]
    pub const fn union(self, other: Features) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns true if every marker in `other` is present.
    #[must_use]
    pub const fn contains(self, other: Features) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Server-side table CRUD and query, as consumed by the engine.
pub trait RemoteClient: Send + Sync {
    /// Creates a row; returns the server-authoritative item.
    fn insert(&self, table: &str, item: &Item, features: Features) -> Result<Item, RemoteError>;

    /// Updates a row; returns the server-authoritative item.
    fn update(&self, table: &str, item: &Item, features: Features) -> Result<Item, RemoteError>;

    /// Deletes a row.
    fn delete(&self, table: &str, item: &Item, features: Features) -> Result<(), RemoteError>;

    /// Reads rows matching a query.
    fn query(&self, query: &Query, features: Features) -> Result<QueryPage, RemoteError>;
}

/// One recorded call against the mock remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    /// An insert against (table, item id).
    Insert(String, String),
    /// An update against (table, item id).
    Update(String, String),
    /// A delete against (table, item id).
    Delete(String, String),
    /// A query against a table.
    Query(String),
}

/// A scripted in-memory server for tests.
///
/// Rows are stamped with `__version`, `__createdAt`, and `__updatedAt` from a
/// deterministic clock. Failures are injected either for the next call only
/// or for every call until cleared.
pub struct MockRemoteClient {
    rows: RwLock<HashMap<String, BTreeMap<String, Item>>>,
    calls: Mutex<Vec<RemoteCall>>,
    fail_next: Mutex<VecDeque<RemoteError>>,
    fail_all: Mutex<Option<RemoteError>>,
    clock_millis: AtomicI64,
    version_counter: AtomicU64,
}

/// Deterministic base instant for the mock server clock.
const MOCK_CLOCK_START_MILLIS: i64 = 1_700_000_000_000;

impl MockRemoteClient {
    /// Creates an empty mock server.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_next: Mutex::new(VecDeque::new()),
            fail_all: Mutex::new(None),
            clock_millis: AtomicI64::new(MOCK_CLOCK_START_MILLIS),
            version_counter: AtomicU64::new(1),
        }
    }

    /// Injects a failure for the next call only. Multiple injections queue up.
    pub fn fail_next_with(&self, error: RemoteError) {
        self.fail_next.lock().push_back(error);
    }

    /// Makes every call fail until [`Self::clear_failures`].
    pub fn fail_all_with(&self, error: RemoteError) {
        *self.fail_all.lock() = Some(error);
    }

    /// Clears injected failures.
    pub fn clear_failures(&self) {
        self.fail_next.lock().clear();
        *self.fail_all.lock() = None;
    }

    /// Seeds a server row without recording a call.
    ///
    /// Missing system properties are stamped; present ones are preserved, so
    /// tests can pin explicit `__updatedAt` values.
    pub fn seed(&self, table: &str, item: Item) {
        let stamped = self.stamp(item, false);
        let id = stamped.id().expect("seeded item must carry an id").to_string();
        self.rows
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(id, stamped);
    }

    /// The calls recorded so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    /// Number of calls recorded so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Forgets recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Reads a row as stored on the "server".
    #[must_use]
    pub fn row(&self, table: &str, item_id: &str) -> Option<Item> {
        self.rows.read().get(table).and_then(|rows| rows.get(item_id)).cloned()
    }

    /// Number of rows in a server table.
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.rows.read().get(table).map_or(0, BTreeMap::len)
    }

    fn next_timestamp(&self) -> Timestamp {
        let millis = self.clock_millis.fetch_add(1_000, Ordering::SeqCst);
        Timestamp::from_unix_millis(millis)
    }

    fn next_version(&self) -> String {
        format!("v{}", self.version_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Fills in server-managed fields. `touch` forces a fresh `__version`
    /// and `__updatedAt` the way a real write would.
    fn stamp(&self, mut item: Item, touch: bool) -> Item {
        if touch || item.version().is_none() {
            item.set(VERSION_FIELD, self.next_version());
        }
        if touch || item.get(UPDATED_AT_FIELD).is_none() {
            item.set(UPDATED_AT_FIELD, self.next_timestamp().to_iso8601());
        }
        if item.get(CREATED_AT_FIELD).is_none() {
            if let Some(updated) = item.get(UPDATED_AT_FIELD).cloned() {
                item.set(CREATED_AT_FIELD, updated);
            }
        }
        item
    }

    fn take_failure(&self) -> Option<RemoteError> {
        if let Some(err) = self.fail_next.lock().pop_front() {
            return Some(err);
        }
        self.fail_all.lock().clone()
    }

    fn record(&self, call: RemoteCall) {
        self.calls.lock().push(call);
    }
}

impl Default for MockRemoteClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteClient for MockRemoteClient {
    fn insert(&self, table: &str, item: &Item, _features: Features) -> Result<Item, RemoteError> {
        let id = item
            .id()
            .ok_or_else(|| RemoteError::Validation {
                status: 400,
                message: "insert without an id".into(),
            })?
            .to_string();
        self.record(RemoteCall::Insert(table.to_string(), id.clone()));
        if let Some(err) = self.take_failure() {
            return Err(err);
        }

        let mut rows = self.rows.write();
        let table_rows = rows.entry(table.to_string()).or_default();
        if let Some(existing) = table_rows.get(&id) {
            return Err(RemoteError::Conflict {
                server_item: Some(existing.clone()),
            });
        }
        let stamped = self.stamp(item.clone(), true);
        table_rows.insert(id, stamped.clone());
        Ok(stamped)
    }

    fn update(&self, table: &str, item: &Item, _features: Features) -> Result<Item, RemoteError> {
        let id = item
            .id()
            .ok_or_else(|| RemoteError::Validation {
                status: 400,
                message: "update without an id".into(),
            })?
            .to_string();
        self.record(RemoteCall::Update(table.to_string(), id.clone()));
        if let Some(err) = self.take_failure() {
            return Err(err);
        }

        let mut rows = self.rows.write();
        let table_rows = rows.entry(table.to_string()).or_default();
        let Some(existing) = table_rows.get(&id) else {
            return Err(RemoteError::Validation {
                status: 404,
                message: format!("no row {id} in {table}"),
            });
        };
        if let (Some(sent), Some(stored)) = (item.version(), existing.version()) {
            if sent != stored {
                return Err(RemoteError::PreconditionFailed {
                    server_item: Some(existing.clone()),
                });
            }
        }
        let stamped = self.stamp(item.clone(), true);
        table_rows.insert(id, stamped.clone());
        Ok(stamped)
    }

    fn delete(&self, table: &str, item: &Item, _features: Features) -> Result<(), RemoteError> {
        let id = item
            .id()
            .ok_or_else(|| RemoteError::Validation {
                status: 400,
                message: "delete without an id".into(),
            })?
            .to_string();
        self.record(RemoteCall::Delete(table.to_string(), id.clone()));
        if let Some(err) = self.take_failure() {
            return Err(err);
        }

        let mut rows = self.rows.write();
        let table_rows = rows.entry(table.to_string()).or_default();
        let Some(existing) = table_rows.get(&id) else {
            return Err(RemoteError::Validation {
                status: 404,
                message: format!("no row {id} in {table}"),
            });
        };
        if let (Some(sent), Some(stored)) = (item.version(), existing.version()) {
            if sent != stored {
                return Err(RemoteError::PreconditionFailed {
                    server_item: Some(existing.clone()),
                });
            }
        }
        table_rows.remove(&id);
        Ok(())
    }

    fn query(&self, query: &Query, _features: Features) -> Result<QueryPage, RemoteError> {
        self.record(RemoteCall::Query(query.table.clone()));
        if let Some(err) = self.take_failure() {
            return Err(err);
        }

        let rows = self
            .rows
            .read()
            .get(&query.table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        Ok(apply_query(rows, query))
    }
}
