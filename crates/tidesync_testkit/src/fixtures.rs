//! Blocking test harness over the asynchronous context API.

use std::sync::{mpsc, Arc};
use std::time::Duration;
use tidesync_engine::{
    InMemoryDataSource, MockRemoteClient, OperationKind, SyncConfig, SyncContext, SyncResult,
    SyncTable,
};
use tidesync_types::{Item, Query};

const TIMEOUT: Duration = Duration::from_secs(10);

/// An in-memory store, a mock remote, and a context wired over them, with
/// blocking wrappers so tests read sequentially.
pub struct SyncHarness {
    /// The local store.
    pub store: Arc<InMemoryDataSource>,
    /// The scripted server.
    pub remote: Arc<MockRemoteClient>,
    /// The context under test.
    pub context: Arc<SyncContext>,
}

impl SyncHarness {
    /// Builds a harness with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SyncConfig::new().with_callback_workers(2))
    }

    /// Builds a harness with a specific configuration.
    #[must_use]
    pub fn with_config(config: SyncConfig) -> Self {
        let store = Arc::new(InMemoryDataSource::new());
        let remote = Arc::new(MockRemoteClient::new());
        let context = SyncContext::builder()
            .data_source(store.clone())
            .remote_client(remote.clone())
            .config(config)
            .build()
            .expect("harness context builds");
        Self {
            store,
            remote,
            context,
        }
    }

    /// A table handle.
    #[must_use]
    pub fn table(&self, name: &str) -> SyncTable {
        self.context.table(name)
    }

    /// Applies a local mutation and waits for its completion.
    ///
    /// Deletes report success as an empty item so the three kinds share a
    /// return type.
    pub fn apply(&self, table: &str, kind: OperationKind, item: Item) -> SyncResult<Item> {
        let handle = self.table(table);
        match kind {
            OperationKind::Insert => {
                let (tx, rx) = mpsc::channel();
                handle.insert(item, move |r| {
                    let _ = tx.send(r);
                });
                rx.recv_timeout(TIMEOUT).expect("insert completion")
            }
            OperationKind::Update => {
                let (tx, rx) = mpsc::channel();
                handle.update(item, move |r| {
                    let _ = tx.send(r);
                });
                rx.recv_timeout(TIMEOUT).expect("update completion")
            }
            OperationKind::Delete => {
                let (tx, rx) = mpsc::channel();
                handle.delete(item, move |r| {
                    let _ = tx.send(r);
                });
                rx.recv_timeout(TIMEOUT)
                    .expect("delete completion")
                    .map(|()| Item::new())
            }
        }
    }

    /// Pushes and waits for the completion.
    pub fn push(&self) -> SyncResult<()> {
        let (tx, rx) = mpsc::channel();
        self.context.push(move |r| {
            let _ = tx.send(r);
        });
        rx.recv_timeout(TIMEOUT).expect("push completion")
    }

    /// Pulls and waits for the completion.
    pub fn pull(&self, table: &str, query_id: Option<&str>) -> SyncResult<()> {
        let (tx, rx) = mpsc::channel();
        self.table(table)
            .pull(Query::for_table(table), query_id, move |r| {
                let _ = tx.send(r);
            });
        rx.recv_timeout(TIMEOUT).expect("pull completion")
    }

    /// Purges and waits for the completion.
    pub fn purge(&self, table: &str, query_id: Option<&str>, force: bool) -> SyncResult<()> {
        let (tx, rx) = mpsc::channel();
        self.table(table).purge(None, query_id, force, move |r| {
            let _ = tx.send(r);
        });
        rx.recv_timeout(TIMEOUT).expect("purge completion")
    }
}

impl Default for SyncHarness {
    fn default() -> Self {
        Self::new()
    }
}
