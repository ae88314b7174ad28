//! End-to-end scenarios for the sync engine, driving the public API with the
//! in-memory store and the mock remote.

use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::time::Duration;
use tidesync_engine::{
    ConfigStore, DataSource, Features, InMemoryDataSource, MockRemoteClient, OperationKind,
    QueryPage, RemoteCall, RemoteClient, RemoteError, SyncConfig, SyncContext, SyncError,
    SyncResult, SyncTable,
};
use tidesync_types::{Item, Query, Timestamp};

const TIMEOUT: Duration = Duration::from_secs(5);

const T1: &str = "2024-01-01T00:00:01.000Z";
const T2: &str = "2024-01-01T00:00:02.000Z";
const T3: &str = "2024-01-01T00:00:03.000Z";

struct Harness {
    store: Arc<InMemoryDataSource>,
    remote: Arc<MockRemoteClient>,
    context: Arc<SyncContext>,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryDataSource::new());
    let remote = Arc::new(MockRemoteClient::new());
    let context = SyncContext::builder()
        .data_source(store.clone())
        .remote_client(remote.clone())
        .config(SyncConfig::new().with_page_size(2).with_callback_workers(2))
        .build()
        .unwrap();
    Harness {
        store,
        remote,
        context,
    }
}

fn item(value: serde_json::Value) -> Item {
    Item::from_value(value).unwrap()
}

fn insert(table: &SyncTable, it: Item) -> SyncResult<Item> {
    let (tx, rx) = mpsc::channel();
    table.insert(it, move |r| {
        let _ = tx.send(r);
    });
    rx.recv_timeout(TIMEOUT).expect("insert completion")
}

fn update(table: &SyncTable, it: Item) -> SyncResult<Item> {
    let (tx, rx) = mpsc::channel();
    table.update(it, move |r| {
        let _ = tx.send(r);
    });
    rx.recv_timeout(TIMEOUT).expect("update completion")
}

fn delete(table: &SyncTable, it: Item) -> SyncResult<()> {
    let (tx, rx) = mpsc::channel();
    table.delete(it, move |r| {
        let _ = tx.send(r);
    });
    rx.recv_timeout(TIMEOUT).expect("delete completion")
}

fn push(context: &Arc<SyncContext>) -> SyncResult<()> {
    let (tx, rx) = mpsc::channel();
    context.push(move |r| {
        let _ = tx.send(r);
    });
    rx.recv_timeout(TIMEOUT).expect("push completion")
}

fn pull(table: &SyncTable, query: Query, query_id: Option<&str>) -> SyncResult<()> {
    let (tx, rx) = mpsc::channel();
    table.pull(query, query_id, move |r| {
        let _ = tx.send(r);
    });
    rx.recv_timeout(TIMEOUT).expect("pull completion")
}

fn purge(
    table: &SyncTable,
    query: Option<Query>,
    query_id: Option<&str>,
    force: bool,
) -> SyncResult<()> {
    let (tx, rx) = mpsc::channel();
    table.purge(query, query_id, force, move |r| {
        let _ = tx.send(r);
    });
    rx.recv_timeout(TIMEOUT).expect("purge completion")
}

#[test]
fn insert_then_delete_collapses_to_noop() {
    let h = harness();
    let todo = h.context.table("todo");

    insert(&todo, item(json!({"id": "a", "text": "hi"}))).unwrap();
    delete(&todo, item(json!({"id": "a"}))).unwrap();

    assert_eq!(h.context.pending_operation_count(), 0);
    assert!(todo.read_with_id("a").unwrap().is_none());

    push(&h.context).unwrap();
    assert_eq!(h.remote.call_count(), 0);
}

#[test]
fn update_after_insert_preserves_insert() {
    let h = harness();
    let todo = h.context.table("todo");

    insert(&todo, item(json!({"id": "a", "text": "v1"}))).unwrap();
    update(&todo, item(json!({"id": "a", "text": "v2"}))).unwrap();

    let ops = h.context.pending_operations("todo");
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, OperationKind::Insert);

    let local = todo.read_with_id("a").unwrap().unwrap();
    assert_eq!(local.get("text"), Some(&json!("v2")));

    push(&h.context).unwrap();
    assert_eq!(
        h.remote.calls(),
        vec![RemoteCall::Insert("todo".into(), "a".into())]
    );
    let server = h.remote.row("todo", "a").unwrap();
    assert_eq!(server.get("text"), Some(&json!("v2")));
    assert_eq!(h.context.pending_operation_count(), 0);
}

#[test]
fn incremental_pull_is_incremental() {
    let h = harness();
    let todo = h.context.table("todo");
    h.remote
        .seed("todo", item(json!({"id": "1", "text": "one", "__updatedAt": T1})));
    h.remote
        .seed("todo", item(json!({"id": "2", "text": "two", "__updatedAt": T2})));
    h.remote
        .seed("todo", item(json!({"id": "3", "text": "three", "__updatedAt": T3})));

    pull(&todo, Query::for_table("todo"), Some("q")).unwrap();

    assert_eq!(todo.read_all().unwrap().len(), 3);
    let tokens = ConfigStore::new(h.store.clone());
    assert_eq!(
        tokens.delta_token("todo", "q").unwrap(),
        Some(Timestamp::parse(T3).unwrap())
    );

    // A second pull with no server changes: one read, zero rows, no writes.
    h.remote.clear_calls();
    let writes_before = h.store.write_count();
    pull(&todo, Query::for_table("todo"), Some("q")).unwrap();

    assert_eq!(h.remote.calls(), vec![RemoteCall::Query("todo".into())]);
    assert_eq!(h.store.write_count(), writes_before);
    assert_eq!(
        tokens.delta_token("todo", "q").unwrap(),
        Some(Timestamp::parse(T3).unwrap())
    );
}

#[test]
fn incremental_pull_resumes_from_the_token() {
    let h = harness();
    let todo = h.context.table("todo");
    h.remote
        .seed("todo", item(json!({"id": "1", "__updatedAt": T1})));
    pull(&todo, Query::for_table("todo"), Some("q")).unwrap();
    assert_eq!(todo.read_all().unwrap().len(), 1);

    // New server rows past the token arrive incrementally.
    h.remote
        .seed("todo", item(json!({"id": "2", "__updatedAt": T3})));
    pull(&todo, Query::for_table("todo"), Some("q")).unwrap();

    assert_eq!(todo.read_all().unwrap().len(), 2);
    let tokens = ConfigStore::new(h.store.clone());
    assert_eq!(
        tokens.delta_token("todo", "q").unwrap(),
        Some(Timestamp::parse(T3).unwrap())
    );
}

#[test]
fn plain_pull_paginates_and_ingests_deletes() {
    let h = harness();
    let todo = h.context.table("todo");
    for i in 0..5 {
        h.remote
            .seed("todo", item(json!({"id": format!("r{i}"), "n": i})));
    }
    // A soft-deleted server row with a stale local copy.
    h.store
        .upsert("todo", &[item(json!({"id": "gone", "n": 99}))])
        .unwrap();
    h.remote
        .seed("todo", item(json!({"id": "gone", "__deleted": true})));

    pull(&todo, Query::for_table("todo"), None).unwrap();

    assert_eq!(todo.read_all().unwrap().len(), 5);
    assert!(todo.read_with_id("gone").unwrap().is_none());
    // Page size 2, six server rows: four page reads (2+2+2+0).
    assert_eq!(h.remote.call_count(), 4);
}

#[test]
fn pull_pushes_a_dirty_table_first() {
    let h = harness();
    let todo = h.context.table("todo");
    // Last-synced state on both sides, then a local edit.
    h.remote.seed(
        "todo",
        item(json!({"id": "a", "text": "old", "__version": "aaa", "__updatedAt": T1})),
    );
    h.store
        .upsert("todo", &[item(json!({"id": "a", "text": "old", "__version": "aaa"}))])
        .unwrap();
    update(&todo, item(json!({"id": "a", "text": "local-edit", "__version": "aaa"}))).unwrap();

    pull(&todo, Query::for_table("todo"), None).unwrap();

    // The push ran before any server read.
    let calls = h.remote.calls();
    assert_eq!(calls[0], RemoteCall::Update("todo".into(), "a".into()));
    assert!(matches!(calls[1], RemoteCall::Query(_)));
    assert_eq!(h.context.pending_operation_count(), 0);

    // The local row is the server-authoritative form of the pushed edit.
    let local = todo.read_with_id("a").unwrap().unwrap();
    assert_eq!(local.get("text"), Some(&json!("local-edit")));
    assert_ne!(local.version(), Some("aaa"));
}

#[test]
fn pull_fails_when_the_pushdown_fails() {
    let h = harness();
    let todo = h.context.table("todo");
    h.store
        .upsert("todo", &[item(json!({"id": "a", "text": "old", "__version": "v1"}))])
        .unwrap();
    update(&todo, item(json!({"id": "a", "text": "local-edit", "__version": "v1"}))).unwrap();

    h.remote.fail_all_with(RemoteError::transport("offline"));
    let err = pull(&todo, Query::for_table("todo"), None).unwrap_err();
    assert!(matches!(err, SyncError::PushAborted { .. }));

    // Local state untouched, operation still queued.
    let local = todo.read_with_id("a").unwrap().unwrap();
    assert_eq!(local.get("text"), Some(&json!("local-edit")));
    assert_eq!(local.version(), Some("v1"));
    assert_eq!(h.context.pending_operation_count(), 1);
}

#[test]
fn purge_with_pending_ops_and_no_force_fails() {
    let h = harness();
    let todo = h.context.table("todo");
    insert(&todo, item(json!({"id": "a", "text": "hi"}))).unwrap();

    let err = purge(&todo, None, None, false).unwrap_err();
    assert!(matches!(err, SyncError::PurgeAborted(_)));
    assert_eq!(h.context.pending_operation_count(), 1);
    assert!(todo.read_with_id("a").unwrap().is_some());
}

#[test]
fn purge_with_force_removes_ops_then_clears() {
    let h = harness();
    let todo = h.context.table("todo");
    insert(&todo, item(json!({"id": "a", "text": "hi"}))).unwrap();

    purge(&todo, None, None, true).unwrap();
    assert_eq!(h.context.pending_operation_count(), 0);
    assert!(todo.read_all().unwrap().is_empty());

    // Nothing left to push.
    push(&h.context).unwrap();
    assert_eq!(h.remote.call_count(), 0);
}

#[test]
fn scoped_purge_over_pending_ops_fails_even_with_force() {
    let h = harness();
    let todo = h.context.table("todo");
    insert(&todo, item(json!({"id": "a", "text": "hi"}))).unwrap();

    let query = Query::for_table("todo")
        .with_predicate(tidesync_types::Predicate::eq("text", "hi"));
    let err = purge(&todo, Some(query), None, true).unwrap_err();
    assert!(matches!(err, SyncError::PurgeAborted(_)));
    assert_eq!(h.context.pending_operation_count(), 1);
}

#[test]
fn purge_removes_the_delta_token() {
    let h = harness();
    let todo = h.context.table("todo");
    h.remote
        .seed("todo", item(json!({"id": "1", "__updatedAt": T1})));
    pull(&todo, Query::for_table("todo"), Some("q")).unwrap();

    let tokens = ConfigStore::new(h.store.clone());
    assert!(tokens.delta_token("todo", "q").unwrap().is_some());

    purge(&todo, None, Some("q"), false).unwrap();
    assert!(tokens.delta_token("todo", "q").unwrap().is_none());
    assert!(todo.read_all().unwrap().is_empty());

    // The next incremental pull starts over from epoch.
    pull(&todo, Query::for_table("todo"), Some("q")).unwrap();
    assert_eq!(todo.read_all().unwrap().len(), 1);
}

#[test]
fn push_collects_per_op_errors_and_continues() {
    let h = harness();
    let todo = h.context.table("todo");
    // Server holds a newer version of "a" than the local copy.
    h.remote.seed(
        "todo",
        item(json!({"id": "a", "text": "server", "__version": "v9", "__updatedAt": T1})),
    );
    h.store
        .upsert("todo", &[item(json!({"id": "a", "text": "old", "__version": "stale"}))])
        .unwrap();

    update(&todo, item(json!({"id": "a", "text": "mine", "__version": "stale"}))).unwrap();
    insert(&todo, item(json!({"id": "b", "text": "fresh"}))).unwrap();

    let err = push(&h.context).unwrap_err();
    let SyncError::PushCompleteWithErrors { op_errors } = err else {
        panic!("expected PushCompleteWithErrors, got {err:?}");
    };
    assert_eq!(op_errors.len(), 1);
    assert_eq!(op_errors[0].item_id, "a");
    let server_item = op_errors[0].server_item.clone().unwrap();
    assert_eq!(server_item.get("text"), Some(&json!("server")));

    // The later operation was not blocked.
    assert!(h.remote.row("todo", "b").is_some());
    assert_eq!(h.context.pending_operation_count(), 1);
    let op = h.context.pending_operations("todo").remove(0);
    assert_eq!(op.item_id, "a");
    assert!(op.is_errored());

    // Resolve the conflict with the server copy; the queue drains.
    let (tx, rx) = mpsc::channel();
    h.context
        .cancel_and_update_item(&op_errors[0], server_item, move |r| {
            let _ = tx.send(r);
        });
    rx.recv_timeout(TIMEOUT).unwrap().unwrap();

    assert_eq!(h.context.pending_operation_count(), 0);
    let local = todo.read_with_id("a").unwrap().unwrap();
    assert_eq!(local.get("text"), Some(&json!("server")));
    assert_eq!(local.version(), Some("v9"));
}

#[test]
fn transport_failure_aborts_the_whole_push() {
    let h = harness();
    let todo = h.context.table("todo");
    insert(&todo, item(json!({"id": "a"}))).unwrap();
    insert(&todo, item(json!({"id": "b"}))).unwrap();

    h.remote.fail_next_with(RemoteError::transport("offline"));
    let err = push(&h.context).unwrap_err();
    let SyncError::PushAborted { op_errors, .. } = err else {
        panic!("expected PushAborted, got {err:?}");
    };
    assert!(op_errors.is_empty());

    // Only the first operation was attempted; both remain queued.
    assert_eq!(h.remote.call_count(), 1);
    assert_eq!(h.context.pending_operation_count(), 2);

    // Connectivity back: the retry drains in order.
    push(&h.context).unwrap();
    assert_eq!(h.context.pending_operation_count(), 0);
    assert_eq!(
        h.remote.calls()[1..].to_vec(),
        vec![
            RemoteCall::Insert("todo".into(), "a".into()),
            RemoteCall::Insert("todo".into(), "b".into()),
        ]
    );
}

#[test]
fn errored_operations_are_retried_on_the_next_push() {
    let h = harness();
    let todo = h.context.table("todo");
    insert(&todo, item(json!({"id": "a", "text": "hi"}))).unwrap();

    h.remote.fail_next_with(RemoteError::Validation {
        status: 400,
        message: "bad payload".into(),
    });
    let err = push(&h.context).unwrap_err();
    assert_eq!(err.op_errors().len(), 1);
    assert!(h.context.pending_operations("todo")[0].is_errored());

    // The failure was transient on the server side; the retry succeeds and
    // clears the recorded error with the operation.
    push(&h.context).unwrap();
    assert_eq!(h.context.pending_operation_count(), 0);
    assert!(h.remote.row("todo", "a").is_some());
}

#[test]
fn operation_ids_stay_monotonic_across_context_rebuilds() {
    let store = Arc::new(InMemoryDataSource::new());
    let remote = Arc::new(MockRemoteClient::new());

    let context = SyncContext::builder()
        .data_source(store.clone())
        .remote_client(remote.clone())
        .build()
        .unwrap();
    let todo = context.table("todo");
    insert(&todo, item(json!({"id": "a"}))).unwrap();
    insert(&todo, item(json!({"id": "b"}))).unwrap();
    drop(todo);
    drop(context);

    // A fresh context over the same store continues the id sequence.
    let context = SyncContext::builder()
        .data_source(store.clone())
        .remote_client(remote)
        .build()
        .unwrap();
    let todo = context.table("todo");
    insert(&todo, item(json!({"id": "c"}))).unwrap();

    let ids: Vec<u64> = context
        .pending_operations("todo")
        .iter()
        .map(|op| op.id)
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

/// A remote that injects a local mutation during the first page read, so a
/// pending operation exists by the time the page is merged.
struct InjectOnQueryClient {
    inner: Arc<MockRemoteClient>,
    context: Mutex<Option<Weak<SyncContext>>>,
    injected: AtomicBool,
}

impl InjectOnQueryClient {
    fn new(inner: Arc<MockRemoteClient>) -> Self {
        Self {
            inner,
            context: Mutex::new(None),
            injected: AtomicBool::new(false),
        }
    }

    fn bind(&self, context: &Arc<SyncContext>) {
        *self.context.lock() = Some(Arc::downgrade(context));
    }
}

impl RemoteClient for InjectOnQueryClient {
    fn insert(&self, table: &str, it: &Item, features: Features) -> Result<Item, RemoteError> {
        self.inner.insert(table, it, features)
    }

    fn update(&self, table: &str, it: &Item, features: Features) -> Result<Item, RemoteError> {
        self.inner.update(table, it, features)
    }

    fn delete(&self, table: &str, it: &Item, features: Features) -> Result<(), RemoteError> {
        self.inner.delete(table, it, features)
    }

    fn query(&self, query: &Query, features: Features) -> Result<QueryPage, RemoteError> {
        if !self.injected.swap(true, Ordering::SeqCst) {
            let context = self
                .context
                .lock()
                .as_ref()
                .and_then(Weak::upgrade)
                .expect("context is bound");
            let (tx, rx) = mpsc::channel();
            context.table("todo").update(
                item(json!({"id": "x", "text": "local-edit"})),
                move |r| {
                    let _ = tx.send(r);
                },
            );
            rx.recv_timeout(TIMEOUT).unwrap().unwrap();
        }
        self.inner.query(query, features)
    }
}

#[test]
fn pull_never_clobbers_a_locally_pending_item() {
    let mock = Arc::new(MockRemoteClient::new());
    mock.seed(
        "todo",
        item(json!({"id": "x", "text": "server", "__updatedAt": T2})),
    );
    let remote = Arc::new(InjectOnQueryClient::new(mock.clone()));
    let store = Arc::new(InMemoryDataSource::new());
    let context = SyncContext::builder()
        .data_source(store.clone())
        .remote_client(remote.clone())
        .build()
        .unwrap();
    remote.bind(&context);
    let todo = context.table("todo");

    // The local edit lands between the page fetch and the merge.
    pull(&todo, Query::for_table("todo"), None).unwrap();

    let local = todo.read_with_id("x").unwrap().unwrap();
    assert_eq!(local.get("text"), Some(&json!("local-edit")));
    assert_eq!(context.pending_operation_count(), 1);
}

/// A remote that parks the first write until released, so tests can overlap
/// work with an in-flight push deterministically.
struct GatedClient {
    inner: Arc<MockRemoteClient>,
    gate: Mutex<Option<mpsc::Receiver<()>>>,
    entered: Mutex<Option<mpsc::Sender<()>>>,
}

impl GatedClient {
    fn new(inner: Arc<MockRemoteClient>) -> (Self, mpsc::Sender<()>, mpsc::Receiver<()>) {
        let (release_tx, release_rx) = mpsc::channel();
        let (entered_tx, entered_rx) = mpsc::channel();
        (
            Self {
                inner,
                gate: Mutex::new(Some(release_rx)),
                entered: Mutex::new(Some(entered_tx)),
            },
            release_tx,
            entered_rx,
        )
    }

    fn wait_at_gate(&self) {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            if let Some(entered) = self.entered.lock().take() {
                let _ = entered.send(());
            }
            let _ = gate.recv_timeout(TIMEOUT);
        }
    }
}

impl RemoteClient for GatedClient {
    fn insert(&self, table: &str, it: &Item, features: Features) -> Result<Item, RemoteError> {
        self.wait_at_gate();
        self.inner.insert(table, it, features)
    }

    fn update(&self, table: &str, it: &Item, features: Features) -> Result<Item, RemoteError> {
        self.wait_at_gate();
        self.inner.update(table, it, features)
    }

    fn delete(&self, table: &str, it: &Item, features: Features) -> Result<(), RemoteError> {
        self.wait_at_gate();
        self.inner.delete(table, it, features)
    }

    fn query(&self, query: &Query, features: Features) -> Result<QueryPage, RemoteError> {
        self.inner.query(query, features)
    }
}

fn gated_harness() -> (
    Arc<InMemoryDataSource>,
    Arc<MockRemoteClient>,
    Arc<SyncContext>,
    mpsc::Sender<()>,
    mpsc::Receiver<()>,
) {
    let mock = Arc::new(MockRemoteClient::new());
    let (gated, release, entered) = GatedClient::new(mock.clone());
    let store = Arc::new(InMemoryDataSource::new());
    let context = SyncContext::builder()
        .data_source(store.clone())
        .remote_client(Arc::new(gated))
        .build()
        .unwrap();
    (store, mock, context, release, entered)
}

#[test]
fn cancelled_push_stops_between_operations_and_keeps_the_queue() {
    let (_, mock, context, release, entered) = gated_harness();
    let todo = context.table("todo");
    insert(&todo, item(json!({"id": "a"}))).unwrap();
    insert(&todo, item(json!({"id": "b"}))).unwrap();

    let (tx, rx) = mpsc::channel();
    let token = context.push(move |r| {
        let _ = tx.send(r);
    });

    // The push is parked inside the first remote call; cancel, then release.
    entered.recv_timeout(TIMEOUT).unwrap();
    token.cancel();
    release.send(()).unwrap();

    let err = rx.recv_timeout(TIMEOUT).unwrap().unwrap_err();
    assert!(matches!(err, SyncError::PushCancelled));

    // The first operation completed, the second was never attempted.
    assert!(mock.row("todo", "a").is_some());
    assert!(mock.row("todo", "b").is_none());
    assert_eq!(context.pending_operation_count(), 1);
}

#[test]
fn mutation_condensed_during_a_push_is_not_lost() {
    let (_, mock, context, release, entered) = gated_harness();
    let todo = context.table("todo");
    insert(&todo, item(json!({"id": "a", "text": "v1"}))).unwrap();

    let (tx, rx) = mpsc::channel();
    context.push(move |r| {
        let _ = tx.send(r);
    });
    entered.recv_timeout(TIMEOUT).unwrap();

    // While "a" is in flight, a newer local edit condenses into its op.
    update(&todo, item(json!({"id": "a", "text": "v2"}))).unwrap();
    release.send(()).unwrap();
    rx.recv_timeout(TIMEOUT).unwrap().unwrap();

    // The op survived (bumped version), and the local edit was not
    // overwritten by the server echo of the stale payload.
    assert_eq!(context.pending_operation_count(), 1);
    let op = context.pending_operations("todo").remove(0);
    assert_eq!(op.version, 2);
    let local = todo.read_with_id("a").unwrap().unwrap();
    assert_eq!(local.get("text"), Some(&json!("v2")));
    // The server only has the first payload so far.
    let server = mock.row("todo", "a").unwrap();
    assert_eq!(server.get("text"), Some(&json!("v1")));
}

#[test]
fn pull_rejects_queries_for_another_table() {
    let h = harness();
    let todo = h.context.table("todo");
    let err = pull(&todo, Query::for_table("notes"), None).unwrap_err();
    assert!(matches!(err, SyncError::InvalidParameter(_)));
    assert_eq!(h.remote.call_count(), 0);
}

#[test]
fn completions_run_off_the_caller_thread() {
    let h = harness();
    let todo = h.context.table("todo");
    let caller = std::thread::current().id();

    let (tx, rx) = mpsc::channel();
    todo.insert(item(json!({"id": "a"})), move |r| {
        let _ = tx.send((r, std::thread::current().id()));
    });
    let (result, callback_thread) = rx.recv_timeout(TIMEOUT).unwrap();
    result.unwrap();
    assert_ne!(callback_thread, caller);
}
