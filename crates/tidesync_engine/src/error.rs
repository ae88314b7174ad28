//! Error types for the sync engine.

use crate::operation::OperationKind;
use crate::remote::RemoteError;
use crate::store::StoreError;
use std::fmt;
use thiserror::Error;
use tidesync_types::{Item, TypeError};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed query or forbidden field combination.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A pull stream identifier violated the queryId grammar.
    #[error("invalid query id {0:?}")]
    InvalidQueryId(String),

    /// The condensation rules reject the mutation.
    #[error("a local {action:?} is not supported over a pending {pending:?} operation")]
    InvalidAction {
        /// Kind of the pending operation.
        pending: OperationKind,
        /// Kind of the rejected mutation.
        action: OperationKind,
    },

    /// The context was built without a local data source.
    #[error("no local data source configured")]
    MissingDataSource,

    /// The context was built without a remote client.
    #[error("no remote client configured")]
    MissingRemoteClient,

    /// A pending operation already exists for the target.
    #[error("a pending operation already exists for {table}/{item_id}")]
    QueueConflict {
        /// Target table.
        table: String,
        /// Target item id.
        item_id: String,
    },

    /// Underlying data source failure.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    /// The local store and the operation queue diverged and could not be
    /// reconciled automatically.
    #[error("local store inconsistent: {0}")]
    StoreInconsistent(String),

    /// A stored record or timestamp could not be interpreted.
    #[error("malformed record: {0}")]
    Types(#[from] TypeError),

    /// Remote communication or credential failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Push terminated early on a transport or authorization failure.
    #[error("push aborted: {cause}")]
    PushAborted {
        /// The failure that aborted the drain.
        cause: Box<SyncError>,
        /// Per-operation errors collected before the abort.
        op_errors: Vec<TableOperationError>,
    },

    /// Push drained the queue but some operations were rejected.
    #[error("push completed with {} failed operation(s)", op_errors.len())]
    PushCompleteWithErrors {
        /// Per-operation errors, in operation-id order.
        op_errors: Vec<TableOperationError>,
    },

    /// Push was cancelled; the queue is intact.
    #[error("push cancelled")]
    PushCancelled,

    /// Pull failed; carries the underlying cause.
    #[error("pull aborted: {0}")]
    PullAborted(Box<SyncError>),

    /// Pull was cancelled; the local store may hold already-merged pages.
    #[error("pull cancelled")]
    PullCancelled,

    /// Purge refused to run over pending operations without `force`.
    #[error("purge aborted: table {0} has pending operations")]
    PurgeAborted(String),

    /// The sync context was dropped before the queued task ran.
    #[error("sync context dropped before the task ran")]
    ContextDropped,
}

impl SyncError {
    /// Creates an invalid parameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }

    /// Creates a store inconsistency error.
    pub fn store_inconsistent(message: impl Into<String>) -> Self {
        Self::StoreInconsistent(message.into())
    }

    /// The per-operation errors carried by a push outcome, if any.
    pub fn op_errors(&self) -> &[TableOperationError] {
        match self {
            SyncError::PushAborted { op_errors, .. }
            | SyncError::PushCompleteWithErrors { op_errors } => op_errors,
            _ => &[],
        }
    }
}

/// A single operation's failure during a push.
///
/// Carried inside the aggregate push error and persisted on the operation
/// itself, so the application can resolve the conflict later via
/// [`crate::SyncContext::cancel_and_update_item`] or
/// [`crate::SyncContext::cancel_and_discard_item`].
#[derive(Debug, Clone, PartialEq)]
pub struct TableOperationError {
    /// Id of the failed operation.
    pub operation_id: u64,
    /// Target table.
    pub table: String,
    /// Target item id.
    pub item_id: String,
    /// Kind of the failed operation.
    pub kind: OperationKind,
    /// Human-readable failure description.
    pub message: String,
    /// The server's authoritative copy, when the server supplied one
    /// (conflicts and precondition failures).
    pub server_item: Option<Item>,
}

impl fmt::Display for TableOperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operation {} ({:?} {}/{}): {}",
            self.operation_id, self.kind, self.table, self.item_id, self.message
        )
    }
}
