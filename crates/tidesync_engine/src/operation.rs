//! Pending table operations and the condensation rules.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidesync_types::{Item, TypeError, TypeResult};

/// Kind of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// The item was created locally.
    Insert,
    /// The item was modified locally.
    Update,
    /// The item was deleted locally.
    Delete,
}

/// Error details recorded on an operation after a failed push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    /// Failure description.
    pub message: String,
    /// The server's authoritative copy, when the server supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_item: Option<Item>,
}

/// Push state of a pending operation.
///
/// Keeping the error record on the operation itself (rather than in a
/// sibling table) means the one-op-per-target invariant also covers errors.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OperationState {
    /// Not yet pushed, or awaiting retry.
    #[default]
    Pending,
    /// The last push attempt was rejected by the server.
    Errored(OperationError),
}

impl OperationState {
    /// Returns true when no error is recorded.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, OperationState::Pending)
    }

    /// The recorded error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&OperationError> {
        match self {
            OperationState::Pending => None,
            OperationState::Errored(err) => Some(err),
        }
    }
}

/// A recorded, pending local mutation destined for the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableOperation {
    /// Monotonic operation id; assignment order equals enqueue order.
    pub id: u64,
    /// Target table name.
    #[serde(rename = "tableName")]
    pub table: String,
    /// Target item id.
    pub item_id: String,
    /// Operation kind.
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// For Delete, the pre-delete snapshot (needed to reconstruct the row on
    /// cancel or conflict). Unset for Insert/Update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Item>,
    /// Bumped each time the operation is condensed in place; lets the push
    /// runner detect a concurrent mutation against an in-flight operation.
    pub version: u64,
    /// Push state. Persisted as an optional `error` field on the row.
    #[serde(skip)]
    pub state: OperationState,
}

/// Row field carrying the serialized [`OperationState::Errored`] record.
const ERROR_FIELD: &str = "error";

impl TableOperation {
    /// Creates a fresh pending operation.
    pub fn new(
        id: u64,
        table: impl Into<String>,
        item_id: impl Into<String>,
        kind: OperationKind,
    ) -> Self {
        Self {
            id,
            table: table.into(),
            item_id: item_id.into(),
            kind,
            item: None,
            version: 1,
            state: OperationState::Pending,
        }
    }

    /// Attaches the pre-delete snapshot.
    #[must_use]
    pub fn with_item(mut self, item: Option<Item>) -> Self {
        self.item = item;
        self
    }

    /// Marks an in-place condensation.
    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Records a push failure.
    pub fn set_error(&mut self, error: OperationError) {
        self.state = OperationState::Errored(error);
    }

    /// Returns true when a push failure is recorded.
    #[must_use]
    pub fn is_errored(&self) -> bool {
        !self.state.is_pending()
    }

    /// Serializes the operation as a row for the reserved operation table.
    ///
    /// The row id is the decimal operation id, so removal by id works through
    /// the plain item interface of the data source.
    pub fn to_item(&self) -> TypeResult<Item> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| TypeError::invalid_record(e.to_string()))?;
        let map = value
            .as_object_mut()
            .ok_or(TypeError::NotAnObject("a non-object operation row"))?;
        map.insert("id".into(), Value::String(self.id.to_string()));
        if let OperationState::Errored(err) = &self.state {
            let err_value = serde_json::to_value(err)
                .map_err(|e| TypeError::invalid_record(e.to_string()))?;
            map.insert(ERROR_FIELD.into(), err_value);
        }
        Item::from_value(value)
    }

    /// Deserializes an operation-table row.
    pub fn from_item(item: &Item) -> TypeResult<Self> {
        let mut value = item.clone().into_value();
        let map = value
            .as_object_mut()
            .ok_or(TypeError::NotAnObject("a non-object operation row"))?;

        if let Some(id) = map.get("id").and_then(Value::as_str).map(str::to_string) {
            let parsed: u64 = id.parse().map_err(|_| {
                TypeError::invalid_record(format!("operation row id {id:?} is not numeric"))
            })?;
            map.insert("id".into(), Value::Number(parsed.into()));
        }
        let error = match map.remove(ERROR_FIELD) {
            Some(err_value) => Some(
                serde_json::from_value::<OperationError>(err_value)
                    .map_err(|e| TypeError::invalid_record(e.to_string()))?,
            ),
            None => None,
        };

        let mut op: TableOperation = serde_json::from_value(value)
            .map_err(|e| TypeError::invalid_record(e.to_string()))?;
        if let Some(err) = error {
            op.state = OperationState::Errored(err);
        }
        Ok(op)
    }
}

/// Outcome of condensing a new local mutation into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondenseAction {
    /// Append a fresh operation with the next id.
    AddNew,
    /// Retain the existing operation (its version is bumped; the local store
    /// still receives the new data).
    Keep,
    /// Rewrite the existing operation's kind to Delete, preserving its id.
    ToDelete,
    /// An Insert followed by a Delete cancels out; remove the existing
    /// operation without ever pushing it.
    Discard,
    /// The mutation is rejected with `InvalidAction`.
    NotSupported,
}

/// Decides how a new mutation combines with the pending operation (if any)
/// for the same (table, item id).
///
/// The server sees at most one operation per target between sync cycles;
/// coalescing is safe because the local store always holds the
/// post-mutation state.
#[must_use]
pub fn condense(pending: Option<OperationKind>, action: OperationKind) -> CondenseAction {
    use OperationKind::{Delete, Insert, Update};

    match (pending, action) {
        (None, _) => CondenseAction::AddNew,
        (Some(Insert), Update) => CondenseAction::Keep,
        (Some(Insert), Delete) => CondenseAction::Discard,
        (Some(Update), Update) => CondenseAction::Keep,
        (Some(Update), Delete) => CondenseAction::ToDelete,
        (Some(Insert | Update), Insert) | (Some(Delete), _) => CondenseAction::NotSupported,
    }
}
