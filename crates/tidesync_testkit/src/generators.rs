//! Property-based generators and the reference condensation model.

use proptest::prelude::*;
use tidesync_engine::OperationKind;
use tidesync_types::Item;

/// One randomly generated local mutation.
#[derive(Debug, Clone)]
pub struct LocalMutation {
    /// Target item id, drawn from a small pool so condensation happens often.
    pub item_id: String,
    /// Mutation kind.
    pub kind: OperationKind,
    /// Payload value, so successive writes are distinguishable.
    pub value: i32,
}

impl LocalMutation {
    /// The mutation rendered as an item.
    #[must_use]
    pub fn to_item(&self) -> Item {
        Item::from_value(serde_json::json!({
            "id": self.item_id,
            "value": self.value,
        }))
        .expect("object literal")
    }
}

/// Strategy for mutation kinds.
pub fn operation_kind_strategy() -> impl Strategy<Value = OperationKind> {
    prop_oneof![
        Just(OperationKind::Insert),
        Just(OperationKind::Update),
        Just(OperationKind::Delete),
    ]
}

/// Strategy for a single mutation over a five-item id pool.
pub fn local_mutation_strategy() -> impl Strategy<Value = LocalMutation> {
    (
        prop::sample::select(vec!["a", "b", "c", "d", "e"]),
        operation_kind_strategy(),
        any::<i32>(),
    )
        .prop_map(|(item_id, kind, value)| LocalMutation {
            item_id: item_id.to_string(),
            kind,
            value,
        })
}

/// Strategy for a mutation sequence.
pub fn mutation_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<LocalMutation>> {
    prop::collection::vec(local_mutation_strategy(), 0..max_len)
}

/// Reference model for one condensation step on a single (table, item id).
///
/// `pending` is the queued operation kind before the mutation (if any).
/// Returns `None` when the mutation is rejected, otherwise the queued kind
/// after the mutation (`Some(None)` meaning the queue entry disappeared).
#[must_use]
#[allow(clippy::option_option)]
pub fn collapse(
    pending: Option<OperationKind>,
    action: OperationKind,
) -> Option<Option<OperationKind>> {
    use OperationKind::{Delete, Insert, Update};

    match (pending, action) {
        (None, kind) => Some(Some(kind)),
        (Some(Insert), Update) => Some(Some(Insert)),
        (Some(Insert), Delete) => Some(None),
        (Some(Update), Update) => Some(Some(Update)),
        (Some(Update), Delete) => Some(Some(Delete)),
        (Some(Insert | Update), Insert) | (Some(Delete), _) => None,
    }
}
