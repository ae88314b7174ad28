//! JSON item records.

use crate::error::{TypeError, TypeResult};
use crate::properties::{is_system_field, DELETED_FIELD, UPDATED_AT_FIELD, VERSION_FIELD};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field name of the record identity.
pub const ID_FIELD: &str = "id";

/// A single table record: an opaque mapping from field names to JSON values.
///
/// Every item destined for the engine carries a string `id`; system fields
/// (`__version`, `__updatedAt`, `__deleted`, `__createdAt`) are optional and
/// preserved verbatim when present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Item(Map<String, Value>);

impl Item {
    /// Creates an empty item.
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Creates an item carrying only an `id`.
    pub fn with_id(id: impl Into<String>) -> Self {
        let mut item = Self::new();
        item.set_id(id);
        item
    }

    /// Converts a JSON value into an item.
    ///
    /// Fails unless the value is a JSON object.
    pub fn from_value(value: Value) -> TypeResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Err(TypeError::NotAnObject("null")),
            Value::Bool(_) => Err(TypeError::NotAnObject("a boolean")),
            Value::Number(_) => Err(TypeError::NotAnObject("a number")),
            Value::String(_) => Err(TypeError::NotAnObject("a string")),
            Value::Array(_) => Err(TypeError::NotAnObject("an array")),
        }
    }

    /// Converts the item back into a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// The item's string id, if present.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_FIELD).and_then(Value::as_str)
    }

    /// The item's string id, or `MissingItemId`.
    pub fn require_id(&self) -> TypeResult<&str> {
        self.id().ok_or(TypeError::MissingItemId)
    }

    /// Sets the item's id.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert(ID_FIELD.into(), Value::String(id.into()));
    }

    /// Reads a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Writes a field.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    /// Removes a field, returning its previous value.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the item has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// The server version string (`__version`), if present.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.0.get(VERSION_FIELD).and_then(Value::as_str)
    }

    /// The server update timestamp (`__updatedAt`).
    ///
    /// `Ok(None)` when the field is absent; an error when it is present but
    /// not a parsable ISO-8601 string.
    pub fn updated_at(&self) -> TypeResult<Option<Timestamp>> {
        match self.0.get(UPDATED_AT_FIELD) {
            None => Ok(None),
            Some(Value::String(s)) => Timestamp::parse(s).map(Some),
            Some(other) => Err(TypeError::invalid_timestamp(
                other.to_string(),
                "expected an ISO-8601 string",
            )),
        }
    }

    /// True when the server marked this row deleted (`__deleted: true`).
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.0
            .get(DELETED_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Returns a copy with system fields removed.
    ///
    /// `keep_version` retains `__version`, which the server needs as a write
    /// precondition.
    #[must_use]
    pub fn without_system_fields(&self, keep_version: bool) -> Self {
        let map = self
            .0
            .iter()
            .filter(|(k, _)| !is_system_field(k) || (keep_version && k.as_str() == VERSION_FIELD))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self(map)
    }
}

impl From<Map<String, Value>> for Item {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Item {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}
