//! Rows of the reserved per-table config store.

use crate::error::{TypeError, TypeResult};
use crate::item::Item;
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};

/// Kind of a config row key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfigKind {
    /// An incremental-pull delta token (server-updatedAt high-water mark).
    DeltaToken,
    /// Any other per-table metadata value.
    Setting,
}

/// A typed key/value row in the reserved config table.
///
/// Row ids are stable composite strings so the same key can be re-read across
/// process restarts; delta tokens use `deltaToken|{table}|{queryId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigValue {
    /// Stable composite row id.
    pub id: String,
    /// The logical table this row belongs to.
    pub table: String,
    /// Kind of key.
    #[serde(rename = "keyType")]
    pub kind: ConfigKind,
    /// Key within the (table, kind) namespace.
    pub key: String,
    /// String-encoded value.
    pub value: String,
}

impl ConfigValue {
    /// The composite row id for a delta token.
    pub fn delta_token_id(table: &str, query_id: &str) -> String {
        format!("deltaToken|{table}|{query_id}")
    }

    /// Builds a delta-token row.
    pub fn delta_token(table: impl Into<String>, query_id: &str, token: Timestamp) -> Self {
        let table = table.into();
        Self {
            id: Self::delta_token_id(&table, query_id),
            table,
            kind: ConfigKind::DeltaToken,
            key: query_id.to_string(),
            value: token.to_iso8601(),
        }
    }

    /// Parses the row's value as a timestamp (delta-token rows only).
    pub fn token_value(&self) -> TypeResult<Timestamp> {
        if self.kind != ConfigKind::DeltaToken {
            return Err(TypeError::invalid_config_value(format!(
                "row {} is not a delta token",
                self.id
            )));
        }
        Timestamp::parse(&self.value)
    }

    /// Serializes the row into an item for the config table.
    pub fn to_item(&self) -> TypeResult<Item> {
        let value = serde_json::to_value(self)
            .map_err(|e| TypeError::invalid_config_value(e.to_string()))?;
        Item::from_value(value)
    }

    /// Deserializes a config-table item back into a row.
    pub fn from_item(item: &Item) -> TypeResult<Self> {
        serde_json::from_value(item.clone().into_value())
            .map_err(|e| TypeError::invalid_config_value(e.to_string()))
    }
}
