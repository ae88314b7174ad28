//! Delta-token persistence through the reserved config table.

use crate::error::SyncResult;
use crate::store::DataSource;
use std::sync::Arc;
use tidesync_types::{ConfigValue, Timestamp};

/// Typed access to the data source's reserved config table.
///
/// All writes go through the writer domain (the callers guarantee that);
/// reads may come from any thread.
#[derive(Clone)]
pub struct ConfigStore {
    store: Arc<dyn DataSource>,
}

impl ConfigStore {
    /// Wraps a data source.
    pub fn new(store: Arc<dyn DataSource>) -> Self {
        Self { store }
    }

    /// Reads the delta token for (table, query id), if one was persisted.
    pub fn delta_token(&self, table: &str, query_id: &str) -> SyncResult<Option<Timestamp>> {
        let id = ConfigValue::delta_token_id(table, query_id);
        let Some(row) = self.store.read(self.store.config_table_name(), &id)? else {
            return Ok(None);
        };
        let value = ConfigValue::from_item(&row)?;
        Ok(Some(value.token_value()?))
    }

    /// Persists a delta token.
    pub fn set_delta_token(
        &self,
        table: &str,
        query_id: &str,
        token: Timestamp,
    ) -> SyncResult<()> {
        let row = ConfigValue::delta_token(table, query_id, token).to_item()?;
        self.store.upsert(self.store.config_table_name(), &[row])?;
        Ok(())
    }

    /// Deletes the delta token for (table, query id). Missing rows are fine.
    pub fn remove_delta_token(&self, table: &str, query_id: &str) -> SyncResult<()> {
        let id = ConfigValue::delta_token_id(table, query_id);
        self.store.delete(self.store.config_table_name(), &[id])?;
        Ok(())
    }
}
