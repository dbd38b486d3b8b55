//! Per-table sync engine.
//!
//! One engine binds a descriptor to the local store and the remote
//! gateway. `pull` computes a patch from the remote delta, `push`
//! reconciles the local delta back; the coordinator sequences the two
//! across all registered tables.

mod pull;
mod push;

use std::sync::Arc;

use serde_json::Value;

use crate::accessor::{coerce_timestamp_ms, extract_path, read_field, LocalAccessor};
use crate::descriptor::TableDescriptor;
use crate::error::Result;
use crate::remote::{RemoteChangeCallback, RemoteFilter, RemoteGateway, RemoteSubscription};
use crate::storage::LocalStore;
use crate::suppress::ChangeSuppressor;
use crate::types::{SyncContext, TimeProvider};

/// Rows fetched per page during pull.
pub const PULL_PAGE_SIZE: usize = 1000;

/// Pull/Push executor for one table pair.
pub struct TableEngine {
    descriptor: Arc<TableDescriptor>,
    store: Arc<dyn LocalStore>,
    gateway: Arc<dyn RemoteGateway>,
    accessor: LocalAccessor,
    suppressor: Arc<ChangeSuppressor>,
    time_provider: TimeProvider,
}

impl TableEngine {
    pub fn new(
        descriptor: Arc<TableDescriptor>,
        store: Arc<dyn LocalStore>,
        gateway: Arc<dyn RemoteGateway>,
        suppressor: Arc<ChangeSuppressor>,
        time_provider: TimeProvider,
    ) -> Self {
        let accessor = LocalAccessor::new(Arc::clone(&descriptor), Arc::clone(&store));
        Self {
            descriptor,
            store,
            gateway,
            accessor,
            suppressor,
            time_provider,
        }
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    /// Open this table's realtime channel, filtered to the context's user
    /// scope when one is configured.
    pub async fn subscribe(
        &self,
        ctx: &SyncContext,
        on_change: RemoteChangeCallback,
    ) -> Result<Box<dyn RemoteSubscription>> {
        let handle = self
            .gateway
            .subscribe(&self.descriptor.remote_table, self.scope_filter(ctx), on_change)
            .await?;
        Ok(handle)
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    fn scope_filter(&self, ctx: &SyncContext) -> Option<RemoteFilter> {
        match (&self.descriptor.scope, &ctx.user_id) {
            (Some(scope), Some(user_id)) => Some(RemoteFilter::eq(
                scope.user_field.clone(),
                Value::String(user_id.clone()),
            )),
            _ => None,
        }
    }

    fn remote_timestamp_ms(&self, row: &Value) -> i64 {
        read_field(row, &self.descriptor.timestamps.remote_field)
            .map(coerce_timestamp_ms)
            .unwrap_or(0)
    }

    fn remote_is_deleted(&self, row: &Value) -> bool {
        read_field(row, &self.descriptor.soft_delete_field)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Extract every configured remote unique-key path, or `None` when any
    /// path is missing (the row cannot participate in key matching).
    fn remote_unique_key_values(&self, row: &Value) -> Option<Vec<Value>> {
        self.descriptor
            .keys
            .unique_keys
            .iter()
            .map(|key| extract_path(row, &key.remote_path))
            .collect()
    }
}

/// Render a primary key value as the string the local remote-id field
/// stores.
pub(crate) fn pk_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Insert-or-overwrite one field on a JSON object record.
pub(crate) fn set_field(record: &mut Value, field: &str, value: Value) {
    if let Some(obj) = record.as_object_mut() {
        obj.insert(field.to_string(), value);
    }
}
