//! Per-table sync descriptors.
//!
//! A descriptor binds one local table to one remote table: key fields,
//! timestamp fields, optional user scope, and the two pure mapping
//! callbacks that translate row shapes. Descriptors are built once,
//! registered at coordinator construction, and never mutated.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::types::SyncContext;

/// Pure row mapping (`remote row → local raw` or `local record → remote
/// payload`).
pub type MapFn = Arc<dyn Fn(&Value, &SyncContext) -> Value + Send + Sync>;

/// Per-record push filter.
pub type PushFilterFn = Arc<dyn Fn(&Value, &SyncContext) -> bool + Send + Sync>;

// ============================================================================
// Specs
// ============================================================================

/// A logical key shared by both sides, used to bootstrap the remote-id link
/// when a local row has not been pushed yet. Each path is either a flat
/// field name or a dotted path into a JSON column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueKeySpec {
    pub local_path: String,
    pub remote_path: String,
}

impl UniqueKeySpec {
    pub fn new(local_path: impl Into<String>, remote_path: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
        }
    }
}

/// Key configuration for one table.
#[derive(Debug, Clone)]
pub struct KeySpec {
    /// Remote primary key column.
    pub remote_pk: String,
    /// Local field holding the remote primary key once linked.
    pub local_remote_id_field: String,
    /// Zero or more unique keys for reconciliation.
    pub unique_keys: Vec<UniqueKeySpec>,
}

/// Timestamp fields. Local values are integer milliseconds; remote values
/// are ISO-8601 strings.
#[derive(Debug, Clone)]
pub struct TimestampSpec {
    pub local_field: String,
    pub remote_field: String,
}

/// Optional per-user row scope.
#[derive(Debug, Clone)]
pub struct ScopeSpec {
    /// Column holding the owning user id, on both sides.
    pub user_field: String,
}

// ============================================================================
// TableDescriptor
// ============================================================================

/// Static description of one syncable table pair.
#[derive(Clone)]
pub struct TableDescriptor {
    pub local_table: String,
    pub remote_table: String,
    pub keys: KeySpec,
    pub timestamps: TimestampSpec,
    pub scope: Option<ScopeSpec>,
    /// Remote boolean column marking logical deletion.
    pub soft_delete_field: String,
    /// Human-readable diagnostic name.
    pub label: String,
    pub remote_to_local: MapFn,
    pub local_to_remote: MapFn,
    pub should_sync_local: Option<PushFilterFn>,
}

impl std::fmt::Debug for TableDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableDescriptor")
            .field("local_table", &self.local_table)
            .field("remote_table", &self.remote_table)
            .field("keys", &self.keys)
            .field("timestamps", &self.timestamps)
            .field("scope", &self.scope)
            .field("soft_delete_field", &self.soft_delete_field)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Start building a descriptor for `local_table` ↔ `remote_table`.
pub fn table(local_table: impl Into<String>, remote_table: impl Into<String>) -> TableBuilder {
    TableBuilder {
        local_table: local_table.into(),
        remote_table: remote_table.into(),
        remote_pk: "id".to_string(),
        local_remote_id_field: "remote_id".to_string(),
        unique_keys: Vec::new(),
        local_timestamp_field: "updated_at".to_string(),
        remote_timestamp_field: "updated_at".to_string(),
        scope: None,
        soft_delete_field: "is_deleted".to_string(),
        label: None,
        remote_to_local: None,
        local_to_remote: None,
        should_sync_local: None,
    }
}

/// Builder returned by [`table`].
pub struct TableBuilder {
    local_table: String,
    remote_table: String,
    remote_pk: String,
    local_remote_id_field: String,
    unique_keys: Vec<UniqueKeySpec>,
    local_timestamp_field: String,
    remote_timestamp_field: String,
    scope: Option<ScopeSpec>,
    soft_delete_field: String,
    label: Option<String>,
    remote_to_local: Option<MapFn>,
    local_to_remote: Option<MapFn>,
    should_sync_local: Option<PushFilterFn>,
}

impl TableBuilder {
    pub fn remote_pk(mut self, column: impl Into<String>) -> Self {
        self.remote_pk = column.into();
        self
    }

    pub fn remote_id_field(mut self, field: impl Into<String>) -> Self {
        self.local_remote_id_field = field.into();
        self
    }

    /// Add one unique key (may be called repeatedly for composite setups).
    pub fn unique_key(mut self, local_path: impl Into<String>, remote_path: impl Into<String>) -> Self {
        self.unique_keys.push(UniqueKeySpec::new(local_path, remote_path));
        self
    }

    pub fn timestamps(mut self, local_field: impl Into<String>, remote_field: impl Into<String>) -> Self {
        self.local_timestamp_field = local_field.into();
        self.remote_timestamp_field = remote_field.into();
        self
    }

    pub fn scope(mut self, user_field: impl Into<String>) -> Self {
        self.scope = Some(ScopeSpec {
            user_field: user_field.into(),
        });
        self
    }

    pub fn soft_delete_field(mut self, field: impl Into<String>) -> Self {
        self.soft_delete_field = field.into();
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn remote_to_local(
        mut self,
        f: impl Fn(&Value, &SyncContext) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.remote_to_local = Some(Arc::new(f));
        self
    }

    pub fn local_to_remote(
        mut self,
        f: impl Fn(&Value, &SyncContext) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.local_to_remote = Some(Arc::new(f));
        self
    }

    pub fn should_sync_local(
        mut self,
        f: impl Fn(&Value, &SyncContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_sync_local = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<TableDescriptor> {
        if self.local_table.is_empty() || self.remote_table.is_empty() {
            return Err(SyncError::config("table names must be non-empty"));
        }
        if self.remote_pk.is_empty() || self.local_remote_id_field.is_empty() {
            return Err(SyncError::config("key fields must be non-empty"));
        }
        for key in &self.unique_keys {
            if key.local_path.is_empty() || key.remote_path.is_empty() {
                return Err(SyncError::config(format!(
                    "unique key paths must be non-empty on table {}",
                    self.local_table
                )));
            }
        }

        // Identity mappings suit tables whose row shapes already agree.
        let identity: MapFn = Arc::new(|row: &Value, _ctx: &SyncContext| row.clone());

        Ok(TableDescriptor {
            label: self.label.unwrap_or_else(|| self.local_table.clone()),
            local_table: self.local_table,
            remote_table: self.remote_table,
            keys: KeySpec {
                remote_pk: self.remote_pk,
                local_remote_id_field: self.local_remote_id_field,
                unique_keys: self.unique_keys,
            },
            timestamps: TimestampSpec {
                local_field: self.local_timestamp_field,
                remote_field: self.remote_timestamp_field,
            },
            scope: self.scope,
            soft_delete_field: self.soft_delete_field,
            remote_to_local: self.remote_to_local.unwrap_or_else(|| identity.clone()),
            local_to_remote: self.local_to_remote.unwrap_or(identity),
            should_sync_local: self.should_sync_local,
        })
    }
}
