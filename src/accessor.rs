//! Local record access helpers.
//!
//! Bridges the remote column convention (snake_case) and common local
//! object conventions (camelCase): every field read tries the exact name,
//! then the camelCase form, then the snake_case form. Also home to the
//! timestamp coercions and the dotted-path unique-key extraction shared by
//! pull matching and push target resolution.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value};

use crate::descriptor::TableDescriptor;
use crate::error::{Result, SyncError};
use crate::storage::LocalStore;
use crate::types::SyncContext;

// ============================================================================
// Name-style fallback
// ============================================================================

/// `remoteId` → `remote_id`. Already-snake input passes through.
pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// `remote_id` → `remoteId`. Already-camel input passes through.
pub fn to_camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.push(ch.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Read a field trying the exact name, then camelCase, then snake_case.
pub fn read_field<'a>(record: &'a Value, name: &str) -> Option<&'a Value> {
    let obj = record.as_object()?;
    if let Some(v) = obj.get(name) {
        return Some(v);
    }
    if let Some(v) = obj.get(&to_camel_case(name)) {
        return Some(v);
    }
    obj.get(&to_snake_case(name))
}

// ============================================================================
// Timestamps
// ============================================================================

/// Parse an ISO-8601 timestamp string to integer milliseconds.
pub fn parse_iso_ms(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Render integer milliseconds as an ISO-8601 (RFC 3339) UTC string.
/// Out-of-range inputs clamp to the epoch.
pub fn iso_string(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Coerce a value to integer milliseconds: integers and floats pass
/// through, numeric strings are parsed, date strings are parsed as
/// ISO-8601. Anything else is 0.
pub fn coerce_timestamp_ms(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => {
            if let Ok(n) = s.parse::<i64>() {
                n
            } else {
                parse_iso_ms(s).unwrap_or(0)
            }
        }
        _ => 0,
    }
}

// ============================================================================
// Unique-key paths
// ============================================================================

/// Extract a value at a dotted path. The head segment is read with the
/// name-style fallback; if its value is a JSON-text string it is parsed
/// before the remaining segments traverse it. Missing or unparseable
/// intermediates yield `None`.
pub fn extract_path(record: &Value, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let head = segments.next()?;
    let mut current = read_field(record, head)?.clone();

    for segment in segments {
        if let Value::String(text) = &current {
            current = serde_json::from_str(text).ok()?;
        }
        current = current.get(segment)?.clone();
    }
    Some(current)
}

/// Serialize an ordered list of unique-key values into one comparable
/// string. Both sides of every comparison must use this exact encoding.
pub fn serialize_key(values: &[Value]) -> String {
    Value::Array(values.to_vec()).to_string()
}

// ============================================================================
// LocalAccessor
// ============================================================================

/// Descriptor-aware reads against the local store.
pub struct LocalAccessor {
    descriptor: Arc<TableDescriptor>,
    store: Arc<dyn LocalStore>,
}

impl LocalAccessor {
    pub fn new(descriptor: Arc<TableDescriptor>, store: Arc<dyn LocalStore>) -> Self {
        Self { descriptor, store }
    }

    /// The sole live record whose remote-id field equals `remote_id`.
    pub fn find_by_remote_id(&self, remote_id: &str) -> Result<Option<Value>> {
        self.store.find_by_field(
            &self.descriptor.local_table,
            &self.descriptor.keys.local_remote_id_field,
            &Value::String(remote_id.to_string()),
        )
    }

    /// The record's stable local id.
    pub fn record_id(&self, record: &Value) -> Result<String> {
        read_field(record, "id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                SyncError::store(format!(
                    "record in {} has no string id",
                    self.descriptor.local_table
                ))
            })
    }

    /// The record's remote id, or `None` when empty or absent (the row
    /// never reached the remote).
    pub fn remote_id_of(&self, record: &Value) -> Option<String> {
        read_field(record, &self.descriptor.keys.local_remote_id_field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    /// The record's local timestamp in milliseconds.
    pub fn record_timestamp_ms(&self, record: &Value) -> i64 {
        read_field(record, &self.descriptor.timestamps.local_field)
            .map(coerce_timestamp_ms)
            .unwrap_or(0)
    }

    /// True iff the record's soft-delete field is boolean `true`.
    pub fn is_soft_deleted(&self, record: &Value) -> bool {
        read_field(record, &self.descriptor.soft_delete_field)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Extract every configured local unique-key path from `record`,
    /// erroring on the first missing path.
    pub fn unique_key_values(&self, record: &Value) -> Result<Vec<Value>> {
        let id = self.record_id(record).unwrap_or_default();
        self.descriptor
            .keys
            .unique_keys
            .iter()
            .map(|key| {
                extract_path(record, &key.local_path).ok_or_else(|| SyncError::MissingKeyPath {
                    table: self.descriptor.local_table.clone(),
                    path: key.local_path.clone(),
                    id: id.clone(),
                })
            })
            .collect()
    }

    /// Index all live rows by serialized unique key, optionally filtered to
    /// the context's user scope. Duplicate keys among live rows are an
    /// integrity error, not a silent merge.
    pub fn build_unique_index(&self, ctx: &SyncContext) -> Result<HashMap<String, Value>> {
        let mut filters: Vec<(String, Value)> = Vec::new();
        if let (Some(scope), Some(user_id)) = (&self.descriptor.scope, &ctx.user_id) {
            filters.push((scope.user_field.clone(), json!(user_id)));
        }

        let rows = self
            .store
            .query_with_scope(&self.descriptor.local_table, &filters)?;

        let mut index = HashMap::with_capacity(rows.len());
        for record in rows {
            if self.is_soft_deleted(&record) {
                continue;
            }
            let key = serialize_key(&self.unique_key_values(&record)?);
            if index.insert(key.clone(), record).is_some() {
                return Err(SyncError::DuplicateLocalKey {
                    table: self.descriptor.local_table.clone(),
                    key,
                });
            }
        }
        Ok(index)
    }

    /// Route a local write through the suppressor so its change
    /// notification is absorbed instead of scheduling another cycle.
    pub fn write_suppressed(
        &self,
        suppressor: &crate::suppress::ChangeSuppressor,
        id: &str,
        fields: &[(String, Value)],
    ) -> Result<()> {
        suppressor.run_suppressed(|| {
            self.store
                .set_fields(&self.descriptor.local_table, id, fields)
        })
    }
}
