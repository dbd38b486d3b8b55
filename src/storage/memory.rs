//! In-memory implementation of [`LocalStore`].
//!
//! Holds all records in `Mutex`-guarded maps. User-facing writes tombstone
//! on delete and feed a per-table change log (created/updated/deleted id
//! sets) that `apply_sync_patch` reports and `mark_synced` retires; sync
//! write-backs through `set_fields` bypass the log. Observers receive
//! exactly one event per write batch, emitted after all locks are released
//! so callbacks may re-enter the store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::accessor::read_field;
use crate::error::{Result, SyncError};
use crate::types::{ChangedIds, LocalChanges, PatchSet, Unsubscribe};

use super::traits::{ChangeCallback, LocalChangeEvent, LocalStore};

// ============================================================================
// Internal state
// ============================================================================

#[derive(Debug, Clone)]
struct StoredRecord {
    data: Value,
    /// Locally deleted, awaiting push of the remote soft delete.
    tombstoned: bool,
}

#[derive(Debug, Clone, Default)]
struct ChangeLog {
    created: HashSet<String>,
    updated: HashSet<String>,
    deleted: HashSet<String>,
}

impl ChangeLog {
    fn note_created(&mut self, id: &str) {
        self.created.insert(id.to_string());
    }

    fn note_updated(&mut self, id: &str) {
        if !self.created.contains(id) {
            self.updated.insert(id.to_string());
        }
    }

    fn note_deleted(&mut self, id: &str) -> bool {
        // A record created and deleted between syncs never existed
        // remotely; drop it from the log entirely.
        if self.created.remove(id) {
            return false;
        }
        self.updated.remove(id);
        self.deleted.insert(id.to_string());
        true
    }

    /// Fold a newer log into this one. Deletions win over pending creates
    /// and updates of the same id; the deletion itself is kept so the push
    /// phase can decide whether a remote soft delete is owed.
    fn absorb(&mut self, newer: ChangeLog) {
        self.created.extend(newer.created);
        self.updated.extend(newer.updated);
        self.deleted.extend(newer.deleted);
        for id in &self.deleted {
            self.created.remove(id);
            self.updated.remove(id);
        }
        self.updated.retain(|id| !self.created.contains(id));
    }

    fn as_changed_ids(&self) -> ChangedIds {
        ChangedIds {
            created: self.created.iter().cloned().collect(),
            updated: self.updated.iter().cloned().collect(),
            deleted: self.deleted.iter().cloned().collect(),
        }
    }

    fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

struct Observer {
    id: u64,
    tables: Vec<String>,
    callback: ChangeCallback,
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-memory [`LocalStore`] suitable for tests and embedders without a
/// database.
#[derive(Default)]
pub struct MemoryStore {
    /// table → (record id → record)
    records: Mutex<HashMap<String, HashMap<String, StoredRecord>>>,
    change_log: Mutex<HashMap<String, ChangeLog>>,
    /// Changes reported to a sync cycle but not yet acknowledged as
    /// pushed. Re-reported on the next patch application.
    in_flight: Mutex<HashMap<String, ChangeLog>>,
    last_pulled_at: Mutex<Option<i64>>,
    observers: Arc<Mutex<Vec<Observer>>>,
    next_observer_id: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // User-facing writes
    // -----------------------------------------------------------------------

    /// Insert a record. A missing or empty `id` field gets a generated
    /// UUID. Returns the stored record.
    pub fn create(&self, table: &str, data: Value) -> Result<Value> {
        self.write(|batch| batch.create(table, data))
    }

    /// Merge `fields` into an existing live record.
    pub fn update(&self, table: &str, id: &str, fields: Value) -> Result<()> {
        self.write(|batch| batch.update(table, id, fields))
    }

    /// Tombstone a record. Returns `false` (and emits nothing) when the
    /// record does not exist.
    pub fn delete(&self, table: &str, id: &str) -> Result<bool> {
        self.write(|batch| batch.delete(table, id))
    }

    /// Group several writes into one atomic batch observed as a single
    /// change event.
    pub fn write<T>(&self, f: impl FnOnce(&mut WriteBatch<'_>) -> Result<T>) -> Result<T> {
        let mut batch = WriteBatch {
            store: self,
            touched: Vec::new(),
        };
        let out = f(&mut batch)?;
        let touched = batch.touched;
        self.notify(&touched);
        Ok(out)
    }

    /// Live record count for one table.
    pub fn count(&self, table: &str) -> usize {
        self.records
            .lock()
            .get(table)
            .map(|t| t.values().filter(|r| !r.tombstoned).count())
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn notify(&self, touched: &[String]) {
        if touched.is_empty() {
            return;
        }
        let event = LocalChangeEvent {
            tables: touched.to_vec(),
        };
        let interested: Vec<ChangeCallback> = self
            .observers
            .lock()
            .iter()
            .filter(|o| o.tables.iter().any(|t| touched.contains(t)))
            .map(|o| Arc::clone(&o.callback))
            .collect();
        for callback in interested {
            callback(&event);
        }
    }

    fn merge_fields(record: &mut Value, fields: &Value) -> Result<()> {
        let (Some(target), Some(source)) = (record.as_object_mut(), fields.as_object()) else {
            return Err(SyncError::store("records must be JSON objects"));
        };
        for (k, v) in source {
            target.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}

// ============================================================================
// WriteBatch
// ============================================================================

/// Mutation scope handed to [`MemoryStore::write`] closures.
pub struct WriteBatch<'a> {
    store: &'a MemoryStore,
    touched: Vec<String>,
}

impl WriteBatch<'_> {
    fn touch(&mut self, table: &str) {
        if !self.touched.iter().any(|t| t == table) {
            self.touched.push(table.to_string());
        }
    }

    pub fn create(&mut self, table: &str, mut data: Value) -> Result<Value> {
        let Some(obj) = data.as_object_mut() else {
            return Err(SyncError::store("records must be JSON objects"));
        };
        let id = match obj.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                obj.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };

        let mut records = self.store.records.lock();
        let table_records = records.entry(table.to_string()).or_default();
        if table_records.contains_key(&id) {
            return Err(SyncError::store(format!(
                "record {id} already exists in {table}"
            )));
        }
        table_records.insert(
            id.clone(),
            StoredRecord {
                data: data.clone(),
                tombstoned: false,
            },
        );
        drop(records);

        self.store
            .change_log
            .lock()
            .entry(table.to_string())
            .or_default()
            .note_created(&id);
        self.touch(table);
        Ok(data)
    }

    pub fn update(&mut self, table: &str, id: &str, fields: Value) -> Result<()> {
        let mut records = self.store.records.lock();
        let record = records
            .get_mut(table)
            .and_then(|t| t.get_mut(id))
            .filter(|r| !r.tombstoned)
            .ok_or_else(|| SyncError::store(format!("no record {id} in {table}")))?;
        MemoryStore::merge_fields(&mut record.data, &fields)?;
        drop(records);

        self.store
            .change_log
            .lock()
            .entry(table.to_string())
            .or_default()
            .note_updated(id);
        self.touch(table);
        Ok(())
    }

    pub fn delete(&mut self, table: &str, id: &str) -> Result<bool> {
        let mut records = self.store.records.lock();
        let Some(record) = records.get_mut(table).and_then(|t| t.get_mut(id)) else {
            return Ok(false);
        };
        if record.tombstoned {
            return Ok(false);
        }
        record.tombstoned = true;
        drop(records);

        let dropped_from_log = !self
            .store
            .change_log
            .lock()
            .entry(table.to_string())
            .or_default()
            .note_deleted(id);
        if dropped_from_log {
            // Never pushed; nothing will reference the tombstone again.
            if let Some(table_records) = self.store.records.lock().get_mut(table) {
                table_records.remove(id);
            }
        }
        self.touch(table);
        Ok(true)
    }
}

// ============================================================================
// LocalStore implementation
// ============================================================================

impl LocalStore for MemoryStore {
    fn observe_changes(&self, tables: &[String], callback: ChangeCallback) -> Unsubscribe {
        let id = {
            let mut next = self.next_observer_id.lock();
            *next += 1;
            *next
        };
        self.observers.lock().push(Observer {
            id,
            tables: tables.to_vec(),
            callback,
        });

        let observers = Arc::clone(&self.observers);
        Box::new(move || {
            observers.lock().retain(|o| o.id != id);
        })
    }

    fn find_by_field(&self, table: &str, field: &str, value: &Value) -> Result<Option<Value>> {
        let records = self.records.lock();
        Ok(records.get(table).and_then(|t| {
            // Tombstoned rows still match (a pending local deletion must
            // keep claiming its remote row), but live rows win.
            let mut tombstoned_match = None;
            for r in t.values() {
                if read_field(&r.data, field) != Some(value) {
                    continue;
                }
                if !r.tombstoned {
                    return Some(r.data.clone());
                }
                tombstoned_match.get_or_insert_with(|| r.data.clone());
            }
            tombstoned_match
        }))
    }

    fn query_with_scope(&self, table: &str, filters: &[(String, Value)]) -> Result<Vec<Value>> {
        let records = self.records.lock();
        Ok(records
            .get(table)
            .map(|t| {
                t.values()
                    .filter(|r| !r.tombstoned)
                    .filter(|r| {
                        filters
                            .iter()
                            .all(|(field, value)| read_field(&r.data, field) == Some(value))
                    })
                    .map(|r| r.data.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn find_by_id(&self, table: &str, id: &str) -> Result<Option<Value>> {
        let records = self.records.lock();
        Ok(records
            .get(table)
            .and_then(|t| t.get(id))
            .map(|r| r.data.clone()))
    }

    fn set_fields(&self, table: &str, id: &str, fields: &[(String, Value)]) -> Result<()> {
        {
            let mut records = self.records.lock();
            let record = records
                .get_mut(table)
                .and_then(|t| t.get_mut(id))
                .ok_or_else(|| SyncError::store(format!("no record {id} in {table}")))?;
            let mut patch = Map::new();
            for (field, value) in fields {
                patch.insert(field.clone(), value.clone());
            }
            MemoryStore::merge_fields(&mut record.data, &Value::Object(patch))?;
        }
        // One atomic write, one notification; the change log is untouched.
        self.notify(&[table.to_string()]);
        Ok(())
    }

    fn apply_sync_patch(&self, patch: &PatchSet, new_last_pulled_at: i64) -> Result<LocalChanges> {
        let mut touched: Vec<String> = Vec::new();
        {
            let mut records = self.records.lock();
            for (table, table_patch) in patch {
                if table_patch.is_empty() {
                    continue;
                }
                touched.push(table.clone());
                let table_records = records.entry(table.clone()).or_default();

                for record in &table_patch.created {
                    let Some(id) = record.get("id").and_then(Value::as_str) else {
                        return Err(SyncError::store(format!(
                            "created patch record in {table} has no id"
                        )));
                    };
                    table_records.insert(
                        id.to_string(),
                        StoredRecord {
                            data: record.clone(),
                            tombstoned: false,
                        },
                    );
                }

                for record in &table_patch.updated {
                    let Some(id) = record.get("id").and_then(Value::as_str) else {
                        return Err(SyncError::store(format!(
                            "updated patch record in {table} has no id"
                        )));
                    };
                    match table_records.get_mut(id) {
                        Some(existing) => {
                            MemoryStore::merge_fields(&mut existing.data, record)?;
                            existing.tombstoned = false;
                        }
                        None => {
                            debug!(table, id, "patch updated a missing record; inserting");
                            table_records.insert(
                                id.to_string(),
                                StoredRecord {
                                    data: record.clone(),
                                    tombstoned: false,
                                },
                            );
                        }
                    }
                }

                for id in &table_patch.deleted {
                    table_records.remove(id);
                }
            }
        }

        *self.last_pulled_at.lock() = Some(new_last_pulled_at);

        let changes: LocalChanges = {
            let drained = std::mem::take(&mut *self.change_log.lock());
            let mut in_flight = self.in_flight.lock();
            for (table, log) in drained {
                in_flight.entry(table).or_default().absorb(log);
            }
            in_flight
                .iter()
                .filter(|(_, l)| !l.is_empty())
                .map(|(table, l)| (table.clone(), l.as_changed_ids()))
                .collect()
        };

        self.notify(&touched);
        Ok(changes)
    }

    fn mark_synced(&self, table: &str) -> Result<()> {
        self.in_flight.lock().remove(table);
        Ok(())
    }

    fn last_pulled_at(&self) -> Result<Option<i64>> {
        Ok(*self.last_pulled_at.lock())
    }
}

// ============================================================================
// Tests
// ============================================================================
