//! Narrow interface onto the local reactive database.
//!
//! Covers only the operations the sync engine needs; the database itself
//! (persistence, queries, reactivity for the application) is an external
//! collaborator.

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::types::{LocalChanges, PatchSet, Unsubscribe};

/// One change notification, emitted once per atomic write batch.
#[derive(Debug, Clone)]
pub struct LocalChangeEvent {
    /// Tables touched by the batch.
    pub tables: Vec<String>,
}

pub type ChangeCallback = Arc<dyn Fn(&LocalChangeEvent) + Send + Sync>;

/// Local database operations consumed by the sync engine.
///
/// # Threading
/// All methods are synchronous. Callers that use this from async contexts
/// should be aware that these calls will block the current thread.
pub trait LocalStore: Send + Sync {
    /// Observe change notifications for the given tables, at-least-once,
    /// one event per atomic write batch.
    fn observe_changes(&self, tables: &[String], callback: ChangeCallback) -> Unsubscribe;

    /// The sole record whose `field` equals `value`, or `None`. Live rows
    /// take precedence, but a locally tombstoned row still matches — its
    /// pending deletion must keep claiming the remote row it maps to.
    fn find_by_field(&self, table: &str, field: &str, value: &Value) -> Result<Option<Value>>;

    /// All live records matching every equality filter.
    fn query_with_scope(&self, table: &str, filters: &[(String, Value)]) -> Result<Vec<Value>>;

    /// A record by id, whether live or locally tombstoned (a pending
    /// deletion still carries the remote id the push phase needs).
    fn find_by_id(&self, table: &str, id: &str) -> Result<Option<Value>>;

    /// Set fields on one record in a single atomic write. Used for sync
    /// write-backs: the change notification fires as usual, but the record
    /// is *not* marked as locally changed.
    fn set_fields(&self, table: &str, id: &str, fields: &[(String, Value)]) -> Result<()>;

    /// Apply a pull patch atomically and persist `new_last_pulled_at`.
    /// Returns the push phase's input: the local mutations observed since
    /// the previous call, plus any earlier mutations that were reported
    /// but never acknowledged via [`mark_synced`](Self::mark_synced) — a
    /// failed push must not lose its delta.
    fn apply_sync_patch(&self, patch: &PatchSet, new_last_pulled_at: i64) -> Result<LocalChanges>;

    /// Acknowledge that the changes last reported for `table` reached the
    /// remote. Mutations observed after the report are unaffected and will
    /// be reported next time.
    fn mark_synced(&self, table: &str) -> Result<()>;

    /// The instant the previous patch application recorded, or `None`
    /// before the first sync.
    fn last_pulled_at(&self) -> Result<Option<i64>>;
}
