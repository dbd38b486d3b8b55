//! Core sync types: contexts, patches, change sets, and cycle summaries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

// ============================================================================
// SyncContext
// ============================================================================

/// Per-call context threaded into every mapping and scope-applying query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncContext {
    /// Restricts queries and change streams to this user's rows when the
    /// descriptor declares a scope field.
    pub user_id: Option<String>,
}

impl SyncContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }

    /// Merge a per-call override over an engine default. Fields set on the
    /// override win.
    pub fn merged_over(&self, base: &SyncContext) -> SyncContext {
        SyncContext {
            user_id: self.user_id.clone().or_else(|| base.user_id.clone()),
        }
    }
}

// ============================================================================
// Patches (remote → local)
// ============================================================================

/// Changes for one local table, ready for atomic application.
#[derive(Debug, Clone, Default)]
pub struct TablePatch {
    /// Full records to insert. Each carries its local `id`.
    pub created: Vec<Value>,
    /// Field patches keyed by the `id` each record carries.
    pub updated: Vec<Value>,
    /// Local ids to remove.
    pub deleted: Vec<String>,
}

impl TablePatch {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Aggregate pull output for a cycle: local table → patch.
pub type PatchSet = HashMap<String, TablePatch>;

// ============================================================================
// Local change sets (local → remote)
// ============================================================================

/// Ids of locally mutated records for one table, as reported by the local
/// store since the previous patch application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedIds {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangedIds {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Created ∪ updated, the upsert phase input.
    pub fn upsert_ids(&self) -> impl Iterator<Item = &String> {
        self.created.iter().chain(self.updated.iter())
    }
}

/// Local mutations per table, collected by `LocalStore::apply_sync_patch`.
pub type LocalChanges = HashMap<String, ChangedIds>;

// ============================================================================
// Engine outcomes
// ============================================================================

/// Result of a single-table pull.
#[derive(Debug, Clone, Default)]
pub struct PullOutcome {
    pub patch: TablePatch,
    /// Largest remote timestamp seen during the pull. Informational; cycle
    /// bookkeeping advances on the instant captured before paging started.
    pub max_remote_updated_at: Option<i64>,
}

/// A push skip caused by the remote row being at least as new.
#[derive(Debug, Clone, Serialize)]
pub struct PushConflict {
    pub local_id: String,
    pub remote_id: String,
    pub local_updated_at: i64,
    pub remote_updated_at: i64,
}

/// Result of a single-table push.
#[derive(Debug, Clone, Default)]
pub struct PushSummary {
    /// Remote rows written (soft deletes, updates, and inserts).
    pub pushed: usize,
    /// Upserts skipped because the remote side was at least as new.
    pub conflicts: Vec<PushConflict>,
}

// ============================================================================
// Coordinator state
// ============================================================================

/// Snapshot of the coordinator's observable state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncState {
    /// Auto-sync is enabled.
    pub running: bool,
    /// Labels of tables currently being pulled.
    pub in_progress: Vec<String>,
    /// Start instant (ms) of the last successfully completed cycle.
    pub last_sync_at: Option<i64>,
    pub registered_tables: Vec<String>,
    /// Count of failed cycles since construction.
    pub errors: u64,
}

// ============================================================================
// Options
// ============================================================================

/// Clock used for cycle instants and soft-delete timestamps. Production
/// deployments should return server time to avoid client clock skew.
pub type TimeProvider = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Detaches a callback registered with an observable.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Configuration for [`SyncManager`](crate::SyncManager).
#[derive(Clone)]
pub struct SyncOptions {
    /// Quiet window for coalescing change triggers.
    pub debounce: Duration,
    /// Defaults to the local wall clock.
    pub time_provider: Option<TimeProvider>,
    /// Engine-level default context, merged under per-call overrides.
    pub context: SyncContext,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(3000),
            time_provider: None,
            context: SyncContext::default(),
        }
    }
}
