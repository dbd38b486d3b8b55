//! Typed event fan-out.
//!
//! Listener failures must never reach the emitter or starve other
//! listeners: each callback runs under `catch_unwind` and panics are
//! logged. Delivery is FIFO among the listeners of one emit.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::types::{PushConflict, SyncState, Unsubscribe};

// ============================================================================
// SyncEvent
// ============================================================================

/// Everything the coordinator reports to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A table's pull completed and its patch was staged.
    Pulled {
        label: String,
        created: usize,
        updated: usize,
        deleted: usize,
    },
    /// A table's push completed.
    Pushed { label: String, pushed: usize, skipped: usize },
    /// Push skipped an upsert because the remote row was at least as new.
    Conflict { label: String, conflict: PushConflict },
    /// A cycle failed; `label` names the table when the failure was
    /// table-scoped.
    Error { label: Option<String>, message: String },
    /// Observable coordinator state changed.
    State { state: SyncState },
    /// A realtime subscription reported remote activity.
    RemoteChanged { label: String },
}

// ============================================================================
// EventBus
// ============================================================================

pub type EventListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Publish/subscribe hub for [`SyncEvent`]s.
#[derive(Default)]
pub struct EventBus {
    inner: Arc<Mutex<ListenerTable>>,
}

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    listeners: Vec<(u64, EventListener)>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. The returned closure removes it again;
    /// dropping the closure without calling it leaves the listener
    /// attached for the lifetime of the bus.
    pub fn subscribe(&self, listener: EventListener) -> Unsubscribe {
        let id = {
            let mut table = self.inner.lock();
            let id = table.next_id;
            table.next_id += 1;
            table.listeners.push((id, listener));
            id
        };

        let inner = Arc::clone(&self.inner);
        Box::new(move || {
            inner.lock().listeners.retain(|(lid, _)| *lid != id);
        })
    }

    /// Deliver `event` to every listener registered at the time of the
    /// call. Listeners registered or removed by a callback take effect for
    /// the next emit.
    pub fn emit(&self, event: &SyncEvent) {
        let snapshot: Vec<EventListener> = self
            .inner
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(?event, "sync event listener panicked");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}
