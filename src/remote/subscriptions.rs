//! Per-table registry of live realtime subscription handles.
//!
//! Push temporarily tears down the pushed table's channel so the gateway's
//! echo of our own writes cannot re-trigger a cycle; only that table's
//! window goes blind, other tables keep streaming.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use super::gateway::RemoteSubscription;

#[derive(Default)]
pub(crate) struct SubscriptionMux {
    active: Mutex<HashMap<String, Box<dyn RemoteSubscription>>>,
}

impl SubscriptionMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle for `table`, closing any handle it displaces.
    pub fn insert(&self, table: &str, handle: Box<dyn RemoteSubscription>) {
        if let Some(old) = self.active.lock().insert(table.to_string(), handle) {
            debug!(table, "replacing live remote subscription");
            old.close();
        }
    }

    /// Close and remove `table`'s handle. Returns whether one was active —
    /// the caller uses this to know a resubscribe is owed.
    pub fn pause(&self, table: &str) -> bool {
        match self.active.lock().remove(table) {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Close everything.
    pub fn clear(&self) {
        for (table, handle) in self.active.lock().drain() {
            debug!(table, "closing remote subscription");
            handle.close();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.active.lock().len()
    }
}
