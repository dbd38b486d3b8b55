//! Change-notification suppression.
//!
//! Every write the sync engine performs against the local store comes back
//! around as a change notification, and an unchecked notification would
//! schedule another cycle. A boolean "inside sync" flag races when
//! notifications fan out asynchronously, so suppression is a counter: each
//! suppressed write pushes one unit, each observed notification pops one.
//!
//! The counter only counts while *armed*. Arming happens when a consumer
//! attaches (the coordinator's change observer); without one, increments
//! would never be popped and the counter would drift.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Non-negative suppression counter shared between the engines (which
/// raise it around their writes) and the coordinator's change observer
/// (which consumes it one notification at a time).
#[derive(Debug, Default)]
pub struct ChangeSuppressor {
    depth: AtomicUsize,
    armed: AtomicBool,
}

impl ChangeSuppressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting. Clears any residue left by notifications that were
    /// in flight when the previous consumer detached.
    pub fn arm(&self) {
        self.depth.store(0, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Stop counting and clear the counter.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.depth.store(0, Ordering::SeqCst);
    }

    /// Run `work`, with the counter raised by one while armed.
    ///
    /// The matching decrement is *not* performed here: it happens when the
    /// resulting change notification is filtered through
    /// [`check_and_decrement`](Self::check_and_decrement), which may be
    /// long after `work` itself returned. Nested suppression composes by
    /// addition.
    pub fn run_suppressed<T>(&self, work: impl FnOnce() -> T) -> T {
        if self.armed.load(Ordering::SeqCst) {
            self.depth.fetch_add(1, Ordering::SeqCst);
        }
        work()
    }

    /// Classify one change notification.
    ///
    /// Returns `true` when the counter is zero — a genuine external change
    /// that should schedule sync work. Otherwise pops one unit and returns
    /// `false`: the notification originated from a suppressed write.
    pub fn check_and_decrement(&self) -> bool {
        self.depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
    }

    /// Current suppression depth.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}
