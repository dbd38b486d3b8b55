//! Debounced trigger coalescing.
//!
//! A burst of change notifications should cost one cycle, not one cycle
//! per notification: triggers reset a quiet window and the callback fires
//! once after the window elapses undisturbed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Coalesces [`trigger`](Self::trigger) calls into one firing per quiet
/// window. The timer task lives on the runtime whose handle is supplied at
/// construction; dropping the handle aborts it.
pub struct Debounced {
    tx: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl Debounced {
    pub fn new(
        runtime: &tokio::runtime::Handle,
        quiet: Duration,
        on_fire: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let task = runtime.spawn(async move {
            while rx.recv().await.is_some() {
                // Keep absorbing triggers until the window stays quiet.
                loop {
                    match tokio::time::timeout(quiet, rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                on_fire();
            }
        });
        Self { tx, task }
    }

    /// Request a firing. Cheap and callable from any thread.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Stop the timer task; pending triggers are discarded.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for Debounced {
    fn drop(&mut self) {
        self.task.abort();
    }
}
