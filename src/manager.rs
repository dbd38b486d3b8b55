//! Cycle orchestration across all registered tables.
//!
//! One cycle pulls every table, applies the aggregate patch atomically
//! under suppression, then pushes every table that reported local changes
//! (pausing that table's realtime channel around the push). At most one
//! cycle runs at a time; overlapping `sync_now` calls share the running
//! cycle's completion, and changes observed mid-cycle queue a compensation
//! cycle so the engine settles before going quiet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::descriptor::TableDescriptor;
use crate::engine::TableEngine;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, EventListener, SyncEvent};
use crate::remote::subscriptions::SubscriptionMux;
use crate::remote::{RemoteChange, RemoteChangeCallback, RemoteGateway};
use crate::scheduler::Debounced;
use crate::storage::{LocalChangeEvent, LocalStore};
use crate::suppress::ChangeSuppressor;
use crate::types::{
    PatchSet, SyncContext, SyncOptions, SyncState, TimeProvider, Unsubscribe,
};

// ============================================================================
// SyncManager
// ============================================================================

/// Coordinates Pull/Push cycles for a fixed set of table descriptors.
///
/// Cheaply cloneable; clones share all state.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    engines: Vec<Arc<TableEngine>>,
    store: Arc<dyn LocalStore>,
    suppressor: Arc<ChangeSuppressor>,
    bus: EventBus,
    time_provider: TimeProvider,
    default_ctx: SyncContext,
    debounce: Duration,
    run: Mutex<RunState>,
    subscriptions: SubscriptionMux,
    subs_enabled: AtomicBool,
    debounced: Mutex<Option<Debounced>>,
    local_observer: Mutex<Option<Unsubscribe>>,
}

#[derive(Default)]
struct RunState {
    is_syncing: bool,
    has_pending_change: bool,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    in_progress: Vec<String>,
    last_sync_at: Option<i64>,
    errors: u64,
    running: bool,
}

impl SyncManager {
    /// Build a coordinator over `descriptors`. The set is immutable for
    /// the manager's lifetime.
    pub fn new(
        store: Arc<dyn LocalStore>,
        gateway: Arc<dyn RemoteGateway>,
        descriptors: Vec<TableDescriptor>,
        options: SyncOptions,
    ) -> Result<Self> {
        for (i, d) in descriptors.iter().enumerate() {
            if descriptors[..i].iter().any(|o| o.local_table == d.local_table) {
                return Err(SyncError::config(format!(
                    "table {} registered twice",
                    d.local_table
                )));
            }
        }

        let suppressor = Arc::new(ChangeSuppressor::new());
        let time_provider: TimeProvider = options
            .time_provider
            .unwrap_or_else(|| Arc::new(|| chrono::Utc::now().timestamp_millis()));

        let engines = descriptors
            .into_iter()
            .map(|d| {
                Arc::new(TableEngine::new(
                    Arc::new(d),
                    Arc::clone(&store),
                    Arc::clone(&gateway),
                    Arc::clone(&suppressor),
                    Arc::clone(&time_provider),
                ))
            })
            .collect();

        Ok(Self {
            inner: Arc::new(ManagerInner {
                engines,
                store,
                suppressor,
                bus: EventBus::new(),
                time_provider,
                default_ctx: options.context,
                debounce: options.debounce,
                run: Mutex::new(RunState::default()),
                subscriptions: SubscriptionMux::new(),
                subs_enabled: AtomicBool::new(false),
                debounced: Mutex::new(None),
                local_observer: Mutex::new(None),
            }),
        })
    }

    /// Subscribe to the coordinator's event stream.
    pub fn on_event(&self, listener: EventListener) -> Unsubscribe {
        self.inner.bus.subscribe(listener)
    }

    /// Current observable state.
    pub fn state(&self) -> SyncState {
        self.inner.snapshot_state()
    }

    /// The suppression counter shared with the engines. Exposed for
    /// embedders whose own maintenance writes must not re-trigger sync.
    pub fn suppressor(&self) -> &Arc<ChangeSuppressor> {
        &self.inner.suppressor
    }

    // -----------------------------------------------------------------------
    // sync_now
    // -----------------------------------------------------------------------

    /// Run a full cycle now (plus compensation cycles until quiescent).
    ///
    /// When a cycle is already running the call enqueues onto it: the
    /// shared cycle's completion resolves every caller, and the running
    /// cycle is told to run once more before settling.
    pub async fn sync_now(&self, ctx: Option<SyncContext>) -> Result<()> {
        let ctx = self.inner.merge_ctx(ctx);

        let waiter = {
            let mut run = self.inner.run.lock();
            if run.is_syncing {
                run.has_pending_change = true;
                let (tx, rx) = oneshot::channel();
                run.waiters.push(tx);
                Some(rx)
            } else {
                run.is_syncing = true;
                None
            }
        };

        if let Some(rx) = waiter {
            return rx.await.unwrap_or(Err(SyncError::Canceled));
        }

        let result = self.run_until_quiescent(&ctx).await;

        let waiters = {
            let mut run = self.inner.run.lock();
            run.is_syncing = false;
            std::mem::take(&mut run.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        self.inner.emit_state();
        result
    }

    async fn run_until_quiescent(&self, ctx: &SyncContext) -> Result<()> {
        loop {
            let result = self.run_cycle(ctx).await;

            let (waiters, again) = {
                let mut run = self.inner.run.lock();
                match &result {
                    Ok(cycle_start) => run.last_sync_at = Some(*cycle_start),
                    Err(_) => run.errors += 1,
                }
                let waiters = std::mem::take(&mut run.waiters);
                let again = result.is_ok() && std::mem::take(&mut run.has_pending_change);
                (waiters, again)
            };

            let shared = result.clone().map(|_| ());
            for waiter in waiters {
                let _ = waiter.send(shared.clone());
            }
            self.inner.emit_state();

            if !again {
                return shared;
            }
            debug!("changes arrived mid-cycle; running compensation cycle");
        }
    }

    // -----------------------------------------------------------------------
    // One cycle
    // -----------------------------------------------------------------------

    /// Pull all tables, apply, push changed tables. Returns the cycle
    /// start instant on success.
    async fn run_cycle(&self, ctx: &SyncContext) -> Result<i64> {
        let inner = &self.inner;
        // Captured before any page is fetched: rows written while paging
        // runs are redelivered next cycle rather than lost.
        let cycle_start = (inner.time_provider)();
        let last_pulled_at = inner.store.last_pulled_at().map_err(|e| {
            inner.emit_error(None, &e);
            e
        })?;

        let mut patch = PatchSet::new();
        for engine in &inner.engines {
            let descriptor = engine.descriptor();
            let label = descriptor.label.clone();

            inner.set_in_progress(&label, true);
            let pulled = engine.pull(last_pulled_at, ctx).await;
            inner.set_in_progress(&label, false);

            match pulled {
                Ok(outcome) => {
                    inner.bus.emit(&SyncEvent::Pulled {
                        label,
                        created: outcome.patch.created.len(),
                        updated: outcome.patch.updated.len(),
                        deleted: outcome.patch.deleted.len(),
                    });
                    patch.insert(descriptor.local_table.clone(), outcome.patch);
                }
                Err(e) => {
                    // The aggregate patch is no longer consistent; later
                    // tables are not attempted.
                    inner.emit_error(Some(&label), &e);
                    return Err(e);
                }
            }
        }

        let has_mutations = patch.values().any(|p| !p.is_empty());
        let applied = if has_mutations {
            inner
                .suppressor
                .run_suppressed(|| inner.store.apply_sync_patch(&patch, cycle_start))
        } else {
            // No record mutation means no change notification to absorb.
            inner.store.apply_sync_patch(&patch, cycle_start)
        };
        let changes = applied.map_err(|e| {
            inner.emit_error(None, &e);
            e
        })?;

        for engine in &inner.engines {
            let descriptor = engine.descriptor();
            let label = descriptor.label.clone();
            let Some(table_changes) = changes.get(&descriptor.local_table) else {
                continue;
            };
            if table_changes.is_empty() {
                continue;
            }

            let paused = inner.subs_enabled.load(Ordering::SeqCst)
                && inner.subscriptions.pause(&descriptor.local_table);
            let pushed = engine.push(table_changes, ctx).await;
            if paused {
                self.reopen_subscription(engine, ctx).await;
            }

            match pushed {
                Ok(summary) => {
                    // Acknowledge so the same delta is not reported again;
                    // a failed push skips this and keeps its delta alive.
                    if let Err(e) = inner.store.mark_synced(&descriptor.local_table) {
                        inner.emit_error(Some(&label), &e);
                        return Err(e);
                    }
                    for conflict in &summary.conflicts {
                        inner.bus.emit(&SyncEvent::Conflict {
                            label: label.clone(),
                            conflict: conflict.clone(),
                        });
                    }
                    inner.bus.emit(&SyncEvent::Pushed {
                        label,
                        pushed: summary.pushed,
                        skipped: summary.conflicts.len(),
                    });
                }
                Err(e) => {
                    inner.emit_error(Some(&label), &e);
                    return Err(e);
                }
            }
        }

        Ok(cycle_start)
    }

    async fn reopen_subscription(&self, engine: &Arc<TableEngine>, ctx: &SyncContext) {
        let descriptor = engine.descriptor();
        let callback = self.remote_callback(descriptor.label.clone());
        match engine.subscribe(ctx, callback).await {
            Ok(handle) => self.inner.subscriptions.insert(&descriptor.local_table, handle),
            Err(e) => warn!(
                table = %descriptor.label,
                error = %e,
                "failed to reopen remote subscription after push"
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Auto-sync
    // -----------------------------------------------------------------------

    /// Enable auto-sync: local change notifications (filtered through the
    /// suppressor) schedule a debounced cycle. Must be called within a
    /// tokio runtime.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        self.ensure_debounced()?;

        let mut observer = inner.local_observer.lock();
        if observer.is_none() {
            let tables: Vec<String> = inner
                .engines
                .iter()
                .map(|e| e.descriptor().local_table.clone())
                .collect();
            let weak = Arc::downgrade(inner);
            let callback = Arc::new(move |_event: &LocalChangeEvent| {
                let Some(inner) = weak.upgrade() else { return };
                if inner.suppressor.check_and_decrement() {
                    inner.note_external_trigger();
                }
            });
            *observer = Some(inner.store.observe_changes(&tables, callback));
            inner.suppressor.arm();
        }
        drop(observer);

        inner.run.lock().running = true;
        inner.emit_state();
        Ok(())
    }

    /// Disable auto-sync and tear everything transient down: the local
    /// observer, all realtime subscriptions, and the debounce timer. An
    /// in-flight cycle is not interrupted; it completes and nothing
    /// further is scheduled.
    pub fn stop(&self) {
        let inner = &self.inner;
        if let Some(unsubscribe) = inner.local_observer.lock().take() {
            unsubscribe();
            inner.suppressor.disarm();
        }
        if let Some(debounced) = inner.debounced.lock().take() {
            debounced.cancel();
        }
        inner.subs_enabled.store(false, Ordering::SeqCst);
        inner.subscriptions.clear();
        inner.run.lock().running = false;
        inner.emit_state();
    }

    fn ensure_debounced(&self) -> Result<()> {
        let mut debounced = self.inner.debounced.lock();
        if debounced.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SyncError::config("sync scheduling requires a tokio runtime"))?;

        let weak = Arc::downgrade(&self.inner);
        let spawn_handle = runtime.clone();
        let on_fire: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            let Some(inner) = weak.upgrade() else { return };
            let manager = SyncManager { inner };
            spawn_handle.spawn(async move {
                // Failures already surfaced as error events and counters.
                if let Err(e) = manager.sync_now(None).await {
                    debug!(error = %e, "scheduled cycle failed");
                }
            });
        });
        *debounced = Some(Debounced::new(&runtime, self.inner.debounce, on_fire));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Remote subscriptions
    // -----------------------------------------------------------------------

    /// Open a realtime channel per table (scope-filtered) so remote writes
    /// schedule cycles without polling. Independent of auto-sync.
    pub async fn enable_remote_subscriptions(&self, ctx: Option<SyncContext>) -> Result<()> {
        let inner = &self.inner;
        let ctx = inner.merge_ctx(ctx);
        self.ensure_debounced()?;
        inner.subs_enabled.store(true, Ordering::SeqCst);

        for engine in &inner.engines {
            let descriptor = engine.descriptor();
            let callback = self.remote_callback(descriptor.label.clone());
            match engine.subscribe(&ctx, callback).await {
                Ok(handle) => inner.subscriptions.insert(&descriptor.local_table, handle),
                Err(e) => warn!(
                    table = %descriptor.label,
                    error = %e,
                    "failed to open remote subscription"
                ),
            }
        }
        Ok(())
    }

    /// Close every realtime channel.
    pub fn disable_remote_subscriptions(&self) {
        self.inner.subs_enabled.store(false, Ordering::SeqCst);
        self.inner.subscriptions.clear();
    }

    fn remote_callback(&self, label: String) -> RemoteChangeCallback {
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        Arc::new(move |_change: &RemoteChange| {
            let Some(inner) = weak.upgrade() else { return };
            inner.bus.emit(&SyncEvent::RemoteChanged {
                label: label.clone(),
            });
            inner.note_external_trigger();
        })
    }
}

// ============================================================================
// ManagerInner helpers
// ============================================================================

impl ManagerInner {
    fn merge_ctx(&self, ctx: Option<SyncContext>) -> SyncContext {
        match ctx {
            Some(ctx) => ctx.merged_over(&self.default_ctx),
            None => self.default_ctx.clone(),
        }
    }

    fn snapshot_state(&self) -> SyncState {
        let run = self.run.lock();
        SyncState {
            running: run.running,
            in_progress: run.in_progress.clone(),
            last_sync_at: run.last_sync_at,
            registered_tables: self
                .engines
                .iter()
                .map(|e| e.descriptor().local_table.clone())
                .collect(),
            errors: run.errors,
        }
    }

    fn emit_state(&self) {
        let state = self.snapshot_state();
        self.bus.emit(&SyncEvent::State { state });
    }

    fn emit_error(&self, label: Option<&str>, error: &SyncError) {
        self.bus.emit(&SyncEvent::Error {
            label: label.map(str::to_string),
            message: error.to_string(),
        });
    }

    fn set_in_progress(&self, label: &str, active: bool) {
        {
            let mut run = self.run.lock();
            if active {
                run.in_progress.push(label.to_string());
            } else {
                run.in_progress.retain(|l| l != label);
            }
        }
        self.emit_state();
    }

    /// A change not caused by sync: fold it into the running cycle or
    /// schedule a debounced one.
    fn note_external_trigger(&self) {
        let mut run = self.run.lock();
        if run.is_syncing {
            run.has_pending_change = true;
            return;
        }
        drop(run);
        if let Some(debounced) = self.debounced.lock().as_ref() {
            debounced.trigger();
        }
    }
}
