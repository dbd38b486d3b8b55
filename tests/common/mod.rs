//! Shared fixtures: an in-memory remote gateway and harness builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use tidesync::{
    coerce_timestamp_ms, iso_string, GatewayError, MemoryStore, RemoteChange,
    RemoteChangeCallback, RemoteFilter, RemoteGateway, RemoteQuery, RemoteSubscription,
    SyncEvent, SyncManager, SyncOptions, TableBuilder, TimeProvider,
};

// ============================================================================
// MemoryGateway
// ============================================================================

/// In-memory stand-in for the remote relational source. Understands the
/// engine's rendered JSON-path columns (`a->b->>c`) and emits realtime
/// events on insert/update, like the real gateway's change stream.
/// Inserted rows get `R<n>` primary keys in their `id` column.
#[derive(Default)]
pub struct MemoryGateway {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    subscribers: Mutex<Vec<SubEntry>>,
    next_pk: AtomicU64,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

struct SubEntry {
    table: String,
    filter: Option<RemoteFilter>,
    callback: RemoteChangeCallback,
    closed: Arc<AtomicBool>,
}

struct GatewaySub {
    closed: Arc<AtomicBool>,
}

impl RemoteSubscription for GatewaySub {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rows without counting writes or firing events.
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Total update + insert calls that reached the gateway.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Live subscriber count (closed handles excluded).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|s| !s.closed.load(Ordering::SeqCst))
            .count()
    }

    fn notify(&self, table: &str, row: &Value) {
        let interested: Vec<RemoteChangeCallback> = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.table == table && !s.closed.load(Ordering::SeqCst))
            .filter(|s| s.filter.as_ref().map(|f| matches_filter(row, f)).unwrap_or(true))
            .map(|s| Arc::clone(&s.callback))
            .collect();
        let change = RemoteChange {
            table: table.to_string(),
            payload: row.clone(),
        };
        for callback in interested {
            callback(&change);
        }
    }

    fn check_writable(&self) -> Result<(), GatewayError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(GatewayError::new("gateway unavailable"))
        } else {
            Ok(())
        }
    }
}

/// Resolve a possibly JSON-path column (`payload->tags->>kind`) against a
/// row, parsing JSON-text intermediates like a real JSON column would.
fn path_lookup(row: &Value, column: &str) -> Option<Value> {
    if !column.contains("->") {
        return row.get(column).cloned();
    }
    let mut current = row.clone();
    for segment in column.split("->") {
        let key = segment.strip_prefix('>').unwrap_or(segment);
        if let Value::String(text) = &current {
            current = serde_json::from_str(text).ok()?;
        }
        current = current.get(key)?.clone();
    }
    Some(current)
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn matches_filter(row: &Value, filter: &RemoteFilter) -> bool {
    match filter {
        RemoteFilter::Eq { column, value } => match path_lookup(row, column) {
            // Text extraction compares textually, like `->>` does.
            Some(found) => found == *value || text_of(&found) == text_of(value),
            None => false,
        },
        RemoteFilter::Gte { column, value } => {
            let found = match path_lookup(row, column) {
                Some(found) => found,
                None => return false,
            };
            let found_ms = coerce_timestamp_ms(&found);
            let bound_ms = coerce_timestamp_ms(value);
            if found_ms != 0 || bound_ms != 0 {
                found_ms >= bound_ms
            } else {
                text_of(&found) >= text_of(value)
            }
        }
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    async fn select(&self, table: &str, query: &RemoteQuery) -> Result<Vec<Value>, GatewayError> {
        let tables = self.tables.lock().unwrap();
        let rows = tables.get(table).cloned().unwrap_or_default();
        let matched = rows
            .into_iter()
            .filter(|row| query.filters.iter().all(|f| matches_filter(row, f)));

        Ok(match query.range {
            Some((from, to)) => matched.skip(from).take(to.saturating_sub(from) + 1).collect(),
            None => matched.collect(),
        })
    }

    async fn find_by_pk(
        &self,
        table: &str,
        pk_column: &str,
        pk: &Value,
    ) -> Result<Option<Value>, GatewayError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.get(table).and_then(|rows| {
            rows.iter()
                .find(|row| {
                    row.get(pk_column)
                        .map(|v| text_of(v) == text_of(pk))
                        .unwrap_or(false)
                })
                .cloned()
        }))
    }

    async fn update(
        &self,
        table: &str,
        pk_column: &str,
        pk: &Value,
        patch: &Value,
    ) -> Result<Vec<Value>, GatewayError> {
        self.check_writable()?;
        let mut affected = Vec::new();
        {
            let mut tables = self.tables.lock().unwrap();
            if let Some(rows) = tables.get_mut(table) {
                for row in rows.iter_mut() {
                    let matches = row
                        .get(pk_column)
                        .map(|v| text_of(v) == text_of(pk))
                        .unwrap_or(false);
                    if !matches {
                        continue;
                    }
                    if let (Some(target), Some(source)) = (row.as_object_mut(), patch.as_object()) {
                        for (k, v) in source {
                            target.insert(k.clone(), v.clone());
                        }
                    }
                    affected.push(row.clone());
                }
            }
        }
        if !affected.is_empty() {
            self.writes.fetch_add(1, Ordering::SeqCst);
            for row in &affected {
                self.notify(table, row);
            }
        }
        Ok(affected)
    }

    async fn insert(&self, table: &str, row: &Value) -> Result<Vec<Value>, GatewayError> {
        self.check_writable()?;
        let mut stored = row.clone();
        let needs_pk = stored
            .get("id")
            .and_then(Value::as_str)
            .map(str::is_empty)
            .unwrap_or(true);
        if needs_pk {
            let n = self.next_pk.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(obj) = stored.as_object_mut() {
                obj.insert("id".to_string(), json!(format!("R{n}")));
            }
        }

        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(stored.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.notify(table, &stored);
        Ok(vec![stored])
    }

    async fn subscribe(
        &self,
        table: &str,
        filter: Option<RemoteFilter>,
        on_change: RemoteChangeCallback,
    ) -> Result<Box<dyn RemoteSubscription>, GatewayError> {
        let closed = Arc::new(AtomicBool::new(false));
        self.subscribers.lock().unwrap().push(SubEntry {
            table: table.to_string(),
            filter,
            callback: on_change,
            closed: Arc::clone(&closed),
        });
        Ok(Box::new(GatewaySub { closed }))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Builder for the standard `tasks` table: `title` payload, millisecond
/// `updated_at` locally, ISO `updated_at` remotely.
pub fn tasks_table() -> TableBuilder {
    tidesync::table("tasks", "tasks")
        .remote_to_local(|row, _ctx| {
            json!({
                "title": row.get("title").cloned().unwrap_or(Value::Null),
                "is_deleted": false,
            })
        })
        .local_to_remote(|record, _ctx| {
            let updated_at = record
                .get("updated_at")
                .map(coerce_timestamp_ms)
                .unwrap_or(0);
            json!({
                "title": record.get("title").cloned().unwrap_or(Value::Null),
                "updated_at": iso_string(updated_at),
                "is_deleted": false,
            })
        })
}

pub fn fixed_clock(ms: i64) -> TimeProvider {
    Arc::new(move || ms)
}

/// Settable clock for multi-step timelines.
#[derive(Clone)]
pub struct TestClock {
    ms: Arc<std::sync::atomic::AtomicI64>,
}

impl TestClock {
    pub fn new(ms: i64) -> Self {
        Self {
            ms: Arc::new(std::sync::atomic::AtomicI64::new(ms)),
        }
    }

    pub fn set(&self, ms: i64) {
        self.ms.store(ms, Ordering::SeqCst);
    }

    pub fn provider(&self) -> TimeProvider {
        let ms = Arc::clone(&self.ms);
        Arc::new(move || ms.load(Ordering::SeqCst))
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<MemoryGateway>,
    pub manager: SyncManager,
}

pub fn make_harness(descriptors: Vec<tidesync::TableDescriptor>, options: SyncOptions) -> Harness {
    make_harness_with(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryGateway::new()),
        descriptors,
        options,
    )
}

/// Build a harness over existing store/gateway instances — lets tests
/// model several devices against one remote.
pub fn make_harness_with(
    store: Arc<MemoryStore>,
    gateway: Arc<MemoryGateway>,
    descriptors: Vec<tidesync::TableDescriptor>,
    options: SyncOptions,
) -> Harness {
    let manager = SyncManager::new(
        Arc::clone(&store) as Arc<dyn tidesync::LocalStore>,
        Arc::clone(&gateway) as Arc<dyn RemoteGateway>,
        descriptors,
        options,
    )
    .expect("manager construction");
    Harness {
        store,
        gateway,
        manager,
    }
}

/// Collect every emitted event for later assertions.
pub fn record_events(manager: &SyncManager) -> Arc<Mutex<Vec<SyncEvent>>> {
    let events: Arc<Mutex<Vec<SyncEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let events_clone = Arc::clone(&events);
    let _keep = manager.on_event(Arc::new(move |event| {
        events_clone.lock().unwrap().push(event.clone());
    }));
    events
}

/// Number of completed pulls for `label` — one per cycle that reached it.
pub fn pulled_count(events: &Arc<Mutex<Vec<SyncEvent>>>, label: &str) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, SyncEvent::Pulled { label: l, .. } if l == label))
        .count()
}
