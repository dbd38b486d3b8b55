//! Bidirectional table sync for offline-first reactive databases.
//!
//! Keeps local tables consistent with a remote relational source, per
//! table, per user scope: pull applies the remote delta locally with
//! unique-key reconciliation and soft-delete handling, push reconciles
//! local changes back, and conflicts resolve row-wise by timestamp with
//! the remote side winning ties. A [`SyncManager`] orchestrates all
//! registered tables into atomic cycles triggered explicitly, by debounced
//! local-change observation, or by remote realtime events — with a
//! suppression counter breaking the write → notification → write loop.
//!
//! The local database and the remote transport stay outside the crate,
//! consumed through the [`LocalStore`] and [`RemoteGateway`] traits. An
//! in-memory [`MemoryStore`] ships for tests and embedders without a
//! database.

pub mod accessor;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod events;
pub mod manager;
pub mod remote;
pub mod scheduler;
pub mod storage;
pub mod suppress;
pub mod types;

pub use accessor::{coerce_timestamp_ms, iso_string, parse_iso_ms, LocalAccessor};
pub use descriptor::{table, TableBuilder, TableDescriptor, UniqueKeySpec};
pub use engine::TableEngine;
pub use error::{Result, SyncError};
pub use events::{EventBus, EventListener, SyncEvent};
pub use manager::SyncManager;
pub use remote::{
    GatewayError, GatewayErrorKind, RemoteChange, RemoteChangeCallback, RemoteFilter,
    RemoteGateway, RemoteQuery, RemoteSubscription,
};
pub use scheduler::Debounced;
pub use storage::{ChangeCallback, LocalChangeEvent, LocalStore, MemoryStore};
pub use suppress::ChangeSuppressor;
pub use types::{
    ChangedIds, LocalChanges, PatchSet, PullOutcome, PushConflict, PushSummary, SyncContext,
    SyncOptions, SyncState, TablePatch, TimeProvider, Unsubscribe,
};
