//! Remote data gateway contract.
//!
//! Implementations handle the actual wire protocol (PostgREST, HTTP RPC,
//! etc.) against the remote relational source. The engine only needs paged
//! filtered selects, single-row lookups, update/insert returning the
//! affected rows, and a realtime change stream.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

// ============================================================================
// GatewayError
// ============================================================================

/// Transport-level error (wraps arbitrary error strings from the gateway
/// implementation).
#[derive(Debug, Clone)]
pub struct GatewayError {
    pub message: String,
    pub kind: GatewayErrorKind,
}

/// Classification of gateway errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    /// Retriable (network, temporary failures)
    Transient,
    /// Not retriable (validation, constraint violations, etc.)
    Permanent,
    /// Authentication failed
    Auth,
    /// Rate limit or quota exceeded
    Capacity,
}

impl GatewayError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GatewayErrorKind::Transient,
        }
    }

    pub fn with_kind(message: impl Into<String>, kind: GatewayErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for GatewayError {}

// ============================================================================
// Queries
// ============================================================================

/// Equality or range condition on a remote column. Columns addressing JSON
/// content arrive pre-rendered in the gateway's path syntax (see
/// [`render_json_path`](crate::remote::render_json_path)).
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteFilter {
    Eq { column: String, value: Value },
    /// Greater-or-equal; used for the timestamp window.
    Gte { column: String, value: Value },
}

impl RemoteFilter {
    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        RemoteFilter::Eq {
            column: column.into(),
            value,
        }
    }

    pub fn gte(column: impl Into<String>, value: Value) -> Self {
        RemoteFilter::Gte {
            column: column.into(),
            value,
        }
    }
}

/// A filtered, optionally ranged select.
#[derive(Debug, Clone, Default)]
pub struct RemoteQuery {
    pub filters: Vec<RemoteFilter>,
    /// Inclusive row range `[from, to]` for paging.
    pub range: Option<(usize, usize)>,
}

// ============================================================================
// Realtime
// ============================================================================

/// An opaque realtime notification for one table.
#[derive(Debug, Clone)]
pub struct RemoteChange {
    pub table: String,
    pub payload: Value,
}

pub type RemoteChangeCallback = Arc<dyn Fn(&RemoteChange) + Send + Sync>;

/// Live realtime channel handle. Dropping without `close` leaks the
/// server-side channel until the connection dies.
pub trait RemoteSubscription: Send + Sync {
    fn close(&self);
}

// ============================================================================
// RemoteGateway
// ============================================================================

/// User-implemented gateway to the remote relational source.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Rows matching every filter, within the optional inclusive range.
    async fn select(&self, table: &str, query: &RemoteQuery)
        -> Result<Vec<Value>, GatewayError>;

    /// Single-row lookup by primary key.
    async fn find_by_pk(
        &self,
        table: &str,
        pk_column: &str,
        pk: &Value,
    ) -> Result<Option<Value>, GatewayError>;

    /// Update by primary key, returning the affected rows.
    async fn update(
        &self,
        table: &str,
        pk_column: &str,
        pk: &Value,
        patch: &Value,
    ) -> Result<Vec<Value>, GatewayError>;

    /// Insert, returning the inserted rows with their assigned primary
    /// keys.
    async fn insert(&self, table: &str, row: &Value) -> Result<Vec<Value>, GatewayError>;

    /// Open a realtime subscription on a table, optionally filtered by an
    /// equality condition.
    async fn subscribe(
        &self,
        table: &str,
        filter: Option<RemoteFilter>,
        on_change: RemoteChangeCallback,
    ) -> Result<Box<dyn RemoteSubscription>, GatewayError>;
}
