use thiserror::Error;

use crate::remote::GatewayError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the sync engine and coordinator.
///
/// All payloads are owned strings so the error can be cloned into every
/// waiter of a failed cycle.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("Invalid sync configuration: {0}")]
    Config(String),

    #[error("Missing unique key path `{path}` on {table} record {id}")]
    MissingKeyPath {
        table: String,
        path: String,
        id: String,
    },

    #[error("Duplicate local unique key {key} in {table}")]
    DuplicateLocalKey { table: String, key: String },

    #[error("Duplicate remote unique key {key} in {table}")]
    DuplicateRemoteKey { table: String, key: String },

    #[error("Mapper for {table} returned a non-object value")]
    MapperOutput { table: String },

    #[error("Remote gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Local store error: {0}")]
    Store(String),

    #[error("Sync stopped before the cycle completed")]
    Canceled,
}

impl SyncError {
    /// Shorthand for configuration errors.
    pub fn config(message: impl Into<String>) -> Self {
        SyncError::Config(message.into())
    }

    /// Shorthand for local store errors.
    pub fn store(message: impl Into<String>) -> Self {
        SyncError::Store(message.into())
    }
}
