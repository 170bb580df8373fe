//! Error types for the offline POS subsystem.

use thiserror::Error;

/// Result type alias for store, queue and checkout operations.
pub type Result<T> = std::result::Result<T, PosError>;

/// Errors surfaced by the local store, sync queue, checkout and config layer.
///
/// Local persistence failures are always propagated to the caller; nothing
/// in this crate swallows a `Database` error.
#[derive(Debug, Error)]
pub enum PosError {
    /// SQLite failure (open, pragma, statement or transaction).
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Record (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure (data dir, log dir, config file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// `query_by_index` called with an index the collection does not declare.
    #[error("index '{index}' is not defined on collection '{collection}'")]
    UnknownIndex {
        collection: &'static str,
        index: &'static str,
    },

    #[error("record not found: {collection}/{id}")]
    NotFound { collection: &'static str, id: String },

    /// A mutex guarding the connection was poisoned by a panicking holder.
    #[error("lock poisoned: {0}")]
    Lock(String),

    /// Transport construction failure. Push failures never surface here; the
    /// sync engine books them on the queue record instead.
    #[error("transport error: {0}")]
    Transport(#[from] crate::api::TransportError),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation rejected because of the current state (e.g. paying an empty cart).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl PosError {
    pub fn not_found(collection: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            collection,
            id: id.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }
}

impl<T> From<std::sync::PoisonError<T>> for PosError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_index_message_names_both_sides() {
        let err = PosError::UnknownIndex {
            collection: "customers",
            index: "barcode",
        };
        assert_eq!(
            err.to_string(),
            "index 'barcode' is not defined on collection 'customers'"
        );
    }

    #[test]
    fn test_rusqlite_errors_convert() {
        let err: PosError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, PosError::Database(_)));
    }
}
