//! Error types for tally-state

use thiserror::Error;

/// Errors raised while connecting to or preparing a backend
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the storage trait operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Content digest not present in the store
    #[error("content not found: {digest}")]
    NotFound { digest: String },

    /// Stored bytes no longer hash to the digest they were filed under
    #[error("stored content does not match digest {digest}")]
    Corrupt { digest: String },

    /// A digest string that is not 64 hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// A second, different increment for an already-counted (ballot, contest)
    #[error(
        "ledger conflict for ballot {ballot_id} contest {contest_id}: \
         recorded {existing}, incoming {incoming}"
    )]
    LedgerConflict {
        ballot_id: String,
        contest_id: String,
        existing: String,
        incoming: String,
    },

    /// Backend failure (database, serialization)
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
