//! Tally-State: persistence layer for the ballot tally engine
//!
//! Everything the engine persists is append-only and keyed by a stable
//! ballot identifier:
//!
//! - `CasStore`: normalized ballot images, content-addressed
//! - `RecordLog`: append-only streams (intake, readings, results, review)
//! - `TallyLedger`: per-(ballot, contest) increments, deduplicated
//!
//! ## Layer 0 - Data/Persistence
//!
//! In-memory fakes live in [`fakes`]; the filesystem CAS in [`fs_cas`]; the
//! SurrealDB backend for the record log and ledger in [`surreal_store`].

mod error;
pub mod fakes;
pub mod fs_cas;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use fs_cas::FsCasStore;
pub use storage_traits::{
    AppendOutcome, BallotId, CasStore, ContentDigest, LedgerEntry, NewLedgerEntry, NewRecord,
    RecordLog, StorageResult, StoredRecord, TallyLedger,
};
pub use surreal_store::SurrealStore;

/// Result type for tally-state connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
