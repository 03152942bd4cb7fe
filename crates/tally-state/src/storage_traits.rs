//! Storage trait definitions for the ballot tally engine
//!
//! These traits define the core storage abstractions:
//! - `CasStore`: Content-addressed storage for normalized ballot images
//! - `RecordLog`: Append-only record streams keyed by ballot
//! - `TallyLedger`: Deduplicated per-(ballot, contest) tally increments
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// CasStore — Content-Addressed Storage
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed blob store.
///
/// Guarantees:
/// - `put(data)` always returns the SHA-256 digest of `data`.
/// - `get(digest)` returns the exact bytes previously stored.
/// - Same content always yields the same digest (deduplication).
#[async_trait]
pub trait CasStore: Send + Sync {
    /// Store bytes and return their content digest.
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest>;

    /// Retrieve bytes by digest. Returns `StorageError::NotFound` if absent.
    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>>;

    /// Check whether a digest exists in the store.
    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool>;
}

// ---------------------------------------------------------------------------
// BallotId
// ---------------------------------------------------------------------------

/// Stable ballot identifier: the SHA-256 of the raw submitted image bytes.
///
/// Re-submitting the same scan always resolves to the same ballot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BallotId(pub String);

impl BallotId {
    /// Derive the ballot id from the raw image bytes.
    pub fn from_image_bytes(raw: &[u8]) -> Self {
        BallotId(ContentDigest::from_bytes(raw).as_str().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 chars) for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for BallotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// RecordLog — Append-only Record Streams
// ---------------------------------------------------------------------------

/// A record to append to a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRecord {
    /// Stream name (e.g. "intake", "readings", "results", "review")
    pub stream: String,
    /// Ballot id the record belongs to
    pub key: String,
    /// Record kind within the stream (e.g. "reading", "needs_rescan")
    pub kind: String,
    /// Record payload
    pub payload: serde_json::Value,
}

impl NewRecord {
    pub fn new(
        stream: impl Into<String>,
        key: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            stream: stream.into(),
            key: key.into(),
            kind: kind.into(),
            payload,
        }
    }
}

/// A record as stored, with its log position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Monotonic sequence number across the whole log
    pub seq: u64,
    pub stream: String,
    pub key: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only record log.
///
/// Guarantees:
/// - Records are never updated or deleted.
/// - `seq` is strictly increasing in append order across all streams.
/// - Reads return records in `seq` ascending order.
#[async_trait]
pub trait RecordLog: Send + Sync {
    /// Append a record and return its sequence number.
    async fn append(&self, record: NewRecord) -> StorageResult<u64>;

    /// All records of `stream` for one key, oldest first.
    async fn records(&self, stream: &str, key: &str) -> StorageResult<Vec<StoredRecord>>;

    /// All records of `stream`, oldest first.
    async fn stream(&self, stream: &str) -> StorageResult<Vec<StoredRecord>>;
}

// ---------------------------------------------------------------------------
// TallyLedger — Deduplicated Tally Increments
// ---------------------------------------------------------------------------

/// One tally increment to append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLedgerEntry {
    pub ballot_id: BallotId,
    pub precinct: String,
    pub contest_id: String,
    /// Canonical selection key (e.g. "candidate:alice", "blank", "invalid")
    pub selection: String,
    /// Result status that produced the increment ("accepted" | "overridden")
    pub source: String,
}

/// A ledger entry as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Monotonic sequence number within the ledger
    pub seq: u64,
    pub ballot_id: BallotId,
    pub precinct: String,
    pub contest_id: String,
    pub selection: String,
    pub source: String,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of appending to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppendOutcome {
    /// A new increment was recorded at `seq`.
    Appended { seq: u64 },
    /// The same (ballot, contest, selection) was already recorded; ignored.
    Duplicate { existing_seq: u64 },
}

impl AppendOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Append-only tally ledger.
///
/// Guarantees:
/// - At most one entry per `(ballot_id, contest_id)`; re-delivery of the same
///   increment returns `Duplicate` and changes nothing.
/// - A different selection for an already-counted `(ballot_id, contest_id)`
///   fails with `StorageError::LedgerConflict`.
/// - The check-and-append is linearizable: concurrent appends never lose or
///   double an increment.
/// - `entries()` returns a consistent snapshot in `seq` order.
#[async_trait]
pub trait TallyLedger: Send + Sync {
    /// Append an increment, deduplicating by `(ballot_id, contest_id)`.
    async fn append(&self, entry: NewLedgerEntry) -> StorageResult<AppendOutcome>;

    /// Snapshot of every entry, ordered by `seq`.
    async fn entries(&self) -> StorageResult<Vec<LedgerEntry>>;

    /// Entries recorded for a single ballot, ordered by `seq`.
    async fn entries_for(&self, ballot_id: &BallotId) -> StorageResult<Vec<LedgerEntry>>;
}
