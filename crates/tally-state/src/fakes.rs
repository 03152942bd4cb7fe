//! In-memory implementations of the storage traits
//!
//! Provides `MemoryCasStore`, `MemoryRecordLog`, and `MemoryTallyLedger`
//! that satisfy the trait contracts without any external dependencies.
//! Used by tests and by single-process runs that do not need durability.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

fn lock<T>(m: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| StorageError::Backend("in-memory store lock poisoned".to_string()))
}

// ---------------------------------------------------------------------------
// MemoryCasStore
// ---------------------------------------------------------------------------

/// In-memory content-addressed store backed by a `HashMap<digest, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryCasStore {
    store: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCasStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CasStore for MemoryCasStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let mut store = lock(&self.store)?;
        store
            .entry(digest.as_str().to_string())
            .or_insert_with(|| data.to_vec());
        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let store = lock(&self.store)?;
        store
            .get(digest.as_str())
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                digest: digest.as_str().to_string(),
            })
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        let store = lock(&self.store)?;
        Ok(store.contains_key(digest.as_str()))
    }
}

// ---------------------------------------------------------------------------
// MemoryRecordLog
// ---------------------------------------------------------------------------

/// In-memory append-only record log backed by a `Vec<StoredRecord>`.
#[derive(Debug, Default)]
pub struct MemoryRecordLog {
    records: Mutex<Vec<StoredRecord>>,
}

impl MemoryRecordLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordLog for MemoryRecordLog {
    async fn append(&self, record: NewRecord) -> StorageResult<u64> {
        let mut records = lock(&self.records)?;
        let seq = records.len() as u64 + 1;
        records.push(StoredRecord {
            seq,
            stream: record.stream,
            key: record.key,
            kind: record.kind,
            payload: record.payload,
            recorded_at: Utc::now(),
        });
        Ok(seq)
    }

    async fn records(&self, stream: &str, key: &str) -> StorageResult<Vec<StoredRecord>> {
        let records = lock(&self.records)?;
        Ok(records
            .iter()
            .filter(|r| r.stream == stream && r.key == key)
            .cloned()
            .collect())
    }

    async fn stream(&self, stream: &str) -> StorageResult<Vec<StoredRecord>> {
        let records = lock(&self.records)?;
        Ok(records
            .iter()
            .filter(|r| r.stream == stream)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryTallyLedger
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    /// (ballot_id, contest_id) -> index into `entries`
    index: HashMap<(String, String), usize>,
}

/// In-memory tally ledger.
///
/// A single mutex covers the duplicate check and the append, which makes the
/// ledger the linearization point for concurrent ballot completions.
#[derive(Debug, Default)]
pub struct MemoryTallyLedger {
    state: Mutex<LedgerState>,
}

impl MemoryTallyLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TallyLedger for MemoryTallyLedger {
    async fn append(&self, entry: NewLedgerEntry) -> StorageResult<AppendOutcome> {
        let mut state = lock(&self.state)?;
        let key = (entry.ballot_id.0.clone(), entry.contest_id.clone());

        if let Some(&idx) = state.index.get(&key) {
            let existing = &state.entries[idx];
            if existing.selection != entry.selection {
                return Err(StorageError::LedgerConflict {
                    ballot_id: entry.ballot_id.0,
                    contest_id: entry.contest_id,
                    existing: existing.selection.clone(),
                    incoming: entry.selection,
                });
            }
            return Ok(AppendOutcome::Duplicate {
                existing_seq: existing.seq,
            });
        }

        let seq = state.entries.len() as u64 + 1;
        state.entries.push(LedgerEntry {
            seq,
            ballot_id: entry.ballot_id,
            precinct: entry.precinct,
            contest_id: entry.contest_id,
            selection: entry.selection,
            source: entry.source,
            recorded_at: Utc::now(),
        });
        let idx = state.entries.len() - 1;
        state.index.insert(key, idx);
        Ok(AppendOutcome::Appended { seq })
    }

    async fn entries(&self) -> StorageResult<Vec<LedgerEntry>> {
        let state = lock(&self.state)?;
        Ok(state.entries.clone())
    }

    async fn entries_for(&self, ballot_id: &BallotId) -> StorageResult<Vec<LedgerEntry>> {
        let state = lock(&self.state)?;
        Ok(state
            .entries
            .iter()
            .filter(|e| &e.ballot_id == ballot_id)
            .cloned()
            .collect())
    }
}
