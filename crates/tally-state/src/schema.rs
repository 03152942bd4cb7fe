//! Row definitions for the SurrealDB tables
//!
//! Tables:
//! - records: append-only record streams (intake, readings, results, review)
//! - ledger_entries: tally increments, unique per (ballot_id, contest_id)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage_traits::{BallotId, LedgerEntry, NewLedgerEntry, NewRecord, StoredRecord};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Record row - one entry of an append-only stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordRow {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    pub seq: u64,
    pub stream: String,
    pub key: String,
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub recorded_at: DateTime<Utc>,
}

impl RecordRow {
    pub fn new(seq: u64, record: NewRecord) -> Self {
        RecordRow {
            id: None,
            seq,
            stream: record.stream,
            key: record.key,
            kind: record.kind,
            payload: record.payload,
            recorded_at: Utc::now(),
        }
    }
}

impl From<RecordRow> for StoredRecord {
    fn from(row: RecordRow) -> Self {
        StoredRecord {
            seq: row.seq,
            stream: row.stream,
            key: row.key,
            kind: row.kind,
            payload: row.payload,
            recorded_at: row.recorded_at,
        }
    }
}

/// Ledger row - one tally increment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRow {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    pub seq: u64,
    pub ballot_id: String,
    pub precinct: String,
    pub contest_id: String,
    pub selection: String,
    pub source: String,
    #[serde(with = "surreal_datetime")]
    pub recorded_at: DateTime<Utc>,
}

impl LedgerRow {
    pub fn new(seq: u64, entry: NewLedgerEntry) -> Self {
        LedgerRow {
            id: None,
            seq,
            ballot_id: entry.ballot_id.0,
            precinct: entry.precinct,
            contest_id: entry.contest_id,
            selection: entry.selection,
            source: entry.source,
            recorded_at: Utc::now(),
        }
    }
}

impl From<LedgerRow> for LedgerEntry {
    fn from(row: LedgerRow) -> Self {
        LedgerEntry {
            seq: row.seq,
            ballot_id: BallotId(row.ballot_id),
            precinct: row.precinct,
            contest_id: row.contest_id,
            selection: row.selection,
            source: row.source,
            recorded_at: row.recorded_at,
        }
    }
}

/// Projection used to recover the last sequence number on connect
#[derive(Debug, Clone, Deserialize)]
pub struct SeqRow {
    pub seq: u64,
}
