//! SurrealDB-backed RecordLog and TallyLedger implementation
//!
//! Uses `schema::RecordRow` and `schema::LedgerRow` for persistence,
//! converting to/from `storage_traits` types at the boundary.
//!
//! All appends go through a single writer lock: the lock covers sequence
//! assignment and, for the ledger, the duplicate check. The unique index on
//! `(ballot_id, contest_id)` backs the same invariant at the database level.

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::{LedgerRow, RecordRow, SeqRow};
use crate::storage_traits::{
    AppendOutcome, BallotId, LedgerEntry, NewLedgerEntry, NewRecord, RecordLog, StorageResult,
    StoredRecord, TallyLedger,
};

const NAMESPACE: &str = "tally";
const DATABASE: &str = "main";

#[derive(Debug, Default)]
struct Sequences {
    records: u64,
    ledger: u64,
}

/// SurrealDB-backed implementation of [`RecordLog`] and [`TallyLedger`].
pub struct SurrealStore {
    db: Surreal<Any>,
    writer: Mutex<Sequences>,
}

impl SurrealStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `tally/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect("mem://").await
    }

    /// Open a local on-disk store under `path` (SurrealKV engine).
    pub async fn open_local(path: &std::path::Path) -> crate::Result<Self> {
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path.display(),
                e
            ))
        })?;
        let url = format!("surrealkv://{}", path.display());
        Self::connect(&url).await
    }

    /// Connect to any SurrealDB endpoint URL (`mem://`, `surrealkv://`, `ws://`).
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {url}: {e}")))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        let sequences = Sequences {
            records: Self::last_seq(&db, "SELECT seq FROM records ORDER BY seq DESC LIMIT 1")
                .await?,
            ledger: Self::last_seq(
                &db,
                "SELECT seq FROM ledger_entries ORDER BY seq DESC LIMIT 1",
            )
            .await?,
        };

        info!(
            url = %url,
            records = sequences.records,
            ledger = sequences.ledger,
            "SurrealStore connected"
        );
        Ok(Self {
            db,
            writer: Mutex::new(sequences),
        })
    }

    // -- private helpers -----------------------------------------------------

    async fn last_seq(db: &Surreal<Any>, sql: &str) -> crate::Result<u64> {
        let mut res = db.query(sql.to_string()).await?;
        let rows: Vec<SeqRow> = res.take(0)?;
        Ok(rows.first().map(|r| r.seq).unwrap_or(0))
    }

    async fn fetch_ledger_entry(
        &self,
        ballot_id: &str,
        contest_id: &str,
    ) -> StorageResult<Option<LedgerRow>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM ledger_entries WHERE ballot_id = $bid AND contest_id = $cid LIMIT 1",
            )
            .bind(("bid", ballot_id.to_string()))
            .bind(("cid", contest_id.to_string()))
            .await?;

        let rows: Vec<LedgerRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl RecordLog for SurrealStore {
    #[instrument(skip(self, record), fields(stream = %record.stream, key = %record.key))]
    async fn append(&self, record: NewRecord) -> StorageResult<u64> {
        let mut seqs = self.writer.lock().await;
        let seq = seqs.records + 1;

        let _created: Option<RecordRow> = self
            .db
            .create("records")
            .content(RecordRow::new(seq, record))
            .await?;

        seqs.records = seq;
        debug!(seq, "record appended");
        Ok(seq)
    }

    async fn records(&self, stream: &str, key: &str) -> StorageResult<Vec<StoredRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM records WHERE stream = $stream AND key = $key ORDER BY seq ASC")
            .bind(("stream", stream.to_string()))
            .bind(("key", key.to_string()))
            .await?;

        let rows: Vec<RecordRow> = res.take(0)?;
        Ok(rows.into_iter().map(StoredRecord::from).collect())
    }

    async fn stream(&self, stream: &str) -> StorageResult<Vec<StoredRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM records WHERE stream = $stream ORDER BY seq ASC")
            .bind(("stream", stream.to_string()))
            .await?;

        let rows: Vec<RecordRow> = res.take(0)?;
        Ok(rows.into_iter().map(StoredRecord::from).collect())
    }
}

#[async_trait]
impl TallyLedger for SurrealStore {
    #[instrument(
        skip(self, entry),
        fields(ballot_id = %entry.ballot_id.short(), contest = %entry.contest_id)
    )]
    async fn append(&self, entry: NewLedgerEntry) -> StorageResult<AppendOutcome> {
        let mut seqs = self.writer.lock().await;

        if let Some(existing) = self
            .fetch_ledger_entry(entry.ballot_id.as_str(), &entry.contest_id)
            .await?
        {
            if existing.selection != entry.selection {
                return Err(StorageError::LedgerConflict {
                    ballot_id: entry.ballot_id.0,
                    contest_id: entry.contest_id,
                    existing: existing.selection,
                    incoming: entry.selection,
                });
            }
            debug!(existing_seq = existing.seq, "duplicate ledger delivery ignored");
            return Ok(AppendOutcome::Duplicate {
                existing_seq: existing.seq,
            });
        }

        let seq = seqs.ledger + 1;
        let _created: Option<LedgerRow> = self
            .db
            .create("ledger_entries")
            .content(LedgerRow::new(seq, entry))
            .await?;

        seqs.ledger = seq;
        Ok(AppendOutcome::Appended { seq })
    }

    async fn entries(&self) -> StorageResult<Vec<LedgerEntry>> {
        let mut res = self
            .db
            .query("SELECT * FROM ledger_entries ORDER BY seq ASC")
            .await?;

        let rows: Vec<LedgerRow> = res.take(0)?;
        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    async fn entries_for(&self, ballot_id: &BallotId) -> StorageResult<Vec<LedgerEntry>> {
        let mut res = self
            .db
            .query("SELECT * FROM ledger_entries WHERE ballot_id = $bid ORDER BY seq ASC")
            .bind(("bid", ballot_id.0.clone()))
            .await?;

        let rows: Vec<LedgerRow> = res.take(0)?;
        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }
}
