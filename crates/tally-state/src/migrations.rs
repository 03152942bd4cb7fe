//! SurrealDB schema initialization
//!
//! Sets up the append-only tables with their uniqueness constraints.
//! Safe to call on every connect (idempotent `DEFINE` statements).

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all tally tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing tally SurrealDB schema");

    init_records_table(db).await?;
    init_ledger_table(db).await?;

    info!("tally schema initialization complete");
    Ok(())
}

/// Initialize `records` table
///
/// Schema:
/// ```text
/// TABLE records {
///   seq:          INT (unique, monotonic across streams)
///   stream:       STRING (indexed with key)
///   key:          STRING (ballot id)
///   kind:         STRING
///   payload:      OBJECT
///   recorded_at:  DATETIME
/// }
/// ```
///
/// Records are never updated or deleted.
async fn init_records_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing records table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS records AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_records_seq ON TABLE records COLUMNS seq UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_records_stream_key ON TABLE records COLUMNS stream, key;
    "#;

    db.query(sql).await?;
    info!("✓ records table initialized");
    Ok(())
}

/// Initialize `ledger_entries` table
///
/// Schema:
/// ```text
/// TABLE ledger_entries {
///   seq:          INT (unique, monotonic)
///   ballot_id:    STRING
///   precinct:     STRING
///   contest_id:   STRING
///   selection:    STRING
///   source:       STRING (accepted | overridden)
///   recorded_at:  DATETIME
/// }
/// ```
///
/// Constraints:
/// - `(ballot_id, contest_id)` is unique: a ballot is counted once per contest
/// - entries are never updated or deleted
async fn init_ledger_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing ledger_entries table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS ledger_entries AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_ledger_seq ON TABLE ledger_entries COLUMNS seq UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_ledger_ballot_contest
            ON TABLE ledger_entries COLUMNS ballot_id, contest_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_ledger_ballot ON TABLE ledger_entries COLUMNS ballot_id;
    "#;

    db.query(sql).await?;
    info!("✓ ledger_entries table initialized");
    Ok(())
}
