//! Tally aggregation over the append-only ledger.
//!
//! Counted results become one ledger increment per `(ballot, contest)`.
//! Re-delivery is detected by the ledger and ignored, so recording the same
//! result twice is harmless. Totals are never stored: they are derived by
//! replaying the ledger from empty.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tally_state::{BallotId, LedgerEntry, NewLedgerEntry, TallyLedger};
use tracing::{debug, instrument};

use crate::domain::{BallotResult, Result, Selection, TallyError};
use crate::metrics::METRICS;

/// Count for one `(precinct, contest, selection)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TallyRecord {
    pub precinct: String,
    pub contest_id: String,
    /// Selection key (`candidate:<id>`, `blank`, `invalid`).
    pub selection: String,
    pub count: u64,
}

/// Deterministic tally derived from a set of increments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyProjection {
    /// Sorted by precinct, contest, selection.
    pub records: Vec<TallyRecord>,
    /// Distinct ballots contributing at least one increment.
    pub ballots: usize,
    /// SHA-256 over the canonical record listing.
    pub digest: String,
}

impl TallyProjection {
    fn build<'a>(
        increments: impl IntoIterator<Item = (&'a str, &'a str, String, &'a BallotId)>,
    ) -> Self {
        let mut counts: BTreeMap<(String, String, String), u64> = BTreeMap::new();
        let mut ballots = BTreeSet::new();
        for (precinct, contest, selection, ballot) in increments {
            *counts
                .entry((precinct.to_string(), contest.to_string(), selection))
                .or_default() += 1;
            ballots.insert(ballot);
        }

        let records: Vec<TallyRecord> = counts
            .into_iter()
            .map(|((precinct, contest_id, selection), count)| TallyRecord {
                precinct,
                contest_id,
                selection,
                count,
            })
            .collect();

        let mut hasher = Sha256::new();
        for r in &records {
            hasher.update(
                format!("{}\t{}\t{}\t{}\n", r.precinct, r.contest_id, r.selection, r.count)
                    .as_bytes(),
            );
        }

        Self {
            records,
            ballots: ballots.len(),
            digest: hex::encode(hasher.finalize()),
        }
    }

    /// Count for one selection, in one precinct or across all of them.
    pub fn count(&self, precinct: Option<&str>, contest_id: &str, selection: &Selection) -> u64 {
        let key = selection.key();
        self.records
            .iter()
            .filter(|r| r.contest_id == contest_id && r.selection == key)
            .filter(|r| precinct.map_or(true, |p| r.precinct == p))
            .map(|r| r.count)
            .sum()
    }

    /// Totals per selection key for one contest across all precincts.
    pub fn totals(&self, contest_id: &str) -> BTreeMap<String, u64> {
        let mut totals = BTreeMap::new();
        for r in self.records.iter().filter(|r| r.contest_id == contest_id) {
            *totals.entry(r.selection.clone()).or_default() += r.count;
        }
        totals
    }
}

/// Replay ledger entries into a projection.
pub fn project(entries: &[LedgerEntry]) -> TallyProjection {
    TallyProjection::build(entries.iter().map(|e| {
        (
            e.precinct.as_str(),
            e.contest_id.as_str(),
            e.selection.clone(),
            &e.ballot_id,
        )
    }))
}

/// Project the counted results directly, without the ledger.
pub fn project_results(results: &[BallotResult]) -> TallyProjection {
    TallyProjection::build(
        results
            .iter()
            .filter(|r| r.status.is_countable())
            .flat_map(|r| {
                r.selections().map(move |(contest, selection)| {
                    (r.precinct.as_str(), contest, selection.key(), &r.ballot_id)
                })
            }),
    )
}

/// What recording one result did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub appended: usize,
    pub duplicates: usize,
}

/// Feeds counted results into the ledger and replays it.
#[derive(Clone)]
pub struct TallyAggregator {
    ledger: Arc<dyn TallyLedger>,
}

impl TallyAggregator {
    pub fn new(ledger: Arc<dyn TallyLedger>) -> Self {
        Self { ledger }
    }

    /// Append one increment per adjudicated contest of a counted result.
    ///
    /// Flagged results never reach the ledger.
    #[instrument(skip_all, fields(ballot_id = %result.ballot_id.short(), status = %result.status))]
    pub async fn record(&self, result: &BallotResult) -> Result<RecordOutcome> {
        if !result.status.is_countable() {
            return Err(TallyError::InvalidTransition {
                ballot_id: result.ballot_id.clone(),
                from: result.status.to_string(),
                to: "counted".to_string(),
            });
        }

        let mut outcome = RecordOutcome::default();
        for (contest, selection) in result.selections() {
            let appended = self
                .ledger
                .append(NewLedgerEntry {
                    ballot_id: result.ballot_id.clone(),
                    precinct: result.precinct.clone(),
                    contest_id: contest.to_string(),
                    selection: selection.key(),
                    source: result.status.to_string(),
                })
                .await?;
            if appended.is_duplicate() {
                METRICS.inc_duplicate_deliveries();
                outcome.duplicates += 1;
            } else {
                outcome.appended += 1;
            }
        }
        debug!(appended = outcome.appended, duplicates = outcome.duplicates, "result recorded");
        Ok(outcome)
    }

    /// Rebuild the tally by replaying every ledger entry from empty.
    pub async fn replay(&self) -> Result<TallyProjection> {
        let entries = self.ledger.entries().await?;
        Ok(project(&entries))
    }

    /// Every ledger entry, in append order.
    pub async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.ledger.entries().await?)
    }

    pub async fn entries_for(&self, ballot_id: &BallotId) -> Result<Vec<LedgerEntry>> {
        Ok(self.ledger.entries_for(ballot_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::template::fixtures::general_template;
    use crate::domain::{
        Adjudication, Confidence, ContestOutcome, DecisionRule, FlagReason, ResultStatus,
    };
    use chrono::Utc;
    use tally_state::fakes::MemoryTallyLedger;

    fn result(
        ballot: &str,
        precinct: &str,
        status: ResultStatus,
        mayor: Option<Selection>,
    ) -> BallotResult {
        let outcome = |id: &str, adj: Adjudication| ContestOutcome {
            contest_id: id.to_string(),
            adjudication: adj,
            confidence: Confidence::ONE,
            rule: DecisionRule::Unanimous,
            support: Vec::new(),
        };
        BallotResult {
            ballot_id: BallotId(ballot.to_string()),
            precinct: precinct.to_string(),
            template_id: general_template().id,
            version: 1,
            status,
            flag_reason: (status == ResultStatus::Flagged).then_some(FlagReason::Disagreement),
            contests: vec![
                outcome(
                    "mayor",
                    mayor.map_or(Adjudication::Disputed, Adjudication::Selected),
                ),
                outcome("council", Adjudication::Selected(Selection::candidate("dan"))),
            ],
            readings: Vec::new(),
            decided_at: Utc::now(),
        }
    }

    fn accepted(ballot: &str, precinct: &str, mayor: Selection) -> BallotResult {
        result(ballot, precinct, ResultStatus::Accepted, Some(mayor))
    }

    #[tokio::test]
    async fn test_record_and_replay() {
        let agg = TallyAggregator::new(Arc::new(MemoryTallyLedger::new()));
        agg.record(&accepted("b1", "p-01", Selection::candidate("alice")))
            .await
            .unwrap();
        agg.record(&accepted("b2", "p-02", Selection::candidate("alice")))
            .await
            .unwrap();
        agg.record(&result("b3", "p-01", ResultStatus::Overridden, Some(Selection::Blank)))
            .await
            .unwrap();

        let tally = agg.replay().await.unwrap();
        assert_eq!(tally.ballots, 3);
        assert_eq!(tally.count(None, "mayor", &Selection::candidate("alice")), 2);
        assert_eq!(tally.count(Some("p-01"), "mayor", &Selection::candidate("alice")), 1);
        assert_eq!(tally.count(None, "mayor", &Selection::Blank), 1);
        assert_eq!(tally.totals("council")["candidate:dan"], 3);
    }

    #[tokio::test]
    async fn test_redelivery_is_ignored() {
        let agg = TallyAggregator::new(Arc::new(MemoryTallyLedger::new()));
        let r = accepted("b1", "p-01", Selection::candidate("bob"));
        let first = agg.record(&r).await.unwrap();
        let second = agg.record(&r).await.unwrap();
        assert_eq!(first, RecordOutcome { appended: 2, duplicates: 0 });
        assert_eq!(second, RecordOutcome { appended: 0, duplicates: 2 });
        let tally = agg.replay().await.unwrap();
        assert_eq!(tally.count(None, "mayor", &Selection::candidate("bob")), 1);
    }

    #[tokio::test]
    async fn test_flagged_results_never_reach_ledger() {
        let ledger = Arc::new(MemoryTallyLedger::new());
        let agg = TallyAggregator::new(ledger.clone());
        let err = agg
            .record(&result("b1", "p-01", ResultStatus::Flagged, None))
            .await
            .unwrap_err();
        assert!(matches!(err, TallyError::InvalidTransition { .. }));
        assert!(ledger.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_is_stable_and_matches_results_projection() {
        let agg = TallyAggregator::new(Arc::new(MemoryTallyLedger::new()));
        let results = vec![
            accepted("b1", "p-01", Selection::candidate("alice")),
            result("b2", "p-01", ResultStatus::Flagged, None),
            result("b3", "p-02", ResultStatus::Overridden, Some(Selection::Invalid)),
        ];
        for r in results.iter().filter(|r| r.status.is_countable()) {
            agg.record(r).await.unwrap();
        }
        let first = agg.replay().await.unwrap();
        let second = agg.replay().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, project_results(&results));
    }

    #[test]
    fn test_digest_depends_on_counts() {
        let a = project_results(&[accepted("b1", "p-01", Selection::Blank)]);
        let b = project_results(&[accepted("b1", "p-01", Selection::Invalid)]);
        assert_ne!(a.digest, b.digest);
        assert_eq!(a.digest.len(), 64);
        assert_eq!(project(&[]).records.len(), 0);
    }
}
