//! Append-only persistence of the ballot lifecycle.
//!
//! Four streams of the record log, all keyed by ballot id:
//!
//! | stream     | kinds                                        |
//! |------------|----------------------------------------------|
//! | `intake`   | `admitted`, `rescan_required`, `superseded`  |
//! | `readings` | `reading`, `abstention`                      |
//! | `results`  | `result` (versioned)                         |
//! | `review`   | `decision`                                   |
//!
//! Nothing is updated in place. A ballot's status is derived from what the
//! streams hold.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tally_state::{BallotId, ContentDigest, NewRecord, RecordLog, StoredRecord};
use tracing::{debug, instrument};

use crate::domain::{
    BallotResult, BallotStatus, Result, ResultStatus, StructuredBallotReading, TallyError,
};
use crate::ingest::ImageQualityError;
use crate::orchestrator::Abstention;
use crate::review::ReviewRecord;

pub const INTAKE: &str = "intake";
pub const READINGS: &str = "readings";
pub const RESULTS: &str = "results";
pub const REVIEW: &str = "review";

const KIND_READING: &str = "reading";
const KIND_ABSTENTION: &str = "abstention";
const KIND_RESULT: &str = "result";
const KIND_DECISION: &str = "decision";

/// What happened to a ballot at intake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IntakeEvent {
    /// The image passed the quality checks and was stored.
    Admitted {
        precinct: String,
        template_id: String,
        image_digest: ContentDigest,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rescan_of: Option<BallotId>,
    },
    /// The image failed a quality check.
    RescanRequired {
        precinct: String,
        template_id: String,
        problem: ImageQualityError,
    },
    /// A rescan replaced this ballot.
    Superseded { by: BallotId },
}

impl IntakeEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Admitted { .. } => "admitted",
            Self::RescanRequired { .. } => "rescan_required",
            Self::Superseded { .. } => "superseded",
        }
    }
}

/// Typed view over the record log.
#[derive(Clone)]
pub struct BallotRepository {
    records: Arc<dyn RecordLog>,
}

impl BallotRepository {
    pub fn new(records: Arc<dyn RecordLog>) -> Self {
        Self { records }
    }

    async fn append<T: Serialize>(
        &self,
        stream: &str,
        ballot_id: &BallotId,
        kind: &str,
        payload: &T,
    ) -> Result<u64> {
        let payload = serde_json::to_value(payload)?;
        let seq = self
            .records
            .append(NewRecord::new(stream, ballot_id.as_str(), kind, payload))
            .await?;
        Ok(seq)
    }

    async fn load<T: DeserializeOwned>(
        &self,
        stream: &str,
        ballot_id: &BallotId,
        kind: &str,
    ) -> Result<Vec<T>> {
        let records = self.records.records(stream, ballot_id.as_str()).await?;
        decode(records, kind)
    }

    // -- intake ------------------------------------------------------------

    pub async fn record_intake(&self, ballot_id: &BallotId, event: &IntakeEvent) -> Result<u64> {
        self.append(INTAKE, ballot_id, event.kind(), event).await
    }

    pub async fn intake(&self, ballot_id: &BallotId) -> Result<Vec<IntakeEvent>> {
        let records = self.records.records(INTAKE, ballot_id.as_str()).await?;
        records
            .into_iter()
            .map(|r| Ok(serde_json::from_value(r.payload)?))
            .collect()
    }

    /// The admission event, if the image was ever admitted.
    pub async fn admission(&self, ballot_id: &BallotId) -> Result<Option<IntakeEvent>> {
        Ok(self
            .intake(ballot_id)
            .await?
            .into_iter()
            .find(|e| matches!(e, IntakeEvent::Admitted { .. })))
    }

    // -- readings ----------------------------------------------------------

    pub async fn append_reading(&self, reading: &StructuredBallotReading) -> Result<u64> {
        self.append(READINGS, &reading.ballot_id, KIND_READING, reading)
            .await
    }

    pub async fn readings(&self, ballot_id: &BallotId) -> Result<Vec<StructuredBallotReading>> {
        self.load(READINGS, ballot_id, KIND_READING).await
    }

    pub async fn append_abstention(
        &self,
        ballot_id: &BallotId,
        abstention: &Abstention,
    ) -> Result<u64> {
        self.append(READINGS, ballot_id, KIND_ABSTENTION, abstention)
            .await
    }

    pub async fn abstentions(&self, ballot_id: &BallotId) -> Result<Vec<Abstention>> {
        self.load(READINGS, ballot_id, KIND_ABSTENTION).await
    }

    // -- results -----------------------------------------------------------

    /// Append a result version.
    ///
    /// A first result may have any status. After that the only allowed
    /// transition is Flagged to Overridden, with the next version number.
    #[instrument(skip_all, fields(ballot_id = %result.ballot_id.short(), status = %result.status))]
    pub async fn append_result(&self, result: &BallotResult) -> Result<u64> {
        let previous = self.latest_result(&result.ballot_id).await?;
        let allowed = match &previous {
            None => result.version == 1,
            Some(prev) => {
                prev.status == ResultStatus::Flagged
                    && result.status == ResultStatus::Overridden
                    && result.version == prev.version + 1
            }
        };
        if !allowed {
            return Err(TallyError::InvalidTransition {
                ballot_id: result.ballot_id.clone(),
                from: previous
                    .map(|p| format!("{} v{}", p.status, p.version))
                    .unwrap_or_else(|| "none".to_string()),
                to: format!("{} v{}", result.status, result.version),
            });
        }

        let seq = self
            .append(RESULTS, &result.ballot_id, KIND_RESULT, result)
            .await?;
        debug!(seq, version = result.version, "result appended");
        Ok(seq)
    }

    /// Every result version for a ballot, oldest first.
    pub async fn results(&self, ballot_id: &BallotId) -> Result<Vec<BallotResult>> {
        self.load(RESULTS, ballot_id, KIND_RESULT).await
    }

    pub async fn latest_result(&self, ballot_id: &BallotId) -> Result<Option<BallotResult>> {
        Ok(self.results(ballot_id).await?.pop())
    }

    /// Latest result version of every ballot, ordered by ballot id.
    pub async fn latest_results(&self) -> Result<Vec<BallotResult>> {
        let records = self.records.stream(RESULTS).await?;
        let mut latest: BTreeMap<BallotId, BallotResult> = BTreeMap::new();
        for result in decode::<BallotResult>(records, KIND_RESULT)? {
            latest.insert(result.ballot_id.clone(), result);
        }
        Ok(latest.into_values().collect())
    }

    // -- review ------------------------------------------------------------

    pub async fn append_decision(
        &self,
        ballot_id: &BallotId,
        record: &ReviewRecord,
    ) -> Result<u64> {
        self.append(REVIEW, ballot_id, KIND_DECISION, record).await
    }

    pub async fn decisions(&self, ballot_id: &BallotId) -> Result<Vec<ReviewRecord>> {
        self.load(REVIEW, ballot_id, KIND_DECISION).await
    }

    // -- status ------------------------------------------------------------

    /// Derived status, or `None` for a ballot never submitted.
    ///
    /// Precedence: superseded, then the latest result, then a pending rescan,
    /// then processing.
    pub async fn status(&self, ballot_id: &BallotId) -> Result<Option<BallotStatus>> {
        let intake = self.intake(ballot_id).await?;
        if intake.is_empty() {
            return Ok(None);
        }
        let latest = self.latest_result(ballot_id).await?;
        Ok(Some(derive_status(&intake, latest.as_ref())))
    }

    /// Status of every ballot that reached intake, ordered by ballot id.
    pub async fn all_statuses(&self) -> Result<BTreeMap<BallotId, BallotStatus>> {
        let mut intake: BTreeMap<BallotId, Vec<IntakeEvent>> = BTreeMap::new();
        for record in self.records.stream(INTAKE).await? {
            let id = BallotId(record.key);
            intake
                .entry(id)
                .or_default()
                .push(serde_json::from_value(record.payload)?);
        }

        let latest: BTreeMap<BallotId, BallotResult> = self
            .latest_results()
            .await?
            .into_iter()
            .map(|r| (r.ballot_id.clone(), r))
            .collect();

        Ok(intake
            .into_iter()
            .map(|(id, events)| {
                let status = derive_status(&events, latest.get(&id));
                (id, status)
            })
            .collect())
    }
}

fn decode<T: DeserializeOwned>(records: Vec<StoredRecord>, kind: &str) -> Result<Vec<T>> {
    records
        .into_iter()
        .filter(|r| r.kind == kind)
        .map(|r| Ok(serde_json::from_value(r.payload)?))
        .collect()
}

fn derive_status(intake: &[IntakeEvent], latest: Option<&BallotResult>) -> BallotStatus {
    if let Some(by) = intake.iter().rev().find_map(|e| match e {
        IntakeEvent::Superseded { by } => Some(by.clone()),
        _ => None,
    }) {
        return BallotStatus::Superseded { by };
    }
    if let Some(result) = latest {
        return result.ballot_status();
    }
    if let Some(problem) = intake.iter().rev().find_map(|e| match e {
        IntakeEvent::RescanRequired { problem, .. } => Some(problem),
        _ => None,
    }) {
        return BallotStatus::NeedsRescan {
            reason: problem.to_string(),
        };
    }
    BallotStatus::Processing
}
