//! Review queue for flagged ballots.
//!
//! A reviewer sees the full evidence for a flagged ballot and submits a
//! decision. The decision is injected into reconciliation as an
//! authoritative [`StrategyKind::HumanReview`] reading, which yields a new
//! `Overridden` result version. A ballot is overridden at most once.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_state::{BallotId, ContentDigest};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::{
    BallotResult, BallotTemplate, Confidence, ContestReading, FlagReason, ReadingRef, Result,
    ResultStatus, Selection, StrategyKind, StructuredBallotReading, TallyError,
};
use crate::orchestrator::Abstention;
use crate::reconcile::{reconcile, ReconcilePolicy};
use crate::repository::{BallotRepository, IntakeEvent};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReviewError {
    #[error("ballot {ballot_id} is not flagged (status: {status})")]
    NotFlagged { ballot_id: BallotId, status: String },

    #[error("ballot {0} was already resolved by a different decision")]
    AlreadyResolved(BallotId),

    #[error("decision has no reviewer")]
    MissingReviewer,

    #[error("decision does not cover disputed contest {0}")]
    MissingContest(String),

    #[error("unknown contest {0}")]
    UnknownContest(String),

    #[error("unknown candidate {candidate} in contest {contest}")]
    UnknownCandidate { contest: String, candidate: String },
}

/// A reviewer's selections for a flagged ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub reviewer: String,
    /// Selection per contest id.
    pub selections: BTreeMap<String, Selection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ReviewDecision {
    pub fn new(reviewer: impl Into<String>) -> Self {
        Self {
            reviewer: reviewer.into(),
            selections: BTreeMap::new(),
            comment: None,
        }
    }

    pub fn select(mut self, contest_id: impl Into<String>, selection: Selection) -> Self {
        self.selections.insert(contest_id.into(), selection);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// A decision as persisted in the review stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub decision_id: Uuid,
    /// Result version the decision produced.
    pub version: u32,
    pub decision: ReviewDecision,
    pub recorded_at: DateTime<Utc>,
}

impl ReviewRecord {
    pub fn new(version: u32, decision: ReviewDecision) -> Self {
        Self {
            decision_id: Uuid::new_v4(),
            version,
            decision,
            recorded_at: Utc::now(),
        }
    }
}

/// A flagged ballot awaiting a reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub ballot_id: BallotId,
    pub precinct: String,
    pub reason: FlagReason,
    pub disputed: Vec<String>,
    pub flagged_at: DateTime<Utc>,
}

/// Everything known about a ballot, for a reviewer or an auditor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub ballot_id: BallotId,
    pub image_digest: Option<ContentDigest>,
    pub intake: Vec<IntakeEvent>,
    pub readings: Vec<StructuredBallotReading>,
    pub abstentions: Vec<Abstention>,
    /// Latest result version.
    pub result: Option<BallotResult>,
    /// Every result version, oldest first.
    pub history: Vec<BallotResult>,
    pub decisions: Vec<ReviewRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewOutcome {
    /// The decision produced a new Overridden result.
    Applied(BallotResult),
    /// The same decision was applied earlier; nothing changed.
    AlreadyApplied(BallotResult),
}

impl ReviewOutcome {
    pub fn result(&self) -> &BallotResult {
        match self {
            Self::Applied(r) | Self::AlreadyApplied(r) => r,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Check a decision against the flagged result and its template.
///
/// Every disputed contest must be decided; contests and candidates must
/// exist. Undisputed contests may be decided too, which replaces the
/// machine selection.
pub fn validate_decision(
    result: &BallotResult,
    template: &BallotTemplate,
    decision: &ReviewDecision,
) -> std::result::Result<(), ReviewError> {
    if decision.reviewer.trim().is_empty() {
        return Err(ReviewError::MissingReviewer);
    }

    for (contest_id, selection) in &decision.selections {
        let contest = template
            .contest(contest_id)
            .ok_or_else(|| ReviewError::UnknownContest(contest_id.clone()))?;
        if let Selection::Candidate(candidate) = selection {
            if contest.candidate(candidate).is_none() {
                return Err(ReviewError::UnknownCandidate {
                    contest: contest_id.clone(),
                    candidate: candidate.clone(),
                });
            }
        }
    }

    if let Some(missing) = result
        .disputed_contests()
        .into_iter()
        .find(|c| !decision.selections.contains_key(*c))
    {
        return Err(ReviewError::MissingContest(missing.to_string()));
    }
    Ok(())
}

/// The authoritative reading a decision stands for.
pub fn override_reading(
    ballot_id: &BallotId,
    decision: &ReviewDecision,
) -> StructuredBallotReading {
    StructuredBallotReading::new(
        ballot_id.clone(),
        StrategyKind::HumanReview,
        decision
            .selections
            .iter()
            .map(|(contest, selection)| {
                ContestReading::new(contest.clone(), selection.clone(), Confidence::ONE)
            })
            .collect(),
    )
}

/// Flagged ballots and their resolution.
#[derive(Clone)]
pub struct ReviewQueue {
    repository: BallotRepository,
    policy: ReconcilePolicy,
}

impl ReviewQueue {
    pub fn new(repository: BallotRepository, policy: ReconcilePolicy) -> Self {
        Self { repository, policy }
    }

    /// Ballots whose latest result is Flagged, ordered by ballot id.
    pub async fn pending(&self) -> Result<Vec<ReviewItem>> {
        Ok(self
            .repository
            .latest_results()
            .await?
            .into_iter()
            .filter(|r| r.status == ResultStatus::Flagged)
            .map(|r| ReviewItem {
                reason: r.flag_reason.unwrap_or(FlagReason::Disagreement),
                disputed: r.disputed_contests().into_iter().map(String::from).collect(),
                ballot_id: r.ballot_id,
                precinct: r.precinct,
                flagged_at: r.decided_at,
            })
            .collect())
    }

    pub async fn evidence(&self, ballot_id: &BallotId) -> Result<EvidenceBundle> {
        let intake = self.repository.intake(ballot_id).await?;
        if intake.is_empty() {
            return Err(TallyError::BallotNotFound(ballot_id.clone()));
        }
        let image_digest = intake.iter().find_map(|e| match e {
            IntakeEvent::Admitted { image_digest, .. } => Some(image_digest.clone()),
            _ => None,
        });
        let history = self.repository.results(ballot_id).await?;

        Ok(EvidenceBundle {
            ballot_id: ballot_id.clone(),
            image_digest,
            intake,
            readings: self.repository.readings(ballot_id).await?,
            abstentions: self.repository.abstentions(ballot_id).await?,
            result: history.last().cloned(),
            history,
            decisions: self.repository.decisions(ballot_id).await?,
        })
    }

    /// Apply a reviewer decision to a flagged ballot.
    ///
    /// Callers serialize decisions per ballot.
    #[instrument(skip_all, fields(ballot_id = %ballot_id.short(), reviewer = %decision.reviewer))]
    pub async fn decide(
        &self,
        template: &BallotTemplate,
        ballot_id: &BallotId,
        decision: &ReviewDecision,
    ) -> Result<ReviewOutcome> {
        let current = self
            .repository
            .latest_result(ballot_id)
            .await?
            .ok_or_else(|| TallyError::BallotNotFound(ballot_id.clone()))?;

        match current.status {
            ResultStatus::Overridden => {
                let applied = self
                    .repository
                    .decisions(ballot_id)
                    .await?
                    .into_iter()
                    .any(|r| {
                        r.version == current.version
                            && r.decision.selections == decision.selections
                    });
                return if applied {
                    Ok(ReviewOutcome::AlreadyApplied(current))
                } else {
                    Err(ReviewError::AlreadyResolved(ballot_id.clone()).into())
                };
            }
            ResultStatus::Accepted => {
                return Err(ReviewError::NotFlagged {
                    ballot_id: ballot_id.clone(),
                    status: current.status.to_string(),
                }
                .into());
            }
            ResultStatus::Flagged => {}
        }

        validate_decision(&current, template, decision)?;

        // Reconcile exactly the readings the flagged result was built from.
        let mut readings: BTreeMap<ReadingRef, StructuredBallotReading> = BTreeMap::new();
        for reading in self.repository.readings(ballot_id).await? {
            let reference = reading.reference()?;
            if current.readings.contains(&reference) {
                readings.insert(reference, reading);
            }
        }
        let mut readings: Vec<StructuredBallotReading> = readings.into_values().collect();
        readings.push(override_reading(ballot_id, decision));

        let mut result =
            reconcile(ballot_id, &current.precinct, template, &readings, &self.policy)?;
        result.version = current.version + 1;

        self.repository
            .append_decision(ballot_id, &ReviewRecord::new(result.version, decision.clone()))
            .await?;
        self.repository.append_result(&result).await?;

        info!(version = result.version, "review decision applied");
        Ok(ReviewOutcome::Applied(result))
    }
}
