//! Adjudicated ballot results and their reconciliation trace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_state::BallotId;

use super::ballot::BallotStatus;
use super::reading::{Confidence, ReadingRef, Selection, StrategyKind};
use super::template::BallotTemplate;

/// Final call for one contest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "selection", rename_all = "snake_case")]
pub enum Adjudication {
    Selected(Selection),
    /// No selection could be adjudicated; needs a reviewer.
    Disputed,
}

impl Adjudication {
    pub fn selection(&self) -> Option<&Selection> {
        match self {
            Self::Selected(s) => Some(s),
            Self::Disputed => None,
        }
    }

    pub fn is_disputed(&self) -> bool {
        matches!(self, Self::Disputed)
    }
}

/// Which reconciliation rule decided a contest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum DecisionRule {
    Unanimous,
    WeightedMajority { share: f64 },
    NoMajority { share: f64 },
    NoCoverage { covered: usize, required: usize },
    Override,
}

/// Weighted support one selection received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionSupport {
    pub selection: Selection,
    pub weight: f64,
    pub strategies: Vec<StrategyKind>,
    /// Combined confidence among the supporting strategies.
    pub confidence: Confidence,
}

/// Adjudication and trace for one contest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContestOutcome {
    pub contest_id: String,
    pub adjudication: Adjudication,
    pub confidence: Confidence,
    pub rule: DecisionRule,
    /// Per-selection support in canonical selection order.
    pub support: Vec<SelectionSupport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Accepted,
    Flagged,
    Overridden,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Flagged => "flagged",
            Self::Overridden => "overridden",
        }
    }

    pub fn is_countable(self) -> bool {
        matches!(self, Self::Accepted | Self::Overridden)
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a ballot was routed to review.
///
/// Ordered by severity: when several apply, the greatest is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagReason {
    LowConfidence,
    Disagreement,
    InsufficientData,
}

impl std::fmt::Display for FlagReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LowConfidence => "low_confidence",
            Self::Disagreement => "disagreement",
            Self::InsufficientData => "insufficient_data",
        };
        f.write_str(s)
    }
}

/// The adjudicated outcome for one ballot.
///
/// Results are versioned: an override appends a new version rather than
/// mutating the flagged one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BallotResult {
    pub ballot_id: BallotId,
    pub precinct: String,
    pub template_id: String,
    pub version: u32,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_reason: Option<FlagReason>,
    /// One entry per template contest, in template order.
    pub contests: Vec<ContestOutcome>,
    pub readings: Vec<ReadingRef>,
    pub decided_at: DateTime<Utc>,
}

impl BallotResult {
    /// A flagged result for a ballot too few strategies could read.
    ///
    /// Every contest is disputed; reconciliation is not attempted.
    pub fn insufficient_data(
        ballot_id: BallotId,
        precinct: impl Into<String>,
        template: &BallotTemplate,
        readings: Vec<ReadingRef>,
        required: usize,
    ) -> Self {
        let covered = readings.len();
        let contests = template
            .contests
            .iter()
            .map(|contest| ContestOutcome {
                contest_id: contest.id.clone(),
                adjudication: Adjudication::Disputed,
                confidence: Confidence::ZERO,
                rule: DecisionRule::NoCoverage { covered, required },
                support: Vec::new(),
            })
            .collect();

        Self {
            ballot_id,
            precinct: precinct.into(),
            template_id: template.id.clone(),
            version: 1,
            status: ResultStatus::Flagged,
            flag_reason: Some(FlagReason::InsufficientData),
            contests,
            readings,
            decided_at: Utc::now(),
        }
    }

    pub fn outcome(&self, contest_id: &str) -> Option<&ContestOutcome> {
        self.contests.iter().find(|c| c.contest_id == contest_id)
    }

    /// Contests a reviewer must decide.
    pub fn disputed_contests(&self) -> Vec<&str> {
        self.contests
            .iter()
            .filter(|c| c.adjudication.is_disputed())
            .map(|c| c.contest_id.as_str())
            .collect()
    }

    /// `(contest, selection)` pairs this result contributes to the tally.
    pub fn selections(&self) -> impl Iterator<Item = (&str, &Selection)> {
        self.contests.iter().filter_map(|c| {
            c.adjudication
                .selection()
                .map(|s| (c.contest_id.as_str(), s))
        })
    }

    pub fn ballot_status(&self) -> BallotStatus {
        match self.status {
            ResultStatus::Accepted => BallotStatus::Accepted,
            ResultStatus::Overridden => BallotStatus::Overridden,
            ResultStatus::Flagged => BallotStatus::Flagged {
                reason: self.flag_reason.unwrap_or(FlagReason::Disagreement),
            },
        }
    }
}
