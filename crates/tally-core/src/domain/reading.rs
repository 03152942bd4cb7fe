//! Strategy readings: what one strategy saw on one ballot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_state::{BallotId, ContentDigest};

use super::template::Region;

/// A mark confidence, guaranteed to lie in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Confidence(f64);

/// A confidence value that was NaN or outside `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("confidence {0} is outside [0, 1]")]
pub struct InvalidConfidence(pub f64);

impl Confidence {
    pub const ZERO: Confidence = Confidence(0.0);
    pub const ONE: Confidence = Confidence(1.0);

    pub fn new(value: f64) -> Result<Self, InvalidConfidence> {
        if value.is_nan() || !(0.0..=1.0).contains(&value) {
            return Err(InvalidConfidence(value));
        }
        Ok(Self(value))
    }

    /// Clamp into range. NaN becomes zero.
    pub fn saturating(value: f64) -> Self {
        if value.is_nan() {
            return Self::ZERO;
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Confidence {
    type Error = InvalidConfidence;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Confidence> for f64 {
    fn from(c: Confidence) -> f64 {
        c.0
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}

/// The closed set of reading strategies.
///
/// Ordering is the canonical order readings are presented in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    VisionModel,
    OcrLayout,
    Detection,
    ClassicalCv,
    /// A reviewer's decision. Never configurable as an automatic strategy.
    HumanReview,
}

impl StrategyKind {
    pub const CONFIGURABLE: [StrategyKind; 4] = [
        StrategyKind::VisionModel,
        StrategyKind::OcrLayout,
        StrategyKind::Detection,
        StrategyKind::ClassicalCv,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::VisionModel => "vision_model",
            Self::OcrLayout => "ocr_layout",
            Self::Detection => "detection",
            Self::ClassicalCv => "classical_cv",
            Self::HumanReview => "human_review",
        }
    }

    pub fn is_configurable(self) -> bool {
        !matches!(self, Self::HumanReview)
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What was marked in a contest.
///
/// The derived ordering (candidates by id, then blank, then invalid) is the
/// canonical order used to break ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "candidate", rename_all = "snake_case")]
pub enum Selection {
    Candidate(String),
    Blank,
    Invalid,
}

impl Selection {
    pub fn candidate(id: impl Into<String>) -> Self {
        Self::Candidate(id.into())
    }

    /// Stable string key used in the ledger (`candidate:<id>`, `blank`, `invalid`).
    pub fn key(&self) -> String {
        match self {
            Self::Candidate(id) => format!("candidate:{id}"),
            Self::Blank => "blank".to_string(),
            Self::Invalid => "invalid".to_string(),
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "blank" => Some(Self::Blank),
            "invalid" => Some(Self::Invalid),
            other => other
                .strip_prefix("candidate:")
                .filter(|id| !id.is_empty())
                .map(Self::candidate),
        }
    }
}

impl std::fmt::Display for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// One strategy's interpretation of one contest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContestReading {
    pub contest_id: String,
    pub selection: Selection,
    pub confidence: Confidence,
    /// Where on the sheet the evidence was found, if the strategy knows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
}

impl ContestReading {
    pub fn new(
        contest_id: impl Into<String>,
        selection: Selection,
        confidence: Confidence,
    ) -> Self {
        Self {
            contest_id: contest_id.into(),
            selection,
            confidence,
            region: None,
        }
    }
}

/// One strategy's full reading of one ballot. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredBallotReading {
    pub ballot_id: BallotId,
    pub strategy: StrategyKind,
    pub contests: Vec<ContestReading>,
    pub produced_at: DateTime<Utc>,
}

impl StructuredBallotReading {
    pub fn new(ballot_id: BallotId, strategy: StrategyKind, contests: Vec<ContestReading>) -> Self {
        Self {
            ballot_id,
            strategy,
            contests,
            produced_at: Utc::now(),
        }
    }

    pub fn contest(&self, contest_id: &str) -> Option<&ContestReading> {
        self.contests.iter().find(|c| c.contest_id == contest_id)
    }

    /// SHA-256 over the reading's content, excluding the production timestamp.
    pub fn digest(&self) -> serde_json::Result<ContentDigest> {
        let bytes = serde_json::to_vec(&(&self.ballot_id, self.strategy, &self.contests))?;
        Ok(ContentDigest::from_bytes(&bytes))
    }

    /// Reference to this reading for audit trails.
    pub fn reference(&self) -> serde_json::Result<ReadingRef> {
        Ok(ReadingRef {
            strategy: self.strategy,
            digest: self.digest()?,
        })
    }
}

/// Pointer from a result back to a reading that contributed to it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReadingRef {
    pub strategy: StrategyKind,
    pub digest: ContentDigest,
}
