//! Classical image-processing adapter.
//!
//! The pipeline splits the warped ballot into horizontal rows along the
//! printed rules and template-matches each row against the known mark
//! symbols. Row `n` is the candidate printed at sheet position `n`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tally_state::BallotId;

use super::marks::{interpret, Mark};
use super::{BackendError, ExtractionStrategy, StrategyError};
use crate::domain::{
    BallotImage, BallotTemplate, Confidence, ContestReading, StrategyKind,
    StructuredBallotReading,
};

/// Best template match within one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowMatch {
    /// 1-based row index, top to bottom.
    pub row: u32,
    /// Best matching symbol, if any template matched at all.
    #[serde(default)]
    pub symbol: Option<String>,
    /// Normalized correlation of the best match.
    pub score: f64,
}

#[async_trait]
pub trait ClassicalPipeline: Send + Sync {
    async fn match_rows(&self, png: &[u8]) -> Result<Vec<RowMatch>, BackendError>;
}

pub struct ClassicalCvStrategy {
    pipeline: Arc<dyn ClassicalPipeline>,
    threshold: f64,
}

impl ClassicalCvStrategy {
    pub fn new(pipeline: Arc<dyn ClassicalPipeline>, threshold: f64) -> Self {
        Self {
            pipeline,
            threshold,
        }
    }
}

#[async_trait]
impl ExtractionStrategy for ClassicalCvStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ClassicalCv
    }

    async fn extract(
        &self,
        image: &BallotImage,
        template: &BallotTemplate,
    ) -> Result<StructuredBallotReading, StrategyError> {
        let rows = self.pipeline.match_rows(image.png()).await?;
        to_reading(&rows, &image.ballot_id, template, self.threshold)
    }
}

/// Convert row matches into a structured reading.
///
/// Matches scoring below `threshold` count as unmarked; an unmarked row
/// contributes `1 - score` to the contest confidence. A contest is skipped
/// when any of its rows is missing.
pub fn to_reading(
    rows: &[RowMatch],
    ballot_id: &BallotId,
    template: &BallotTemplate,
    threshold: f64,
) -> Result<StructuredBallotReading, StrategyError> {
    let mut by_row: HashMap<u32, &RowMatch> = HashMap::new();
    for row in rows {
        Confidence::new(row.score)?;
        if by_row.insert(row.row, row).is_some() {
            return Err(StrategyError::malformed(format!("row {} reported twice", row.row)));
        }
    }

    let mut contests = Vec::new();
    'contests: for contest in &template.contests {
        let mut marks = Vec::new();
        let mut confidence = 1.0f64;

        for candidate in &contest.candidates {
            let Some(row) = by_row.get(&candidate.position) else {
                continue 'contests;
            };
            let mark = row
                .symbol
                .as_deref()
                .filter(|_| row.score >= threshold)
                .and_then(Mark::parse);
            match mark {
                Some(mark) => {
                    confidence = confidence.min(row.score);
                    marks.push((candidate.id.clone(), mark));
                }
                None => confidence = confidence.min(1.0 - row.score),
            }
        }

        contests.push(ContestReading::new(
            contest.id.clone(),
            interpret(contest.rule, &marks),
            Confidence::new(confidence)?,
        ));
    }

    Ok(StructuredBallotReading::new(
        ballot_id.clone(),
        StrategyKind::ClassicalCv,
        contests,
    ))
}
