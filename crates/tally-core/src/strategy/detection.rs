//! Object-detection adapter.
//!
//! The detector labels boxes either with a candidate's printed name or with a
//! mark symbol (`cross`, `1`, `2`, ...). Symbols are paired with the name box
//! they sit beside vertically.

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

/// Axis-aligned box in image pixels, `(x1, y1)` top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub bbox: BoundingBox,
    pub score: f64,
}

impl Detection {
    fn mark(&self) -> Option<Mark> {
        match Mark::parse(&self.label) {
            Some(Mark::Unknown(_)) | None => None,
            known => known,
        }
    }
}

#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, png: &[u8]) -> Result<Vec<Detection>, BackendError>;
}

pub struct DetectionStrategy {
    detector: Arc<dyn Detector>,
    tolerance: f64,
}

impl DetectionStrategy {
    pub fn new(detector: Arc<dyn Detector>, tolerance: i64) -> Self {
        Self {
            detector,
            tolerance: tolerance as f64,
        }
    }
}

#[async_trait]
impl ExtractionStrategy for DetectionStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Detection
    }

    async fn extract(
        &self,
        image: &BallotImage,
        template: &BallotTemplate,
    ) -> Result<StructuredBallotReading, StrategyError> {
        let detections = self.detector.detect(image.png()).await?;
        to_reading(&detections, &image.ballot_id, template, self.tolerance)
    }
}

/// Whether `symbol` belongs on the same row as `name`.
fn beside(name: &BoundingBox, symbol: &BoundingBox, tolerance: f64) -> bool {
    // name starts within the symbol
    (name.y1 >= symbol.y1 && name.y1 <= symbol.y2)
        // name encloses the symbol
        || (name.y1 <= symbol.y1 && name.y2 >= symbol.y2)
        // symbol just above the name
        || (name.y1 - symbol.y2).abs() < tolerance
        // symbol just below the name
        || (symbol.y1 - name.y2).abs() < tolerance
}

/// Convert detections into a structured reading.
///
/// A contest is reported only when all of its candidate names were detected.
pub fn to_reading(
    detections: &[Detection],
    ballot_id: &BallotId,
    template: &BallotTemplate,
    tolerance: f64,
) -> Result<StructuredBallotReading, StrategyError> {
    for d in detections {
        Confidence::new(d.score)?;
    }
    let symbols: Vec<(&Detection, Mark)> = detections
        .iter()
        .filter_map(|d| d.mark().map(|m| (d, m)))
        .collect();

    let mut contests = Vec::new();
    'contests: for contest in &template.contests {
        let mut marks = Vec::new();
        let mut confidence = 1.0f64;

        for candidate in &contest.candidates {
            let Some(name) = detections
                .iter()
                .filter(|d| d.mark().is_none())
                .find(|d| {
                    contest
                        .candidate_named(&d.label)
                        .is_some_and(|c| c.id == candidate.id)
                })
            else {
                continue 'contests;
            };
            confidence = confidence.min(name.score);

            if let Some((symbol, mark)) = symbols
                .iter()
                .find(|(s, _)| beside(&name.bbox, &s.bbox, tolerance))
            {
                confidence = confidence.min(symbol.score);
                marks.push((candidate.id.clone(), mark.clone()));
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
        StrategyKind::Detection,
        contests,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::template::fixtures::general_template;
    use crate::domain::Selection;

    fn det(label: &str, y1: f64, y2: f64, score: f64) -> Detection {
        Detection {
            label: label.to_string(),
            bbox: BoundingBox {
                x1: 10.0,
                y1,
                x2: 100.0,
                y2,
            },
            score,
        }
    }

    #[test]
    fn test_association_cases() {
        let name = BoundingBox { x1: 0.0, y1: 100.0, x2: 50.0, y2: 130.0 };
        let sym = |y1: f64, y2: f64| BoundingBox { x1: 60.0, y1, x2: 80.0, y2 };
        // starts within
        assert!(beside(&name, &sym(95.0, 120.0), 20.0));
        // encloses
        assert!(beside(&name, &sym(105.0, 125.0), 20.0));
        // just above
        assert!(beside(&name, &sym(70.0, 85.0), 20.0));
        // just below
        assert!(beside(&name, &sym(140.0, 160.0), 20.0));
        // far away
        assert!(!beside(&name, &sym(300.0, 320.0), 20.0));
    }

    #[test]
    fn test_cross_and_ranking_from_detections() {
        let detections = vec![
            det("Alice Archer", 100.0, 130.0, 0.95),
            det("cross", 102.0, 128.0, 0.9),
            det("Bob Baker", 200.0, 230.0, 0.97),
            det("Carol Chen", 300.0, 330.0, 0.9),
            det("3", 302.0, 328.0, 0.8),
            det("Dan Diaz", 400.0, 430.0, 0.9),
            det("1", 402.0, 428.0, 0.85),
            det("Erin Eze", 500.0, 530.0, 0.9),
            det("2", 502.0, 528.0, 0.7),
        ];
        let reading =
            to_reading(&detections, &BallotId("b".into()), &general_template(), 20.0).unwrap();

        let mayor = reading.contest("mayor").unwrap();
        assert_eq!(mayor.selection, Selection::candidate("alice"));
        assert!((mayor.confidence.value() - 0.9).abs() < 1e-12);

        let council = reading.contest("council").unwrap();
        assert_eq!(council.selection, Selection::candidate("dan"));
        assert!((council.confidence.value() - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_unmarked_contest_is_blank() {
        let detections = vec![
            det("Alice Archer", 100.0, 130.0, 0.95),
            det("Bob Baker", 200.0, 230.0, 0.97),
        ];
        let reading =
            to_reading(&detections, &BallotId("b".into()), &general_template(), 20.0).unwrap();
        assert_eq!(reading.contest("mayor").unwrap().selection, Selection::Blank);
        assert!(reading.contest("council").is_none());
    }

    #[test]
    fn test_bad_score_is_malformed() {
        let detections = vec![det("Alice Archer", 100.0, 130.0, -0.2)];
        assert!(to_reading(&detections, &BallotId("b".into()), &general_template(), 20.0).is_err());
    }
}
