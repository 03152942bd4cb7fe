//! Vision-model adapter.
//!
//! The model looks at the whole ballot and answers, per contest, whether the
//! marks are valid and which candidates were preferred in order.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tally_state::BallotId;
use tracing::debug;

use super::marks::{interpret, Mark};
use super::{BackendError, ExtractionStrategy, StrategyError};
use crate::domain::{
    BallotImage, BallotTemplate, Confidence, ContestReading, ContestTemplate, MarkingRule,
    Selection, StrategyKind, StructuredBallotReading,
};

/// A candidate reference as the model reports it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PreferenceRef {
    #[serde(default)]
    pub name: Option<String>,
    /// Sheet position.
    #[serde(default)]
    pub position: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionContestAnswer {
    pub contest_id: String,
    pub is_valid: bool,
    #[serde(default)]
    pub explanation: String,
    /// The voter used a cross rather than numbering.
    #[serde(default)]
    pub marked_with_cross: bool,
    /// Preferences, first preference first.
    #[serde(default)]
    pub preferences: Vec<PreferenceRef>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VisionAnswer {
    pub contests: Vec<VisionContestAnswer>,
}

/// A multimodal model that analyzes a normalized ballot image.
#[async_trait]
pub trait VisionModelClient: Send + Sync {
    async fn analyze(
        &self,
        png: &[u8],
        template: &BallotTemplate,
    ) -> Result<VisionAnswer, BackendError>;
}

pub struct VisionModelStrategy {
    client: Arc<dyn VisionModelClient>,
}

impl VisionModelStrategy {
    pub fn new(client: Arc<dyn VisionModelClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExtractionStrategy for VisionModelStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::VisionModel
    }

    async fn extract(
        &self,
        image: &BallotImage,
        template: &BallotTemplate,
    ) -> Result<StructuredBallotReading, StrategyError> {
        let answer = self.client.analyze(image.png(), template).await?;
        debug!(contests = answer.contests.len(), "vision answer received");
        to_reading(&answer, &image.ballot_id, template)
    }
}

/// Convert a model answer into a structured reading.
pub fn to_reading(
    answer: &VisionAnswer,
    ballot_id: &BallotId,
    template: &BallotTemplate,
) -> Result<StructuredBallotReading, StrategyError> {
    let mut seen = HashSet::new();
    let mut contests = Vec::with_capacity(answer.contests.len());

    for item in &answer.contests {
        let contest = template.contest(&item.contest_id).ok_or_else(|| {
            StrategyError::malformed(format!("unknown contest '{}'", item.contest_id))
        })?;
        if !seen.insert(contest.id.as_str()) {
            return Err(StrategyError::malformed(format!(
                "contest '{}' answered twice",
                contest.id
            )));
        }
        let confidence = Confidence::new(item.confidence)?;

        let selection = if item.is_valid {
            let marks = preference_marks(contest, item)?;
            interpret(contest.rule, &marks)
        } else {
            Selection::Invalid
        };
        contests.push(ContestReading::new(contest.id.clone(), selection, confidence));
    }

    Ok(StructuredBallotReading::new(
        ballot_id.clone(),
        StrategyKind::VisionModel,
        contests,
    ))
}

fn preference_marks(
    contest: &ContestTemplate,
    answer: &VisionContestAnswer,
) -> Result<Vec<(String, Mark)>, StrategyError> {
    let as_cross = answer.marked_with_cross || contest.rule == MarkingRule::Cross;
    answer
        .preferences
        .iter()
        .enumerate()
        .map(|(i, pref)| {
            let candidate = pref
                .position
                .and_then(|p| contest.candidate_at(p))
                .or_else(|| pref.name.as_deref().and_then(|n| contest.candidate_named(n)))
                .ok_or_else(|| {
                    StrategyError::malformed(format!(
                        "preference {:?} does not name a candidate in '{}'",
                        pref, contest.id
                    ))
                })?;
            let mark = if as_cross {
                Mark::Cross
            } else {
                Mark::Rank(i as u32 + 1)
            };
            Ok((candidate.id.clone(), mark))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::template::fixtures::general_template;

    fn by_position(p: u32) -> PreferenceRef {
        PreferenceRef {
            name: None,
            position: Some(p),
        }
    }

    fn by_name(n: &str) -> PreferenceRef {
        PreferenceRef {
            name: Some(n.to_string()),
            position: None,
        }
    }

    fn answer(
        contest: &str,
        valid: bool,
        prefs: Vec<PreferenceRef>,
        c: f64,
    ) -> VisionContestAnswer {
        VisionContestAnswer {
            contest_id: contest.to_string(),
            is_valid: valid,
            explanation: String::new(),
            marked_with_cross: false,
            preferences: prefs,
            confidence: c,
        }
    }

    #[test]
    fn test_converts_cross_and_ranking() {
        let template = general_template();
        let vision = VisionAnswer {
            contests: vec![
                answer("mayor", true, vec![by_name("BOB BAKER")], 0.9),
                answer(
                    "council",
                    true,
                    vec![by_position(5), by_position(3), by_name("dan diaz")],
                    0.8,
                ),
            ],
        };
        let reading = to_reading(&vision, &BallotId("b".into()), &template).unwrap();
        assert_eq!(reading.strategy, StrategyKind::VisionModel);
        assert_eq!(reading.contest("mayor").unwrap().selection, Selection::candidate("bob"));
        assert_eq!(reading.contest("council").unwrap().selection, Selection::candidate("erin"));
    }

    #[test]
    fn test_invalid_and_blank_answers() {
        let template = general_template();
        let vision = VisionAnswer {
            contests: vec![
                answer("mayor", false, vec![by_position(1)], 0.7),
                answer("council", true, vec![], 0.6),
            ],
        };
        let reading = to_reading(&vision, &BallotId("b".into()), &template).unwrap();
        assert_eq!(reading.contest("mayor").unwrap().selection, Selection::Invalid);
        assert_eq!(reading.contest("council").unwrap().selection, Selection::Blank);
    }

    #[test]
    fn test_incomplete_ranking_is_invalid() {
        let template = general_template();
        let vision = VisionAnswer {
            contests: vec![answer("council", true, vec![by_position(3)], 0.9)],
        };
        let reading = to_reading(&vision, &BallotId("b".into()), &template).unwrap();
        assert_eq!(reading.contest("council").unwrap().selection, Selection::Invalid);
        assert!(reading.contest("mayor").is_none());
    }

    #[test]
    fn test_malformed_answers() {
        let template = general_template();
        let unknown_contest = VisionAnswer {
            contests: vec![answer("sheriff", true, vec![], 0.9)],
        };
        assert!(matches!(
            to_reading(&unknown_contest, &BallotId("b".into()), &template),
            Err(StrategyError::MalformedReading { .. })
        ));

        let bad_confidence = VisionAnswer {
            contests: vec![answer("mayor", true, vec![by_position(1)], 1.4)],
        };
        assert!(to_reading(&bad_confidence, &BallotId("b".into()), &template).is_err());

        // Position 3 belongs to the council race, not the mayoral one.
        let wrong_contest = VisionAnswer {
            contests: vec![answer("mayor", true, vec![by_position(3)], 0.9)],
        };
        assert!(to_reading(&wrong_contest, &BallotId("b".into()), &template).is_err());
    }
}
