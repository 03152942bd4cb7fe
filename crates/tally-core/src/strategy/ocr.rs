//! OCR / layout adapter.
//!
//! The OCR backend returns the ballot as line-printer text: each candidate's
//! printed name on a line, with whatever the voter wrote further right.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tally_state::BallotId;
use tracing::warn;

use super::marks::{interpret, Mark};
use super::{BackendError, ExtractionStrategy, StrategyError};
use crate::domain::template::normalize_name;
use crate::domain::{
    BallotImage, BallotTemplate, Confidence, ContestReading, StrategyKind,
    StructuredBallotReading,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrLine {
    pub text: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OcrPage {
    pub lines: Vec<OcrLine>,
}

/// OCR engine producing line-printer layout text.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, png: &[u8]) -> Result<OcrPage, BackendError>;
}

pub struct OcrLayoutStrategy {
    engine: Arc<dyn OcrEngine>,
    name_column: usize,
}

impl OcrLayoutStrategy {
    pub fn new(engine: Arc<dyn OcrEngine>, name_column: usize) -> Self {
        Self {
            engine,
            name_column,
        }
    }
}

#[async_trait]
impl ExtractionStrategy for OcrLayoutStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::OcrLayout
    }

    async fn extract(
        &self,
        image: &BallotImage,
        template: &BallotTemplate,
    ) -> Result<StructuredBallotReading, StrategyError> {
        let page = self.engine.recognize(image.png()).await?;
        to_reading(&page, &image.ballot_id, template, self.name_column)
    }
}

/// Printed checkbox glyphs: `[ ]`, `[X]` and the ballot-box character.
const CHECKBOX_GLYPHS: &str = r"\[\s*[xX]?\s*\]|☐";

fn checkbox_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| match Regex::new(CHECKBOX_GLYPHS) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(error = %e, "checkbox pattern rejected, glyphs will not be stripped");
                None
            }
        })
        .as_ref()
}

/// Text right of the name column with printed checkbox glyphs removed.
fn mark_area(text: &str, name_column: usize) -> String {
    let tail: String = text.chars().skip(name_column).collect();
    match checkbox_pattern() {
        Some(re) => re.replace_all(&tail, "").into_owned(),
        None => tail,
    }
}

/// Convert a recognized page into a structured reading.
///
/// A contest is only reported when every one of its candidates was found on
/// the page; otherwise the strategy abstains for that contest. A mark found on
/// a neighbouring line is credited to one candidate only.
pub fn to_reading(
    page: &OcrPage,
    ballot_id: &BallotId,
    template: &BallotTemplate,
    name_column: usize,
) -> Result<StructuredBallotReading, StrategyError> {
    for line in &page.lines {
        Confidence::new(line.confidence)?;
    }

    let normalized: Vec<String> = page.lines.iter().map(|l| normalize_name(&l.text)).collect();
    let all_names: Vec<String> = template
        .contests
        .iter()
        .flat_map(|c| c.candidates.iter().map(|cand| normalize_name(&cand.name)))
        .collect();
    let names_a_candidate =
        |i: usize| all_names.iter().any(|n| !n.is_empty() && normalized[i].contains(n.as_str()));

    let mut borrowed = HashSet::new();
    let mut contests = Vec::new();
    'contests: for contest in &template.contests {
        let mut marks = Vec::new();
        let mut confidence = 1.0f64;

        for candidate in &contest.candidates {
            let wanted = normalize_name(&candidate.name);
            let Some(i) = normalized.iter().position(|l| l.contains(wanted.as_str())) else {
                continue 'contests;
            };
            confidence = confidence.min(page.lines[i].confidence);

            let mut found =
                Mark::scan(&mark_area(&page.lines[i].text, name_column)).map(|m| (m, i));
            if found.is_none() {
                let neighbours = [i.checked_sub(1), Some(i + 1)];
                found = neighbours
                    .into_iter()
                    .flatten()
                    .filter(|&j| {
                        j < page.lines.len() && !borrowed.contains(&j) && !names_a_candidate(j)
                    })
                    .find_map(|j| {
                        Mark::scan(&mark_area(&page.lines[j].text, name_column)).map(|m| (m, j))
                    });
                if let Some((_, j)) = found {
                    borrowed.insert(j);
                }
            }
            if let Some((mark, j)) = found {
                confidence = confidence.min(page.lines[j].confidence);
                marks.push((candidate.id.clone(), mark));
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
        StrategyKind::OcrLayout,
        contests,
    ))
}
