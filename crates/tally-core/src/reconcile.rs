//! Consensus reconciliation of strategy readings.
//!
//! Each template contest is decided independently:
//!
//! 1. Fewer than `quorum` covering readings: disputed, no coverage.
//! 2. All readings agree: accepted with the combined confidence.
//! 3. Disagreement: the selection with the greatest trust weight leads (ties
//!    go to the canonically smallest selection). It wins if its share of the
//!    total weight exceeds `majority_fraction`, with its combined confidence
//!    discounted by that share; otherwise the contest is disputed.
//!
//! A reviewer reading ([`StrategyKind::HumanReview`]) is authoritative for the
//! contests it covers.
//!
//! Sums are taken in a fixed order over `BTreeMap`s so identical inputs give
//! bit-identical results.

use std::collections::BTreeMap;

use chrono::Utc;
use tally_state::BallotId;
use tracing::{debug, instrument};

use crate::domain::{
    Adjudication, BallotResult, BallotTemplate, Confidence, ContestOutcome, ContestTemplate,
    DecisionRule, FlagReason, ReadingRef, Result, ResultStatus, Selection, SelectionSupport,
    StrategyKind, StructuredBallotReading,
};

/// Reconciliation parameters, derived from the engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePolicy {
    pub quorum: usize,
    pub majority_fraction: f64,
    pub min_confidence: f64,
    /// Trust weight per strategy. Unlisted strategies weigh 1.0.
    pub weights: BTreeMap<StrategyKind, f64>,
}

impl ReconcilePolicy {
    pub fn weight(&self, kind: StrategyKind) -> f64 {
        self.weights.get(&kind).copied().unwrap_or(1.0)
    }
}

/// Weighted noisy-OR: `1 - Π (1 - c_i)^(w_i / w_min)`.
///
/// Every exponent is at least 1, so the result is never below the highest
/// contributing confidence. With equal weights this is `1 - Π (1 - c_i)`.
pub fn combine(contributions: &[(Confidence, f64)]) -> Confidence {
    let w_min = contributions
        .iter()
        .map(|(_, w)| *w)
        .fold(f64::INFINITY, f64::min);
    if contributions.is_empty() || w_min <= 0.0 {
        return Confidence::ZERO;
    }
    let doubt: f64 = contributions
        .iter()
        .map(|(c, w)| (1.0 - c.value()).powf(w / w_min))
        .product();
    Confidence::saturating(1.0 - doubt)
}

#[derive(Default)]
struct Tally {
    weight: f64,
    strategies: Vec<StrategyKind>,
    contributions: Vec<(Confidence, f64)>,
}

/// Reconcile every contest of `template` from the given readings.
#[instrument(skip_all, fields(ballot_id = %ballot_id.short(), readings = readings.len()))]
pub fn reconcile(
    ballot_id: &BallotId,
    precinct: &str,
    template: &BallotTemplate,
    readings: &[StructuredBallotReading],
    policy: &ReconcilePolicy,
) -> Result<BallotResult> {
    let mut ordered: Vec<&StructuredBallotReading> = readings.iter().collect();
    ordered.sort_by_key(|r| r.strategy);

    let refs = ordered
        .iter()
        .map(|r| r.reference())
        .collect::<serde_json::Result<Vec<ReadingRef>>>()?;

    let overridden = ordered.iter().any(|r| r.strategy == StrategyKind::HumanReview);
    let contests: Vec<ContestOutcome> = template
        .contests
        .iter()
        .map(|contest| decide_contest(contest, &ordered, policy))
        .collect();

    let mut reason: Option<FlagReason> = None;
    for outcome in &contests {
        let contest_reason = match (&outcome.adjudication, &outcome.rule) {
            (Adjudication::Disputed, DecisionRule::NoCoverage { .. }) => {
                Some(FlagReason::InsufficientData)
            }
            (Adjudication::Disputed, _) => Some(FlagReason::Disagreement),
            (Adjudication::Selected(_), DecisionRule::Override) => None,
            (Adjudication::Selected(_), _)
                if !overridden && outcome.confidence.value() < policy.min_confidence =>
            {
                Some(FlagReason::LowConfidence)
            }
            _ => None,
        };
        reason = reason.max(contest_reason);
    }

    let status = match (reason, overridden) {
        (Some(_), _) => ResultStatus::Flagged,
        (None, true) => ResultStatus::Overridden,
        (None, false) => ResultStatus::Accepted,
    };
    debug!(status = %status, reason = ?reason, "ballot reconciled");

    Ok(BallotResult {
        ballot_id: ballot_id.clone(),
        precinct: precinct.to_string(),
        template_id: template.id.clone(),
        version: 1,
        status,
        flag_reason: reason,
        contests,
        readings: refs,
        decided_at: Utc::now(),
    })
}

fn decide_contest(
    contest: &ContestTemplate,
    readings: &[&StructuredBallotReading],
    policy: &ReconcilePolicy,
) -> ContestOutcome {
    if let Some(human) = readings
        .iter()
        .filter(|r| r.strategy == StrategyKind::HumanReview)
        .find_map(|r| r.contest(&contest.id))
    {
        // Recorded as outweighing every machine reading of the contest combined.
        let machine_weight: f64 = readings
            .iter()
            .filter(|r| r.strategy != StrategyKind::HumanReview)
            .filter(|r| r.contest(&contest.id).is_some())
            .map(|r| policy.weight(r.strategy))
            .sum();
        return ContestOutcome {
            contest_id: contest.id.clone(),
            adjudication: Adjudication::Selected(human.selection.clone()),
            confidence: Confidence::ONE,
            rule: DecisionRule::Override,
            support: vec![SelectionSupport {
                selection: human.selection.clone(),
                weight: machine_weight + 1.0,
                strategies: vec![StrategyKind::HumanReview],
                confidence: Confidence::ONE,
            }],
        };
    }

    let mut tallies: BTreeMap<Selection, Tally> = BTreeMap::new();
    let mut covered = 0usize;
    for reading in readings.iter().filter(|r| r.strategy != StrategyKind::HumanReview) {
        let Some(cr) = reading.contest(&contest.id) else {
            continue;
        };
        covered += 1;
        let weight = policy.weight(reading.strategy);
        let tally = tallies.entry(cr.selection.clone()).or_default();
        tally.weight += weight;
        tally.strategies.push(reading.strategy);
        tally.contributions.push((cr.confidence, weight));
    }

    let support: Vec<SelectionSupport> = tallies
        .iter()
        .map(|(selection, t)| SelectionSupport {
            selection: selection.clone(),
            weight: t.weight,
            strategies: t.strategies.clone(),
            confidence: combine(&t.contributions),
        })
        .collect();

    let disputed = |rule: DecisionRule, support: Vec<SelectionSupport>| ContestOutcome {
        contest_id: contest.id.clone(),
        adjudication: Adjudication::Disputed,
        confidence: Confidence::ZERO,
        rule,
        support,
    };

    if covered < policy.quorum {
        return disputed(
            DecisionRule::NoCoverage {
                covered,
                required: policy.quorum,
            },
            support,
        );
    }

    if support.len() == 1 {
        let only = &support[0];
        return ContestOutcome {
            contest_id: contest.id.clone(),
            adjudication: Adjudication::Selected(only.selection.clone()),
            confidence: only.confidence,
            rule: DecisionRule::Unanimous,
            support,
        };
    }

    let total: f64 = support.iter().map(|s| s.weight).sum();
    let mut leader = &support[0];
    for candidate in &support[1..] {
        if candidate.weight > leader.weight {
            leader = candidate;
        }
    }
    let share = if total > 0.0 { leader.weight / total } else { 0.0 };

    if share > policy.majority_fraction {
        let adjudication = Adjudication::Selected(leader.selection.clone());
        let confidence = Confidence::saturating(leader.confidence.value() * share);
        return ContestOutcome {
            contest_id: contest.id.clone(),
            adjudication,
            confidence,
            rule: DecisionRule::WeightedMajority { share },
            support,
        };
    }

    disputed(DecisionRule::NoMajority { share }, support)
}
