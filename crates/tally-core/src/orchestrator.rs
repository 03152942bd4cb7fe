//! Concurrent dispatch of extraction strategies for one ballot.
//!
//! Every active strategy runs in its own task. Each attempt is bounded by the
//! strategy's timeout; a timed-out attempt is dropped and its partial output
//! discarded. Transient failures are retried up to the configured count, after
//! which the strategy abstains. A hung or failing backend never blocks its
//! siblings.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tally_state::BallotId;
use tracing::{debug, instrument, warn};

use crate::domain::{
    BallotImage, BallotTemplate, Selection, StrategyKind, StructuredBallotReading,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::strategy::{ActiveStrategy, StrategyError};

/// A strategy that produced no reading for a ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abstention {
    pub strategy: StrategyKind,
    pub error: StrategyError,
    pub attempts: u32,
}

/// Everything the strategies produced for one ballot.
#[derive(Debug, Clone)]
pub struct OrchestrationOutcome {
    /// Successful readings, ordered by strategy kind.
    pub readings: Vec<StructuredBallotReading>,
    /// Strategies that abstained, ordered by strategy kind.
    pub abstentions: Vec<Abstention>,
    pub quorum: usize,
}

impl OrchestrationOutcome {
    pub fn has_quorum(&self) -> bool {
        self.readings.len() >= self.quorum
    }
}

pub struct StrategyOrchestrator {
    strategies: Vec<ActiveStrategy>,
    quorum: usize,
}

impl StrategyOrchestrator {
    pub fn new(strategies: Vec<ActiveStrategy>, quorum: usize) -> Self {
        Self { strategies, quorum }
    }

    pub fn strategies(&self) -> impl Iterator<Item = StrategyKind> + '_ {
        self.strategies.iter().map(ActiveStrategy::kind)
    }

    /// Run every active strategy against `image` concurrently.
    #[instrument(
        skip_all,
        fields(ballot_id = %image.ballot_id.short(), strategies = self.strategies.len())
    )]
    pub async fn run(
        &self,
        image: Arc<BallotImage>,
        template: Arc<BallotTemplate>,
    ) -> OrchestrationOutcome {
        let tasks = self.strategies.iter().cloned().map(|active| {
            let image = Arc::clone(&image);
            let template = Arc::clone(&template);
            tokio::spawn(async move { run_strategy(&active, &image, &template).await })
        });
        let joined = join_all(tasks).await;

        let mut readings = Vec::new();
        let mut abstentions = Vec::new();
        for (active, joined) in self.strategies.iter().zip(joined) {
            let outcome = joined.unwrap_or_else(|e| {
                Err(Abstention {
                    strategy: active.kind(),
                    error: StrategyError::Unavailable {
                        detail: format!("strategy task failed: {e}"),
                    },
                    attempts: 1,
                })
            });
            match outcome {
                Ok(reading) => readings.push(reading),
                Err(abstention) => {
                    warn!(
                        strategy = %abstention.strategy,
                        attempts = abstention.attempts,
                        error = %abstention.error,
                        "strategy abstained"
                    );
                    obs::emit_strategy_abstained(
                        &image.ballot_id,
                        abstention.strategy,
                        &abstention.error,
                    );
                    METRICS.inc_abstentions();
                    abstentions.push(abstention);
                }
            }
        }

        readings.sort_by_key(|r| r.strategy);
        abstentions.sort_by_key(|a| a.strategy);
        debug!(
            readings = readings.len(),
            abstentions = abstentions.len(),
            "strategies finished"
        );

        OrchestrationOutcome {
            readings,
            abstentions,
            quorum: self.quorum,
        }
    }
}

async fn run_strategy(
    active: &ActiveStrategy,
    image: &BallotImage,
    template: &BallotTemplate,
) -> Result<StructuredBallotReading, Abstention> {
    let max_attempts = active.config.retries.saturating_add(1);
    let timeout = active.config.timeout();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(timeout, active.strategy.extract(image, template))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(StrategyError::Timeout {
                after_ms: active.config.timeout_ms,
            }),
        };

        let checked =
            result.and_then(|r| check_reading(r, active.kind(), &image.ballot_id, template));
        let error = match checked {
            Ok(reading) => return Ok(reading),
            Err(e) => e,
        };

        if error.is_transient() && attempt < max_attempts {
            debug!(strategy = %active.kind(), attempt, error = %error, "retrying strategy");
            continue;
        }
        return Err(Abstention {
            strategy: active.kind(),
            error,
            attempts: attempt,
        });
    }
}

/// Reject readings that do not describe this ballot under this template.
fn check_reading(
    reading: StructuredBallotReading,
    kind: StrategyKind,
    ballot_id: &BallotId,
    template: &BallotTemplate,
) -> Result<StructuredBallotReading, StrategyError> {
    if reading.strategy != kind {
        return Err(StrategyError::malformed(format!(
            "reading labelled {} from strategy {kind}",
            reading.strategy
        )));
    }
    if &reading.ballot_id != ballot_id {
        return Err(StrategyError::malformed("reading is for another ballot"));
    }

    let mut seen = HashSet::new();
    for contest_reading in &reading.contests {
        let contest = template.contest(&contest_reading.contest_id).ok_or_else(|| {
            StrategyError::malformed(format!("unknown contest '{}'", contest_reading.contest_id))
        })?;
        if !seen.insert(contest.id.as_str()) {
            return Err(StrategyError::malformed(format!(
                "contest '{}' read twice",
                contest.id
            )));
        }
        if let Selection::Candidate(id) = &contest_reading.selection {
            if contest.candidate(id).is_none() {
                return Err(StrategyError::malformed(format!(
                    "candidate '{id}' is not in contest '{}'",
                    contest.id
                )));
            }
        }
    }
    Ok(reading)
}
