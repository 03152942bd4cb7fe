//! Structured observability hooks for the ballot lifecycle.
//!
//! This module provides:
//! - Ballot-scoped tracing spans via the `BallotSpan` RAII guard
//! - Emission functions for lifecycle events: submission, rescan, abstention,
//!   adjudication, override and re-tally
//!
//! Events are emitted at `info!` level except abstentions and rescans, which
//! are `warn!`.

use tally_state::BallotId;
use tracing::{info, warn};

use crate::domain::{FlagReason, ResultStatus, StrategyKind};
use crate::strategy::StrategyError;

/// RAII guard that keeps a ballot-scoped span entered.
///
/// ```ignore
/// let _span = BallotSpan::enter(&ballot_id);
/// // every event below carries ballot_id
/// ```
pub struct BallotSpan {
    _span: tracing::span::EnteredSpan,
}

impl BallotSpan {
    pub fn enter(ballot_id: &BallotId) -> Self {
        let span = tracing::info_span!("tally.ballot", ballot_id = %ballot_id.short());
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: a ballot image was admitted for processing.
pub fn emit_ballot_submitted(ballot_id: &BallotId, precinct: &str, template_id: &str) {
    info!(
        event = "ballot.submitted",
        ballot_id = %ballot_id,
        precinct = %precinct,
        template = %template_id,
    );
}

/// Emit event: the image failed a quality check.
pub fn emit_rescan_required(ballot_id: &BallotId, reason: &dyn std::fmt::Display) {
    warn!(event = "ballot.rescan_required", ballot_id = %ballot_id, reason = %reason);
}

/// Emit event: a strategy produced no reading.
pub fn emit_strategy_abstained(
    ballot_id: &BallotId,
    strategy: StrategyKind,
    error: &StrategyError,
) {
    warn!(
        event = "strategy.abstained",
        ballot_id = %ballot_id,
        strategy = %strategy,
        error = %error,
    );
}

/// Emit event: reconciliation produced a result.
pub fn emit_ballot_adjudicated(
    ballot_id: &BallotId,
    status: ResultStatus,
    reason: Option<FlagReason>,
    readings: usize,
) {
    info!(
        event = "ballot.adjudicated",
        ballot_id = %ballot_id,
        status = %status,
        reason = reason.map(|r| r.to_string()).unwrap_or_default(),
        readings = readings,
    );
}

/// Emit event: a reviewer decision overrode a flagged ballot.
pub fn emit_ballot_overridden(ballot_id: &BallotId, reviewer: &str, version: u32) {
    info!(
        event = "ballot.overridden",
        ballot_id = %ballot_id,
        reviewer = %reviewer,
        version = version,
    );
}

/// Emit event: the tally was rebuilt from stored results.
pub fn emit_retallied(ballots: usize, repaired: usize, consistent: bool) {
    info!(
        event = "tally.retallied",
        ballots = ballots,
        repaired = repaired,
        consistent = consistent,
    );
}
