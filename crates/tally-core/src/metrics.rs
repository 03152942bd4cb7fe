//! Global atomic counters for ballot processing.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a batch).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    ballots_submitted: AtomicU64,
    ballots_accepted: AtomicU64,
    ballots_flagged: AtomicU64,
    ballots_overridden: AtomicU64,
    rescans_required: AtomicU64,
    abstentions: AtomicU64,
    duplicate_deliveries: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            ballots_submitted: AtomicU64::new(0),
            ballots_accepted: AtomicU64::new(0),
            ballots_flagged: AtomicU64::new(0),
            ballots_overridden: AtomicU64::new(0),
            rescans_required: AtomicU64::new(0),
            abstentions: AtomicU64::new(0),
            duplicate_deliveries: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = name, "counter incremented");
    }

    pub fn inc_submitted(&self) {
        Self::bump(&self.ballots_submitted, "ballots_submitted");
    }

    pub fn inc_accepted(&self) {
        Self::bump(&self.ballots_accepted, "ballots_accepted");
    }

    pub fn inc_flagged(&self) {
        Self::bump(&self.ballots_flagged, "ballots_flagged");
    }

    pub fn inc_overridden(&self) {
        Self::bump(&self.ballots_overridden, "ballots_overridden");
    }

    pub fn inc_rescans(&self) {
        Self::bump(&self.rescans_required, "rescans_required");
    }

    pub fn inc_abstentions(&self) {
        Self::bump(&self.abstentions, "abstentions");
    }

    /// A ledger append that was ignored as a re-delivery.
    pub fn inc_duplicate_deliveries(&self) {
        Self::bump(&self.duplicate_deliveries, "duplicate_deliveries");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            ballots_submitted = self.ballots_submitted(),
            ballots_accepted = self.ballots_accepted(),
            ballots_flagged = self.ballots_flagged(),
            ballots_overridden = self.ballots_overridden(),
            rescans_required = self.rescans_required(),
            abstentions = self.abstentions(),
            duplicate_deliveries = self.duplicate_deliveries(),
        );
    }

    pub fn ballots_submitted(&self) -> u64 {
        self.ballots_submitted.load(Ordering::Relaxed)
    }

    pub fn ballots_accepted(&self) -> u64 {
        self.ballots_accepted.load(Ordering::Relaxed)
    }

    pub fn ballots_flagged(&self) -> u64 {
        self.ballots_flagged.load(Ordering::Relaxed)
    }

    pub fn ballots_overridden(&self) -> u64 {
        self.ballots_overridden.load(Ordering::Relaxed)
    }

    pub fn rescans_required(&self) -> u64 {
        self.rescans_required.load(Ordering::Relaxed)
    }

    pub fn abstentions(&self) -> u64 {
        self.abstentions.load(Ordering::Relaxed)
    }

    pub fn duplicate_deliveries(&self) -> u64 {
        self.duplicate_deliveries.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.ballots_submitted,
            &self.ballots_accepted,
            &self.ballots_flagged,
            &self.ballots_overridden,
            &self.rescans_required,
            &self.abstentions,
            &self.duplicate_deliveries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
