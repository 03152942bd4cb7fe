//! Lifecycle events and counters emitted while processing ballots.

mod common;

use common::{engine, reads, submission, Script};
use tally_core::metrics::METRICS;
use tally_core::{ReviewDecision, Selection, StrategyError, StrategyKind};
use tracing_test::traced_test;

#[traced_test]
#[tokio::test]
async fn submission_emits_lifecycle_events() {
    let engine = engine(vec![
        (StrategyKind::VisionModel, reads(Selection::candidate("alice"), 0.9)),
        (StrategyKind::OcrLayout, reads(Selection::candidate("alice"), 0.9)),
        (
            StrategyKind::Detection,
            Script::Fail(StrategyError::malformed("no boxes")),
        ),
    ]);
    let before = METRICS.abstentions();
    engine.submit(submission(1, "p-01")).await.unwrap();

    assert!(logs_contain("ballot.submitted"));
    assert!(logs_contain("strategy.abstained"));
    assert!(logs_contain("ballot.adjudicated"));
    assert!(METRICS.abstentions() > before);
    assert!(METRICS.ballots_accepted() >= 1);
}

#[traced_test]
#[tokio::test]
async fn override_and_retally_emit_events() {
    let engine = engine(vec![
        (StrategyKind::VisionModel, reads(Selection::candidate("alice"), 0.9)),
        (StrategyKind::OcrLayout, reads(Selection::candidate("bob"), 0.9)),
    ]);
    let id = engine.submit(submission(2, "p-01")).await.unwrap().ballot_id;
    let decision = ReviewDecision::new("judge-7").select("mayor", Selection::candidate("bob"));
    engine.submit_review(&id, &decision).await.unwrap();
    engine.retally().await.unwrap();

    assert!(logs_contain("ballot.overridden"));
    assert!(logs_contain("judge-7"));
    assert!(logs_contain("tally.retallied"));
    assert!(METRICS.ballots_overridden() >= 1);
}

#[traced_test]
#[tokio::test]
async fn unreadable_scan_emits_rescan_event() {
    let engine = engine(vec![
        (StrategyKind::VisionModel, reads(Selection::Blank, 0.9)),
        (StrategyKind::OcrLayout, reads(Selection::Blank, 0.9)),
    ]);
    engine
        .submit(tally_core::BallotSubmission::new(
            b"GIF89a-truncated".to_vec(),
            "general-2024",
            "p-01",
        ))
        .await
        .unwrap();
    assert!(logs_contain("ballot.rescan_required"));
    assert!(METRICS.rescans_required() >= 1);
}
