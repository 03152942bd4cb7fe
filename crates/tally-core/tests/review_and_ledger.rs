//! Review overrides, ledger idempotence, re-tally and rescans.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{engine, engine_with, reads, sheet_png, submission, PacedLog, Script};
use tally_core::{
    project, BallotStatus, BallotSubmission, EngineStores, ResultStatus, ReviewDecision,
    ReviewError, Selection, StrategyKind, TallyError,
};
use tally_state::fakes::{MemoryCasStore, MemoryRecordLog, MemoryTallyLedger};
use tally_state::{FsCasStore, SurrealStore, TallyLedger};

use StrategyKind::{Detection, OcrLayout, VisionModel};

fn split_engine() -> tally_core::BallotEngine {
    engine(vec![
        (VisionModel, reads(Selection::candidate("alice"), 0.9)),
        (OcrLayout, reads(Selection::candidate("bob"), 0.9)),
    ])
}

fn agreeing() -> Vec<(StrategyKind, Script)> {
    vec![
        (VisionModel, reads(Selection::candidate("alice"), 0.9)),
        (OcrLayout, reads(Selection::candidate("alice"), 0.9)),
    ]
}

#[tokio::test]
async fn override_counts_exactly_once() {
    let engine = split_engine();
    let id = engine.submit(submission(1, "p-01")).await.unwrap().ballot_id;

    let decision = ReviewDecision::new("judge-1")
        .select("mayor", Selection::candidate("bob"))
        .with_comment("clear cross next to Baker");
    let outcome = engine.submit_review(&id, &decision).await.unwrap();
    assert!(outcome.is_applied());
    assert_eq!(outcome.result().status, ResultStatus::Overridden);
    assert_eq!(outcome.result().version, 2);

    // Same decision again: no-op.
    let again = engine.submit_review(&id, &decision).await.unwrap();
    assert!(!again.is_applied());

    // A different decision cannot reopen the ballot.
    let other = ReviewDecision::new("judge-2").select("mayor", Selection::candidate("alice"));
    let err = engine.submit_review(&id, &other).await.unwrap_err();
    assert!(matches!(err, TallyError::Review(ReviewError::AlreadyResolved(_))));

    let tally = engine.tally_snapshot().await.unwrap();
    assert_eq!(tally.projection.count(None, "mayor", &Selection::candidate("bob")), 1);
    assert_eq!(tally.projection.count(None, "mayor", &Selection::candidate("alice")), 0);
    assert_eq!(tally.projection.ballots, 1);
    assert!(tally.complete);

    let evidence = engine.evidence(&id).await.unwrap();
    assert_eq!(evidence.history.len(), 2);
    assert_eq!(evidence.decisions.len(), 1);
    assert_eq!(evidence.decisions[0].decision.reviewer, "judge-1");
}

#[tokio::test]
async fn concurrent_identical_reviews_apply_once() {
    let engine = Arc::new(split_engine());
    let id = engine.submit(submission(2, "p-01")).await.unwrap().ballot_id;
    let decision = ReviewDecision::new("judge-1").select("mayor", Selection::Blank);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let id = id.clone();
            let decision = decision.clone();
            tokio::spawn(async move { engine.submit_review(&id, &decision).await.unwrap() })
        })
        .collect();

    let mut applied = 0;
    for task in tasks {
        if task.await.unwrap().is_applied() {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);
    let tally = engine.tally_snapshot().await.unwrap();
    assert_eq!(tally.projection.count(None, "mayor", &Selection::Blank), 1);
}

#[tokio::test]
async fn review_of_unknown_candidate_is_rejected() {
    let engine = split_engine();
    let id = engine.submit(submission(3, "p-01")).await.unwrap().ballot_id;
    let decision = ReviewDecision::new("judge-1").select("mayor", Selection::candidate("zed"));
    let err = engine.submit_review(&id, &decision).await.unwrap_err();
    assert!(matches!(
        err,
        TallyError::Review(ReviewError::UnknownCandidate { .. })
    ));
    assert!(matches!(
        engine.status(&id).await.unwrap(),
        BallotStatus::Flagged { .. }
    ));
}

#[tokio::test]
async fn replaying_the_ledger_is_stable() {
    let ledger = Arc::new(MemoryTallyLedger::new());
    let stores = EngineStores {
        cas: Arc::new(MemoryCasStore::new()),
        records: Arc::new(MemoryRecordLog::new()),
        ledger: ledger.clone(),
    };
    let engine = engine_with(agreeing(), stores);
    for seed in 0..5 {
        engine.submit(submission(seed, "p-01")).await.unwrap();
    }
    // Redelivered scans change nothing.
    for seed in 0..5 {
        assert!(engine.submit(submission(seed, "p-01")).await.unwrap().duplicate);
    }

    let entries = ledger.entries().await.unwrap();
    assert_eq!(entries.len(), 10);
    let first = project(&entries);
    let second = project(&ledger.entries().await.unwrap());
    assert_eq!(first, second);
    assert_eq!(first.count(None, "mayor", &Selection::candidate("alice")), 5);
}

#[tokio::test]
async fn concurrent_submissions_never_lose_increments() {
    let engine = Arc::new(engine(agreeing()));
    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let engine = Arc::clone(&engine);
            // Every scan delivered twice.
            tokio::spawn(async move { engine.submit(submission(i % 16, "p-03")).await.unwrap() })
        })
        .collect();

    let mut fresh = 0;
    for task in tasks {
        if !task.await.unwrap().duplicate {
            fresh += 1;
        }
    }
    assert_eq!(fresh, 16);

    let tally = engine.tally_snapshot().await.unwrap();
    assert_eq!(tally.projection.ballots, 16);
    assert_eq!(
        tally
            .projection
            .count(Some("p-03"), "mayor", &Selection::candidate("alice")),
        16
    );
}

#[tokio::test]
async fn retally_repairs_a_ledger_missing_entries() {
    let cas = Arc::new(MemoryCasStore::new());
    let records = Arc::new(MemoryRecordLog::new());
    let original = engine_with(
        agreeing(),
        EngineStores {
            cas: cas.clone(),
            records: records.clone(),
            ledger: Arc::new(MemoryTallyLedger::new()),
        },
    );
    for seed in 0..3 {
        original.submit(submission(seed, "p-01")).await.unwrap();
    }
    let reference = original.retally().await.unwrap();
    assert!(reference.consistent);

    // Same results, empty ledger.
    let rebuilt = engine_with(
        agreeing(),
        EngineStores {
            cas,
            records,
            ledger: Arc::new(MemoryTallyLedger::new()),
        },
    );
    let report = rebuilt.retally().await.unwrap();
    assert_eq!(report.repaired, 6);
    assert!(report.consistent);
    assert_eq!(report.ledger_digest, reference.ledger_digest);

    let again = rebuilt.retally().await.unwrap();
    assert_eq!(again.repaired, 0);
    assert_eq!(again.ledger_digest, report.ledger_digest);
}

#[tokio::test(start_paused = true)]
async fn retally_alongside_live_submission_stays_consistent() {
    let engine = engine_with(
        agreeing(),
        EngineStores {
            cas: Arc::new(MemoryCasStore::new()),
            records: PacedLog::new(Duration::from_millis(50)),
            ledger: Arc::new(MemoryTallyLedger::new()),
        },
    );
    engine.submit(submission(1, "p-01")).await.unwrap();

    // Lands after retally has read the stored results but before it reads
    // the ledger.
    let live = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.submit(submission(2, "p-01")).await.unwrap()
    };
    let (report, receipt) = tokio::join!(engine.retally(), live);
    let report = report.unwrap();

    assert_eq!(receipt.status, BallotStatus::Accepted);
    assert_eq!(report.ballots, 1);
    assert_eq!(report.repaired, 0);
    assert!(report.consistent, "{report:?}");

    let settled = engine.retally().await.unwrap();
    assert_eq!(settled.ballots, 2);
    assert!(settled.consistent);
}

#[tokio::test]
async fn retally_reports_ledger_counting_a_flagged_ballot() {
    let ledger = Arc::new(MemoryTallyLedger::new());
    let engine = engine_with(
        vec![
            (VisionModel, reads(Selection::candidate("alice"), 0.9)),
            (OcrLayout, reads(Selection::candidate("bob"), 0.9)),
        ],
        EngineStores {
            cas: Arc::new(MemoryCasStore::new()),
            records: Arc::new(MemoryRecordLog::new()),
            ledger: ledger.clone(),
        },
    );
    let flagged = engine.submit(submission(3, "p-01")).await.unwrap();
    assert!(matches!(flagged.status, BallotStatus::Flagged { .. }));

    ledger
        .append(tally_state::NewLedgerEntry {
            ballot_id: flagged.ballot_id.clone(),
            precinct: "p-01".into(),
            contest_id: "mayor".into(),
            selection: Selection::candidate("alice").key(),
            source: "accepted".into(),
        })
        .await
        .unwrap();

    let report = engine.retally().await.unwrap();
    assert!(!report.consistent);
    assert_ne!(report.ledger_digest, report.results_digest);
}

#[tokio::test]
async fn crossed_rescans_do_not_deadlock() {
    let engine = engine_with(
        agreeing(),
        EngineStores {
            cas: Arc::new(MemoryCasStore::new()),
            records: PacedLog::new(Duration::ZERO),
            ledger: Arc::new(MemoryTallyLedger::new()),
        },
    );
    let unreadable = |fill: u8| BallotSubmission::new(vec![fill; 64], "general-2024", "p-01");
    let a = engine.submit(unreadable(1)).await.unwrap().ballot_id;
    let b = engine.submit(unreadable(2)).await.unwrap().ballot_id;

    // Each rescan carries the other ballot's bytes.
    let (a_rescan, b_rescan) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(
            engine.submit_rescan(&a, unreadable(2)),
            engine.submit_rescan(&b, unreadable(1)),
        )
    })
    .await
    .expect("crossed rescans deadlocked");

    let (a_rescan, b_rescan) = (a_rescan.unwrap(), b_rescan.unwrap());
    assert!(a_rescan.duplicate && b_rescan.duplicate);
    assert_eq!(a_rescan.ballot_id, b);
    assert_eq!(b_rescan.ballot_id, a);
    for id in [&a, &b] {
        assert!(matches!(
            engine.status(id).await.unwrap(),
            BallotStatus::NeedsRescan { .. }
        ));
    }
}

#[tokio::test]
async fn rescan_supersedes_the_rejected_scan() {
    let engine = engine(agreeing());
    let rejected = engine
        .submit(BallotSubmission::new(vec![0u8; 64], "general-2024", "p-01"))
        .await
        .unwrap();
    assert!(matches!(rejected.status, BallotStatus::NeedsRescan { .. }));
    assert!(!engine.tally_snapshot().await.unwrap().complete);

    let rescan = engine
        .submit_rescan(&rejected.ballot_id, submission(9, "p-01"))
        .await
        .unwrap();
    assert_eq!(rescan.status, BallotStatus::Accepted);
    assert_eq!(
        engine.status(&rejected.ballot_id).await.unwrap(),
        BallotStatus::Superseded {
            by: rescan.ballot_id.clone()
        }
    );

    let tally = engine.tally_snapshot().await.unwrap();
    assert!(tally.complete);
    assert_eq!(tally.projection.ballots, 1);

    let err = engine
        .submit_rescan(&rejected.ballot_id, submission(10, "p-01"))
        .await
        .unwrap_err();
    assert!(matches!(err, TallyError::NotAwaitingRescan(_)));
}

#[tokio::test]
async fn unknown_ballot_is_not_found() {
    let engine = engine(agreeing());
    let id = tally_core::BallotId::from_image_bytes(&sheet_png(30));
    assert!(matches!(
        engine.status(&id).await.unwrap_err(),
        TallyError::BallotNotFound(_)
    ));
}

#[tokio::test]
async fn persistent_stores_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let surreal = Arc::new(SurrealStore::in_memory().await.unwrap());
    let stores = || EngineStores {
        cas: Arc::new(FsCasStore::new(dir.path()).unwrap()),
        records: surreal.clone(),
        ledger: surreal.clone(),
    };

    let first = engine_with(agreeing(), stores());
    let id = first.submit(submission(11, "p-04")).await.unwrap().ballot_id;
    drop(first);

    let second = engine_with(agreeing(), stores());
    assert_eq!(second.status(&id).await.unwrap(), BallotStatus::Accepted);
    assert!(second.submit(submission(11, "p-04")).await.unwrap().duplicate);
    assert!(!second.image(&id).await.unwrap().is_empty());

    let report = second.retally().await.unwrap();
    assert!(report.consistent);
    assert_eq!(report.repaired, 0);
}

#[tokio::test]
async fn hung_backend_does_not_block_review_flow() {
    let engine = engine(vec![
        (VisionModel, reads(Selection::candidate("alice"), 0.9)),
        (Detection, Script::Hang),
    ]);
    let receipt = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        engine.submit(submission(12, "p-01")),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(matches!(receipt.status, BallotStatus::Flagged { .. }));

    let decision = ReviewDecision::new("judge-1")
        .select("mayor", Selection::candidate("alice"))
        .select("council", Selection::candidate("dan"));
    let outcome = engine.submit_review(&receipt.ballot_id, &decision).await.unwrap();
    assert_eq!(outcome.result().status, ResultStatus::Overridden);
}
