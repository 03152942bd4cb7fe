//! Tally Core Library
//!
//! Turns scanned paper ballots into an auditable tally:
//!
//! - [`ingest`]: image quality checks and normalization into the template frame
//! - [`strategy`]: heterogeneous recognition backends behind one trait
//! - [`orchestrator`]: concurrent, timeout-bounded strategy dispatch
//! - [`reconcile`]: weighted consensus over strategy readings
//! - [`tally`]: idempotent ledger increments and replayable projections
//! - [`review`]: flagged ballots, evidence and authoritative overrides
//! - [`engine`]: the ballot lifecycle tying the above together

pub mod config;
pub mod domain;
pub mod engine;
pub mod ingest;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod reconcile;
pub mod repository;
pub mod review;
pub mod strategy;
pub mod tally;
pub mod telemetry;

pub use config::{
    AdapterConfig, ConfigError, EngineConfig, IngestConfig, StrategyConfig, MAX_RETRIES,
};

pub use domain::{
    Adjudication, BallotImage, BallotResult, BallotStatus, BallotTemplate, CandidateTemplate,
    Confidence, ContestOutcome, ContestReading, ContestTemplate, DecisionRule, FlagReason, Frame,
    MarkingRule, ReadingRef, Region, Result, ResultStatus, Selection, SelectionSupport,
    StrategyKind, StructuredBallotReading, TallyError,
};

pub use engine::{
    BallotEngine, BallotSubmission, EngineStores, RetallyReport, SubmissionReceipt, TallySnapshot,
};
pub use ingest::{ingest, normalize, ImageQualityError, NormalizedScan};
pub use orchestrator::{Abstention, OrchestrationOutcome, StrategyOrchestrator};
pub use reconcile::{combine, reconcile, ReconcilePolicy};
pub use repository::{BallotRepository, IntakeEvent};
pub use review::{
    override_reading, validate_decision, EvidenceBundle, ReviewDecision, ReviewError, ReviewItem,
    ReviewOutcome, ReviewQueue, ReviewRecord,
};
pub use strategy::{
    ActiveStrategy, BackendError, ExtractionStrategy, StrategyError, StrategyRegistry,
};
pub use tally::{
    project, project_results, RecordOutcome, TallyAggregator, TallyProjection, TallyRecord,
};

pub use tally_state::{BallotId, ContentDigest};

/// Crate version, reported by the CLI and sent as the HTTP user agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
