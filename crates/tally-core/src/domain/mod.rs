//! Domain models for the ballot tally engine.
//!
//! Canonical definitions for the core entities:
//! - `BallotTemplate`: layout and marking rules of a printed ballot
//! - `BallotImage`: a normalized, template-aligned ballot scan
//! - `StructuredBallotReading`: one strategy's reading of one ballot
//! - `BallotResult`: the adjudicated outcome for one ballot

pub mod ballot;
pub mod error;
pub mod reading;
pub mod result;
pub mod template;

pub use ballot::{BallotImage, BallotStatus, Frame};
pub use error::{Result, TallyError};
pub use reading::{
    Confidence, ContestReading, InvalidConfidence, ReadingRef, Selection, StrategyKind,
    StructuredBallotReading,
};
pub use result::{
    Adjudication, BallotResult, ContestOutcome, DecisionRule, FlagReason, ResultStatus,
    SelectionSupport,
};
pub use template::{BallotTemplate, CandidateTemplate, ContestTemplate, MarkingRule, Region};
