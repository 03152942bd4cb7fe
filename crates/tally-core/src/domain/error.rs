//! Engine-level error taxonomy.

use tally_state::{BallotId, StorageError};

use crate::config::ConfigError;
use crate::ingest::ImageQualityError;
use crate::review::ReviewError;

/// Errors surfaced by the ballot engine.
///
/// Strategy failures are not here: they are isolated per strategy and end
/// up as abstentions (see [`crate::strategy::StrategyError`]).
#[derive(Debug, thiserror::Error)]
pub enum TallyError {
    #[error("ballot {ballot_id} needs rescan: {source}")]
    ImageQuality {
        ballot_id: BallotId,
        #[source]
        source: ImageQualityError,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("ballot not found: {0}")]
    BallotNotFound(BallotId),

    #[error("invalid result transition for ballot {ballot_id}: {from} -> {to}")]
    InvalidTransition {
        ballot_id: BallotId,
        from: String,
        to: String,
    },

    #[error("ballot {0} is not awaiting a rescan")]
    NotAwaitingRescan(BallotId),

    #[error("review error: {0}")]
    Review(#[from] ReviewError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("image encoding error: {0}")]
    Image(#[from] image::ImageError),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, TallyError>;
