//! Normalized ballot images and the per-ballot status view.

use std::sync::Arc;

use image::GrayImage;
use serde::{Deserialize, Serialize};
use tally_state::{BallotId, ContentDigest};

use super::result::FlagReason;

/// Fixed coordinate frame every normalized ballot is warped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Width over height. Zero-height frames report an aspect of 0.
    pub fn aspect(&self) -> f64 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f64 / self.height as f64
    }
}

/// A decoded, quality-checked ballot image aligned to its template frame.
///
/// Immutable once created; strategies receive it behind an `Arc` and may read
/// it concurrently.
#[derive(Clone)]
pub struct BallotImage {
    pub ballot_id: BallotId,
    pub template_id: String,
    pub precinct: String,
    pub frame: Frame,
    /// Digest of the normalized PNG in the image store.
    pub image_digest: ContentDigest,
    /// Alignment confidence measured during ingestion.
    pub alignment: f64,
    pixels: Arc<GrayImage>,
    png: Arc<Vec<u8>>,
}

impl BallotImage {
    pub fn new(
        ballot_id: BallotId,
        template_id: impl Into<String>,
        precinct: impl Into<String>,
        pixels: GrayImage,
        png: Vec<u8>,
        image_digest: ContentDigest,
        alignment: f64,
    ) -> Self {
        let frame = Frame::new(pixels.width(), pixels.height());
        Self {
            ballot_id,
            template_id: template_id.into(),
            precinct: precinct.into(),
            frame,
            image_digest,
            alignment,
            pixels: Arc::new(pixels),
            png: Arc::new(png),
        }
    }

    /// Normalized grayscale pixels.
    pub fn pixels(&self) -> &GrayImage {
        &self.pixels
    }

    /// Normalized image encoded as PNG, as stored in the image store.
    pub fn png(&self) -> &[u8] {
        &self.png
    }
}

impl std::fmt::Debug for BallotImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BallotImage")
            .field("ballot_id", &self.ballot_id.short())
            .field("template_id", &self.template_id)
            .field("precinct", &self.precinct)
            .field("frame", &self.frame)
            .field("image_digest", &self.image_digest.short())
            .field("alignment", &self.alignment)
            .field("png_bytes", &self.png.len())
            .finish()
    }
}

/// Externally visible state of a submitted ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BallotStatus {
    /// Intake recorded but no result has been written yet.
    Processing,
    /// The image failed a quality check and must be rescanned.
    NeedsRescan { reason: String },
    /// A rescan replaced this ballot.
    Superseded { by: BallotId },
    Accepted,
    Flagged { reason: FlagReason },
    Overridden,
}

impl BallotStatus {
    /// Whether the ballot's result contributes to the tally.
    pub fn is_counted(&self) -> bool {
        matches!(self, Self::Accepted | Self::Overridden)
    }

    /// Whether the ballot still needs an operator before the tally is complete.
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            Self::Processing | Self::NeedsRescan { .. } | Self::Flagged { .. }
        )
    }
}

impl std::fmt::Display for BallotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Processing => write!(f, "processing"),
            Self::NeedsRescan { reason } => write!(f, "needs_rescan ({reason})"),
            Self::Superseded { by } => write!(f, "superseded by {}", by.short()),
            Self::Accepted => write!(f, "accepted"),
            Self::Flagged { reason } => write!(f, "flagged ({reason})"),
            Self::Overridden => write!(f, "overridden"),
        }
    }
}
