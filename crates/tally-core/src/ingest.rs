//! Ingestion and normalization of raw ballot scans.
//!
//! A scan is decoded, checked for resolution, contrast and alignment, cropped
//! to the outline of the printed ballot and warped into the template frame.
//! The normalized PNG is persisted in the content-addressed image store.

use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageFormat};
use serde::{Deserialize, Serialize};
use tally_state::{BallotId, CasStore};
use tracing::{debug, instrument};

use crate::config::IngestConfig;
use crate::domain::{BallotImage, BallotTemplate, Frame, Result, TallyError};

/// Reasons a scan cannot be processed. None of these are retryable; the ballot
/// must be rescanned.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageQualityError {
    #[error("image could not be decoded: {detail}")]
    Undecodable { detail: String },

    #[error("resolution {width}x{height} is below the required {min_width}x{min_height}")]
    Resolution {
        width: u32,
        height: u32,
        min_width: u32,
        min_height: u32,
    },

    #[error("contrast {contrast:.3} is below the minimum {min:.3}")]
    Contrast { contrast: f64, min: f64 },

    #[error("alignment confidence {alignment:.3} is below the minimum {min:.3}")]
    Alignment { alignment: f64, min: f64 },
}

/// A scan that passed every quality check, warped into the template frame.
#[derive(Debug, Clone)]
pub struct NormalizedScan {
    pub pixels: GrayImage,
    pub contrast: f64,
    pub alignment: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InkBox {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

/// Run the quality checks and normalization on raw image bytes.
pub fn normalize(
    raw: &[u8],
    template: &BallotTemplate,
    config: &IngestConfig,
) -> std::result::Result<NormalizedScan, ImageQualityError> {
    let decoded = image::load_from_memory(raw).map_err(|e| ImageQualityError::Undecodable {
        detail: e.to_string(),
    })?;
    let gray = decoded.to_luma8();

    if gray.width() < template.min_source_width || gray.height() < template.min_source_height {
        return Err(ImageQualityError::Resolution {
            width: gray.width(),
            height: gray.height(),
            min_width: template.min_source_width,
            min_height: template.min_source_height,
        });
    }

    let contrast = luma_stddev(&gray);
    if contrast < config.min_contrast {
        return Err(ImageQualityError::Contrast {
            contrast,
            min: config.min_contrast,
        });
    }

    let Some(ink) = ink_bounds(&gray, config.ink_threshold) else {
        return Err(ImageQualityError::Alignment {
            alignment: 0.0,
            min: config.min_alignment,
        });
    };
    let alignment = alignment_confidence(ink, template.frame);
    if alignment < config.min_alignment {
        return Err(ImageQualityError::Alignment {
            alignment,
            min: config.min_alignment,
        });
    }

    let cropped = imageops::crop_imm(&gray, ink.x, ink.y, ink.width, ink.height).to_image();
    let pixels = imageops::resize(
        &cropped,
        template.frame.width,
        template.frame.height,
        FilterType::Triangle,
    );

    Ok(NormalizedScan {
        pixels,
        contrast,
        alignment,
    })
}

/// Normalize a scan and persist it in the image store.
///
/// Quality failures come back as [`TallyError::ImageQuality`].
#[instrument(
    skip(raw, template, config, cas),
    fields(ballot_id = %ballot_id.short(), template = %template.id)
)]
pub async fn ingest(
    raw: &[u8],
    ballot_id: &BallotId,
    precinct: &str,
    template: &BallotTemplate,
    config: &IngestConfig,
    cas: &dyn CasStore,
) -> Result<BallotImage> {
    let scan = normalize(raw, template, config).map_err(|source| TallyError::ImageQuality {
        ballot_id: ballot_id.clone(),
        source,
    })?;

    let png = encode_png(&scan.pixels)?;
    let digest = cas.put(&png).await?;
    debug!(
        digest = %digest.short(),
        contrast = scan.contrast,
        alignment = scan.alignment,
        "normalized ballot stored"
    );

    Ok(BallotImage::new(
        ballot_id.clone(),
        template.id.clone(),
        precinct,
        scan.pixels,
        png,
        digest,
        scan.alignment,
    ))
}

pub(crate) fn encode_png(pixels: &GrayImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    pixels.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

/// Standard deviation of luma scaled to `[0, 1]`.
fn luma_stddev(gray: &GrayImage) -> f64 {
    let n = (gray.width() as f64) * (gray.height() as f64);
    if n == 0.0 {
        return 0.0;
    }
    let (sum, sum_sq) = gray.pixels().fold((0.0f64, 0.0f64), |(s, sq), p| {
        let v = p.0[0] as f64 / 255.0;
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0).sqrt()
}

/// Bounding box of every pixel darker than `threshold`.
fn ink_bounds(gray: &GrayImage, threshold: f64) -> Option<InkBox> {
    let cutoff = threshold * 255.0;
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, p) in gray.enumerate_pixels() {
        if (p.0[0] as f64) < cutoff {
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
    }
    bounds.map(|(x0, y0, x1, y1)| InkBox {
        x: x0,
        y: y0,
        width: x1 - x0 + 1,
        height: y1 - y0 + 1,
    })
}

/// `1 - |aspect(box) - aspect(frame)| / aspect(frame)`, clamped to `[0, 1]`.
fn alignment_confidence(ink: InkBox, frame: Frame) -> f64 {
    let expected = frame.aspect();
    if expected <= 0.0 {
        return 0.0;
    }
    let found = ink.width as f64 / ink.height as f64;
    (1.0 - (found - expected).abs() / expected).clamp(0.0, 1.0)
}
