//! Engine configuration.
//!
//! Loaded from TOML and validated once at startup; any [`ConfigError`] blocks
//! engine construction.
//!
//! ```toml
//! quorum = 2
//! majority_fraction = 0.6
//! min_confidence = 0.5
//!
//! [ingest]
//! min_contrast = 0.08
//! min_alignment = 0.7
//! ink_threshold = 0.5
//!
//! [[strategies]]
//! kind = "vision_model"
//! weight = 1.0
//! timeout_ms = 5000
//! retries = 1
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::StrategyKind;
use crate::reconcile::ReconcilePolicy;

/// Upper bound on `retries` for any one strategy.
pub const MAX_RETRIES: u32 = 10;

/// Fatal configuration problems.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no strategies configured")]
    NoStrategies,

    #[error("strategy {0} is configured more than once")]
    DuplicateStrategy(StrategyKind),

    #[error("strategy {0} cannot be configured")]
    NotConfigurable(StrategyKind),

    #[error("strategy {kind} has invalid weight {weight}")]
    InvalidWeight { kind: StrategyKind, weight: f64 },

    #[error("strategy {0} has a zero timeout")]
    ZeroTimeout(StrategyKind),

    #[error("strategy {kind} retries {retries} exceeds the limit of {MAX_RETRIES}")]
    TooManyRetries { kind: StrategyKind, retries: u32 },

    #[error("quorum {quorum} must be between 1 and the {active} active strategies")]
    InvalidQuorum { quorum: usize, active: usize },

    #[error("majority_fraction {0} must be within [0.5, 1)")]
    InvalidMajority(f64),

    #[error("{field} = {value} must be within [0, 1]")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("invalid template {template}: {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("no backend registered for strategy {0}")]
    MissingBackend(StrategyKind),
}

fn default_quorum() -> usize {
    2
}

fn default_majority_fraction() -> f64 {
    0.6
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_weight() -> f64 {
    1.0
}

fn default_timeout_ms() -> u64 {
    5_000
}

/// Per-strategy orchestration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    /// Trust weight used during reconciliation.
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra attempts after a transient failure.
    #[serde(default)]
    pub retries: u32,
}

impl StrategyConfig {
    pub fn new(kind: StrategyKind) -> Self {
        Self {
            kind,
            weight: default_weight(),
            timeout_ms: default_timeout_ms(),
            retries: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Image quality thresholds applied at ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Minimum standard deviation of normalized luma.
    pub min_contrast: f64,
    /// Minimum alignment confidence of the detected ballot outline.
    pub min_alignment: f64,
    /// Pixels darker than this (normalized luma) count as ink.
    pub ink_threshold: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            min_contrast: 0.08,
            min_alignment: 0.7,
            ink_threshold: 0.5,
        }
    }
}

/// Tuning for the backend output adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Column where candidate names end in OCR line-printer output.
    pub ocr_name_column: usize,
    /// Vertical slack (pixels) when pairing detected symbols with names.
    pub detection_tolerance: i64,
    /// Template-match scores below this are treated as unmarked.
    pub match_threshold: f64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            ocr_name_column: 20,
            detection_tolerance: 20,
            match_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum number of successful readings required to reconcile.
    #[serde(default = "default_quorum")]
    pub quorum: usize,
    /// Share of weighted support a selection must exceed to win a disagreement.
    #[serde(default = "default_majority_fraction")]
    pub majority_fraction: f64,
    /// Accepted contests below this combined confidence are flagged.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub adapters: AdapterConfig,
    pub strategies: Vec<StrategyConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quorum: default_quorum(),
            majority_fraction: default_majority_fraction(),
            min_confidence: default_min_confidence(),
            ingest: IngestConfig::default(),
            adapters: AdapterConfig::default(),
            strategies: StrategyKind::CONFIGURABLE
                .into_iter()
                .map(StrategyConfig::new)
                .collect(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML configuration.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.strategies.is_empty() {
            return Err(ConfigError::NoStrategies);
        }

        let mut seen = HashSet::new();
        for strategy in &self.strategies {
            if !strategy.kind.is_configurable() {
                return Err(ConfigError::NotConfigurable(strategy.kind));
            }
            if !seen.insert(strategy.kind) {
                return Err(ConfigError::DuplicateStrategy(strategy.kind));
            }
            if !strategy.weight.is_finite() || strategy.weight <= 0.0 {
                return Err(ConfigError::InvalidWeight {
                    kind: strategy.kind,
                    weight: strategy.weight,
                });
            }
            if strategy.timeout_ms == 0 {
                return Err(ConfigError::ZeroTimeout(strategy.kind));
            }
            if strategy.retries > MAX_RETRIES {
                return Err(ConfigError::TooManyRetries {
                    kind: strategy.kind,
                    retries: strategy.retries,
                });
            }
        }

        if self.quorum == 0 || self.quorum > self.strategies.len() {
            return Err(ConfigError::InvalidQuorum {
                quorum: self.quorum,
                active: self.strategies.len(),
            });
        }

        if !(0.5..1.0).contains(&self.majority_fraction) {
            return Err(ConfigError::InvalidMajority(self.majority_fraction));
        }

        unit_range("min_confidence", self.min_confidence)?;
        unit_range("ingest.min_contrast", self.ingest.min_contrast)?;
        unit_range("ingest.min_alignment", self.ingest.min_alignment)?;
        unit_range("ingest.ink_threshold", self.ingest.ink_threshold)?;
        unit_range("adapters.match_threshold", self.adapters.match_threshold)?;
        Ok(())
    }

    pub fn strategy(&self, kind: StrategyKind) -> Option<&StrategyConfig> {
        self.strategies.iter().find(|s| s.kind == kind)
    }

    /// Reconciliation parameters derived from this configuration.
    pub fn policy(&self) -> ReconcilePolicy {
        let weights: BTreeMap<StrategyKind, f64> = self
            .strategies
            .iter()
            .map(|s| (s.kind, s.weight))
            .collect();
        ReconcilePolicy {
            quorum: self.quorum,
            majority_fraction: self.majority_fraction,
            min_confidence: self.min_confidence,
            weights,
        }
    }
}

fn unit_range(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_nan() || !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::OutOfRange { field, value });
    }
    Ok(())
}
