//! Extraction strategies.
//!
//! Every recognition approach is one [`ExtractionStrategy`] trait object keyed
//! by its [`StrategyKind`]. Adapters in the submodules wrap an external backend
//! and convert its native output into a [`StructuredBallotReading`].

pub mod classical;
pub mod detection;
pub mod http;
pub mod marks;
pub mod ocr;
pub mod vision;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, EngineConfig, StrategyConfig};
use crate::domain::{
    BallotImage, BallotTemplate, InvalidConfidence, StrategyKind, StructuredBallotReading,
};

pub use classical::{ClassicalCvStrategy, ClassicalPipeline, RowMatch};
pub use detection::{BoundingBox, Detection, DetectionStrategy, Detector};
pub use http::HttpBackend;
pub use marks::{interpret, Mark};
pub use ocr::{OcrEngine, OcrLayoutStrategy, OcrLine, OcrPage};
pub use vision::{
    PreferenceRef, VisionAnswer, VisionContestAnswer, VisionModelClient, VisionModelStrategy,
};

/// Why a strategy produced no reading.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyError {
    #[error("backend unavailable: {detail}")]
    Unavailable { detail: String },

    #[error("timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("malformed reading: {detail}")]
    MalformedReading { detail: String },
}

impl StrategyError {
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedReading {
            detail: detail.into(),
        }
    }

    /// Transient failures are retried; malformed readings are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

impl From<InvalidConfidence> for StrategyError {
    fn from(e: InvalidConfidence) -> Self {
        Self::malformed(e.to_string())
    }
}

/// Errors reported by a recognition backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("undecodable backend response: {0}")]
    Decode(String),
}

impl From<BackendError> for StrategyError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Decode(detail) => Self::MalformedReading { detail },
            other => Self::Unavailable {
                detail: other.to_string(),
            },
        }
    }
}

/// A ballot-reading capability.
///
/// Implementations must be stateless with respect to individual ballots: safe
/// to call concurrently and repeatedly.
#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn extract(
        &self,
        image: &BallotImage,
        template: &BallotTemplate,
    ) -> Result<StructuredBallotReading, StrategyError>;
}

/// A registered strategy paired with its orchestration settings.
#[derive(Clone)]
pub struct ActiveStrategy {
    pub strategy: Arc<dyn ExtractionStrategy>,
    pub config: StrategyConfig,
}

impl ActiveStrategy {
    pub fn kind(&self) -> StrategyKind {
        self.config.kind
    }
}

impl std::fmt::Debug for ActiveStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveStrategy")
            .field("kind", &self.config.kind)
            .field("config", &self.config)
            .finish()
    }
}

/// Strategies available to the engine, at most one per kind.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: BTreeMap<StrategyKind, Arc<dyn ExtractionStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy. Human review cannot be registered.
    pub fn register(&mut self, strategy: Arc<dyn ExtractionStrategy>) -> Result<(), ConfigError> {
        let kind = strategy.kind();
        if !kind.is_configurable() {
            return Err(ConfigError::NotConfigurable(kind));
        }
        if self.strategies.contains_key(&kind) {
            return Err(ConfigError::DuplicateStrategy(kind));
        }
        self.strategies.insert(kind, strategy);
        Ok(())
    }

    pub fn with(mut self, strategy: Arc<dyn ExtractionStrategy>) -> Result<Self, ConfigError> {
        self.register(strategy)?;
        Ok(self)
    }

    pub fn kinds(&self) -> Vec<StrategyKind> {
        self.strategies.keys().copied().collect()
    }

    /// Pair every configured strategy with its registered implementation.
    pub fn resolve(&self, config: &EngineConfig) -> Result<Vec<ActiveStrategy>, ConfigError> {
        let mut active = config
            .strategies
            .iter()
            .map(|sc| {
                self.strategies
                    .get(&sc.kind)
                    .map(|strategy| ActiveStrategy {
                        strategy: Arc::clone(strategy),
                        config: sc.clone(),
                    })
                    .ok_or(ConfigError::MissingBackend(sc.kind))
            })
            .collect::<Result<Vec<_>, _>>()?;
        active.sort_by_key(|a| a.kind());
        Ok(active)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted strategies for orchestrator and engine tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::domain::{Confidence, ContestReading, Selection};

    /// What a scripted strategy does on each call.
    #[derive(Debug, Clone)]
    pub enum Script {
        Read(Vec<(&'static str, Selection, f64)>),
        Fail(StrategyError),
        Hang,
        /// Fail transiently `n` times, then read.
        FlakyThenRead(usize, Vec<(&'static str, Selection, f64)>),
    }

    pub struct ScriptedStrategy {
        kind: StrategyKind,
        script: Script,
        calls: AtomicUsize,
    }

    impl ScriptedStrategy {
        pub fn new(kind: StrategyKind, script: Script) -> Arc<Self> {
            Arc::new(Self {
                kind,
                script,
                calls: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn reading(
        image: &BallotImage,
        kind: StrategyKind,
        contests: &[(&'static str, Selection, f64)],
    ) -> Result<StructuredBallotReading, StrategyError> {
        let contests = contests
            .iter()
            .map(|(id, sel, c)| Ok(ContestReading::new(*id, sel.clone(), Confidence::new(*c)?)))
            .collect::<Result<Vec<_>, StrategyError>>()?;
        Ok(StructuredBallotReading::new(
            image.ballot_id.clone(),
            kind,
            contests,
        ))
    }

    #[async_trait]
    impl ExtractionStrategy for ScriptedStrategy {
        fn kind(&self) -> StrategyKind {
            self.kind
        }

        async fn extract(
            &self,
            image: &BallotImage,
            _template: &BallotTemplate,
        ) -> Result<StructuredBallotReading, StrategyError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Read(contests) => reading(image, self.kind, contests),
                Script::Fail(e) => Err(e.clone()),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(StrategyError::Unavailable {
                        detail: "woke up".into(),
                    })
                }
                Script::FlakyThenRead(failures, contests) => {
                    if call < *failures {
                        Err(StrategyError::Unavailable {
                            detail: format!("flake {call}"),
                        })
                    } else {
                        reading(image, self.kind, contests)
                    }
                }
            }
        }
    }
}
