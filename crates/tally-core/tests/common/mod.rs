//! Shared fixtures for tally-core integration tests.

#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{GrayImage, ImageFormat, Luma};

use tally_core::{
    BallotEngine, BallotImage, BallotSubmission, BallotTemplate, Confidence, ContestReading,
    EngineConfig, EngineStores, Selection, StrategyConfig, StrategyError, StrategyKind,
    StrategyRegistry, StructuredBallotReading,
};
use tally_core::ExtractionStrategy;
use tally_state::fakes::MemoryRecordLog;
use tally_state::{NewRecord, RecordLog, StorageResult, StoredRecord};

pub const TEMPLATE: &str = r#"
id = "general-2024"
frame = { width = 200, height = 300 }
min_source_width = 100
min_source_height = 150

[[contests]]
id = "mayor"
title = "Mayor"
candidates = [
  { id = "alice", name = "Alice Archer", position = 1 },
  { id = "bob", name = "Bob Baker", position = 2 },
]

[[contests]]
id = "council"
title = "City Council"
rule = { kind = "ranked", max_rank = 2 }
candidates = [
  { id = "carol", name = "Carol Chen", position = 3 },
  { id = "dan", name = "Dan Diaz", position = 4 },
]
"#;

pub fn template() -> BallotTemplate {
    BallotTemplate::from_toml_str(TEMPLATE).unwrap()
}

/// A printed sheet: light paper, dark outline and a header bar.
///
/// `seed` shifts the sheet on the canvas so every seed yields distinct bytes.
pub fn sheet_png(seed: u32) -> Vec<u8> {
    let (x, y, w, h) = (10 + seed % 40, 10 + seed / 40, 200, 300);
    let mut img = GrayImage::from_pixel(260, 400, Luma([250]));
    for py in y..y + h {
        for px in x..x + w {
            let edge = px < x + 4 || px >= x + w - 4 || py < y + 4 || py >= y + h - 4;
            if edge || py < y + h / 6 {
                img.put_pixel(px, py, Luma([10]));
            }
        }
    }
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn submission(seed: u32, precinct: &str) -> BallotSubmission {
    BallotSubmission::new(sheet_png(seed), "general-2024", precinct)
}

/// What a scripted strategy does on every call.
#[derive(Debug, Clone)]
pub enum Script {
    Read(Vec<(&'static str, Selection, f64)>),
    Fail(StrategyError),
    Hang,
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
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Read(contests) => Ok(StructuredBallotReading::new(
                image.ballot_id.clone(),
                self.kind,
                contests
                    .iter()
                    .map(|(id, s, c)| {
                        ContestReading::new(*id, s.clone(), Confidence::new(*c).unwrap())
                    })
                    .collect(),
            )),
            Script::Fail(e) => Err(e.clone()),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(StrategyError::Unavailable {
                    detail: "woke up".into(),
                })
            }
        }
    }
}

pub fn reads(mayor: Selection, confidence: f64) -> Script {
    Script::Read(vec![
        ("mayor", mayor, confidence),
        ("council", Selection::candidate("dan"), 0.95),
    ])
}

/// Engine over the given scripts, equal weights, quorum 2, 100 ms timeouts.
pub fn engine_with(scripts: Vec<(StrategyKind, Script)>, stores: EngineStores) -> BallotEngine {
    let mut config = EngineConfig {
        strategies: Vec::new(),
        ..EngineConfig::default()
    };
    let mut registry = StrategyRegistry::new();
    for (kind, script) in scripts {
        config.strategies.push(StrategyConfig {
            timeout_ms: 100,
            ..StrategyConfig::new(kind)
        });
        registry.register(ScriptedStrategy::new(kind, script)).unwrap();
    }
    BallotEngine::new(config, &registry, vec![template()], stores).unwrap()
}

pub fn engine(scripts: Vec<(StrategyKind, Script)>) -> BallotEngine {
    engine_with(scripts, EngineStores::in_memory())
}

/// In-memory record log that gives other tasks room to interleave.
///
/// Per-ballot reads yield first. Whole-stream reads take their snapshot and
/// then hold it for `stream_delay` before returning.
pub struct PacedLog {
    inner: MemoryRecordLog,
    stream_delay: Duration,
}

impl PacedLog {
    pub fn new(stream_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryRecordLog::new(),
            stream_delay,
        })
    }
}

#[async_trait]
impl RecordLog for PacedLog {
    async fn append(&self, record: NewRecord) -> StorageResult<u64> {
        self.inner.append(record).await
    }

    async fn records(&self, stream: &str, key: &str) -> StorageResult<Vec<StoredRecord>> {
        tokio::task::yield_now().await;
        self.inner.records(stream, key).await
    }

    async fn stream(&self, stream: &str) -> StorageResult<Vec<StoredRecord>> {
        let snapshot = self.inner.stream(stream).await?;
        tokio::time::sleep(self.stream_delay).await;
        Ok(snapshot)
    }
}
