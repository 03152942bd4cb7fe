//! Tally - consensus ballot tallying CLI
//!
//! The `tally` command drives a ballot engine backed by on-disk state.
//!
//! ## Commands
//!
//! - `submit`: Submit a scanned ballot image
//! - `rescan`: Submit a rescan for a ballot whose image was rejected
//! - `status`: Show the status of a ballot
//! - `evidence`: Dump everything recorded for a ballot
//! - `pending`: List flagged ballots awaiting review
//! - `review`: Apply a reviewer decision to a flagged ballot
//! - `tally`: Show current totals and what still blocks them
//! - `retally`: Rebuild the tally from stored results and check the ledger

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::{info, Level};

use tally_core::metrics::METRICS;
use tally_core::strategy::{
    ClassicalCvStrategy, DetectionStrategy, ExtractionStrategy, HttpBackend, OcrLayoutStrategy,
    VisionModelStrategy,
};
use tally_core::{
    BallotEngine, BallotId, BallotSubmission, BallotTemplate, EngineConfig, EngineStores,
    ReviewDecision, Selection, StrategyKind, StrategyRegistry,
};
use tally_state::{FsCasStore, SurrealStore};

#[derive(Parser)]
#[command(name = "tally")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Consensus tallying of scanned paper ballots", long_about = None)]
struct Cli {
    /// Engine configuration file
    #[arg(long, global = true, env = "TALLY_CONFIG", default_value = "tally.toml")]
    config: PathBuf,

    /// Directory of ballot template files (*.toml)
    #[arg(long, global = true, env = "TALLY_TEMPLATE_DIR", default_value = "templates")]
    template_dir: PathBuf,

    /// Directory holding the image store and the database
    #[arg(long, global = true, env = "TALLY_STATE_DIR", default_value = ".tally")]
    state_dir: PathBuf,

    /// Output format for command results
    #[arg(long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a scanned ballot image
    Submit {
        /// Path to the scanned image
        image: PathBuf,

        /// Template the ballot was printed from
        #[arg(short, long)]
        template: String,

        /// Precinct the ballot was cast in
        #[arg(short, long)]
        precinct: String,
    },

    /// Submit a rescan of a ballot whose image was rejected
    Rescan {
        /// Ballot id of the rejected scan
        original: String,

        /// Path to the new scan
        image: PathBuf,

        #[arg(short, long)]
        template: String,

        #[arg(short, long)]
        precinct: String,
    },

    /// Show the status of a ballot
    Status {
        ballot: String,
    },

    /// Dump readings, abstentions, results and decisions for a ballot
    Evidence {
        ballot: String,
    },

    /// List flagged ballots awaiting review
    Pending,

    /// Apply a reviewer decision to a flagged ballot
    Review {
        ballot: String,

        /// Reviewer name, recorded with the decision
        #[arg(short, long, env = "TALLY_REVIEWER")]
        reviewer: String,

        /// Selection per contest: `contest=candidate-id`, `contest=blank` or
        /// `contest=invalid` (repeatable)
        #[arg(short, long = "select", value_parser = parse_selection)]
        selections: Vec<(String, Selection)>,

        #[arg(short, long)]
        comment: Option<String>,
    },

    /// Show current totals and outstanding ballots
    Tally,

    /// Rebuild the tally from stored results and compare with the ledger
    Retally,
}

/// Backend endpoints, read from the `[backends]` table of the config file.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct BackendEndpoints {
    vision_model: Option<String>,
    ocr_layout: Option<String>,
    detection: Option<String>,
    classical_cv: Option<String>,
    /// Bearer token sent to every backend.
    token: Option<String>,
}

impl BackendEndpoints {
    fn endpoint(&self, kind: StrategyKind) -> Option<&str> {
        match kind {
            StrategyKind::VisionModel => self.vision_model.as_deref(),
            StrategyKind::OcrLayout => self.ocr_layout.as_deref(),
            StrategyKind::Detection => self.detection.as_deref(),
            StrategyKind::ClassicalCv => self.classical_cv.as_deref(),
            StrategyKind::HumanReview => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct BackendSection {
    #[serde(default)]
    backends: BackendEndpoints,
}

/// Everything read from the config file.
struct CliConfig {
    engine: EngineConfig,
    backends: BackendEndpoints,
}

impl CliConfig {
    fn parse(raw: &str) -> Result<Self> {
        let engine = EngineConfig::from_toml_str(raw).context("Invalid engine configuration")?;
        let section: BackendSection =
            toml::from_str(raw).context("Invalid [backends] configuration")?;
        Ok(Self {
            engine,
            backends: section.backends,
        })
    }

    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&raw)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tally_core::telemetry::init_tracing(cli.json, level);

    let config = CliConfig::load(&cli.config)?;
    let engine = open_engine(&config, &cli.template_dir, &cli.state_dir).await?;
    let out = Output(cli.format);

    let result = match cli.command {
        Commands::Submit {
            image,
            template,
            precinct,
        } => cmd_submit(&engine, &out, &image, &template, &precinct).await,
        Commands::Rescan {
            original,
            image,
            template,
            precinct,
        } => cmd_rescan(&engine, &out, &original, &image, &template, &precinct).await,
        Commands::Status { ballot } => cmd_status(&engine, &out, &ballot).await,
        Commands::Evidence { ballot } => cmd_evidence(&engine, &ballot).await,
        Commands::Pending => cmd_pending(&engine, &out).await,
        Commands::Review {
            ballot,
            reviewer,
            selections,
            comment,
        } => cmd_review(&engine, &out, &ballot, &reviewer, selections, comment).await,
        Commands::Tally => cmd_tally(&engine, &out).await,
        Commands::Retally => cmd_retally(&engine, &out).await,
    };

    METRICS.flush();
    result
}

/// Build the registry of HTTP-backed strategies for every configured kind.
fn build_registry(config: &CliConfig) -> Result<StrategyRegistry> {
    let adapters = &config.engine.adapters;
    let mut registry = StrategyRegistry::new();

    for strategy in &config.engine.strategies {
        let kind = strategy.kind;
        let endpoint = config
            .backends
            .endpoint(kind)
            .ok_or_else(|| anyhow!("No endpoint configured for strategy {kind} in [backends]"))?;
        let mut backend = HttpBackend::new(endpoint)
            .with_context(|| format!("Failed to build HTTP client for {kind}"))?;
        if let Some(token) = &config.backends.token {
            backend = backend.with_token(token.clone());
        }
        let backend = Arc::new(backend);

        let adapter: Arc<dyn ExtractionStrategy> = match kind {
            StrategyKind::VisionModel => Arc::new(VisionModelStrategy::new(backend)),
            StrategyKind::OcrLayout => {
                Arc::new(OcrLayoutStrategy::new(backend, adapters.ocr_name_column))
            }
            StrategyKind::Detection => {
                Arc::new(DetectionStrategy::new(backend, adapters.detection_tolerance))
            }
            StrategyKind::ClassicalCv => {
                Arc::new(ClassicalCvStrategy::new(backend, adapters.match_threshold))
            }
            StrategyKind::HumanReview => bail!("Strategy {kind} cannot be configured"),
        };
        registry.register(adapter)?;
    }
    Ok(registry)
}

/// Load every `*.toml` template in `dir`.
fn load_templates(dir: &Path) -> Result<Vec<BallotTemplate>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read template directory {}", dir.display()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }
    paths.sort();

    let templates = paths
        .iter()
        .map(|path| {
            BallotTemplate::load(path)
                .with_context(|| format!("Failed to load template {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    if templates.is_empty() {
        bail!("No ballot templates found in {}", dir.display());
    }
    Ok(templates)
}

async fn open_engine(
    config: &CliConfig,
    template_dir: &Path,
    state_dir: &Path,
) -> Result<BallotEngine> {
    let templates = load_templates(template_dir)?;
    let registry = build_registry(config)?;

    let cas = FsCasStore::new(state_dir.join("images"))
        .with_context(|| format!("Failed to open image store under {}", state_dir.display()))?;
    let db = Arc::new(
        SurrealStore::open_local(&state_dir.join("db"))
            .await
            .context("Failed to open tally database")?,
    );
    let stores = EngineStores {
        cas: Arc::new(cas),
        records: db.clone(),
        ledger: db,
    };

    let engine = BallotEngine::new(config.engine.clone(), &registry, templates, stores)
        .context("Invalid engine configuration")?;
    info!(state_dir = %state_dir.display(), "engine opened");
    Ok(engine)
}

fn parse_selection(raw: &str) -> std::result::Result<(String, Selection), String> {
    let (contest, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected contest=selection, got '{raw}'"))?;
    let contest = contest.trim();
    let value = value.trim();
    if contest.is_empty() || value.is_empty() {
        return Err(format!("expected contest=selection, got '{raw}'"));
    }
    let selection = Selection::from_key(value).unwrap_or_else(|| Selection::candidate(value));
    Ok((contest.to_string(), selection))
}

struct Output(Format);

impl Output {
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        match self.0 {
            Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
            Format::Text => println!("{}", text()),
        }
        Ok(())
    }
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read image {}", path.display()))
}

async fn cmd_submit(
    engine: &BallotEngine,
    out: &Output,
    image: &Path,
    template: &str,
    precinct: &str,
) -> Result<()> {
    let submission = BallotSubmission::new(read_image(image)?, template, precinct);
    let receipt = engine.submit(submission).await?;
    out.emit(&receipt, || {
        let dup = if receipt.duplicate { " (already submitted)" } else { "" };
        format!("{}  {}{}", receipt.ballot_id, receipt.status, dup)
    })
}

async fn cmd_rescan(
    engine: &BallotEngine,
    out: &Output,
    original: &str,
    image: &Path,
    template: &str,
    precinct: &str,
) -> Result<()> {
    let original = BallotId(original.to_string());
    let submission = BallotSubmission::new(read_image(image)?, template, precinct);
    let receipt = engine.submit_rescan(&original, submission).await?;
    out.emit(&receipt, || {
        format!(
            "{}  {}  (rescan of {})",
            receipt.ballot_id,
            receipt.status,
            original.short()
        )
    })
}

async fn cmd_status(engine: &BallotEngine, out: &Output, ballot: &str) -> Result<()> {
    let status = engine.status(&BallotId(ballot.to_string())).await?;
    out.emit(&status, || status.to_string())
}

async fn cmd_evidence(engine: &BallotEngine, ballot: &str) -> Result<()> {
    let evidence = engine.evidence(&BallotId(ballot.to_string())).await?;
    println!("{}", serde_json::to_string_pretty(&evidence)?);
    Ok(())
}

async fn cmd_pending(engine: &BallotEngine, out: &Output) -> Result<()> {
    let pending = engine.pending_reviews().await?;
    out.emit(&pending, || {
        if pending.is_empty() {
            return "No ballots awaiting review".to_string();
        }
        pending
            .iter()
            .map(|item| {
                format!(
                    "{}  {:<8}  {:<17}  disputed: {}",
                    item.ballot_id.short(),
                    item.precinct,
                    item.reason.to_string(),
                    if item.disputed.is_empty() {
                        "-".to_string()
                    } else {
                        item.disputed.join(", ")
                    }
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

async fn cmd_review(
    engine: &BallotEngine,
    out: &Output,
    ballot: &str,
    reviewer: &str,
    selections: Vec<(String, Selection)>,
    comment: Option<String>,
) -> Result<()> {
    let mut decision = ReviewDecision::new(reviewer);
    for (contest, selection) in selections {
        decision = decision.select(contest, selection);
    }
    decision.comment = comment;

    let ballot_id = BallotId(ballot.to_string());
    let outcome = engine.submit_review(&ballot_id, &decision).await?;
    let result = outcome.result();
    out.emit(result, || {
        let verb = if outcome.is_applied() {
            "applied"
        } else {
            "already applied"
        };
        format!(
            "{}  {} v{} ({verb})",
            ballot_id.short(),
            result.status,
            result.version
        )
    })
}

async fn cmd_tally(engine: &BallotEngine, out: &Output) -> Result<()> {
    let snapshot = engine.tally_snapshot().await?;
    out.emit(&snapshot, || {
        let mut lines: Vec<String> = snapshot
            .projection
            .records
            .iter()
            .map(|r| {
                format!(
                    "{:<10} {:<12} {:<24} {:>6}",
                    r.precinct, r.contest_id, r.selection, r.count
                )
            })
            .collect();
        lines.push(String::new());
        lines.push(format!("Ballots counted:  {}", snapshot.projection.ballots));
        lines.push(format!("Needs rescan:     {}", snapshot.needs_rescan));
        lines.push(format!("Awaiting review:  {}", snapshot.flagged_pending));
        lines.push(format!("Processing:       {}", snapshot.processing));
        lines.push(format!(
            "Tally:            {}",
            if snapshot.complete { "complete" } else { "incomplete" }
        ));
        lines.push(format!("Digest:           {}", snapshot.projection.digest));
        lines.join("\n")
    })
}

async fn cmd_retally(engine: &BallotEngine, out: &Output) -> Result<()> {
    let report = engine.retally().await?;
    out.emit(&report, || {
        format!(
            "Ballots: {}\nRepaired increments: {}\nLedger digest:  {}\nResults digest: {}\n{}",
            report.ballots,
            report.repaired,
            report.ledger_digest,
            report.results_digest,
            if report.consistent {
                "Ledger matches stored results"
            } else {
                "MISMATCH between ledger and stored results"
            }
        )
    })?;
    if !report.consistent {
        bail!("Ledger does not match stored results");
    }
    Ok(())
}
